//! Work items and the order they are placed in

use super::planner::Planner;
use super::prepass::Duplicates;
use crate::errors::Result;
use crate::source::{self, DataSource};
use crate::BlockNum;
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use repr::BlocknumWidth;
use slog::Logger;
use std::fmt;
use std::sync::Arc;

/// Block numbers of one scheduled source, filled in when the image is flushed
#[derive(Debug, Clone, Default)]
pub struct BlockList(Arc<Mutex<Vec<BlockNum>>>);

impl BlockList {
    pub fn blocks(&self) -> Vec<BlockNum> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little endian block numbers, `width` bytes each
    ///
    /// Block numbers which do not fit are truncated: pick `width` with
    /// [`BlocknumWidth::for_count`] over the image's block count.
    pub fn encode(&self, width: BlocknumWidth) -> Vec<u8> {
        let blocks = self.0.lock();
        let mut out = Vec::with_capacity(blocks.len() * width.bytes());
        for block in blocks.iter() {
            match width {
                BlocknumWidth::W16 => out.write_u16::<LittleEndian>(block.0 as u16),
                BlocknumWidth::W24 => out.write_u24::<LittleEndian>(block.0 & 0xff_ffff),
                BlocknumWidth::W32 => out.write_u32::<LittleEndian>(block.0),
            }
            .expect("writes into a Vec can't fail");
        }
        out
    }

    fn set(&self, blocks: Vec<BlockNum>) {
        *self.0.lock() = blocks;
    }
}

pub(crate) struct ScheduleItem {
    pub source: Arc<dyn DataSource>,
    pub class: u32,
    pub block_size: u32,
    pub target: BlockList,
}

impl ScheduleItem {
    pub(crate) fn block_count(&self) -> u64 {
        let block_size = u64::from(self.block_size);
        (self.source.len() + block_size - 1) / block_size
    }
}

impl fmt::Debug for ScheduleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleItem")
            .field("source", &self.source.name())
            .field("class", &self.class)
            .field("block_size", &self.block_size)
            .finish()
    }
}

/// Order items by class, then by name, keeping the scheduling order of equal keys
pub(crate) fn sort(items: &mut [ScheduleItem]) {
    items.sort_by(|a, b| {
        a.class
            .cmp(&b.class)
            .then_with(|| a.source.name().cmp(b.source.name()))
    });
}

/// Cut every item into blocks and place them, in order
///
/// Returns the number of blocks placed.
pub(crate) fn place_all(
    items: &[ScheduleItem],
    planner: &mut Planner,
    duplicates: &Duplicates,
    logger: &Logger,
) -> Result<u64> {
    let max_block_size = items.iter().map(|item| item.block_size).max().unwrap_or(0);
    let mut buf = vec![0; max_block_size as usize];
    // Block number of every block position, for resolving prepass duplicates
    let mut placed: Vec<BlockNum> = Vec::new();

    for item in items {
        slog::debug!(logger, "Placing source";
            "source" => %item.source.name(),
            "class" => item.class,
            "len" => item.source.len(),
        );
        let block_size = item.block_size as usize;
        let mut reader = item.source.open()?;
        let mut list = Vec::with_capacity(item.block_count() as usize);
        loop {
            let n = source::read_block(&mut reader, &mut buf[..block_size])?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            let position = placed.len() as u64;
            let block = match duplicates.earlier(position) {
                Some(earlier) => planner.place_duplicate(data, placed[earlier as usize])?,
                None => planner.place(data)?,
            };
            placed.push(block);
            list.push(block);
            if n < block_size {
                break;
            }
        }
        item.target.set(list);
    }
    Ok(placed.len() as u64)
}
