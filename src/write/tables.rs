//! Writing the finished image: compressed containers, the block table and the superblock

use super::container::{SharedStaging, Staging};
use super::planner::BlockRecord;
use crate::compress_threads::ParallelCompressor;
use crate::errors::{Error, Result};
use crate::shared_position_file::SharedWriteAt;
use repr::container::{sparse_stride, RecordHeader};
use repr::locator::Format;
use repr::superblock::{Flags, Superblock};
use repr::{Le16, Le32, Le64};
use slog::Logger;
use std::sync::Arc;
use zerocopy::AsBytes;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub block_size: u32,
    pub container_size: u32,
    pub pack_locators: bool,
    pub sparse_containers: bool,
    pub modification_time: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Written {
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
    pub bytes_used: u64,
    pub packed_locators: bool,
}

pub(crate) fn write_image(
    writer: &dyn SharedWriteAt,
    compressor: &ParallelCompressor,
    layout: Layout,
    containers: Vec<SharedStaging>,
    blocks: &[BlockRecord],
    logger: &Logger,
) -> Result<Written> {
    let container_count = containers.len() as u32;
    let container_table_start = Superblock::SIZE as u64;
    let mut written = Written::default();
    let mut position = container_table_start;

    let batch_size = compressor.thread_count() * 2;
    let mut containers = containers.into_iter().map(into_staging).enumerate().peekable();
    while containers.peek().is_some() {
        let batch: Vec<(usize, Staging)> = containers.by_ref().take(batch_size).collect();
        let first = batch[0].0;
        let raw: Vec<Staging> = batch.into_iter().map(|(_, staging)| staging).collect();
        written.raw_bytes += raw.iter().map(|s| s.len() as u64).sum::<u64>();

        for (i, compressed) in compressor.compress_batch(raw).into_iter().enumerate() {
            let id = (first + i) as u32;
            let compressed = compressed?;
            if layout.sparse_containers {
                let stride = sparse_stride(layout.container_size);
                if compressed.len() > layout.container_size as usize {
                    return Err(Error::CompressedTooLarge {
                        container: id,
                        size: compressed.len(),
                        stride,
                    });
                }
                position = container_table_start + u64::from(id) * stride;
            }
            position += write_record(writer, position, &compressed)?;
            written.compressed_bytes += compressed.len() as u64;
        }
    }
    if layout.sparse_containers {
        position = container_table_start
            + u64::from(container_count) * sparse_stride(layout.container_size);
    }
    slog::debug!(logger, "Wrote container table";
        "containers" => container_count,
        "raw_bytes" => written.raw_bytes,
        "compressed_bytes" => written.compressed_bytes,
    );

    let format = Format::choose(layout.pack_locators, layout.container_size, container_count);
    let (format, table) = match encode_block_table(format, blocks) {
        Some(table) => (format, table),
        None => {
            slog::debug!(logger, "Block locators do not all pack, storing them unpacked");
            let table = encode_block_table(Format::Unpacked, blocks)
                .ok_or_else(|| Error::corruption("unpacked locators can't fail to encode"))?;
            (Format::Unpacked, table)
        }
    };
    let block_table_start = position;
    let compressed = compressor.compress(&table)?;
    let block_table_size = write_record(writer, position, &compressed)?;
    position += block_table_size;

    let mut flags = Flags::default();
    flags.set(Flags::PACKED_LOCATORS, matches!(format, Format::Packed { .. }));
    flags.set(Flags::SPARSE_CONTAINERS, layout.sparse_containers);

    let superblock = Superblock {
        magic: Le32::new(repr::superblock::MAGIC),
        version_major: Le16::new(repr::superblock::VERSION_MAJOR),
        version_minor: Le16::new(repr::superblock::VERSION_MINOR),
        flags: Le32::new(flags.bits()),
        compression_id: Le16::new(compressor.kind().id()),
        _reserved: Le16::new(0),
        block_size: Le32::new(layout.block_size),
        container_size: Le32::new(layout.container_size),
        block_count: Le32::new(blocks.len() as u32),
        container_count: Le32::new(container_count),
        modification_time: Le32::new(layout.modification_time),
        _padding: Le32::new(0),
        container_table_start: Le64::new(container_table_start),
        block_table_start: Le64::new(block_table_start),
        block_table_size: Le64::new(block_table_size),
        bytes_used: Le64::new(position),
    };
    writer.write_all_at(superblock.as_bytes(), 0)?;
    writer.flush()?;

    written.bytes_used = position;
    written.packed_locators = flags.contains(Flags::PACKED_LOCATORS);
    Ok(written)
}

fn into_staging(shared: SharedStaging) -> Staging {
    match Arc::try_unwrap(shared) {
        Ok(lock) => lock.into_inner(),
        Err(shared) => Staging::Memory(shared.read().data().to_vec()),
    }
}

/// Write a length prefixed record, returning its total size
fn write_record(writer: &dyn SharedWriteAt, position: u64, data: &[u8]) -> Result<u64> {
    let header = RecordHeader::new(data.len() as u32);
    writer.write_all_at(header.as_bytes(), position)?;
    writer.write_all_at(data, position + RecordHeader::SIZE as u64)?;
    Ok((RecordHeader::SIZE + data.len()) as u64)
}

fn encode_block_table(format: Format, blocks: &[BlockRecord]) -> Option<Vec<u8>> {
    let mut table = Vec::with_capacity(blocks.len() * format.entry_size());
    for block in blocks {
        let locator = format.encode(block.location.container, block.location.offset)?;
        format.write_entry(locator, &mut table);
    }
    Some(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Location;

    fn record(container: u32, offset: u32) -> BlockRecord {
        BlockRecord {
            location: Location::new(container, offset),
            len: 1,
        }
    }

    #[test]
    fn packed_table() {
        let format = Format::Packed { container_size: 16 };
        let table = encode_block_table(format, &[record(0, 2), record(2, 15)]).unwrap();
        assert_eq!(table, [2, 0, 0, 0, 47, 0, 0, 0]);
        assert_eq!(encode_block_table(format, &[record(0, 16)]), None);
    }

    #[test]
    fn unpacked_table() {
        let table = encode_block_table(Format::Unpacked, &[record(1, 2)]).unwrap();
        assert_eq!(table, [1, 0, 0, 0, 2, 0, 0, 0]);
    }
}
