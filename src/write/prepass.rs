//! Finding identical blocks across the whole batch before placement, and the resume checkpoint
//! which records the result

use super::scheduler::ScheduleItem;
use crate::errors::{Error, Result};
use crate::hash::identity_hash;
use crate::source::{self, DataSource};
use crate::thread::WorkerPool;
use repr::checkpoint::{Header, Pair, MAGIC};
use repr::Le64;
use slog::Logger;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// Block positions which hold the same bytes as an earlier position
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Duplicates {
    block_count: u64,
    /// later position -> earlier position
    pairs: HashMap<u64, u64>,
}

impl Duplicates {
    pub(crate) fn earlier(&self, position: u64) -> Option<u64> {
        self.pairs.get(&position).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.pairs.len()
    }

    fn sorted_pairs(&self) -> Vec<(u64, u64)> {
        let mut pairs: Vec<(u64, u64)> = self.pairs.iter().map(|(&l, &e)| (l, e)).collect();
        pairs.sort_unstable();
        pairs
    }
}

/// Hash every block of every item on the pool, and pair up blocks with equal identity and length
pub(crate) fn find_duplicates(items: &[ScheduleItem], pool: &WorkerPool) -> Result<Duplicates> {
    let jobs: Vec<(Arc<dyn DataSource>, usize)> = items
        .iter()
        .map(|item| (Arc::clone(&item.source), item.block_size as usize))
        .collect();
    let identities = pool.map(jobs, |(source, block_size)| block_identities(&*source, block_size));

    let mut first_seen: HashMap<(u64, u32), u64> = HashMap::new();
    let mut duplicates = Duplicates::default();
    let mut position = 0;
    for item_identities in identities {
        for identity in item_identities? {
            match first_seen.get(&identity) {
                Some(&earlier) => {
                    duplicates.pairs.insert(position, earlier);
                }
                None => {
                    first_seen.insert(identity, position);
                }
            }
            position += 1;
        }
    }
    duplicates.block_count = position;
    Ok(duplicates)
}

fn block_identities(source: &dyn DataSource, block_size: usize) -> io::Result<Vec<(u64, u32)>> {
    let mut reader = source.open()?;
    let mut buf = vec![0; block_size];
    let mut identities = Vec::new();
    loop {
        let n = source::read_block(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        identities.push((identity_hash(&buf[..n]), n as u32));
        if n < block_size {
            break;
        }
    }
    Ok(identities)
}

/// Load a checkpoint for a batch of `block_count` blocks, if one exists at `path`
pub(crate) fn read_checkpoint(path: &Path, block_count: u64) -> Result<Option<Duplicates>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_checkpoint(&data, block_count).map(Some)
}

fn parse_checkpoint(data: &[u8], block_count: u64) -> Result<Duplicates> {
    let header = Header::read_from_prefix(data)
        .ok_or_else(|| Error::corruption("resume checkpoint is truncated"))?;
    if header.magic != MAGIC {
        return Err(Error::corruption("resume checkpoint has a bad magic number"));
    }
    let pair_count = header.pair_count.get();
    let body = &data[std::mem::size_of::<Header>()..];
    let pair_size = std::mem::size_of::<Pair>() as u64;
    if pair_count.checked_mul(pair_size) != Some(body.len() as u64) {
        return Err(Error::corruption(format!(
            "resume checkpoint should hold {} pairs, but has {} bytes of them",
            pair_count,
            body.len()
        )));
    }

    let mut pairs = HashMap::with_capacity(pair_count as usize);
    for chunk in body.chunks_exact(pair_size as usize) {
        let pair =
            Pair::read_from(chunk).ok_or_else(|| Error::corruption("short checkpoint pair"))?;
        let (later, earlier) = (pair.later.get(), pair.earlier.get());
        if later >= block_count {
            return Err(Error::ResumeOutOfRange {
                position: later,
                blocks: block_count,
            });
        }
        if earlier >= later {
            return Err(Error::corruption(format!(
                "resume checkpoint pairs block {} with block {}, which is not earlier",
                later, earlier
            )));
        }
        pairs.insert(later, earlier);
    }
    if header.block_count.get() != block_count {
        return Err(Error::corruption(format!(
            "resume checkpoint was taken from {} blocks, but the batch has {}",
            header.block_count.get(),
            block_count
        )));
    }
    Ok(Duplicates { block_count, pairs })
}

/// Atomically replace the checkpoint at `path`
pub(crate) fn write_checkpoint(path: &Path, duplicates: &Duplicates) -> Result<()> {
    let pairs = duplicates.sorted_pairs();
    let header = Header {
        magic: MAGIC,
        block_count: Le64::new(duplicates.block_count),
        pair_count: Le64::new(pairs.len() as u64),
    };
    let mut data = Vec::with_capacity(
        header.as_bytes().len() + pairs.len() * std::mem::size_of::<Pair>(),
    );
    data.extend_from_slice(header.as_bytes());
    for (later, earlier) in pairs {
        let pair = Pair {
            later: Le64::new(later),
            earlier: Le64::new(earlier),
        };
        data.extend_from_slice(pair.as_bytes());
    }

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(&data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Run the prepass, or replay it from the checkpoint at `checkpoint`
pub(crate) fn prepare(
    items: &[ScheduleItem],
    pool: &WorkerPool,
    checkpoint: Option<&Path>,
    logger: &Logger,
) -> Result<Duplicates> {
    let block_count: u64 = items.iter().map(ScheduleItem::block_count).sum();
    if let Some(path) = checkpoint {
        if let Some(duplicates) = read_checkpoint(path, block_count)? {
            slog::info!(logger, "Replaying resume checkpoint";
                "path" => %path.display(),
                "duplicates" => duplicates.len(),
            );
            return Ok(duplicates);
        }
    }

    let duplicates = find_duplicates(items, pool)?;
    slog::info!(logger, "Identical block prepass done";
        "blocks" => duplicates.block_count,
        "duplicates" => duplicates.len(),
    );
    if let Some(path) = checkpoint {
        write_checkpoint(path, &duplicates)?;
        slog::debug!(logger, "Wrote resume checkpoint"; "path" => %path.display());
    }
    Ok(duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::write::BlockList;

    fn items(sources: &[&[u8]]) -> Vec<ScheduleItem> {
        sources
            .iter()
            .enumerate()
            .map(|(i, data)| ScheduleItem {
                source: Arc::new(MemorySource::new(i.to_string(), data.to_vec())),
                class: 0,
                block_size: 4,
                target: BlockList::default(),
            })
            .collect()
    }

    #[test]
    fn duplicates_across_items() {
        let items = items(&[b"aaaabbbbcc", b"bbbbcc", b"cc"]);
        let pool = WorkerPool::new(2);
        let duplicates = find_duplicates(&items, &pool).unwrap();
        assert_eq!(duplicates.block_count, 6);
        assert_eq!(duplicates.sorted_pairs(), vec![(3, 1), (4, 2), (5, 2)]);
        assert_eq!(duplicates.earlier(3), Some(1));
        assert_eq!(duplicates.earlier(0), None);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume");
        let mut duplicates = Duplicates {
            block_count: 10,
            pairs: HashMap::new(),
        };
        duplicates.pairs.insert(7, 2);
        duplicates.pairs.insert(9, 8);
        write_checkpoint(&path, &duplicates).unwrap();
        assert_eq!(read_checkpoint(&path, 10).unwrap(), Some(duplicates));
        assert_eq!(read_checkpoint(&dir.path().join("missing"), 10).unwrap(), None);
    }

    #[test]
    fn bad_checkpoints_are_fatal() {
        let mut duplicates = Duplicates {
            block_count: 10,
            pairs: HashMap::new(),
        };
        duplicates.pairs.insert(9, 1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume");
        write_checkpoint(&path, &duplicates).unwrap();

        let err = read_checkpoint(&path, 5).unwrap_err();
        assert!(matches!(err, Error::ResumeOutOfRange { position: 9, blocks: 5 }));
        let err = read_checkpoint(&path, 12).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));

        let data = fs::read(&path).unwrap();
        assert!(matches!(parse_checkpoint(&data[..30], 10), Err(Error::Corruption(_))));
        assert!(matches!(
            parse_checkpoint(b"not a checkpoint at all!", 10),
            Err(Error::Corruption(_))
        ));
    }
}
