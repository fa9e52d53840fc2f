//! Deciding where each block goes
//!
//! Placing a block tries, in order:
//! 1. an identical block found through the real index or the auto index, verified byte for byte
//! 2. the cheapest spot in a few candidate containers: a full occurrence, a tail overlap, or a
//!    plain append
//! 3. a new container
//!
//! Placement is sequential: each decision depends on the container contents left by the last one.
//! Only the searches inside a single decision run on the worker pool.

use super::container::{ContainerStore, SharedStaging};
use crate::config::DedupMode;
use crate::errors::{Error, Result};
use crate::hash::{block_hash, is_blank};
use crate::index::{BlockIndex, IndexStats};
use crate::search::{analyze_append, AppendInfo, Needle, OverlapLimits};
use crate::thread::WorkerPool;
use crate::{BlockNum, Location};
use slog::Logger;
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct PlacementSettings {
    pub dedup: DedupMode,
    pub min_overlap: u32,
    pub overlap_granularity: u32,
    pub max_candidates: usize,
    pub autoindex_period: u32,
    pub autoindex_interval: u32,
}

/// Where a block's bytes are
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockRecord {
    pub location: Location,
    pub len: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Reuse {
    Real(BlockNum),
    Auto(Location),
}

#[derive(Debug, Copy, Clone)]
struct ReusingPlan {
    hash: u32,
    reuse: Reuse,
}

#[derive(Debug, Copy, Clone)]
struct WritePlan {
    /// None to start a new container
    container: Option<u32>,
    append: AppendInfo,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PlacementStats {
    pub placed: u64,
    pub reused: u64,
    pub auto_hits: u64,
    pub written_bytes: u64,
    pub overlapped_bytes: u64,
    pub auto_entries: u64,
}

pub(crate) struct Planner {
    settings: PlacementSettings,
    store: ContainerStore,
    index: Option<BlockIndex>,
    blocks: Vec<BlockRecord>,
    by_location: HashMap<BlockRecord, BlockNum>,
    /// Container size at the last auto-indexing, per (container, block size)
    autoindexed: HashMap<(u32, u32), u32>,
    block_sizes: BTreeSet<u32>,
    pool: Arc<WorkerPool>,
    stats: PlacementStats,
    logger: Logger,
}

pub(crate) struct Placed {
    pub blocks: Vec<BlockRecord>,
    pub containers: Vec<SharedStaging>,
    pub stats: PlacementStats,
    pub index: Option<IndexStats>,
}

impl Planner {
    pub(crate) fn new(
        settings: PlacementSettings,
        store: ContainerStore,
        index: Option<BlockIndex>,
        pool: Arc<WorkerPool>,
        logger: Logger,
    ) -> Self {
        Self {
            settings,
            store,
            index,
            blocks: Vec::new(),
            by_location: HashMap::new(),
            autoindexed: HashMap::new(),
            block_sizes: BTreeSet::new(),
            pool,
            stats: PlacementStats::default(),
            logger,
        }
    }

    /// Block sizes to auto-index containers for
    pub(crate) fn add_block_size(&mut self, block_size: u32) {
        self.block_sizes.insert(block_size);
    }

    pub(crate) fn block(&self, block: BlockNum) -> Option<BlockRecord> {
        self.blocks.get(block.0 as usize).copied()
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &ContainerStore {
        &self.store
    }

    /// Find or make room for `data`, returning its block number
    pub(crate) fn place(&mut self, data: &[u8]) -> Result<BlockNum> {
        self.stats.placed += 1;
        let hash = block_hash(data);
        let indexed = match self.settings.dedup {
            DedupMode::None => false,
            DedupMode::BlanksOnly => is_blank(data),
            DedupMode::All | DedupMode::AllWithPrepass => true,
        };
        if indexed {
            if let Some(plan) = self.create_reusing_plan(hash, data)? {
                return self.execute_reuse(plan, data.len() as u32);
            }
        }
        let plan = self.create_write_plan(data);
        self.execute_write(plan, hash, data, indexed)
    }

    /// Place `data`, which is expected to be identical to the earlier block `earlier`
    pub(crate) fn place_duplicate(&mut self, data: &[u8], earlier: BlockNum) -> Result<BlockNum> {
        if let Some(record) = self.block(earlier) {
            if record.len as usize == data.len() && self.store.matches(record.location, data) {
                self.stats.placed += 1;
                self.stats.reused += 1;
                slog::debug!(self.logger, "Reused block from prepass"; "block" => earlier.0);
                return Ok(earlier);
            }
        }
        slog::debug!(self.logger, "Prepass duplicate did not verify"; "block" => earlier.0);
        self.place(data)
    }

    fn create_reusing_plan(&self, hash: u32, data: &[u8]) -> Result<Option<ReusingPlan>> {
        let index = match &self.index {
            Some(index) => index,
            None => return Ok(None),
        };
        for block in index.find_real(hash) {
            let record = self.block(block).ok_or_else(|| {
                Error::corruption(format!(
                    "index refers to block {} of {}",
                    block.0,
                    self.blocks.len()
                ))
            })?;
            if record.len as usize == data.len() && self.store.matches(record.location, data) {
                return Ok(Some(ReusingPlan {
                    hash,
                    reuse: Reuse::Real(block),
                }));
            }
        }
        if self.settings.dedup.searches_overlap() {
            // Auto entries can be hash collisions, so a mismatch is not an error. An entry
            // pointing outside of the stored data is.
            for location in index.find_auto(hash) {
                if location.container >= self.store.count()
                    || location.offset > self.store.size(location.container)
                {
                    return Err(Error::corruption(format!(
                        "auto index entry {:?} is outside the stored data",
                        location
                    )));
                }
                if self.store.matches(location, data) {
                    return Ok(Some(ReusingPlan {
                        hash,
                        reuse: Reuse::Auto(location),
                    }));
                }
            }
        }
        Ok(None)
    }

    fn execute_reuse(&mut self, plan: ReusingPlan, len: u32) -> Result<BlockNum> {
        let (block, location) = match plan.reuse {
            Reuse::Real(block) => {
                self.stats.reused += 1;
                let location = self.blocks[block.0 as usize].location;
                slog::debug!(self.logger, "Reused block"; "block" => block.0);
                (block, location)
            }
            Reuse::Auto(location) => {
                let block = self.register(BlockRecord { location, len });
                if let Some(index) = &self.index {
                    index.delete_auto(plan.hash, location);
                    index.add_real(plan.hash, block);
                }
                self.stats.auto_hits += 1;
                self.stats.overlapped_bytes += u64::from(len);
                slog::debug!(self.logger, "Auto index hit";
                    "block" => block.0,
                    "container" => location.container,
                    "offset" => location.offset,
                );
                (block, location)
            }
        };
        self.predict(location, len);
        Ok(block)
    }

    /// Data often repeats in runs: after a reuse, the next block may well match what follows
    fn predict(&mut self, location: Location, len: u32) {
        if !self.settings.dedup.searches_overlap() || self.index.is_none() {
            return;
        }
        let next = Location::new(location.container, location.offset + len);
        let staging = Arc::clone(self.store.staging(next.container));
        let staging = staging.read();
        let start = next.offset as usize;
        if let Some(window) = staging.data().get(start..start + len as usize) {
            let hash = block_hash(window);
            if self.add_auto_entry(hash, next, window, staging.data()) {
                slog::trace!(self.logger, "Predicted next block";
                    "container" => next.container,
                    "offset" => next.offset,
                );
            }
        }
    }

    /// Adds an auto index entry unless an entry with the same bytes exists
    ///
    /// `container_data` is the data of `location.container`, which the caller holds a lock on.
    fn add_auto_entry(
        &mut self,
        hash: u32,
        location: Location,
        window: &[u8],
        container_data: &[u8],
    ) -> bool {
        let index = match &self.index {
            Some(index) => index,
            None => return false,
        };
        let known = index.find_auto(hash).any(|existing| {
            if existing.container == location.container {
                let start = existing.offset as usize;
                container_data.get(start..start + window.len()) == Some(window)
            } else {
                self.store.matches(existing, window)
            }
        });
        if known {
            return false;
        }
        index.add_auto(hash, location);
        self.stats.auto_entries += 1;
        true
    }

    fn candidates(&self, len: u32) -> Vec<u32> {
        let max = self.settings.max_candidates.max(1);
        let mut candidates = Vec::with_capacity(max);
        if let Some(id) = self.store.best_fit(len) {
            candidates.push(id);
        }
        for id in self.store.most_recent(max) {
            if candidates.len() >= max {
                break;
            }
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        candidates
    }

    fn create_write_plan(&self, data: &[u8]) -> WritePlan {
        let len = data.len();
        let capacity = self.store.capacity() as usize;
        let append_limit = capacity - self.store.min_free_space() as usize;

        let needle = if self.settings.dedup.searches_overlap() {
            Some(Arc::new(Needle::new(data.to_vec())))
        } else {
            None
        };
        let limits = OverlapLimits {
            min_overlap: self.settings.min_overlap as usize,
            granularity: self.settings.overlap_granularity as usize,
            capacity,
        };
        let jobs: Vec<(u32, SharedStaging)> = self
            .candidates(len as u32)
            .into_iter()
            .map(|id| (id, Arc::clone(self.store.staging(id))))
            .collect();

        let results = self.pool.map(jobs, move |(id, staging)| {
            let staging = staging.read();
            let info = match &needle {
                Some(needle) => analyze_append(needle, staging.data(), limits),
                None => Some(AppendInfo::append(staging.len(), len)),
            };
            (id, info)
        });

        let best = results
            .into_iter()
            .filter_map(|(id, info)| info.map(|info| (id, info)))
            .filter(|(_, info)| {
                if info.overlap(len) > 0 {
                    info.appended_size <= capacity
                } else {
                    info.appended_size <= append_limit
                }
            })
            .min_by_key(|&(id, info)| (info.added(), id));

        match best {
            Some((id, append)) => WritePlan {
                container: Some(id),
                append,
            },
            None => WritePlan {
                container: None,
                append: AppendInfo::append(0, len),
            },
        }
    }

    fn execute_write(
        &mut self,
        plan: WritePlan,
        hash: u32,
        data: &[u8],
        indexed: bool,
    ) -> Result<BlockNum> {
        let len = data.len() as u32;
        let id = match plan.container {
            Some(id) => id,
            None => {
                let id = self.store.create()?;
                slog::debug!(self.logger, "Started container"; "container" => id);
                id
            }
        };
        let info = plan.append;
        let new_size = self.store.append(id, info.base_offset as u32, data)?;
        let overlap = info.overlap(data.len());
        self.stats.written_bytes += info.added() as u64;
        self.stats.overlapped_bytes += overlap as u64;

        let location = Location::new(id, info.base_offset as u32);
        let block = self.register(BlockRecord { location, len });
        slog::debug!(self.logger, "Placed block";
            "block" => block.0,
            "container" => id,
            "offset" => location.offset,
            "size" => new_size,
            "overlap" => overlap,
        );
        if indexed {
            if let Some(index) = &self.index {
                index.add_real(hash, block);
            }
        }
        if self.settings.dedup.searches_overlap() && self.index.is_some() {
            self.maybe_autoindex(id, new_size, overlap > 0);
        }
        Ok(block)
    }

    fn register(&mut self, record: BlockRecord) -> BlockNum {
        let blocks = &mut self.blocks;
        *self.by_location.entry(record).or_insert_with(|| {
            let block = BlockNum(blocks.len() as u32);
            blocks.push(record);
            block
        })
    }

    fn maybe_autoindex(&mut self, id: u32, new_size: u32, overlapped: bool) {
        let capacity = u64::from(self.store.capacity());
        let reserve = u64::from(self.store.min_free_space());
        let block_sizes: Vec<u32> = self.block_sizes.iter().copied().collect();
        for block_size in block_sizes {
            let last = self.autoindexed.get(&(id, block_size)).copied().unwrap_or(0);
            let nearly_full = u64::from(new_size) + reserve + u64::from(block_size) >= capacity;
            if new_size - last >= self.settings.autoindex_interval || nearly_full || overlapped {
                self.autoindex(id, last, new_size, block_size);
                self.autoindexed.insert((id, block_size), new_size);
            }
        }
    }

    /// Index the windows of `block_size` bytes which became complete as the container grew from
    /// `old_size` to `new_size`
    fn autoindex(&mut self, id: u32, old_size: u32, new_size: u32, block_size: u32) {
        let period = self.settings.autoindex_period.max(1);
        let window_count = |size: u32| {
            if size < block_size {
                0
            } else {
                (size - block_size) / period + 1
            }
        };
        let windows = window_count(old_size)..window_count(new_size);
        if windows.is_empty() {
            return;
        }

        let staging = Arc::clone(self.store.staging(id));
        let hashes = self.window_hashes(&staging, windows.clone(), period, block_size);
        let data = staging.read();
        let before = self.stats.auto_entries;
        for (window, hash) in windows.zip(hashes) {
            let offset = window * period;
            let bytes = &data.data()[offset as usize..(offset + block_size) as usize];
            self.add_auto_entry(hash, Location::new(id, offset), bytes, data.data());
        }
        slog::trace!(self.logger, "Auto indexed container";
            "container" => id,
            "block_size" => block_size,
            "from" => old_size,
            "to" => new_size,
            "added" => self.stats.auto_entries - before,
        );
    }

    /// Hash every window in parallel
    fn window_hashes(
        &self,
        staging: &SharedStaging,
        windows: Range<u32>,
        period: u32,
        block_size: u32,
    ) -> Vec<u32> {
        let count = (windows.end - windows.start) as usize;
        let per_job = (count + self.pool.thread_count() - 1) / self.pool.thread_count();
        let per_job = per_job.max(1) as u32;
        let jobs: Vec<(Range<u32>, SharedStaging)> = (windows.start..windows.end)
            .step_by(per_job as usize)
            .map(|start| (start..(start + per_job).min(windows.end), Arc::clone(staging)))
            .collect();
        self.pool
            .map(jobs, move |(range, staging)| {
                let staging = staging.read();
                let data = staging.data();
                range
                    .map(|window| {
                        let offset = (window * period) as usize;
                        block_hash(&data[offset..offset + block_size as usize])
                    })
                    .collect::<Vec<u32>>()
            })
            .into_iter()
            .flatten()
            .collect()
    }

    pub(crate) fn finish(self) -> Placed {
        let index = self.index.as_ref().map(BlockIndex::stats);
        Placed {
            blocks: self.blocks,
            containers: self.store.finish(),
            stats: self.stats,
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexBackend, StagingMode};
    use crate::index::{IndexShape, LayerFactory};

    fn planner(dedup: DedupMode, capacity: u32, min_free_space: u32, granularity: u32) -> Planner {
        let logger = crate::test_logger();
        let settings = PlacementSettings {
            dedup,
            min_overlap: 0,
            overlap_granularity: granularity,
            max_candidates: 2,
            autoindex_period: 1,
            autoindex_interval: 256 * 1024,
        };
        let index = if dedup.uses_index() {
            let factory = LayerFactory::new(IndexBackend::Memory, None, None);
            let shape = IndexShape {
                shards: 4,
                max_layers: 4,
                layer_entries: 1 << 16,
            };
            Some(BlockIndex::new(&factory, shape, &logger))
        } else {
            None
        };
        let store = ContainerStore::new(capacity, min_free_space, StagingMode::Memory);
        let pool = Arc::new(WorkerPool::new(2));
        let mut planner = Planner::new(settings, store, index, pool, logger);
        planner.add_block_size(4);
        planner
    }

    fn contents(planner: &Planner, id: u32) -> Vec<u8> {
        planner.store().staging(id).read().data().to_vec()
    }

    #[test]
    fn overlap_then_reuse() {
        let mut planner = planner(DedupMode::All, 16, 0, 1);
        let a = planner.place(b"abcd").unwrap();
        let b = planner.place(b"cdef").unwrap();
        let c = planner.place(b"abcd").unwrap();
        assert_eq!(a, BlockNum(0));
        assert_eq!(b, BlockNum(1));
        assert_eq!(c, a);
        assert_eq!(planner.block(b).unwrap().location, Location::new(0, 2));
        assert_eq!(contents(&planner, 0), b"abcdef");
        assert_eq!(planner.stats.reused, 1);
    }

    #[test]
    fn autoindexed_windows_are_reused() {
        let mut planner = planner(DedupMode::All, 64, 0, 1);
        planner.place(b"abcdefgh").unwrap();
        // Overlapping triggers indexing of every 4 byte window
        let ghij = planner.place(b"ghij").unwrap();
        assert_eq!(planner.block(ghij).unwrap().location, Location::new(0, 6));

        let block = planner.place(b"cdef").unwrap();
        assert_eq!(block, BlockNum(2));
        assert_eq!(planner.block(block).unwrap().location, Location::new(0, 2));
        assert_eq!(planner.stats.auto_hits, 1);
        assert_eq!(contents(&planner, 0), b"abcdefghij");

        // Now a real block
        assert_eq!(planner.place(b"cdef").unwrap(), block);
        assert_eq!(planner.stats.reused, 1);
    }

    #[test]
    fn pure_appends_keep_the_reserve() {
        let mut planner = planner(DedupMode::None, 16, 4, 1);
        planner.place(b"aaaaaaaa").unwrap();
        planner.place(b"bbbb").unwrap();
        // 12 + 4 would leave no reserve
        let block = planner.place(b"cccc").unwrap();
        assert_eq!(planner.block(block).unwrap().location, Location::new(1, 0));
        assert_eq!(planner.store().count(), 2);
    }

    #[test]
    fn no_dedup_stores_duplicates() {
        let mut planner = planner(DedupMode::None, 64, 0, 1);
        let a = planner.place(b"wxyz").unwrap();
        let b = planner.place(b"wxyz").unwrap();
        assert_ne!(a, b);
        assert_eq!(contents(&planner, 0), b"wxyzwxyz");
    }

    #[test]
    fn blanks_only_shares_zero_blocks() {
        let mut planner = planner(DedupMode::BlanksOnly, 64, 0, 1);
        let a = planner.place(&[0; 4]).unwrap();
        let b = planner.place(&[0; 4]).unwrap();
        let c = planner.place(b"wxyz").unwrap();
        let d = planner.place(b"wxyz").unwrap();
        assert_eq!(a, b);
        assert_ne!(c, d);
    }

    #[test]
    fn granularity_limits_overlaps() {
        let mut planner = planner(DedupMode::All, 64, 0, 2);
        planner.place(b"abcdefgh").unwrap();
        // A 3 byte overlap is not a multiple of 2
        let block = planner.place(b"fghXYZ12").unwrap();
        let record = planner.block(block).unwrap();
        assert_eq!(record.location, Location::new(0, 8));
    }

    #[test]
    fn prepass_duplicates_are_verified() {
        let mut planner = planner(DedupMode::AllWithPrepass, 64, 0, 1);
        let a = planner.place(b"abcd").unwrap();
        assert_eq!(planner.place_duplicate(b"abcd", a).unwrap(), a);
        let other = planner.place_duplicate(b"zzzz", a).unwrap();
        assert_ne!(other, a);
    }
}
