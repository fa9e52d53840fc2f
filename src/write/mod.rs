//! Building an image
//!
//! Sources are scheduled on an [`Image`], and nothing is read until [`Image::flush`]. Flushing
//! sorts the sources, optionally runs the identical block prepass, places every block, and
//! finally compresses the containers and writes the tables.

mod container;
mod planner;
mod prepass;
mod scheduler;
mod tables;

pub use scheduler::BlockList;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use slog::Logger;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compress_threads::ParallelCompressor;
use crate::compression::{self, AnyCodec};
use crate::config::{DedupMode, IndexBackend, StagingMode};
use crate::errors::{Error, Result};
use crate::index::{BlockIndex, IndexShape, LayerFactory};
use crate::shared_position_file::SharedWriteAt;
use crate::source::DataSource;
use crate::thread::WorkerPool;

use container::ContainerStore;
use planner::{PlacementSettings, Planner};
use prepass::Duplicates;
use scheduler::ScheduleItem;

const MAX_INDEX_SHARDS: usize = 256;

/// An image being built
pub struct Image {
    file: Box<dyn SharedWriteAt>,
    items: Vec<ScheduleItem>,
    planner: Planner,
    pool: Arc<WorkerPool>,
    compression: ParallelCompressor,
    dedup: DedupMode,
    container_size: u32,
    resume_checkpoint: Option<PathBuf>,
    layout: tables::Layout,
    logger: Logger,
}

/// What a flushed image holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Blocks placed, counting every reuse
    pub blocks: u64,
    /// Entries in the block table
    pub unique_blocks: u64,
    pub containers: u32,
    /// Uncompressed size of all containers
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
    /// Placements which resolved to an existing block
    pub reused_blocks: u64,
    /// Bytes of new blocks which were already present in a container
    pub overlapped_bytes: u64,
    pub index_evictions: u64,
    /// Total size of the image
    pub image_bytes: u64,
    pub packed_locators: bool,
}

impl Image {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        ImageBuilder::new().build_path(path)
    }

    pub fn from_writer(writer: Box<dyn SharedWriteAt>) -> Result<Self> {
        ImageBuilder::new().build(writer)
    }

    /// Schedule `source` to be cut into blocks of `block_size` bytes
    ///
    /// Sources are processed in order of `class`, then name. The returned list is filled in by
    /// [`flush`](Self::flush).
    pub fn schedule<S: DataSource + 'static>(
        &mut self,
        source: S,
        class: u32,
        block_size: u32,
    ) -> Result<BlockList> {
        self._schedule(Arc::new(source), class, block_size)
    }

    fn _schedule(
        &mut self,
        source: Arc<dyn DataSource>,
        class: u32,
        block_size: u32,
    ) -> Result<BlockList> {
        if block_size == 0 || block_size > self.container_size {
            return Err(Error::InvalidConfig(format!(
                "block size {} must be between 1 and the container size {}",
                block_size, self.container_size
            )));
        }
        let target = BlockList::default();
        self.planner.add_block_size(block_size);
        self.items.push(ScheduleItem {
            source,
            class,
            block_size,
            target: target.clone(),
        });
        Ok(target)
    }

    /// Schedule `source` with the image's default block size
    pub fn schedule_default<S: DataSource + 'static>(
        &mut self,
        source: S,
        class: u32,
    ) -> Result<BlockList> {
        let block_size = self.layout.block_size;
        self.schedule(source, class, block_size)
    }

    /// Place every scheduled block and write the image
    pub fn flush(mut self) -> Result<Summary> {
        slog::debug!(self.logger, "Sorting schedule"; "items" => self.items.len());
        scheduler::sort(&mut self.items);

        let duplicates = if self.dedup == DedupMode::AllWithPrepass {
            prepass::prepare(
                &self.items,
                &self.pool,
                self.resume_checkpoint.as_deref(),
                &self.logger,
            )?
        } else {
            if self.resume_checkpoint.is_some() {
                slog::warn!(self.logger, "Resume checkpoint ignored without the identical block prepass");
            }
            Duplicates::default()
        };

        let blocks = scheduler::place_all(
            &self.items,
            &mut self.planner,
            &duplicates,
            &self.logger,
        )?;
        let placed = self.planner.finish();
        slog::info!(self.logger, "Placed blocks";
            "blocks" => blocks,
            "unique_blocks" => placed.blocks.len(),
            "containers" => placed.containers.len(),
        );

        let container_count = placed.containers.len() as u32;
        let written = tables::write_image(
            &*self.file,
            &self.compression,
            self.layout,
            placed.containers,
            &placed.blocks,
            &self.logger,
        )?;

        let summary = Summary {
            blocks,
            unique_blocks: placed.blocks.len() as u64,
            containers: container_count,
            raw_bytes: written.raw_bytes,
            compressed_bytes: written.compressed_bytes,
            reused_blocks: placed.stats.reused,
            overlapped_bytes: placed.stats.overlapped_bytes,
            index_evictions: placed.index.map_or(0, |stats| stats.evictions),
            image_bytes: written.bytes_used,
            packed_locators: written.packed_locators,
        };
        slog::info!(self.logger, "Wrote image";
            "image_bytes" => summary.image_bytes,
            "raw_bytes" => summary.raw_bytes,
            "compressed_bytes" => summary.compressed_bytes,
            "reused_blocks" => summary.reused_blocks,
            "auto_index_hits" => placed.stats.auto_hits,
            "auto_index_entries" => placed.stats.auto_entries,
            "overlapped_bytes" => summary.overlapped_bytes,
            "index_evictions" => summary.index_evictions,
        );
        Ok(summary)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Image")
            .field("items", &self.items)
            .field("dedup", &self.dedup)
            .field("layout", &self.layout)
            .field("compression", &self.compression)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    /// Block size used by [`Image::schedule_default`]
    pub block_size: u32,
    /// Most bytes a container can hold before compression
    pub container_size: u32,
    /// Room a plain append has to leave in a container
    pub min_free_space: u32,
    pub min_overlap: u32,
    /// Overlap lengths must be a multiple of this. 0 disables overlapping.
    pub overlap_granularity: u32,
    /// How many containers are searched for each new block
    pub max_candidates: usize,
    /// Distance between windows entered into the auto index
    pub autoindex_period: u32,
    /// Growth of a container which triggers auto indexing
    pub autoindex_interval: u32,
    pub dedup: DedupMode,
    pub index_backend: IndexBackend,
    pub index_shards: usize,
    pub max_index_layers: usize,
    pub index_layer_entries: usize,
    pub compressor: compression::Kind,
    pub compression_level: Option<i32>,
    pub pack_locators: bool,
    pub sparse_containers: bool,
    /// Stage containers and disk index segments in temporary files here
    pub staging_dir: Option<PathBuf>,
    pub threads: usize,
    pub resume_checkpoint: Option<PathBuf>,

    compression_options: Vec<(String, String)>,
    modified_time: DateTime<Utc>,
    logger: Option<Logger>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder {
            block_size: repr::BLOCK_SIZE_DEFAULT,
            container_size: repr::CONTAINER_SIZE_DEFAULT,
            min_free_space: 16,
            min_overlap: 0,
            overlap_granularity: 1,
            max_candidates: 2,
            autoindex_period: 256,
            autoindex_interval: 256 * 1024,
            dedup: DedupMode::default(),
            index_backend: IndexBackend::default(),
            index_shards: 16,
            max_index_layers: 8,
            index_layer_entries: 1 << 20,
            compressor: compression::Kind::default(),
            compression_level: None,
            pack_locators: true,
            sparse_containers: false,
            staging_dir: None,
            threads: num_cpus::get(),
            resume_checkpoint: None,
            compression_options: Vec::new(),
            modified_time: Utc::now(),
            logger: None,
        }
    }
}

impl ImageBuilder {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.container_size == 0 || self.container_size > repr::CONTAINER_SIZE_MAX {
            return invalid(format!(
                "container size {} must be between 1 and {}",
                self.container_size,
                repr::CONTAINER_SIZE_MAX
            ));
        }
        if self.block_size < repr::BLOCK_SIZE_MIN || self.block_size > self.container_size {
            return invalid(format!(
                "block size {} must be between {} and the container size {}",
                self.block_size,
                repr::BLOCK_SIZE_MIN,
                self.container_size
            ));
        }
        if self.min_free_space >= self.container_size {
            return invalid(format!(
                "minimum free space {} must be less than the container size {}",
                self.min_free_space, self.container_size
            ));
        }
        if self.index_shards == 0
            || self.index_shards > MAX_INDEX_SHARDS
            || !self.index_shards.is_power_of_two()
        {
            return invalid(format!(
                "index shard count {} must be a power of two up to {}",
                self.index_shards, MAX_INDEX_SHARDS
            ));
        }
        if self.max_candidates == 0 {
            return invalid("at least one candidate container must be searched".to_string());
        }
        if self.autoindex_period == 0 {
            return invalid("auto index period must not be zero".to_string());
        }
        if self.max_index_layers == 0 || self.index_layer_entries == 0 {
            return invalid("index segments must hold at least one entry".to_string());
        }
        if !self.compressor.supported() {
            return Err(Error::DisabledCompression(self.compressor));
        }
        Ok(())
    }

    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_modification_time(&mut self, time: DateTime<Utc>) -> &mut Self {
        self.modified_time = time;
        self
    }

    pub fn set_logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = Some(logger);
        self
    }

    /// Set a codec specific option, such as `compression_level`
    pub fn set_compression_option<F: Into<String>, V: Into<String>>(
        &mut self,
        field: F,
        value: V,
    ) -> &mut Self {
        self.compression_options.push((field.into(), value.into()));
        self
    }

    fn codec(&self) -> Result<AnyCodec> {
        let mut options = self.compression_options.clone();
        if let Some(level) = self.compression_level {
            options.push(("compression_level".to_string(), level.to_string()));
        }
        AnyCodec::configured(self.compressor, &options)
    }

    pub fn build(self, writer: Box<dyn SharedWriteAt>) -> Result<Image> {
        self.validate()?;

        let logger = self.logger.clone().unwrap_or_else(crate::default_logger);
        let modification_time = date_time_to_mtime(self.modified_time, &logger);
        let codec = self.codec()?;
        slog::debug!(logger, "Configured compression"; "kind" => %codec.kind(), "config" => ?codec.config());

        let pool = Arc::new(WorkerPool::new(self.threads));
        let compression = ParallelCompressor::new(codec.clone(), Arc::clone(&pool));

        let index = if self.dedup.uses_index() {
            let factory =
                LayerFactory::new(self.index_backend, Some(codec), self.staging_dir.clone());
            let shape = IndexShape {
                shards: self.index_shards,
                max_layers: self.max_index_layers,
                layer_entries: self.index_layer_entries,
            };
            Some(BlockIndex::new(&factory, shape, &logger.new(slog::o!("index" => "blocks"))))
        } else {
            None
        };
        let staging = match &self.staging_dir {
            Some(dir) => StagingMode::Mapped(dir.clone()),
            None => StagingMode::Memory,
        };
        let store = ContainerStore::new(self.container_size, self.min_free_space, staging);
        let settings = PlacementSettings {
            dedup: self.dedup,
            min_overlap: self.min_overlap,
            overlap_granularity: self.overlap_granularity,
            max_candidates: self.max_candidates,
            autoindex_period: self.autoindex_period,
            autoindex_interval: self.autoindex_interval,
        };
        let planner = Planner::new(settings, store, index, Arc::clone(&pool), logger.clone());

        Ok(Image {
            file: writer,
            items: Vec::new(),
            planner,
            pool,
            compression,
            dedup: self.dedup,
            container_size: self.container_size,
            resume_checkpoint: self.resume_checkpoint,
            layout: tables::Layout {
                block_size: self.block_size,
                container_size: self.container_size,
                pack_locators: self.pack_locators,
                sparse_containers: self.sparse_containers,
                modification_time,
            },
            logger,
        })
    }

    pub fn build_path<P: AsRef<Path>>(self, path: P) -> Result<Image> {
        self._build_path(path.as_ref())
    }

    fn _build_path(mut self, path: &Path) -> Result<Image> {
        let logger = self.logger.take().unwrap_or_else(crate::default_logger);
        let path_str = path.display().to_string();
        self.logger = Some(logger.new(slog::o!("file" => path_str)));

        let file = Mutex::new(fs::File::create(path)?);
        self.build(Box::new(file))
    }
}

fn date_time_to_mtime(date_time: DateTime<Utc>, logger: &Logger) -> u32 {
    let mtime = date_time.timestamp();
    if mtime > u32::MAX.into() {
        slog::warn!(logger, "Modification time is out of range"; "date" => %date_time);
        u32::MAX
    } else if mtime < u32::MIN.into() {
        slog::warn!(logger, "Modification time is out of range"; "date" => %date_time);
        u32::MIN
    } else {
        mtime as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_are_valid() {
        ImageBuilder::new().validate().unwrap();
    }

    #[test]
    fn bad_settings_are_rejected() {
        let check = |f: fn(&mut ImageBuilder)| {
            let mut builder = ImageBuilder::new();
            f(&mut builder);
            assert!(matches!(builder.validate(), Err(Error::InvalidConfig(_))), "{:?}", builder);
        };
        check(|b| b.block_size = 0);
        check(|b| b.block_size = b.container_size + 1);
        check(|b| b.container_size = repr::CONTAINER_SIZE_MAX + 1);
        check(|b| b.min_free_space = b.container_size);
        check(|b| b.index_shards = 3);
        check(|b| b.index_shards = 512);
        check(|b| b.max_candidates = 0);
        check(|b| b.autoindex_period = 0);
    }

    #[test]
    fn bad_compression_level() {
        let mut builder = ImageBuilder::new();
        builder.compression_level = Some(1000);
        builder.set_logger(crate::test_logger());
        let writer = Box::new(Arc::new(Mutex::new(Vec::<u8>::new())));
        assert!(matches!(builder.build(writer), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn mtime_is_clamped() {
        let logger = crate::test_logger();
        assert_eq!(date_time_to_mtime(Utc.timestamp_opt(-5, 0).unwrap(), &logger), 0);
        assert_eq!(date_time_to_mtime(Utc.timestamp_opt(1 << 33, 0).unwrap(), &logger), u32::MAX);
        assert_eq!(date_time_to_mtime(Utc.timestamp_opt(1000, 0).unwrap(), &logger), 1000);
    }

    #[test]
    fn zero_block_size_is_rejected_when_scheduling() {
        let mut builder = ImageBuilder::new();
        builder.set_logger(crate::test_logger());
        let mut image = builder
            .build(Box::new(Arc::new(Mutex::new(Vec::<u8>::new()))))
            .unwrap();
        let source = crate::MemorySource::new("a", b"data".to_vec());
        assert!(image.schedule(source, 0, 0).is_err());
    }
}
