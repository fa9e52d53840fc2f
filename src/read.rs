//! Reading blocks back out of an image

use crate::compression::{self, AnyCodec};
use crate::errors::{Error, Result};
use crate::{BlockNum, Location};
use indexmap::IndexMap;
use positioned_io::{RandomAccessFile, ReadAt};
use repr::container::{sparse_stride, RecordHeader};
use repr::locator::Format;
use repr::superblock::{Flags, Superblock};
use slog::Logger;
use std::path::Path;
use std::sync::Arc;
use zerocopy::FromBytes;

/// Decompressed container bytes kept around by default
pub const DEFAULT_CACHE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct ContainerRecord {
    /// Start of the compressed data
    position: u64,
    size: u32,
}

#[derive(Debug)]
pub struct Image<R> {
    reader: R,
    superblock: Superblock,
    flags: Flags,
    codec: AnyCodec,
    containers: Vec<ContainerRecord>,
    blocks: Vec<Location>,
    cache: IndexMap<u32, Arc<Vec<u8>>>,
    cache_bytes: usize,
    cache_limit: usize,
    logger: Logger,
}

impl Image<RandomAccessFile> {
    pub fn open<P: AsRef<Path>>(p: P) -> Result<Self> {
        Image::open_with_logger(p, crate::default_logger())
    }

    pub fn open_with_logger<P: AsRef<Path>>(p: P, logger: Logger) -> Result<Self> {
        Self::_open_with_logger(p.as_ref(), logger)
    }

    fn _open_with_logger(path: &Path, logger: Logger) -> Result<Self> {
        let path_str = path.display().to_string();
        let logger = logger.new(slog::o!("file" => path_str));
        let file = RandomAccessFile::open(path)?;
        Self::with_logger(file, logger)
    }
}

impl<R: ReadAt> Image<R> {
    pub fn new(reader: R) -> Result<Self> {
        Self::with_logger(reader, crate::default_logger())
    }

    pub fn with_logger(reader: R, logger: Logger) -> Result<Self> {
        let mut raw = [0; Superblock::SIZE];
        reader.read_exact_at(0, &mut raw)?;
        let superblock = Superblock::read_from(&raw[..])
            .ok_or_else(|| Error::corruption("short superblock"))?;
        log_superblock(&logger, &superblock);

        let (flags, kind) = validate_superblock(&superblock)?;
        let codec = AnyCodec::new(kind)?;
        slog::debug!(logger, "Loaded compressor"; "compression_kind" => %kind);

        let mut image = Self {
            reader,
            superblock,
            flags,
            codec,
            containers: Vec::new(),
            blocks: Vec::new(),
            cache: IndexMap::new(),
            cache_bytes: 0,
            cache_limit: DEFAULT_CACHE_BYTES,
            logger,
        };
        image.containers = image.read_container_records()?;
        image.blocks = image.read_block_table()?;
        Ok(image)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn block_location(&self, block: BlockNum) -> Option<Location> {
        self.blocks.get(block.0 as usize).copied()
    }

    /// Most decompressed container bytes to keep cached
    pub fn set_cache_limit(&mut self, bytes: usize) {
        self.cache_limit = bytes;
        self.trim_cache();
    }

    /// The `len` bytes of `block`
    pub fn read_block(&mut self, block: BlockNum, len: usize) -> Result<Vec<u8>> {
        let location = self.block_location(block).ok_or_else(|| {
            Error::corruption(format!(
                "block {} is past the end of the block table ({} blocks)",
                block.0,
                self.blocks.len()
            ))
        })?;
        let container = self.container_data(location.container)?;
        let start = location.offset as usize;
        container
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                Error::corruption(format!(
                    "block {} ({} bytes at {:?}) is outside its container ({} bytes)",
                    block.0,
                    len,
                    location,
                    container.len()
                ))
            })
    }

    /// Reassemble `total_len` bytes stored as `blocks` of `block_size` bytes each
    pub fn read_list(
        &mut self,
        blocks: &[BlockNum],
        total_len: u64,
        block_size: u32,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_len as usize);
        let mut remaining = total_len;
        for &block in blocks {
            let len = remaining.min(u64::from(block_size));
            if len == 0 {
                break;
            }
            out.extend_from_slice(&self.read_block(block, len as usize)?);
            remaining -= len;
        }
        if remaining != 0 {
            return Err(Error::corruption(format!(
                "{} blocks hold {} bytes less than the expected {}",
                blocks.len(),
                remaining,
                total_len
            )));
        }
        Ok(out)
    }

    /// The uncompressed contents of container `id`
    pub fn container_data(&mut self, id: u32) -> Result<Arc<Vec<u8>>> {
        // Most recently used goes last
        if let Some(data) = self.cache.shift_remove(&id) {
            self.cache.insert(id, Arc::clone(&data));
            return Ok(data);
        }

        let record = *self.containers.get(id as usize).ok_or_else(|| {
            Error::corruption(format!(
                "container {} is past the end of the container table ({} containers)",
                id,
                self.containers.len()
            ))
        })?;
        let mut compressed = vec![0; record.size as usize];
        self.reader.read_exact_at(record.position, &mut compressed)?;
        let mut data = Vec::new();
        let max_size = self.superblock.container_size.get() as usize;
        self.codec.decompress_into(&compressed, &mut data, max_size)?;
        slog::trace!(self.logger, "Loaded container"; "container" => id, "size" => data.len());

        let data = Arc::new(data);
        self.cache_bytes += data.len();
        self.cache.insert(id, Arc::clone(&data));
        self.trim_cache();
        Ok(data)
    }

    fn trim_cache(&mut self) {
        // The newest entry stays, even when it is over the limit alone
        while self.cache_bytes > self.cache_limit && self.cache.len() > 1 {
            if let Some((_, evicted)) = self.cache.shift_remove_index(0) {
                self.cache_bytes -= evicted.len();
            }
        }
    }

    fn read_record_header(&self, position: u64) -> Result<u32> {
        let mut raw = [0; RecordHeader::SIZE];
        self.reader.read_exact_at(position, &mut raw)?;
        let header = RecordHeader::read_from(&raw[..])
            .ok_or_else(|| Error::corruption("short record header"))?;
        Ok(header.size.get())
    }

    fn read_container_records(&self) -> Result<Vec<ContainerRecord>> {
        let count = self.superblock.container_count.get();
        let container_size = self.superblock.container_size.get();
        let table_start = self.superblock.container_table_start.get();
        let table_end = self.superblock.block_table_start.get();
        let sparse = self.flags.contains(Flags::SPARSE_CONTAINERS);

        let mut records = Vec::with_capacity(count as usize);
        let mut position = table_start;
        for id in 0..count {
            if sparse {
                position = table_start + u64::from(id) * sparse_stride(container_size);
            }
            let size = self.read_record_header(position)?;
            let data_start = position + RecordHeader::SIZE as u64;
            if (sparse && size > container_size) || data_start + u64::from(size) > table_end {
                return Err(Error::corruption(format!(
                    "container {} record of {} bytes at {} overruns the container table",
                    id, size, position
                )));
            }
            records.push(ContainerRecord {
                position: data_start,
                size,
            });
            position = data_start + u64::from(size);
        }
        Ok(records)
    }

    fn read_block_table(&mut self) -> Result<Vec<Location>> {
        let start = self.superblock.block_table_start.get();
        let size = self.read_record_header(start)?;
        if u64::from(size) + RecordHeader::SIZE as u64 != self.superblock.block_table_size.get() {
            return Err(Error::corruption(format!(
                "block table record holds {} bytes, the superblock says {}",
                size,
                self.superblock.block_table_size.get()
            )));
        }
        let mut compressed = vec![0; size as usize];
        self.reader
            .read_exact_at(start + RecordHeader::SIZE as u64, &mut compressed)?;

        let format = if self.flags.contains(Flags::PACKED_LOCATORS) {
            Format::Packed {
                container_size: self.superblock.container_size.get(),
            }
        } else {
            Format::Unpacked
        };
        let block_count = self.superblock.block_count.get() as usize;
        let expected = block_count * format.entry_size();
        let mut table = Vec::new();
        self.codec.decompress_into(&compressed, &mut table, expected)?;
        if table.len() != expected {
            return Err(Error::corruption(format!(
                "block table is {} bytes, expected {}",
                table.len(),
                expected
            )));
        }

        let container_count = self.containers.len() as u32;
        let mut blocks = Vec::with_capacity(block_count);
        for entry in table.chunks_exact(format.entry_size()) {
            let locator = format
                .read_entry(entry)
                .ok_or_else(|| Error::corruption("short block table entry"))?;
            let (container, offset) = format.decode(locator);
            if container >= container_count {
                return Err(Error::corruption(format!(
                    "block {} refers to container {} of {}",
                    blocks.len(),
                    container,
                    container_count
                )));
            }
            blocks.push(Location::new(container, offset));
        }
        slog::debug!(self.logger, "Loaded block table"; "blocks" => blocks.len(), "packed" => format != Format::Unpacked);
        Ok(blocks)
    }
}

fn validate_superblock(superblock: &Superblock) -> Result<(Flags, compression::Kind)> {
    let magic = superblock.magic.get();
    if magic != repr::superblock::MAGIC {
        return Err(Error::BadMagic { magic });
    }
    let (major, minor) = (superblock.version_major.get(), superblock.version_minor.get());
    if major != repr::superblock::VERSION_MAJOR || minor != repr::superblock::VERSION_MINOR {
        return Err(Error::BadVersion { major, minor });
    }
    let flags = superblock.flags().ok_or_else(|| {
        Error::corruption(format!(
            "unknown superblock flags in {:#x}",
            superblock.flags.get()
        ))
    })?;
    let container_size = superblock.container_size.get();
    if container_size == 0 || container_size > repr::CONTAINER_SIZE_MAX {
        return Err(Error::corruption(format!(
            "container size {} is out of range",
            container_size
        )));
    }

    let id = superblock.compression_id.get();
    let kind = compression::Kind::from_id(repr::compression::Id(id));
    if kind == compression::Kind::Unknown {
        return Err(Error::UnknownCompression(id));
    }
    if !kind.supported() {
        return Err(Error::DisabledCompression(kind));
    }
    Ok((flags, kind))
}

fn log_superblock(logger: &Logger, superblock: &Superblock) {
    slog::debug!(logger, "Read superblock";
        "magic" => superblock.magic.get(),
        "version_major" => superblock.version_major.get(),
        "version_minor" => superblock.version_minor.get(),
        "flags" => superblock.flags.get(),
        "compression_id" => superblock.compression_id.get(),
        "block_size" => superblock.block_size.get(),
        "container_size" => superblock.container_size.get(),
        "block_count" => superblock.block_count.get(),
        "container_count" => superblock.container_count.get(),
        "modification_time" => superblock.modification_time.get(),
        "container_table_start" => superblock.container_table_start.get(),
        "block_table_start" => superblock.block_table_start.get(),
        "block_table_size" => superblock.block_table_size.get(),
        "bytes_used" => superblock.bytes_used.get()
    )
}
