use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::{Le16, Le32, Le64};

/// The magic constant which marks a crfs image ("crfs" read as a little endian u32)
pub const MAGIC: u32 = 0x7366_7263;

/// The supported major version of the image layout
pub const VERSION_MAJOR: u16 = 1;
/// The supported minor version of the image layout
pub const VERSION_MINOR: u16 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Superblock {
    /// Must match the value of [`MAGIC`](constant.MAGIC.html) to be considered a crfs image
    pub magic: Le32,
    pub version_major: Le16,
    pub version_minor: Le16,
    /// See [`Flags`](struct.Flags.html)
    pub flags: Le32,
    /// The ID of the compression algorithm used for containers and the block table
    pub compression_id: Le16,
    pub _reserved: Le16,
    /// The default size of a block in bytes. Individual files may use smaller blocks.
    pub block_size: Le32,
    /// The maximum raw (uncompressed) size of a container
    pub container_size: Le32,
    /// The number of entries in the block table
    pub block_count: Le32,
    /// The number of records in the container table
    pub container_count: Le32,
    /// Seconds since the unix epoch when the image was created. Unsigned, expires in 2106.
    pub modification_time: Le32,
    pub _padding: Le32,
    /// The byte offset of the first container record
    pub container_table_start: Le64,
    /// The byte offset of the block table record
    pub block_table_start: Le64,
    /// The size of the block table record on disk, including its length prefix
    pub block_table_size: Le64,
    /// The number of bytes used by the image
    pub bytes_used: Le64,
}

const_assert_eq!(std::mem::size_of::<Superblock>(), Superblock::SIZE);

impl Superblock {
    pub const SIZE: usize = 72;

    pub fn flags(&self) -> Option<Flags> {
        Flags::from_bits(self.flags.get())
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Flags: u32 {
        /// The block table holds 4 byte packed locators (`container * container_size + offset`)
        /// instead of 8 byte `(container, offset)` pairs
        const PACKED_LOCATORS   = 1;
        /// Container records are stored at a fixed stride of `4 + container_size` bytes
        const SPARSE_CONTAINERS = 1 << 1;
    }
}
