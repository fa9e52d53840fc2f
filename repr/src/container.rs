//! The container table is a sequence of records, one per container, in container id order.
//! Each record is a u32 length followed by that many bytes of compressed container data.
//!
//! In sparse mode, record `i` starts at `container_table_start + i * (4 + container_size)`,
//! leaving room for the container to later grow in place. Otherwise records are packed.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::Le32;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    /// The size of the following compressed data on disk
    pub size: Le32,
}

const_assert_eq!(std::mem::size_of::<RecordHeader>(), RecordHeader::SIZE);

impl RecordHeader {
    pub const SIZE: usize = 4;

    pub fn new(size: u32) -> Self {
        Self {
            size: Le32::new(size),
        }
    }
}

/// The distance between sparse container records
pub fn sparse_stride(container_size: u32) -> u64 {
    RecordHeader::SIZE as u64 + u64::from(container_size)
}
