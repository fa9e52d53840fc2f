//! A crfs image consists of three parts, packed together on a byte alignment:
//!
//! * [Superblock](superblock/index.html)
//! * [Container Table](container/index.html)
//! * [Block Table](locator/index.html)
//!
//! All integers are stored little endian. The structures in this crate are plain byte layouts,
//! they may be read from or written to any byte slice of the right length.

use zerocopy::byteorder::{LittleEndian, U16, U32, U64};

pub mod checkpoint;
pub mod compression;
pub mod container;
pub mod locator;
pub mod superblock;

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;

pub const BLOCK_SIZE_MIN: u32 = 1;
pub const BLOCK_SIZE_DEFAULT: u32 = 64 * 1024;

pub const CONTAINER_SIZE_DEFAULT: u32 = 2 * 1024 * 1024;
/// Containers are addressed with 32 bit offsets, and packed locators need headroom above that
pub const CONTAINER_SIZE_MAX: u32 = 1 << 31;

/// Block numbers as stored in a block list
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlocknumWidth {
    W16,
    W24,
    W32,
}

impl BlocknumWidth {
    /// The narrowest width which can address `count` blocks
    pub fn for_count(count: u64) -> Self {
        if count <= 0x1_0000 {
            BlocknumWidth::W16
        } else if count <= 0x100_0000 {
            BlocknumWidth::W24
        } else {
            BlocknumWidth::W32
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            BlocknumWidth::W16 => 2,
            BlocknumWidth::W24 => 3,
            BlocknumWidth::W32 => 4,
        }
    }
}

#[test]
fn blocknum_widths() {
    assert_eq!(BlocknumWidth::for_count(0), BlocknumWidth::W16);
    assert_eq!(BlocknumWidth::for_count(0x1_0000), BlocknumWidth::W16);
    assert_eq!(BlocknumWidth::for_count(0x1_0001), BlocknumWidth::W24);
    assert_eq!(BlocknumWidth::for_count(0x100_0001), BlocknumWidth::W32);
    assert_eq!(BlocknumWidth::W24.bytes(), 3);
}
