//! The block table maps a block number to the position of the block's bytes inside the raw
//! (uncompressed) address space of the containers.
//!
//! It is stored as a single length-prefixed compressed record. Once decompressed, it is a flat
//! array indexed by block number. Which of the two entry encodings is used is decided once per
//! image, and recorded by the `PACKED_LOCATORS` superblock flag:
//!
//! * Packed: a u32 `container * container_size + offset`. Only usable when every possible
//!   value fits, i.e. `(container_size - 1) * container_count < 2^32`.
//! * Unpacked: a u32 container id followed by a u32 offset.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::Le32;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Packed(pub Le32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Unpacked {
    pub container: Le32,
    pub offset: Le32,
}

const_assert_eq!(std::mem::size_of::<Packed>(), 4);
const_assert_eq!(std::mem::size_of::<Unpacked>(), 8);

/// A decoded block table entry
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Packed(u32),
    Unpacked { container: u32, offset: u32 },
}

/// How locators are encoded in one image
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    Packed { container_size: u32 },
    Unpacked,
}

impl Format {
    /// Choose the packed encoding if it can represent every block of the image
    pub fn choose(allow_packed: bool, container_size: u32, container_count: u32) -> Self {
        let max_value = u64::from(container_size.saturating_sub(1)) * u64::from(container_count);
        if allow_packed && container_size > 0 && max_value < (1 << 32) {
            Format::Packed { container_size }
        } else {
            Format::Unpacked
        }
    }

    pub fn entry_size(self) -> usize {
        match self {
            Format::Packed { .. } => std::mem::size_of::<Packed>(),
            Format::Unpacked => std::mem::size_of::<Unpacked>(),
        }
    }

    /// Encode a `(container, offset)` pair. Returns None if the pair has no packed form.
    pub fn encode(self, container: u32, offset: u32) -> Option<Locator> {
        match self {
            Format::Packed { container_size } => {
                let value = u64::from(container) * u64::from(container_size) + u64::from(offset);
                if offset >= container_size || value > u64::from(u32::MAX) {
                    return None;
                }
                Some(Locator::Packed(value as u32))
            }
            Format::Unpacked => Some(Locator::Unpacked { container, offset }),
        }
    }

    /// Split a locator back into `(container, offset)`
    pub fn decode(self, locator: Locator) -> (u32, u32) {
        match (self, locator) {
            (Format::Packed { container_size }, Locator::Packed(value)) => {
                (value / container_size, value % container_size)
            }
            (_, Locator::Unpacked { container, offset }) => (container, offset),
            (Format::Unpacked, Locator::Packed(value)) => (0, value),
        }
    }

    pub fn write_entry(self, locator: Locator, out: &mut Vec<u8>) {
        match locator {
            Locator::Packed(value) => out.extend_from_slice(Packed(Le32::new(value)).as_bytes()),
            Locator::Unpacked { container, offset } => out.extend_from_slice(
                Unpacked {
                    container: Le32::new(container),
                    offset: Le32::new(offset),
                }
                .as_bytes(),
            ),
        }
    }

    /// Parse one entry from the front of `data`
    pub fn read_entry(self, data: &[u8]) -> Option<Locator> {
        match self {
            Format::Packed { .. } => {
                let packed = Packed::read_from_prefix(data)?;
                Some(Locator::Packed(packed.0.get()))
            }
            Format::Unpacked => {
                let unpacked = Unpacked::read_from_prefix(data)?;
                Some(Locator::Unpacked {
                    container: unpacked.container.get(),
                    offset: unpacked.offset.get(),
                })
            }
        }
    }
}
