//! A resume checkpoint records duplicate decisions made by the global identical-block pass, so an
//! aborted build can skip that pass when it is re-run over the same input.
//!
//! The layout is a [`Header`](struct.Header.html) followed by `pair_count`
//! [`Pair`](struct.Pair.html)s. Positions are indexes into the sequence of all blocks of the
//! batch, in processing order.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::Le64;

pub const MAGIC: [u8; 8] = *b"CRFSRSM\x01";

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Header {
    pub magic: [u8; 8],
    /// The number of blocks in the batch the checkpoint was taken from
    pub block_count: Le64,
    pub pair_count: Le64,
}

/// `later` holds the same bytes as `earlier`, and should reuse its block
#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Pair {
    pub later: Le64,
    pub earlier: Le64,
}

const_assert_eq!(std::mem::size_of::<Header>(), 24);
const_assert_eq!(std::mem::size_of::<Pair>(), 16);
