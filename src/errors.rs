use crate::compression::Kind;
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("container {container} would grow to {size} bytes, over the {capacity} byte limit")]
    CapacityExceeded {
        container: u32,
        size: u64,
        capacity: u32,
    },
    #[error("compressed container {container} is {size} bytes, which does not fit a {stride} byte sparse record")]
    CompressedTooLarge {
        container: u32,
        size: usize,
        stride: u64,
    },
    #[error("corrupt data: {0}")]
    Corruption(String),
    #[error("resume checkpoint refers to block {position}, but the batch only has {blocks} blocks")]
    ResumeOutOfRange { position: u64, blocks: u64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("crfs built without support for {0}")]
    DisabledCompression(Kind),
    #[error("unknown compression type: {0}")]
    UnknownCompression(u16),
    #[error("magic mismatch: expected {:#x}, got {magic:#x}", repr::superblock::MAGIC)]
    BadMagic { magic: u32 },
    #[error("invalid image version {major}.{minor}: crfs only supports version {}.{}", repr::superblock::VERSION_MAJOR, repr::superblock::VERSION_MINOR)]
    BadVersion { major: u16, minor: u16 },
}

impl Error {
    pub(crate) fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }
}
