//! Deduplicating block storage
//!
//! Blocks of input data are packed into fixed-capacity containers. A block which is already
//! stored, or which overlaps the tail of a container, takes up little or no new space. Each
//! container is compressed on its own, and every block is addressed by a (container, offset)
//! locator in the block table.

pub mod compress_threads;
pub mod compression;
pub mod config;
pub mod errors;
pub mod hash;
pub mod index;
pub mod pool;
pub mod read;
pub mod search;
pub mod shared_position_file;
pub mod source;
mod thread;
pub mod write;

pub use errors::{Error, Result};
pub use source::{DataSource, FileSource, MemorySource};
pub use write::{BlockList, Image, ImageBuilder, Summary};

use slog::{Drain, Logger};

/// Index of a block in the block table
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockNum(pub u32);

/// Where a block's bytes start inside the uncompressed data of a container
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Location {
    pub container: u32,
    pub offset: u32,
}

impl Location {
    pub fn new(container: u32, offset: u32) -> Self {
        Self { container, offset }
    }
}

pub fn default_logger() -> Logger {
    Logger::root(slog_stdlog::StdLog.fuse(), slog::o!())
}

#[cfg(test)]
pub(crate) fn test_logger() -> Logger {
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};
    use sloggers::types::Severity;
    use sloggers::Build;

    TerminalLoggerBuilder::new()
        .level(Severity::Debug)
        .destination(Destination::Stderr)
        .build()
        .unwrap()
}
