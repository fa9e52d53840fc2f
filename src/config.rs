/// How hard to look for data which is already stored
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DedupMode {
    /// Store every block
    ///
    /// No index lookups or overlap searches are done, blocks are appended to containers
    None,
    /// Only share blocks which consist entirely of zero bytes
    BlanksOnly,
    /// Reuse identical blocks, and overlap new blocks with the tail of existing containers
    All,
    /// Like `All`, with an extra pass over the whole batch to find identical blocks up front
    AllWithPrepass,
}

impl DedupMode {
    pub(crate) fn uses_index(self) -> bool {
        self != DedupMode::None
    }

    pub(crate) fn searches_overlap(self) -> bool {
        matches!(self, DedupMode::All | DedupMode::AllWithPrepass)
    }
}

impl Default for DedupMode {
    fn default() -> Self {
        DedupMode::All
    }
}

/// Storage for the content-addressable index while an image is built
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexBackend {
    /// Plain in-memory hash maps
    Memory,
    /// Buckets of entries, each compressed individually, decompressed when touched
    Compressed,
    /// Sparse temporary files, addressed directly by hash
    DiskFile,
}

impl Default for IndexBackend {
    fn default() -> Self {
        IndexBackend::Memory
    }
}

/// Where the mutable bytes of a container live until it is compressed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StagingMode {
    Memory,
    /// Memory mapped temporary files created in the given directory
    Mapped(std::path::PathBuf),
}

impl Default for StagingMode {
    fn default() -> Self {
        StagingMode::Memory
    }
}
