//! Inputs to be split into blocks

use bstr::{BStr, BString, ByteSlice};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A named stream of bytes which can be opened more than once
///
/// Sources are read once while blocks are placed, and once more if a prepass is enabled.
pub trait DataSource: Send + Sync {
    /// Used to order sources of the same class
    fn name(&self) -> &BStr;
    fn len(&self) -> u64;
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct MemorySource {
    name: BString,
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new<N: Into<BString>, D: Into<Arc<[u8]>>>(name: N, data: D) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl DataSource for MemorySource {
    fn name(&self) -> &BStr {
        self.name.as_bstr()
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(ArcBytes(Arc::clone(&self.data)))))
    }
}

struct ArcBytes(Arc<[u8]>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A file on disk, named by its path
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: BString,
    len: u64,
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::_new(path.as_ref())
    }

    fn _new(path: &Path) -> io::Result<Self> {
        let len = path.metadata()?.len();
        let name = BString::from(path.to_string_lossy().as_bytes());
        Ok(Self {
            path: path.to_owned(),
            name,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for FileSource {
    fn name(&self) -> &BStr {
        self.name.as_bstr()
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        // Limit reads to the size seen when the source was created
        Ok(Box::new(File::open(&self.path)?.take(self.len)))
    }
}

/// Reads until `buf` is full or the stream ends, returning the number of bytes read
pub(crate) fn read_block<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
