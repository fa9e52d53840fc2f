use positioned_io::{ReadAt, WriteAt};
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use super::layer::{decode_record, encode_record, record_size, HashLayer, Slot};

/// A segment kept in an unlinked temporary file, addressed directly by key
///
/// The file is a flat array of records. It is only ever written where keys are stored, so on
/// filesystems with sparse file support it takes space proportional to the entries held. Reads
/// past the end, and holes, read as absent records.
#[derive(Debug)]
pub struct FileLayer<V> {
    file: File,
    len: usize,
    record: Vec<u8>,
    _marker: PhantomData<V>,
}

impl<V: Slot> FileLayer<V> {
    pub fn new(dir: Option<&Path>) -> io::Result<Self> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self {
            file,
            len: 0,
            record: vec![0; record_size::<V>()],
            _marker: PhantomData,
        })
    }

    fn position(key: u32) -> u64 {
        u64::from(key) * record_size::<V>() as u64
    }

    fn read_record(&mut self, key: u32) -> io::Result<Option<V>> {
        let pos = Self::position(key);
        let mut filled = 0;
        while filled < self.record.len() {
            match self.file.read_at(pos + filled as u64, &mut self.record[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if filled < self.record.len() {
            // Past the end of the file
            return Ok(None);
        }
        Ok(decode_record(&self.record))
    }

    fn write_record(&mut self, key: u32, value: Option<V>) -> io::Result<()> {
        encode_record(value, &mut self.record);
        self.file.write_all_at(Self::position(key), &self.record)
    }
}

impl<V: Slot> HashLayer<V> for FileLayer<V> {
    fn get(&mut self, key: u32) -> io::Result<Option<V>> {
        self.read_record(key)
    }

    fn put(&mut self, key: u32, value: V) -> io::Result<()> {
        let was_present = self.read_record(key)?.is_some();
        self.write_record(key, Some(value))?;
        if !was_present {
            self.len += 1;
        }
        Ok(())
    }

    fn delete(&mut self, key: u32) -> io::Result<()> {
        if self.read_record(key)?.is_some() {
            self.write_record(key, None)?;
            self.len -= 1;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::layer::suite;
    use crate::BlockNum;

    #[test]
    fn file_layer() {
        let dir = tempfile::tempdir().unwrap();
        suite::basic_operations(FileLayer::new(Some(dir.path())).unwrap());
        suite::spread_keys(FileLayer::new(None).unwrap(), 1 << 20);
    }

    #[test]
    fn holes_read_as_absent() {
        let mut layer = FileLayer::new(None).unwrap();
        layer.put(1000, BlockNum(3)).unwrap();
        assert_eq!(layer.get(10).unwrap(), None);
        assert_eq!(layer.get(999).unwrap(), None);
        assert_eq!(layer.get(1000).unwrap(), Some(BlockNum(3)));
        assert_eq!(layer.get(100_000).unwrap(), None);
    }
}
