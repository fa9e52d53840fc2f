use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;

use super::layer::{decode_record, encode_record, record_size, HashLayer, Slot};
use crate::compression::AnyCodec;
use crate::hash;

/// Keys per bucket
pub const BUCKET_SLOTS: u32 = 0x1000;

/// A segment stored as individually compressed buckets of fixed-size records
///
/// Only one bucket is kept decompressed at a time. It is written back, recompressed, when a
/// different bucket is touched and it was modified. Buckets which were never written take no
/// space at all.
#[derive(Debug)]
pub struct CompressedLayer<V> {
    codec: AnyCodec,
    buckets: HashMap<u32, Vec<u8>>,
    cache: Option<Cached>,
    len: usize,
    _marker: PhantomData<V>,
}

#[derive(Debug)]
struct Cached {
    bucket: u32,
    data: Vec<u8>,
    dirty: bool,
}

impl<V: Slot> CompressedLayer<V> {
    pub fn new(codec: AnyCodec) -> Self {
        Self {
            codec,
            buckets: HashMap::new(),
            cache: None,
            len: 0,
            _marker: PhantomData,
        }
    }

    fn bucket_bytes() -> usize {
        BUCKET_SLOTS as usize * record_size::<V>()
    }

    fn split(key: u32) -> (u32, usize) {
        let bucket = key / BUCKET_SLOTS;
        let slot = (key % BUCKET_SLOTS) as usize;
        (bucket, slot * record_size::<V>())
    }

    /// The number of buckets currently stored compressed
    pub fn stored_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn write_back(&mut self) -> io::Result<()> {
        let cached = match self.cache.take() {
            Some(cached) => cached,
            None => return Ok(()),
        };
        if !cached.dirty {
            return Ok(());
        }
        if hash::is_blank(&cached.data) {
            self.buckets.remove(&cached.bucket);
            return Ok(());
        }
        let mut compressed = Vec::new();
        self.codec.compress_into(&cached.data, &mut compressed)?;
        compressed.shrink_to_fit();
        self.buckets.insert(cached.bucket, compressed);
        Ok(())
    }

    /// Make `bucket` the cached bucket. Returns false if it does not exist and `create` is unset.
    fn load(&mut self, bucket: u32, create: bool) -> io::Result<bool> {
        if matches!(&self.cache, Some(cached) if cached.bucket == bucket) {
            return Ok(true);
        }
        if !create && !self.buckets.contains_key(&bucket) {
            return Ok(false);
        }
        self.write_back()?;

        let size = Self::bucket_bytes();
        let mut data = Vec::with_capacity(size);
        match self.buckets.get(&bucket) {
            Some(compressed) => {
                self.codec.decompress_into(compressed, &mut data, size)?;
                if data.len() != size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "index bucket decompressed to the wrong size",
                    ));
                }
            }
            None => data.resize(size, 0),
        }
        self.cache = Some(Cached {
            bucket,
            data,
            dirty: false,
        });
        Ok(true)
    }

    fn cached(&mut self) -> &mut Cached {
        // Only called after a successful load
        self.cache.as_mut().expect("bucket loaded")
    }
}

impl<V: Slot> HashLayer<V> for CompressedLayer<V> {
    fn get(&mut self, key: u32) -> io::Result<Option<V>> {
        let (bucket, pos) = Self::split(key);
        if !self.load(bucket, false)? {
            return Ok(None);
        }
        let record = &self.cached().data[pos..pos + record_size::<V>()];
        Ok(decode_record(record))
    }

    fn put(&mut self, key: u32, value: V) -> io::Result<()> {
        let (bucket, pos) = Self::split(key);
        self.load(bucket, true)?;
        let cached = self.cached();
        let record = &mut cached.data[pos..pos + record_size::<V>()];
        let was_present = record[0] != 0;
        encode_record(Some(value), record);
        cached.dirty = true;
        if !was_present {
            self.len += 1;
        }
        Ok(())
    }

    fn delete(&mut self, key: u32) -> io::Result<()> {
        let (bucket, pos) = Self::split(key);
        if !self.load(bucket, false)? {
            return Ok(());
        }
        let cached = self.cached();
        let record = &mut cached.data[pos..pos + record_size::<V>()];
        if record[0] != 0 {
            encode_record::<V>(None, record);
            cached.dirty = true;
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
    use crate::compression::{AnyCodec, Kind};
    use crate::index::layer::suite;
    use crate::BlockNum;

    fn codec() -> AnyCodec {
        AnyCodec::new(Kind::default()).unwrap()
    }

    #[test]
    fn compressed_layer() {
        suite::basic_operations(CompressedLayer::new(codec()));
        suite::spread_keys(CompressedLayer::new(codec()), 1 << 28);
    }

    #[test]
    fn buckets_are_written_back_and_dropped_when_empty() {
        let mut layer = CompressedLayer::new(codec());
        layer.put(1, BlockNum(10)).unwrap();
        // Touching another bucket writes the first one back
        layer.put(BUCKET_SLOTS * 3, BlockNum(11)).unwrap();
        assert_eq!(layer.stored_buckets(), 1);
        assert_eq!(layer.get(1).unwrap(), Some(BlockNum(10)));
        assert_eq!(layer.stored_buckets(), 2);

        layer.delete(1).unwrap();
        assert_eq!(layer.get(BUCKET_SLOTS * 3).unwrap(), Some(BlockNum(11)));
        assert_eq!(layer.stored_buckets(), 1);
        assert_eq!(layer.len(), 1);
    }

    #[test]
    fn missing_buckets_are_not_created_by_reads() {
        let mut layer: CompressedLayer<BlockNum> = CompressedLayer::new(codec());
        assert_eq!(layer.get(12345).unwrap(), None);
        layer.delete(12345).unwrap();
        assert_eq!(layer.stored_buckets(), 0);
        assert!(layer.cache.is_none());
    }
}
