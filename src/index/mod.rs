//! The content-addressable index used while an image is built
//!
//! Two regions share the same machinery: the real index maps the hash of a stored block to its
//! block number, and the auto index maps the hash of any window inside a container to the
//! window's location. Neither is trusted on its own: every hit is checked against the actual
//! bytes before it is used.

mod compressed;
mod file;
mod layer;
mod memory;
mod stack;

pub use compressed::CompressedLayer;
pub use file::FileLayer;
pub use layer::{HashLayer, Slot};
pub use memory::MemoryLayer;
pub use stack::LayerStack;

use parking_lot::Mutex;
use slog::Logger;
use std::io;
use std::path::PathBuf;

use crate::compression::AnyCodec;
use crate::config::IndexBackend;
use crate::{BlockNum, Location};

/// Opens new index segments of the configured kind
#[derive(Debug, Clone)]
pub(crate) struct LayerFactory {
    backend: IndexBackend,
    codec: Option<AnyCodec>,
    dir: Option<PathBuf>,
}

impl LayerFactory {
    pub(crate) fn new(
        backend: IndexBackend,
        codec: Option<AnyCodec>,
        dir: Option<PathBuf>,
    ) -> Self {
        Self {
            backend,
            codec,
            dir,
        }
    }

    pub(crate) fn create<V: Slot>(&self) -> io::Result<Box<dyn HashLayer<V>>> {
        let layer: Box<dyn HashLayer<V>> = match self.backend {
            IndexBackend::Memory => Box::new(MemoryLayer::new()),
            IndexBackend::Compressed => {
                let codec = match &self.codec {
                    Some(codec) => codec.clone(),
                    None => AnyCodec::new(Default::default())
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
                };
                Box::new(CompressedLayer::new(codec))
            }
            IndexBackend::DiskFile => Box::new(FileLayer::new(self.dir.as_deref())?),
        };
        Ok(layer)
    }
}

/// Sizing for a [`ShardedIndex`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexShape {
    pub shards: usize,
    pub max_layers: usize,
    pub layer_entries: usize,
}

/// A multi-map from a 32 bit hash, split into independently locked shards by the hash's high bits
pub struct ShardedIndex<V: Slot> {
    shards: Vec<Mutex<LayerStack<V>>>,
    key_bits: u32,
}

impl<V: Slot> ShardedIndex<V> {
    pub(crate) fn new(factory: &LayerFactory, shape: IndexShape, logger: &Logger) -> Self {
        let shards = shape.shards.max(1).next_power_of_two();
        let key_bits = 32 - shards.trailing_zeros();
        let shards = (0..shards)
            .map(|shard| {
                let logger = logger.new(slog::o!("shard" => shard));
                Mutex::new(LayerStack::new(
                    factory.clone(),
                    shape.max_layers,
                    shape.layer_entries,
                    logger,
                ))
            })
            .collect();
        Self { shards, key_bits }
    }

    fn locate(&self, hash: u32) -> (&Mutex<LayerStack<V>>, u32) {
        let hash = u64::from(hash);
        let shard = (hash >> self.key_bits) as usize;
        let key = (hash & ((1 << self.key_bits) - 1)) as u32;
        (&self.shards[shard], key)
    }

    pub fn find(&self, hash: u32) -> impl Iterator<Item = V> {
        let (shard, key) = self.locate(hash);
        let found = shard.lock().find(key);
        found.into_iter()
    }

    pub fn add(&self, hash: u32, value: V) {
        let (shard, key) = self.locate(hash);
        shard.lock().add(key, value);
    }

    pub fn delete(&self, hash: u32, value: V) -> bool {
        let (shard, key) = self.locate(hash);
        shard.lock().delete(key, value)
    }

    pub fn has(&self, hash: u32) -> bool {
        let (shard, key) = self.locate(hash);
        shard.lock().has(key)
    }

    pub fn entries(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries()).sum()
    }

    pub fn evictions(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().evictions()).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// The real and auto indexes of one build
pub struct BlockIndex {
    real: ShardedIndex<BlockNum>,
    auto: ShardedIndex<Location>,
}

impl BlockIndex {
    pub(crate) fn new(factory: &LayerFactory, shape: IndexShape, logger: &Logger) -> Self {
        Self {
            real: ShardedIndex::new(factory, shape, &logger.new(slog::o!("index" => "real"))),
            auto: ShardedIndex::new(factory, shape, &logger.new(slog::o!("index" => "auto"))),
        }
    }

    pub fn find_real(&self, hash: u32) -> impl Iterator<Item = BlockNum> {
        self.real.find(hash)
    }

    pub fn add_real(&self, hash: u32, block: BlockNum) {
        self.real.add(hash, block);
    }

    pub fn find_auto(&self, hash: u32) -> impl Iterator<Item = Location> {
        self.auto.find(hash)
    }

    pub fn add_auto(&self, hash: u32, location: Location) {
        self.auto.add(hash, location);
    }

    pub fn delete_auto(&self, hash: u32, location: Location) -> bool {
        self.auto.delete(hash, location)
    }

    pub fn has_auto(&self, hash: u32) -> bool {
        self.auto.has(hash)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            real_entries: self.real.entries(),
            auto_entries: self.auto.entries(),
            evictions: self.real.evictions() + self.auto.evictions(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub real_entries: usize,
    pub auto_entries: usize,
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(shards: usize) -> IndexShape {
        IndexShape {
            shards,
            max_layers: 4,
            layer_entries: 1 << 16,
        }
    }

    fn sharded(backend: IndexBackend, shards: usize) -> ShardedIndex<BlockNum> {
        let factory = LayerFactory::new(backend, None, None);
        ShardedIndex::new(&factory, shape(shards), &crate::test_logger())
    }

    fn full_range(backend: IndexBackend) {
        for &shards in &[1, 4, 16] {
            let index = sharded(backend, shards);
            assert_eq!(index.shard_count(), shards);
            let hashes = [0u32, 1, 0x7fff_ffff, 0x8000_0000, u32::MAX, 0x1234_5678];
            for (i, &hash) in hashes.iter().enumerate() {
                index.add(hash, BlockNum(i as u32));
            }
            for (i, &hash) in hashes.iter().enumerate() {
                assert_eq!(index.find(hash).collect::<Vec<_>>(), vec![BlockNum(i as u32)]);
                assert!(index.has(hash));
            }
            assert!(!index.has(2));
            assert_eq!(index.entries(), hashes.len());
        }
    }

    #[test]
    fn sharding_covers_the_full_hash_range() {
        full_range(IndexBackend::Memory);
        full_range(IndexBackend::Compressed);
        full_range(IndexBackend::DiskFile);
    }

    #[test]
    fn colliding_hashes_chain() {
        let factory = LayerFactory::new(IndexBackend::Memory, None, None);
        let index = BlockIndex::new(&factory, shape(16), &crate::test_logger());
        let a = Location {
            container: 0,
            offset: 4,
        };
        let b = Location {
            container: 1,
            offset: 0,
        };
        index.add_auto(99, a);
        index.add_auto(99, b);
        assert_eq!(index.find_auto(99).collect::<Vec<_>>(), vec![a, b]);
        assert!(index.delete_auto(99, a));
        assert_eq!(index.find_auto(99).collect::<Vec<_>>(), vec![b]);
        assert!(index.has_auto(99));

        index.add_real(99, BlockNum(7));
        assert_eq!(index.find_real(99).collect::<Vec<_>>(), vec![BlockNum(7)]);
        let stats = index.stats();
        assert_eq!(stats.real_entries, 1);
        assert_eq!(stats.auto_entries, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn shards_are_usable_from_many_threads() {
        let index = std::sync::Arc::new(sharded(IndexBackend::Memory, 8));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let index = std::sync::Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..1000u32 {
                        let hash = (i * 4 + t).wrapping_mul(0x9E37_79B9);
                        index.add(hash, BlockNum(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.entries(), 4000);
    }
}
