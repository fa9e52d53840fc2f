use slog::Logger;
use std::collections::VecDeque;
use std::io;

use super::layer::{HashLayer, Slot};
use super::LayerFactory;

/// A multi-map built from single-valued segments
///
/// A key maps to at most one value per segment. Adding a value for a key stores it in the
/// oldest segment which has no value for that key and still has room, opening a new segment
/// if needed. When there are more than `max_layers` segments, the oldest one is discarded.
/// A segment whose storage fails is discarded as well: the index only loses recall.
pub struct LayerStack<V: Slot> {
    layers: VecDeque<Box<dyn HashLayer<V>>>,
    factory: LayerFactory,
    max_layers: usize,
    layer_entries: usize,
    evictions: u64,
    logger: Logger,
}

impl<V: Slot> LayerStack<V> {
    pub(crate) fn new(
        factory: LayerFactory,
        max_layers: usize,
        layer_entries: usize,
        logger: Logger,
    ) -> Self {
        Self {
            layers: VecDeque::new(),
            factory,
            max_layers: max_layers.max(1),
            layer_entries: layer_entries.max(1),
            evictions: 0,
            logger,
        }
    }

    fn evict(&mut self, i: usize, reason: &str) {
        if let Some(layer) = self.layers.remove(i) {
            self.evictions += 1;
            slog::warn!(self.logger, "discarding index segment";
                "reason" => reason,
                "entries" => layer.len(),
                "remaining_segments" => self.layers.len());
        }
    }

    fn evict_failed(&mut self, i: usize, err: io::Error) {
        let reason = format!("storage failure: {}", err);
        self.evict(i, &reason);
    }

    /// Every value stored for `key`, oldest segment first
    pub fn find(&mut self, key: u32) -> Vec<V> {
        let mut found = Vec::new();
        let mut i = 0;
        while i < self.layers.len() {
            match self.layers[i].get(key) {
                Ok(Some(value)) => found.push(value),
                Ok(None) => {}
                Err(e) => {
                    self.evict_failed(i, e);
                    continue;
                }
            }
            i += 1;
        }
        found
    }

    pub fn has(&mut self, key: u32) -> bool {
        let mut i = 0;
        while i < self.layers.len() {
            match self.layers[i].has(key) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    self.evict_failed(i, e);
                    continue;
                }
            }
            i += 1;
        }
        false
    }

    pub fn add(&mut self, key: u32, value: V) {
        let mut i = 0;
        while i < self.layers.len() {
            let layer = &mut self.layers[i];
            if layer.len() >= self.layer_entries {
                i += 1;
                continue;
            }
            let result = match layer.has(key) {
                Ok(true) => Ok(false),
                Ok(false) => layer.put(key, value).map(|()| true),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => return,
                Ok(false) => i += 1,
                Err(e) => self.evict_failed(i, e),
            }
        }

        if self.layers.len() >= self.max_layers {
            self.evict(0, "segment limit reached");
        }
        let mut layer = match self.factory.create::<V>() {
            Ok(layer) => layer,
            Err(e) => {
                slog::warn!(self.logger, "unable to open a new index segment, entry dropped"; "error" => %e);
                return;
            }
        };
        match layer.put(key, value) {
            Ok(()) => self.layers.push_back(layer),
            Err(e) => {
                slog::warn!(self.logger, "new index segment failed, entry dropped"; "error" => %e);
            }
        }
    }

    /// Remove `value` from `key`, if it is stored. Returns true if it was found.
    pub fn delete(&mut self, key: u32, value: V) -> bool {
        let mut i = 0;
        while i < self.layers.len() {
            let layer = &mut self.layers[i];
            let result = match layer.get(key) {
                Ok(Some(stored)) if stored == value => layer.delete(key).map(|()| true),
                Ok(_) => Ok(false),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => return true,
                Ok(false) => i += 1,
                Err(e) => self.evict_failed(i, e),
            }
        }
        false
    }

    pub fn entries(&self) -> usize {
        self.layers.iter().map(|layer| layer.len()).sum()
    }

    pub fn segments(&self) -> usize {
        self.layers.len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexBackend;
    use crate::index::layer::HashLayer;
    use crate::{BlockNum, Location};

    fn logger() -> Logger {
        crate::test_logger()
    }

    fn stack<V: Slot>(backend: IndexBackend, max_layers: usize, entries: usize) -> LayerStack<V> {
        let factory = LayerFactory::new(backend, None, None);
        LayerStack::new(factory, max_layers, entries, logger())
    }

    fn multi_values(backend: IndexBackend) {
        let mut s = stack::<BlockNum>(backend, 8, 1000);
        s.add(5, BlockNum(1));
        s.add(5, BlockNum(2));
        s.add(5, BlockNum(3));
        s.add(6, BlockNum(4));
        assert_eq!(s.find(5), vec![BlockNum(1), BlockNum(2), BlockNum(3)]);
        assert_eq!(s.segments(), 3);
        assert!(s.has(6));
        assert!(!s.has(7));

        assert!(s.delete(5, BlockNum(2)));
        assert!(!s.delete(5, BlockNum(2)));
        assert_eq!(s.find(5), vec![BlockNum(1), BlockNum(3)]);

        // The freed slot is reused before opening another segment
        s.add(5, BlockNum(9));
        assert_eq!(s.segments(), 3);
        assert_eq!(s.find(5), vec![BlockNum(1), BlockNum(9), BlockNum(3)]);
        assert_eq!(s.entries(), 4);
    }

    #[test]
    fn multi_values_every_backend() {
        multi_values(IndexBackend::Memory);
        multi_values(IndexBackend::Compressed);
        multi_values(IndexBackend::DiskFile);
    }

    #[test]
    fn oldest_segment_is_evicted() {
        let mut s = stack::<Location>(IndexBackend::Memory, 2, 2);
        let loc = |offset| Location {
            container: 0,
            offset,
        };
        for key in 0..6 {
            s.add(key, loc(key));
        }
        assert_eq!(s.segments(), 2);
        assert_eq!(s.evictions(), 1);
        assert!(s.find(0).is_empty());
        assert!(s.find(1).is_empty());
        assert_eq!(s.find(5), vec![loc(5)]);
        assert_eq!(s.entries(), 4);
    }

    struct Failing;

    impl HashLayer<BlockNum> for Failing {
        fn get(&mut self, _key: u32) -> io::Result<Option<BlockNum>> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn put(&mut self, _key: u32, _value: BlockNum) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn delete(&mut self, _key: u32) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn len(&self) -> usize {
            0
        }
    }

    #[test]
    fn failing_segments_are_discarded() {
        let mut s = stack::<BlockNum>(IndexBackend::Memory, 4, 100);
        s.layers.push_back(Box::new(Failing));
        s.add(1, BlockNum(1));
        assert_eq!(s.evictions(), 1);
        assert_eq!(s.find(1), vec![BlockNum(1)]);

        s.layers.push_front(Box::new(Failing));
        assert_eq!(s.find(1), vec![BlockNum(1)]);
        assert_eq!(s.evictions(), 2);
        assert_eq!(s.segments(), 1);
    }
}
