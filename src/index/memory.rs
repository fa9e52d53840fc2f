use std::collections::HashMap;
use std::io;

use super::layer::{HashLayer, Slot};

/// The simplest segment: a plain hash map
#[derive(Debug, Default)]
pub struct MemoryLayer<V> {
    map: HashMap<u32, V>,
}

impl<V: Slot> MemoryLayer<V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<V: Slot> HashLayer<V> for MemoryLayer<V> {
    fn get(&mut self, key: u32) -> io::Result<Option<V>> {
        Ok(self.map.get(&key).copied())
    }

    fn put(&mut self, key: u32, value: V) -> io::Result<()> {
        self.map.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: u32) -> io::Result<()> {
        self.map.remove(&key);
        Ok(())
    }

    fn has(&mut self, key: u32) -> io::Result<bool> {
        Ok(self.map.contains_key(&key))
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::layer::suite;

    #[test]
    fn memory_layer() {
        suite::basic_operations(MemoryLayer::new());
        suite::spread_keys(MemoryLayer::new(), 1 << 28);
    }
}
