//! Containers being filled while an image is built

use crate::config::StagingMode;
use crate::errors::{Error, Result};
use crate::Location;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::sync::Arc;
use std::{fmt, io};

/// The raw bytes of a container which is still growing
pub enum Staging {
    Memory(Vec<u8>),
    Mapped {
        _file: File,
        map: MmapMut,
        len: usize,
    },
}

impl Staging {
    fn new(mode: &StagingMode, capacity: usize) -> io::Result<Self> {
        match mode {
            StagingMode::Memory => Ok(Staging::Memory(Vec::new())),
            StagingMode::Mapped(dir) => {
                let file = tempfile::tempfile_in(dir)?;
                file.set_len(capacity as u64)?;
                let map = unsafe { MmapMut::map_mut(&file)? };
                Ok(Staging::Mapped {
                    _file: file,
                    map,
                    len: 0,
                })
            }
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Staging::Memory(data) => data,
            Staging::Mapped { map, len, .. } => &map[..*len],
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Extend the data to `offset + data.len()`; `offset` must not be past the end
    fn write_tail(&mut self, offset: usize, tail: &[u8]) {
        debug_assert_eq!(offset, self.len());
        match self {
            Staging::Memory(data) => data.extend_from_slice(tail),
            Staging::Mapped { map, len, .. } => {
                map[offset..offset + tail.len()].copy_from_slice(tail);
                *len = offset + tail.len();
            }
        }
    }
}

impl AsRef<[u8]> for Staging {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for Staging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Staging::Memory(_) => "Memory",
            Staging::Mapped { .. } => "Mapped",
        };
        f.debug_struct("Staging")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

pub type SharedStaging = Arc<RwLock<Staging>>;

/// Containers ranked by remaining room
///
/// Only containers with at least `min_free_space` bytes of room are ranked.
#[derive(Debug, Default)]
struct FreeSpace {
    by_room: BTreeMap<u32, BTreeSet<u32>>,
    rooms: Vec<Option<u32>>,
}

impl FreeSpace {
    fn set(&mut self, id: u32, room: Option<u32>) {
        let idx = id as usize;
        if self.rooms.len() <= idx {
            self.rooms.resize(idx + 1, None);
        }
        if let Some(old) = self.rooms[idx].take() {
            if let Some(ids) = self.by_room.get_mut(&old) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_room.remove(&old);
                }
            }
        }
        if let Some(room) = room {
            self.by_room.entry(room).or_default().insert(id);
            self.rooms[idx] = Some(room);
        }
    }

    fn smallest_at_least(&self, room: u32) -> Option<u32> {
        self.by_room
            .range(room..)
            .next()
            .and_then(|(_, ids)| ids.iter().next().copied())
    }
}

pub struct ContainerStore {
    containers: Vec<SharedStaging>,
    free: Mutex<FreeSpace>,
    capacity: u32,
    min_free_space: u32,
    staging: StagingMode,
}

impl ContainerStore {
    pub fn new(capacity: u32, min_free_space: u32, staging: StagingMode) -> Self {
        Self {
            containers: Vec::new(),
            free: Mutex::new(FreeSpace::default()),
            capacity,
            min_free_space,
            staging,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn min_free_space(&self) -> u32 {
        self.min_free_space
    }

    pub fn count(&self) -> u32 {
        self.containers.len() as u32
    }

    /// Start a new empty container, returning its id
    pub fn create(&mut self) -> Result<u32> {
        let id = self.count();
        let staging = Staging::new(&self.staging, self.capacity as usize)?;
        self.containers.push(Arc::new(RwLock::new(staging)));
        self.free.lock().set(id, self.ranked_room(0));
        Ok(id)
    }

    fn ranked_room(&self, size: u32) -> Option<u32> {
        let room = self.capacity.saturating_sub(size);
        if room >= self.min_free_space {
            Some(room)
        } else {
            None
        }
    }

    pub fn staging(&self, id: u32) -> &SharedStaging {
        &self.containers[id as usize]
    }

    pub fn size(&self, id: u32) -> u32 {
        self.containers[id as usize].read().len() as u32
    }

    /// The container with the least room which still has space for `needed` bytes plus the
    /// reserve, lowest id first
    pub fn best_fit(&self, needed: u32) -> Option<u32> {
        let needed = needed.saturating_add(self.min_free_space);
        self.free.lock().smallest_at_least(needed)
    }

    /// Up to `count` of the newest containers, newest first
    pub fn most_recent(&self, count: usize) -> impl Iterator<Item = u32> {
        (0..self.count()).rev().take(count)
    }

    /// Write the part of `block` which is not already in the container at `base_offset`
    ///
    /// Returns the new size of the container.
    pub fn append(&mut self, id: u32, base_offset: u32, block: &[u8]) -> Result<u32> {
        let staging = &self.containers[id as usize];
        let new_size = {
            let mut staging = staging.write();
            let old_size = staging.len() as u64;
            let end = u64::from(base_offset) + block.len() as u64;
            if u64::from(base_offset) > old_size {
                return Err(Error::corruption(format!(
                    "block placed at {} past the end of container {} ({} bytes)",
                    base_offset, id, old_size
                )));
            }
            if end > u64::from(self.capacity) {
                return Err(Error::CapacityExceeded {
                    container: id,
                    size: end,
                    capacity: self.capacity,
                });
            }
            if end > old_size {
                let skip = (old_size - u64::from(base_offset)) as usize;
                staging.write_tail(old_size as usize, &block[skip..]);
            }
            staging.len() as u32
        };
        let room = self.ranked_room(new_size);
        self.free.lock().set(id, room);
        Ok(new_size)
    }

    /// Whether `data` is stored at `location`
    pub fn matches(&self, location: Location, data: &[u8]) -> bool {
        match self.containers.get(location.container as usize) {
            Some(staging) => {
                let staging = staging.read();
                let start = location.offset as usize;
                start
                    .checked_add(data.len())
                    .and_then(|end| staging.data().get(start..end))
                    .map_or(false, |stored| stored == data)
            }
            None => false,
        }
    }

    /// Release every container's staging, in id order
    pub fn finish(self) -> Vec<SharedStaging> {
        self.containers
    }
}

impl fmt::Debug for ContainerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerStore")
            .field("containers", &self.containers.len())
            .field("capacity", &self.capacity)
            .field("min_free_space", &self.min_free_space)
            .finish_non_exhaustive()
    }
}
