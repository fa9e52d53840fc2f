use byteorder::{ByteOrder, LittleEndian};
use std::{fmt, io};

use crate::{BlockNum, Location};

/// A value which can be stored in a fixed-width index record
pub trait Slot: Copy + PartialEq + fmt::Debug + Send + 'static {
    const SIZE: usize;

    fn encode(self, out: &mut [u8]);
    fn decode(data: &[u8]) -> Self;
}

impl Slot for BlockNum {
    const SIZE: usize = 4;

    fn encode(self, out: &mut [u8]) {
        LittleEndian::write_u32(out, self.0);
    }

    fn decode(data: &[u8]) -> Self {
        BlockNum(LittleEndian::read_u32(data))
    }
}

impl Slot for Location {
    const SIZE: usize = 8;

    fn encode(self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[..4], self.container);
        LittleEndian::write_u32(&mut out[4..8], self.offset);
    }

    fn decode(data: &[u8]) -> Self {
        Location {
            container: LittleEndian::read_u32(&data[..4]),
            offset: LittleEndian::read_u32(&data[4..8]),
        }
    }
}

/// One segment of an index: at most one value per key
///
/// Keys are local to a shard. Backends may keep state on disk, so every operation can fail;
/// callers treat a failure as the loss of the whole segment.
pub trait HashLayer<V: Slot>: Send {
    fn get(&mut self, key: u32) -> io::Result<Option<V>>;
    fn put(&mut self, key: u32, value: V) -> io::Result<()>;
    fn delete(&mut self, key: u32) -> io::Result<()>;

    fn has(&mut self, key: u32) -> io::Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// The number of keys holding a value
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A record is a presence tag followed by the encoded value; all zeroes means absent
pub(crate) fn record_size<V: Slot>() -> usize {
    1 + V::SIZE
}

pub(crate) fn decode_record<V: Slot>(record: &[u8]) -> Option<V> {
    if record[0] == 0 {
        None
    } else {
        Some(V::decode(&record[1..]))
    }
}

pub(crate) fn encode_record<V: Slot>(value: Option<V>, record: &mut [u8]) {
    match value {
        Some(value) => {
            record[0] = 1;
            value.encode(&mut record[1..]);
        }
        None => record.iter_mut().for_each(|b| *b = 0),
    }
}
