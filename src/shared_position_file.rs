use parking_lot::Mutex;
use positioned_io::WriteAt;
use std::io;
use std::sync::Arc;

/// Positioned writes through a shared reference
pub trait SharedWriteAt: Send + Sync {
    fn write_at(&self, buf: &[u8], pos: u64) -> io::Result<usize>;
    fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;
}

impl<W: SharedWriteAt + ?Sized> SharedWriteAt for &W {
    fn write_at(&self, buf: &[u8], pos: u64) -> io::Result<usize> {
        SharedWriteAt::write_at(*self, buf, pos)
    }

    fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        SharedWriteAt::write_all_at(*self, buf, pos)
    }

    fn flush(&self) -> io::Result<()> {
        SharedWriteAt::flush(*self)
    }
}

impl<W: SharedWriteAt + ?Sized> SharedWriteAt for Arc<W> {
    fn write_at(&self, buf: &[u8], pos: u64) -> io::Result<usize> {
        SharedWriteAt::write_at(&**self, buf, pos)
    }

    fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        SharedWriteAt::write_all_at(&**self, buf, pos)
    }

    fn flush(&self) -> io::Result<()> {
        SharedWriteAt::flush(&**self)
    }
}

impl<W: WriteAt + Sync + Send> SharedWriteAt for Mutex<W> {
    fn write_at(&self, buf: &[u8], pos: u64) -> io::Result<usize> {
        self.lock().write_at(pos, buf)
    }

    fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        self.lock().write_all_at(pos, buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_writes_land_in_place() {
        let shared = Arc::new(Mutex::new(Vec::<u8>::new()));
        let by_ref: &dyn SharedWriteAt = &shared;
        by_ref.write_all_at(b"tail", 4).unwrap();
        shared.write_all_at(b"head", 0).unwrap();
        SharedWriteAt::flush(&shared).unwrap();

        let data = shared.lock();
        assert_eq!(&data[..], b"headtail");
    }
}
