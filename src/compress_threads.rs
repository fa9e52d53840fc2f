use crate::compression::AnyCodec;
use crate::pool;
use crate::thread::WorkerPool;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;
use std::{fmt, io};
use thread_local::ThreadLocal;

/// Compresses buffers on a worker pool, with one codec instance per thread
pub struct ParallelCompressor {
    pool: Arc<WorkerPool>,
    inner: Arc<Inner>,
}

struct Inner {
    // Codecs are cloned from this the first time a thread compresses
    prototype: Mutex<AnyCodec>,
    codecs: ThreadLocal<RefCell<AnyCodec>>,
}

impl Inner {
    fn with_codec<R>(&self, f: impl FnOnce(&mut AnyCodec) -> R) -> R {
        let codec = self
            .codecs
            .get_or(|| RefCell::new(self.prototype.lock().clone()));
        let mut codec = codec.borrow_mut();
        f(&mut codec)
    }

    fn compress(&self, data: &[u8]) -> io::Result<pool::Buffer> {
        let mut dst = pool::buffer();
        self.with_codec(|codec| codec.compress_into(data, &mut dst))?;
        Ok(dst)
    }
}

impl ParallelCompressor {
    pub(crate) fn new(codec: AnyCodec, pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            inner: Arc::new(Inner {
                prototype: Mutex::new(codec),
                codecs: ThreadLocal::new(),
            }),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.pool.thread_count()
    }

    pub fn kind(&self) -> crate::compression::Kind {
        self.inner.prototype.lock().kind()
    }

    /// Compress on the calling thread
    pub fn compress(&self, data: &[u8]) -> io::Result<pool::Buffer> {
        self.inner.compress(data)
    }

    /// Compress every buffer on the pool, results are in input order
    pub fn compress_batch<D>(&self, batch: Vec<D>) -> Vec<io::Result<pool::Buffer>>
    where
        D: AsRef<[u8]> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.pool
            .map(batch, move |data| inner.compress(data.as_ref()))
    }
}

impl fmt::Debug for ParallelCompressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelCompressor")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
