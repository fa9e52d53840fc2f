use std::sync::Arc;
use std::{fmt, thread};

#[derive(Debug)]
pub(crate) struct Joiner<T>(Vec<thread::JoinHandle<T>>);

impl<T> Joiner<T> {
    pub(crate) fn new<Gen, ThreadFn>(threads: usize, mut thread_fn: Gen) -> Self
    where
        Gen: FnMut(usize) -> ThreadFn,
        ThreadFn: FnOnce() -> T,
        ThreadFn: Send + 'static,
        T: Send + 'static,
    {
        let mut thread_handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let handle = thread::Builder::new()
                .name(format!("crfs-worker-{}", i))
                .spawn(thread_fn(i))
                .unwrap_or_else(|e| panic!("unable to spawn worker thread: {}", e));
            thread_handles.push(handle);
        }
        Self(thread_handles)
    }
}

impl<T> Default for Joiner<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Drop for Joiner<T> {
    fn drop(&mut self) {
        for t in self.0.drain(..) {
            let res = t.join();
            if !thread::panicking() {
                res.unwrap();
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of OS threads draining a queue of jobs
///
/// Jobs must not submit more jobs to the same pool: submission blocks until a worker is free.
pub(crate) struct WorkerPool {
    // Destructors are run in top-down order, so this closes the sender before joining
    sender: crossbeam_channel::Sender<Job>,
    _threads: Joiner<()>,
    thread_count: usize,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::bounded(0);
        let joiner = Joiner::new(threads, |_| thread_fn(rx.clone()));
        Self {
            sender: tx,
            _threads: joiner,
            thread_count: threads,
        }
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub(crate) fn execute<F: FnOnce() + Send + 'static>(&self, f: F) {
        // Workers only exit once the sender is dropped
        self.sender.send(Box::new(f)).unwrap();
    }

    /// Apply `f` to every item on the pool, returning results in input order
    ///
    /// A single item is handled on the calling thread.
    pub(crate) fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        if items.len() <= 1 {
            return items.into_iter().map(f).collect();
        }

        let count = items.len();
        let f = Arc::new(f);
        let (tx, rx) = crossbeam_channel::unbounded();
        for (i, item) in items.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let tx = tx.clone();
            self.execute(move || {
                // Ignore closed receiver
                let _ = tx.send((i, f(item)));
            });
        }
        drop(tx);

        let mut results: Vec<Option<R>> = (0..count).map(|_| None).collect();
        for (i, result) in rx {
            results[i] = Some(result);
        }
        results
            .into_iter()
            .map(|r| r.expect("worker exited without finishing its job"))
            .collect()
    }
}

fn thread_fn(rx: crossbeam_channel::Receiver<Job>) -> impl FnOnce() {
    move || {
        for job in rx {
            job();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.thread_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn map_keeps_order() {
        let pool = WorkerPool::new(3);
        let items: Vec<u64> = (0..100).collect();
        let squares = pool.map(items, |x| x * x);
        assert_eq!(squares.len(), 100);
        for (i, sq) in squares.iter().enumerate() {
            assert_eq!(*sq, (i * i) as u64);
        }
    }

    #[test]
    fn execute_runs_every_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2);
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        // Dropping the pool joins the workers
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn zero_threads_still_works() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.thread_count(), 1);
        assert_eq!(pool.map(vec![1, 2], |x| x + 1), vec![2, 3]);
    }
}
