use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// One pooled, fixed-size buffer: a recv region (`base`) and a send/response
/// region (`resp`). Serves both recv allocation and send retention so the
/// same buffer can carry a request in and a response back out without a
/// second allocation.
pub struct MemBufData {
    id: usize,
    pub base: Vec<u8>,
    pub resp: Vec<u8>,
}

impl MemBufData {
    pub fn id(&self) -> usize {
        self.id
    }
}

/// An owned handle to a buffer acquired from a [`BufferPool`].
///
/// Unlike the source's `membuf_t`, which is reached through `CONTAINER_OF`
/// address arithmetic on an intrusive `link_t`, this handle is move-only:
/// Rust's ownership rules make "released twice" a compile error rather than
/// a debug-only runtime check for any code that only ever moves the handle.
/// [`BufferPool::release`] keeps an `outstanding` id set and still asserts in
/// debug builds, as defense in depth against handles reconstructed by id.
pub struct MemBuf {
    data: Option<Box<MemBufData>>,
    pool: Arc<PoolInner>,
}

impl MemBuf {
    pub fn id(&self) -> usize {
        self.data.as_ref().expect("membuf used after release").id
    }

    pub fn base(&self) -> &[u8] {
        &self.data.as_ref().expect("membuf used after release").base
    }

    pub fn base_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data.as_mut().expect("membuf used after release").base
    }

    pub fn resp(&self) -> &[u8] {
        &self.data.as_ref().expect("membuf used after release").resp
    }

    pub fn resp_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data.as_mut().expect("membuf used after release").resp
    }
}

struct PoolInner {
    free: Mutex<Vec<Box<MemBufData>>>,
    outstanding: Mutex<HashSet<usize>>,
    suspended: AtomicBool,
}

/// Fixed-count, fixed-size buffer pool (`NMEMBUFS` in the original). `acquire`
/// returns `None` on exhaustion; callers (the recv loop) must treat that as
/// "suspend reception until the next `release`."
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(nmembufs: usize, buf_size: usize) -> Self {
        let free = (0..nmembufs)
            .map(|id| {
                Box::new(MemBufData {
                    id,
                    base: vec![0u8; buf_size],
                    resp: vec![0u8; buf_size],
                })
            })
            .collect();
        BufferPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                outstanding: Mutex::new(HashSet::new()),
                suspended: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.outstanding.lock().len() + self.inner.free.lock().len()
    }

    /// `Some` on success; `None` when the pool is exhausted, at which point
    /// [`BufferPool::is_suspended`] becomes `true` until the next `release`.
    pub fn acquire(&self) -> Option<MemBuf> {
        let mut free = self.inner.free.lock();
        match free.pop() {
            Some(data) => {
                self.inner.outstanding.lock().insert(data.id);
                if free.is_empty() {
                    self.inner.suspended.store(true, Ordering::SeqCst);
                }
                Some(MemBuf {
                    data: Some(data),
                    pool: self.inner.clone(),
                })
            }
            None => {
                self.inner.suspended.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    /// Idempotent on a correctly-owned handle (ownership makes re-calling
    /// impossible); asserts in debug builds if the same buffer id is somehow
    /// released twice. Re-enables reception if the pool had been suspended.
    pub fn release(&self, mut buf: MemBuf) {
        let data = buf.data.take().expect("membuf already released");
        let was_outstanding = self.inner.outstanding.lock().remove(&data.id);
        debug_assert!(was_outstanding, "double release of membuf {}", data.id);
        let mut free = self.inner.free.lock();
        free.push(data);
        self.inner.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_exhausts_and_release_resumes() {
        let pool = BufferPool::new(2, 16);
        let a = pool.acquire().expect("first acquire");
        let b = pool.acquire().expect("second acquire");
        assert!(pool.acquire().is_none());
        assert!(pool.is_suspended());

        pool.release(a);
        assert!(!pool.is_suspended());
        let c = pool.acquire().expect("reacquire after release");
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn total_count_conserved() {
        let pool = BufferPool::new(4, 8);
        let bufs: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
        assert_eq!(bufs.len(), 4);
        for b in bufs {
            pool.release(b);
        }
        assert_eq!(pool.capacity(), 4);
    }
}
