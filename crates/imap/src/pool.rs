use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use trc::event;

/// Anything schedulable onto the pool: one call to `advance()`.
pub trait Advance: Send {
    fn advance(&mut self);
    fn is_closed(&self) -> bool;
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
/// Running, and a `wake()` landed while a worker already held it — the
/// worker must loop again instead of going idle.
const PENDING: u8 = 2;

struct Slot<T: Advance> {
    inner: Mutex<T>,
    state: AtomicU8,
}

/// A wakeup token: posting one re-schedules the CITM onto a worker if it
/// isn't already executing. At most one worker runs a given CITM at a time,
/// enforced by an `executing` flag set under the CITM mutex.
pub struct Handle<T: Advance> {
    slot: Arc<Slot<T>>,
    sender: mpsc::Sender<Arc<Slot<T>>>,
}

impl<T: Advance> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            slot: self.slot.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<T: Advance> Handle<T> {
    /// External mutators call this after pushing work under the CITM mutex.
    /// If a worker is already executing this CITM, this just flips it to
    /// `PENDING` — the running worker re-checks that with the same
    /// compare-exchange it uses to go idle, so a wake landing between the
    /// worker's last `advance()` and its idle transition can never be
    /// silently dropped.
    pub fn wake(&self) {
        loop {
            match self.slot.state.load(Ordering::SeqCst) {
                IDLE => {
                    if self
                        .slot
                        .state
                        .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let _ = self.sender.send(self.slot.clone());
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .slot
                        .state
                        .compare_exchange(RUNNING, PENDING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.slot.inner.lock().unwrap();
        f(&mut guard)
    }
}

/// A small fixed-size pool of blocking worker threads draining a shared
/// queue of wakeup tokens. Sized from the `worker_threads` config value,
/// itself clamped the way `UV_THREADPOOL_SIZE` is.
pub struct WorkerPool<T: Advance + 'static> {
    sender: mpsc::Sender<Arc<Slot<T>>>,
    active: Arc<AtomicUsize>,
}

impl<T: Advance + 'static> WorkerPool<T> {
    pub fn new(worker_threads: usize) -> Self {
        let worker_threads = worker_threads.clamp(1, 128);
        let (sender, receiver) = mpsc::channel::<Arc<Slot<T>>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let active = Arc::new(AtomicUsize::new(0));

        for i in 0..worker_threads {
            let receiver = receiver.clone();
            let active = active.clone();
            thread::Builder::new()
                .name(format!("citm-worker-{i}"))
                .spawn(move || worker_loop(receiver, active))
                .expect("spawn worker thread");
        }

        WorkerPool { sender, active }
    }

    /// Registers a CITM (or anything `Advance`) with the pool and returns a
    /// handle the reactor uses to push work and post wakeups.
    pub fn register(&self, item: T) -> Handle<T> {
        Handle {
            slot: Arc::new(Slot {
                inner: Mutex::new(item),
                state: AtomicU8::new(IDLE),
            }),
            sender: self.sender.clone(),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

fn worker_loop<T: Advance>(receiver: Arc<Mutex<mpsc::Receiver<Arc<Slot<T>>>>>, active: Arc<AtomicUsize>) {
    loop {
        let slot = {
            let rx = receiver.lock().unwrap();
            match rx.recv() {
                Ok(slot) => slot,
                Err(_) => return,
            }
        };
        active.fetch_add(1, Ordering::SeqCst);
        loop {
            let closed = {
                let mut inner = slot.inner.lock().unwrap();
                inner.advance();
                inner.is_closed()
            };
            if closed {
                slot.state.store(IDLE, Ordering::SeqCst);
                break;
            }
            // Only go idle if nothing woke us during that `advance()`; if a
            // wake raced us here the state is PENDING, not RUNNING, and the
            // compare-exchange fails so we loop again instead of dropping it.
            match slot.state.compare_exchange(RUNNING, IDLE, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(_) => slot.state.store(RUNNING, Ordering::SeqCst),
            }
        }
        active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `UV_THREADPOOL_SIZE`-equivalent clamp: read once, clamped to `[1, 128]`.
pub fn clamp_worker_threads(requested: Option<usize>) -> usize {
    const MIN: usize = 1;
    const MAX: usize = 128;
    let n = requested.unwrap_or(4).clamp(MIN, MAX);
    event!(
        trc::EventType::Server(trc::ServerEvent::ConfigLoaded),
        "worker_threads" = n as u64
    );
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Counter {
        n: Arc<AtomicU32>,
        target: u32,
    }

    impl Advance for Counter {
        fn advance(&mut self) {
            self.n.fetch_add(1, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.n.load(Ordering::SeqCst) >= self.target
        }
    }

    struct SlowCounter {
        n: Arc<AtomicU32>,
        target: u32,
    }

    impl Advance for SlowCounter {
        fn advance(&mut self) {
            std::thread::sleep(Duration::from_millis(15));
            self.n.fetch_add(1, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.n.load(Ordering::SeqCst) >= self.target
        }
    }

    /// A `wake()` landing while the single worker is still inside its
    /// `advance()` must still cause a second `advance()`, not be swallowed
    /// by the idle transition racing it.
    #[test]
    fn wake_during_advance_is_not_lost() {
        let pool: WorkerPool<SlowCounter> = WorkerPool::new(1);
        let n = Arc::new(AtomicU32::new(0));
        let handle = pool.register(SlowCounter { n: n.clone(), target: 3 });
        handle.wake();
        std::thread::sleep(Duration::from_millis(5));
        handle.wake();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while n.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(n.load(Ordering::SeqCst) >= 2, "second wake was lost");
    }

    #[test]
    fn wake_runs_advance_until_closed() {
        let pool: WorkerPool<Counter> = WorkerPool::new(2);
        let n = Arc::new(AtomicU32::new(0));
        let handle = pool.register(Counter { n: n.clone(), target: 5 });
        for _ in 0..5 {
            handle.wake();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while n.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(n.load(Ordering::SeqCst) >= 5);
    }
}
