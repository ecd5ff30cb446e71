use std::sync::OnceLock;
use std::sync::mpsc::{self, Sender};
use std::thread;

use parking_lot::RwLock;

use crate::event::Event;
use crate::subscriber::Subscriber;

static SENDER: OnceLock<Sender<Event>> = OnceLock::new();
static SUBSCRIBERS: RwLock<Vec<Box<dyn Subscriber>>> = RwLock::new(Vec::new());

/// The global event fan-out, started once at process startup.
///
/// Uses a plain `mpsc` channel rather than a lock-free ring buffer: this
/// server's event volume (one IMAP session, one DNS responder) never
/// approaches the throughput a ring buffer would exist for.
pub struct Collector;

impl Collector {
    /// Starts the background fan-out thread. Safe to call more than once;
    /// only the first call takes effect.
    pub fn init(subscribers: Vec<Box<dyn Subscriber>>) {
        if SENDER.get().is_some() {
            return;
        }
        *SUBSCRIBERS.write() = subscribers;
        let (tx, rx) = mpsc::channel::<Event>();
        if SENDER.set(tx).is_err() {
            return;
        }
        thread::Builder::new()
            .name("trc-collector".into())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    for sub in SUBSCRIBERS.read().iter() {
                        if event.level >= sub.min_level() {
                            sub.handle(&event);
                        }
                    }
                }
            })
            .expect("failed to spawn trc collector thread");
    }

    /// Sends `event` to the collector thread. If the collector was never
    /// initialized, the event is dropped silently (this only happens in unit
    /// tests that don't call `Collector::init`).
    pub fn dispatch(event: Event) {
        if let Some(tx) = SENDER.get() {
            let _ = tx.send(event);
        }
    }
}
