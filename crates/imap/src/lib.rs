/*
 * DN/UP session state machines, the CITM proxy core, the device-key
 * subsystem (XKEYSYNC/XKEYADD), and the worker-pool scheduler that advances
 * CITMs.
 */

pub mod citm;
pub mod devicekey;
pub mod dn;
pub mod pool;
pub mod transport;
pub mod up;

pub use citm::CitmSession;
pub use devicekey::{diff_fingerprints, handle_xkeyadd, DiffOp, XkeysyncContext};
pub use dn::{DnSession, DnState};
pub use pool::{clamp_worker_threads, Advance, Handle, WorkerPool};
pub use transport::{MemTransport, Transport};
pub use up::{UpEvent, UpSession, UpState};
