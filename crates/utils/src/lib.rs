pub mod jitter;
pub mod membuf;
pub mod rand;

pub use jitter::keepalive_jitter_ms;
pub use membuf::{BufferPool, MemBuf, MemBufData};
pub use rand::{rand_bytes, rand_u32};
