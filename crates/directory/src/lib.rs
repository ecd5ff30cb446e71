pub mod fingerprint;
pub mod sql;
pub mod sqlite;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test_mode"))]
pub mod memory;

pub use fingerprint::{fingerprint_pem, PemError};
pub use sqlite::SqliteStore;
pub use traits::{AccountStore, AddKeyError, AddKeyErrorOr, DeviceKeyStore};
pub use types::{Account, AccountId, DeviceKey, Fingerprint, FINGERPRINT_LEN};

#[cfg(any(test, feature = "test_mode"))]
pub use memory::MemoryStore;
