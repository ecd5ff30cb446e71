use crate::types::{Account, AccountId, DeviceKey, Fingerprint};

/// The account database contract, assumed to live behind a separately
/// operated store. All operations are backed by prepared statements whose
/// bind-count the implementation checks against the database-reported
/// arity.
pub trait AccountStore: Send + Sync {
    fn create_account(&self, email: &str, password_hash: &str, device_cap: usize) -> trc::Result<AccountId>;
    fn validate_login(&self, email: &str, password: &str) -> trc::Result<AccountId>;
    fn validate_user_password(&self, account_id: &AccountId, password: &str) -> trc::Result<bool>;
    fn change_password(&self, account_id: &AccountId, new_hash: &str) -> trc::Result<()>;
    fn account_info(&self, account_id: &AccountId) -> trc::Result<Account>;

    fn add_session_auth(&self, account_id: &AccountId) -> trc::Result<String>;
    fn validate_session_auth(&self, token: &str) -> trc::Result<AccountId>;
    fn session_logout(&self, token: &str) -> trc::Result<()>;
    fn new_csrf(&self, token: &str) -> trc::Result<String>;
    fn gc_sessions_and_csrf(&self, server_id: &str, now: i64) -> trc::Result<usize>;

    fn list_devices(&self, account_id: &AccountId) -> trc::Result<Vec<Fingerprint>>;

    fn list_aliases(&self, account_id: &AccountId) -> trc::Result<Vec<String>>;
    fn add_random_alias(&self, account_id: &AccountId) -> trc::Result<String>;
    fn add_primary_alias(&self, account_id: &AccountId, address: &str) -> trc::Result<()>;
    fn delete_alias(&self, account_id: &AccountId, address: &str) -> trc::Result<()>;
    fn user_owns_address(&self, account_id: &AccountId, address: &str) -> trc::Result<bool>;

    fn list_tokens(&self, account_id: &AccountId) -> trc::Result<Vec<String>>;
    fn add_token(&self, account_id: &AccountId, token: &str) -> trc::Result<()>;
    fn delete_token(&self, token: &str) -> trc::Result<()>;

    fn list_installations(&self, account_id: &AccountId) -> trc::Result<Vec<String>>;
    fn add_installation(&self, account_id: &AccountId, installation_id: &str) -> trc::Result<()>;
    fn delete_installation(&self, installation_id: &str) -> trc::Result<()>;

    /// Looks up the account bound to a DNS subdomain label.
    fn subdomain_user(&self, subdomain: &str) -> trc::Result<Option<AccountId>>;
    fn set_challenge(&self, account_id: &AccountId, token: &str) -> trc::Result<()>;
    fn delete_challenge(&self, account_id: &AccountId) -> trc::Result<()>;
    fn list_challenges(&self) -> trc::Result<Vec<(AccountId, String)>>;

    fn list_deletions(&self) -> trc::Result<Vec<AccountId>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddKeyError {
    /// The PEM didn't parse as a recognized public key.
    InvalidPem,
    /// `count(account) >= cap`; the client should be told `NO`.
    Capacity,
}

/// Account-scoped set of `(fingerprint, pubkey)`.
pub trait DeviceKeyStore: Send + Sync {
    /// Ascending-sorted fingerprints (authoritative server-side order).
    fn list_fingerprints(&self, account_id: &AccountId) -> trc::Result<Vec<Fingerprint>>;
    fn get_pubkey(&self, account_id: &AccountId, fpr: &Fingerprint) -> trc::Result<Option<String>>;
    fn count(&self, account_id: &AccountId) -> trc::Result<usize>;

    /// Validates `pem`, derives its fingerprint, and atomically inserts it
    /// under a table-level write lock iff `count < cap` (invariant iii).
    fn add(&self, account_id: &AccountId, pem: &str, cap: usize) -> Result<Fingerprint, AddKeyErrorOr>;

    fn remove(&self, account_id: &AccountId, fpr: &Fingerprint) -> trc::Result<()>;

    fn all_keys(&self, account_id: &AccountId) -> trc::Result<Vec<DeviceKey>>;
}

/// Either the typed `add()` failure modes or an infrastructure error.
#[derive(Debug)]
pub enum AddKeyErrorOr {
    Typed(AddKeyError),
    Store(trc::Error),
}

impl From<AddKeyError> for AddKeyErrorOr {
    fn from(e: AddKeyError) -> Self {
        AddKeyErrorOr::Typed(e)
    }
}

impl From<trc::Error> for AddKeyErrorOr {
    fn from(e: trc::Error) -> Self {
        AddKeyErrorOr::Store(e)
    }
}
