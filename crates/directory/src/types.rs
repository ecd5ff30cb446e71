use compact_str::CompactString;

/// Opaque account identifier (the `uuid` of the original schema).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub CompactString);

impl AccountId {
    pub fn new(s: impl Into<CompactString>) -> Self {
        AccountId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-width lowercase hex fingerprint, 1:1 with a device public key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub CompactString);

pub const FINGERPRINT_LEN: usize = 40;

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `{ account_id, email, salted-hashed-password, device_cap }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub account_id: AccountId,
    pub email: CompactString,
    pub password_hash: CompactString,
    pub device_cap: usize,
}

/// `{ fingerprint, pubkey_pem, account_id }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKey {
    pub fingerprint: Fingerprint,
    pub pubkey_pem: String,
    pub account_id: AccountId,
}
