//! In-memory `AccountStore`/`DeviceKeyStore` fakes for the `imap` crate's
//! tests, gated behind `test_mode` so production binaries never link them.

use ahash::AHashMap;
use parking_lot::Mutex;
use trc::Error;

use crate::fingerprint::fingerprint_pem;
use crate::traits::{AccountStore, AddKeyError, AddKeyErrorOr, DeviceKeyStore};
use crate::types::{Account, AccountId, DeviceKey, Fingerprint};

struct Inner {
    accounts: AHashMap<AccountId, Account>,
    emails: AHashMap<String, AccountId>,
    sessions: AHashMap<String, AccountId>,
    aliases: AHashMap<AccountId, Vec<(String, bool)>>,
    tokens: AHashMap<AccountId, Vec<String>>,
    installations: AHashMap<AccountId, Vec<String>>,
    subdomains: AHashMap<String, AccountId>,
    challenges: AHashMap<AccountId, String>,
    device_keys: AHashMap<AccountId, Vec<(Fingerprint, String)>>,
}

/// Test-only store: everything lives behind one lock, since tests never
/// exercise contention, only the same count-then-insert ordering real
/// callers depend on.
pub struct MemoryStore(Mutex<Inner>);

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore(Mutex::new(Inner {
            accounts: AHashMap::default(),
            emails: AHashMap::default(),
            sessions: AHashMap::default(),
            aliases: AHashMap::default(),
            tokens: AHashMap::default(),
            installations: AHashMap::default(),
            subdomains: AHashMap::default(),
            challenges: AHashMap::default(),
            device_keys: AHashMap::default(),
        }))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: install an account with a plaintext password, bypassing
    /// any hashing scheme.
    pub fn seed_account(&self, email: &str, password_hash: &str, device_cap: usize) -> AccountId {
        let mut inner = self.0.lock();
        let account_id = AccountId::new(format!("acct-{}", inner.accounts.len() + 1));
        inner.emails.insert(email.to_string(), account_id.clone());
        inner.accounts.insert(
            account_id.clone(),
            Account {
                account_id: account_id.clone(),
                email: email.into(),
                password_hash: password_hash.into(),
                device_cap,
            },
        );
        account_id
    }
}

impl AccountStore for MemoryStore {
    fn create_account(&self, email: &str, password_hash: &str, device_cap: usize) -> trc::Result<AccountId> {
        let mut inner = self.0.lock();
        if inner.emails.contains_key(email) {
            return Err(Error::new(trc::ErrorKind::SqlDup, "email already registered"));
        }
        let account_id = AccountId::new(format!("acct-{}", inner.accounts.len() + 1));
        inner.emails.insert(email.to_string(), account_id.clone());
        inner.accounts.insert(
            account_id.clone(),
            Account {
                account_id: account_id.clone(),
                email: email.into(),
                password_hash: password_hash.into(),
                device_cap,
            },
        );
        Ok(account_id)
    }

    fn validate_login(&self, email: &str, password: &str) -> trc::Result<AccountId> {
        let inner = self.0.lock();
        let account_id = inner
            .emails
            .get(email)
            .ok_or_else(|| Error::user_msg("no such account"))?
            .clone();
        let account = inner.accounts.get(&account_id).expect("email index consistent");
        if account.password_hash == password {
            Ok(account_id)
        } else {
            Err(Error::user_msg("invalid credentials"))
        }
    }

    fn validate_user_password(&self, account_id: &AccountId, password: &str) -> trc::Result<bool> {
        let inner = self.0.lock();
        let account = inner
            .accounts
            .get(account_id)
            .ok_or_else(|| Error::user_msg("no such account"))?;
        Ok(account.password_hash == password)
    }

    fn change_password(&self, account_id: &AccountId, new_hash: &str) -> trc::Result<()> {
        let mut inner = self.0.lock();
        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| Error::user_msg("no such account"))?;
        account.password_hash = new_hash.into();
        Ok(())
    }

    fn account_info(&self, account_id: &AccountId) -> trc::Result<Account> {
        self.0
            .lock()
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| Error::user_msg("no such account"))
    }

    fn add_session_auth(&self, account_id: &AccountId) -> trc::Result<String> {
        let mut inner = self.0.lock();
        let token = format!("sess-{}", inner.sessions.len() + 1);
        inner.sessions.insert(token.clone(), account_id.clone());
        Ok(token)
    }

    fn validate_session_auth(&self, token: &str) -> trc::Result<AccountId> {
        self.0
            .lock()
            .sessions
            .get(token)
            .cloned()
            .ok_or_else(|| Error::user_msg("no such session"))
    }

    fn session_logout(&self, token: &str) -> trc::Result<()> {
        self.0.lock().sessions.remove(token);
        Ok(())
    }

    fn new_csrf(&self, _token: &str) -> trc::Result<String> {
        Ok("test-csrf".into())
    }

    fn gc_sessions_and_csrf(&self, _server_id: &str, _now: i64) -> trc::Result<usize> {
        Ok(0)
    }

    fn list_devices(&self, account_id: &AccountId) -> trc::Result<Vec<Fingerprint>> {
        let inner = self.0.lock();
        let mut fprs: Vec<_> = inner
            .device_keys
            .get(account_id)
            .map(|v| v.iter().map(|(f, _)| f.clone()).collect())
            .unwrap_or_default();
        fprs.sort();
        Ok(fprs)
    }

    fn list_aliases(&self, account_id: &AccountId) -> trc::Result<Vec<String>> {
        Ok(self
            .0
            .lock()
            .aliases
            .get(account_id)
            .map(|v| v.iter().map(|(a, _)| a.clone()).collect())
            .unwrap_or_default())
    }

    fn add_random_alias(&self, account_id: &AccountId) -> trc::Result<String> {
        let mut inner = self.0.lock();
        let addr = format!("alias{}@splintermail.com", inner.aliases.len() + 1);
        inner.aliases.entry(account_id.clone()).or_default().push((addr.clone(), false));
        Ok(addr)
    }

    fn add_primary_alias(&self, account_id: &AccountId, address: &str) -> trc::Result<()> {
        self.0
            .lock()
            .aliases
            .entry(account_id.clone())
            .or_default()
            .push((address.to_string(), true));
        Ok(())
    }

    fn delete_alias(&self, account_id: &AccountId, address: &str) -> trc::Result<()> {
        if let Some(v) = self.0.lock().aliases.get_mut(account_id) {
            v.retain(|(a, _)| a != address);
        }
        Ok(())
    }

    fn user_owns_address(&self, account_id: &AccountId, address: &str) -> trc::Result<bool> {
        Ok(self
            .0
            .lock()
            .aliases
            .get(account_id)
            .is_some_and(|v| v.iter().any(|(a, _)| a == address)))
    }

    fn list_tokens(&self, account_id: &AccountId) -> trc::Result<Vec<String>> {
        Ok(self.0.lock().tokens.get(account_id).cloned().unwrap_or_default())
    }

    fn add_token(&self, account_id: &AccountId, token: &str) -> trc::Result<()> {
        self.0
            .lock()
            .tokens
            .entry(account_id.clone())
            .or_default()
            .push(token.to_string());
        Ok(())
    }

    fn delete_token(&self, token: &str) -> trc::Result<()> {
        for v in self.0.lock().tokens.values_mut() {
            v.retain(|t| t != token);
        }
        Ok(())
    }

    fn list_installations(&self, account_id: &AccountId) -> trc::Result<Vec<String>> {
        Ok(self.0.lock().installations.get(account_id).cloned().unwrap_or_default())
    }

    fn add_installation(&self, account_id: &AccountId, installation_id: &str) -> trc::Result<()> {
        self.0
            .lock()
            .installations
            .entry(account_id.clone())
            .or_default()
            .push(installation_id.to_string());
        Ok(())
    }

    fn delete_installation(&self, installation_id: &str) -> trc::Result<()> {
        for v in self.0.lock().installations.values_mut() {
            v.retain(|i| i != installation_id);
        }
        Ok(())
    }

    fn subdomain_user(&self, subdomain: &str) -> trc::Result<Option<AccountId>> {
        Ok(self.0.lock().subdomains.get(subdomain).cloned())
    }

    fn set_challenge(&self, account_id: &AccountId, token: &str) -> trc::Result<()> {
        self.0.lock().challenges.insert(account_id.clone(), token.to_string());
        Ok(())
    }

    fn delete_challenge(&self, account_id: &AccountId) -> trc::Result<()> {
        self.0.lock().challenges.remove(account_id);
        Ok(())
    }

    fn list_challenges(&self) -> trc::Result<Vec<(AccountId, String)>> {
        Ok(self
            .0
            .lock()
            .challenges
            .iter()
            .map(|(a, t)| (a.clone(), t.clone()))
            .collect())
    }

    fn list_deletions(&self) -> trc::Result<Vec<AccountId>> {
        Ok(Vec::new())
    }
}

impl DeviceKeyStore for MemoryStore {
    fn list_fingerprints(&self, account_id: &AccountId) -> trc::Result<Vec<Fingerprint>> {
        AccountStore::list_devices(self, account_id)
    }

    fn get_pubkey(&self, account_id: &AccountId, fpr: &Fingerprint) -> trc::Result<Option<String>> {
        Ok(self
            .0
            .lock()
            .device_keys
            .get(account_id)
            .and_then(|v| v.iter().find(|(f, _)| f == fpr).map(|(_, pem)| pem.clone())))
    }

    fn count(&self, account_id: &AccountId) -> trc::Result<usize> {
        Ok(self.0.lock().device_keys.get(account_id).map(Vec::len).unwrap_or(0))
    }

    fn add(&self, account_id: &AccountId, pem: &str, cap: usize) -> Result<Fingerprint, AddKeyErrorOr> {
        let fpr = fingerprint_pem(pem).map_err(|_| AddKeyError::InvalidPem)?;
        let mut inner = self.0.lock();
        let keys = inner.device_keys.entry(account_id.clone()).or_default();
        // re-adding an already-present key is a no-op, even at capacity:
        // it does not grow the account's device set (invariant iii).
        if keys.iter().any(|(f, _)| *f == fpr) {
            return Ok(fpr);
        }
        if keys.len() >= cap {
            return Err(AddKeyError::Capacity.into());
        }
        keys.push((fpr.clone(), pem.to_string()));
        Ok(fpr)
    }

    fn remove(&self, account_id: &AccountId, fpr: &Fingerprint) -> trc::Result<()> {
        if let Some(v) = self.0.lock().device_keys.get_mut(account_id) {
            v.retain(|(f, _)| f != fpr);
        }
        Ok(())
    }

    fn all_keys(&self, account_id: &AccountId) -> trc::Result<Vec<DeviceKey>> {
        Ok(self
            .0
            .lock()
            .device_keys
            .get(account_id)
            .map(|v| {
                v.iter()
                    .map(|(fingerprint, pem)| DeviceKey {
                        fingerprint: fingerprint.clone(),
                        pubkey_pem: pem.clone(),
                        account_id: account_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_respects_capacity() {
        let store = MemoryStore::new();
        let account_id = store.seed_account("a@example.com", "pw", 1);
        let pem = crate::fingerprint::testutil::p256_generator_pubkey_pem();
        assert!(store.add(&account_id, &pem, 1).is_ok());

        // re-adding the same key at full capacity is a no-op, not an error.
        assert!(store.add(&account_id, &pem, 1).is_ok());
        assert_eq!(store.count(&account_id).unwrap(), 1);

        // a second, distinct key is rejected once capacity is met.
        let pem2 = crate::fingerprint::testutil::deterministic_pubkey_pem(1);
        match store.add(&account_id, &pem2, 1) {
            Err(AddKeyErrorOr::Typed(AddKeyError::Capacity)) => {}
            other => panic!("expected capacity error, got {other:?}"),
        }
    }

    #[test]
    fn session_roundtrip() {
        let store = MemoryStore::new();
        let account_id = store.seed_account("b@example.com", "pw", 4);
        let token = store.add_session_auth(&account_id).unwrap();
        assert_eq!(store.validate_session_auth(&token).unwrap(), account_id);
        store.session_logout(&token).unwrap();
        assert!(store.validate_session_auth(&token).is_err());
    }
}
