use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use trc::{Error, ErrorKind};

use crate::fingerprint::fingerprint_pem;
use crate::sql::{checked_execute, sql_error};
use crate::traits::{AccountStore, AddKeyError, AddKeyErrorOr, DeviceKeyStore};
use crate::types::{Account, AccountId, DeviceKey, Fingerprint};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    account_id   TEXT PRIMARY KEY,
    email        TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    device_cap   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    token      TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    server_id  TEXT,
    csrf       TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS aliases (
    address    TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    is_primary INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tokens (
    token      TEXT PRIMARY KEY,
    account_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS installations (
    installation_id TEXT PRIMARY KEY,
    account_id       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS subdomains (
    subdomain  TEXT PRIMARY KEY,
    account_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS challenges (
    account_id TEXT PRIMARY KEY,
    token      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS device_keys (
    account_id   TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    pubkey_pem   TEXT NOT NULL,
    PRIMARY KEY (account_id, fingerprint)
);
"#;

/// `rusqlite::Connection` is `!Sync`; the mutex also stands in for the
/// table-level write lock needed around `add()`'s count-then-insert
/// sequence, making the pair linearizable.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_in_memory() -> trc::Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| sql_error(&e))?;
        conn.execute_batch(SCHEMA).map_err(|e| sql_error(&e))?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &std::path::Path) -> trc::Result<Self> {
        let conn = Connection::open(path).map_err(|e| sql_error(&e))?;
        conn.execute_batch(SCHEMA).map_err(|e| sql_error(&e))?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

impl AccountStore for SqliteStore {
    fn create_account(&self, email: &str, password_hash: &str, device_cap: usize) -> trc::Result<AccountId> {
        let conn = self.conn.lock();
        let account_id = AccountId::new(compact_str::CompactString::from(
            uuid_like(&utils::rand_bytes(16)),
        ));
        checked_execute(
            &conn,
            "INSERT INTO accounts (account_id, email, password_hash, device_cap) VALUES (?1, ?2, ?3, ?4)",
            4,
            params![account_id.as_str(), email, password_hash, device_cap as i64],
        )?;
        Ok(account_id)
    }

    fn validate_login(&self, email: &str, password: &str) -> trc::Result<AccountId> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT account_id, password_hash FROM accounts WHERE email = ?1",
                params![email],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| sql_error(&e))?;
        let (account_id, hash) = row.ok_or_else(|| Error::user_msg("no such account"))?;
        if pwhash::bcrypt::verify(password, &hash) {
            Ok(AccountId::new(account_id))
        } else {
            Err(Error::user_msg("invalid credentials"))
        }
    }

    fn validate_user_password(&self, account_id: &AccountId, password: &str) -> trc::Result<bool> {
        let conn = self.conn.lock();
        let hash: String = conn
            .query_row(
                "SELECT password_hash FROM accounts WHERE account_id = ?1",
                params![account_id.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| sql_error(&e))?;
        Ok(pwhash::bcrypt::verify(password, &hash))
    }

    fn change_password(&self, account_id: &AccountId, new_hash: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "UPDATE accounts SET password_hash = ?1 WHERE account_id = ?2",
            2,
            params![new_hash, account_id.as_str()],
        )?;
        Ok(())
    }

    fn account_info(&self, account_id: &AccountId) -> trc::Result<Account> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT account_id, email, password_hash, device_cap FROM accounts WHERE account_id = ?1",
            params![account_id.as_str()],
            |r| {
                Ok(Account {
                    account_id: AccountId::new(r.get::<_, String>(0)?),
                    email: r.get::<_, String>(1)?.into(),
                    password_hash: r.get::<_, String>(2)?.into(),
                    device_cap: r.get::<_, i64>(3)? as usize,
                })
            },
        )
        .map_err(|e| sql_error(&e))
    }

    fn add_session_auth(&self, account_id: &AccountId) -> trc::Result<String> {
        let conn = self.conn.lock();
        let token = uuid_like(&utils::rand_bytes(16));
        checked_execute(
            &conn,
            "INSERT INTO sessions (token, account_id, server_id, csrf, created_at) VALUES (?1, ?2, NULL, NULL, ?3)",
            3,
            params![token, account_id.as_str(), now_unix()],
        )?;
        Ok(token)
    }

    fn validate_session_auth(&self, token: &str) -> trc::Result<AccountId> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT account_id FROM sessions WHERE token = ?1",
            params![token],
            |r| r.get::<_, String>(0),
        )
        .map(AccountId::new)
        .map_err(|e| sql_error(&e))
    }

    fn session_logout(&self, token: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(&conn, "DELETE FROM sessions WHERE token = ?1", 1, params![token])?;
        Ok(())
    }

    fn new_csrf(&self, token: &str) -> trc::Result<String> {
        let conn = self.conn.lock();
        let csrf = uuid_like(&utils::rand_bytes(16));
        checked_execute(
            &conn,
            "UPDATE sessions SET csrf = ?1 WHERE token = ?2",
            2,
            params![csrf, token],
        )?;
        Ok(csrf)
    }

    fn gc_sessions_and_csrf(&self, server_id: &str, now: i64) -> trc::Result<usize> {
        let conn = self.conn.lock();
        const MAX_SESSION_AGE_SECS: i64 = 30 * 24 * 3600;
        checked_execute(
            &conn,
            "DELETE FROM sessions WHERE server_id = ?1 AND created_at < ?2",
            2,
            params![server_id, now - MAX_SESSION_AGE_SECS],
        )
    }

    fn list_devices(&self, account_id: &AccountId) -> trc::Result<Vec<Fingerprint>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT fingerprint FROM device_keys WHERE account_id = ?1 ORDER BY fingerprint ASC")
            .map_err(|e| sql_error(&e))?;
        let rows = stmt
            .query_map(params![account_id.as_str()], |r| r.get::<_, String>(0))
            .map_err(|e| sql_error(&e))?;
        rows.map(|r| r.map(|s| Fingerprint(s.into())).map_err(|e| sql_error(&e)))
            .collect()
    }

    fn list_aliases(&self, account_id: &AccountId) -> trc::Result<Vec<String>> {
        self.list_strings("SELECT address FROM aliases WHERE account_id = ?1", account_id)
    }

    fn add_random_alias(&self, account_id: &AccountId) -> trc::Result<String> {
        // retry-on-collision: `SqlDup` is the one SQL error branched on
        for _ in 0..5 {
            let candidate = format!("{}@splintermail.com", uuid_like(&utils::rand_bytes(8)));
            let conn = self.conn.lock();
            match checked_execute(
                &conn,
                "INSERT INTO aliases (address, account_id, is_primary) VALUES (?1, ?2, 0)",
                2,
                params![candidate, account_id.as_str()],
            ) {
                Ok(_) => return Ok(candidate),
                Err(e) if e.is(ErrorKind::SqlDup) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::new(ErrorKind::Internal, "exhausted alias collision retries"))
    }

    fn add_primary_alias(&self, account_id: &AccountId, address: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "INSERT INTO aliases (address, account_id, is_primary) VALUES (?1, ?2, 1)",
            2,
            params![address, account_id.as_str()],
        )?;
        Ok(())
    }

    fn delete_alias(&self, account_id: &AccountId, address: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "DELETE FROM aliases WHERE address = ?1 AND account_id = ?2",
            2,
            params![address, account_id.as_str()],
        )?;
        Ok(())
    }

    fn user_owns_address(&self, account_id: &AccountId, address: &str) -> trc::Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM aliases WHERE address = ?1 AND account_id = ?2",
                params![address, account_id.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| sql_error(&e))?;
        Ok(count > 0)
    }

    fn list_tokens(&self, account_id: &AccountId) -> trc::Result<Vec<String>> {
        self.list_strings("SELECT token FROM tokens WHERE account_id = ?1", account_id)
    }

    fn add_token(&self, account_id: &AccountId, token: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "INSERT INTO tokens (token, account_id) VALUES (?1, ?2)",
            2,
            params![token, account_id.as_str()],
        )?;
        Ok(())
    }

    fn delete_token(&self, token: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(&conn, "DELETE FROM tokens WHERE token = ?1", 1, params![token])?;
        Ok(())
    }

    fn list_installations(&self, account_id: &AccountId) -> trc::Result<Vec<String>> {
        self.list_strings(
            "SELECT installation_id FROM installations WHERE account_id = ?1",
            account_id,
        )
    }

    fn add_installation(&self, account_id: &AccountId, installation_id: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "INSERT INTO installations (installation_id, account_id) VALUES (?1, ?2)",
            2,
            params![installation_id, account_id.as_str()],
        )?;
        Ok(())
    }

    fn delete_installation(&self, installation_id: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "DELETE FROM installations WHERE installation_id = ?1",
            1,
            params![installation_id],
        )?;
        Ok(())
    }

    fn subdomain_user(&self, subdomain: &str) -> trc::Result<Option<AccountId>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT account_id FROM subdomains WHERE subdomain = ?1",
            params![subdomain],
            |r| r.get::<_, String>(0),
        )
        .optional()
        .map(|opt| opt.map(AccountId::new))
        .map_err(|e| sql_error(&e))
    }

    fn set_challenge(&self, account_id: &AccountId, token: &str) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "INSERT INTO challenges (account_id, token) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET token = excluded.token",
            2,
            params![account_id.as_str(), token],
        )?;
        Ok(())
    }

    fn delete_challenge(&self, account_id: &AccountId) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "DELETE FROM challenges WHERE account_id = ?1",
            1,
            params![account_id.as_str()],
        )?;
        Ok(())
    }

    fn list_challenges(&self) -> trc::Result<Vec<(AccountId, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT account_id, token FROM challenges")
            .map_err(|e| sql_error(&e))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .map_err(|e| sql_error(&e))?;
        rows.map(|r| r.map(|(a, t)| (AccountId::new(a), t)).map_err(|e| sql_error(&e)))
            .collect()
    }

    fn list_deletions(&self) -> trc::Result<Vec<AccountId>> {
        // no separate deletions table is modeled; accounts are never
        // physically removed by the CITM core (external admin path only).
        Ok(Vec::new())
    }
}

impl SqliteStore {
    fn list_strings(&self, sql: &str, account_id: &AccountId) -> trc::Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql).map_err(|e| sql_error(&e))?;
        let rows = stmt
            .query_map(params![account_id.as_str()], |r| r.get::<_, String>(0))
            .map_err(|e| sql_error(&e))?;
        rows.map(|r| r.map_err(|e| sql_error(&e))).collect()
    }
}

impl DeviceKeyStore for SqliteStore {
    fn list_fingerprints(&self, account_id: &AccountId) -> trc::Result<Vec<Fingerprint>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT fingerprint FROM device_keys WHERE account_id = ?1 ORDER BY fingerprint ASC",
            )
            .map_err(|e| sql_error(&e))?;
        let rows = stmt
            .query_map(params![account_id.as_str()], |r| r.get::<_, String>(0))
            .map_err(|e| sql_error(&e))?;
        rows.map(|r| r.map(|s| Fingerprint(s.into())).map_err(|e| sql_error(&e)))
            .collect()
    }

    fn get_pubkey(&self, account_id: &AccountId, fpr: &Fingerprint) -> trc::Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT pubkey_pem FROM device_keys WHERE account_id = ?1 AND fingerprint = ?2",
            params![account_id.as_str(), fpr.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| sql_error(&e))
    }

    fn count(&self, account_id: &AccountId) -> trc::Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM device_keys WHERE account_id = ?1",
                params![account_id.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| sql_error(&e))?;
        Ok(n as usize)
    }

    fn add(&self, account_id: &AccountId, pem: &str, cap: usize) -> Result<Fingerprint, AddKeyErrorOr> {
        let fpr = fingerprint_pem(pem).map_err(|_| AddKeyError::InvalidPem)?;

        // single connection mutex == the table-level write lock; the
        // existing-key check, count-check, and insert all happen while it's
        // held, so the whole sequence is linearizable.
        let conn = self.conn.lock();
        let already_present: bool = conn
            .query_row(
                "SELECT 1 FROM device_keys WHERE account_id = ?1 AND fingerprint = ?2",
                params![account_id.as_str(), fpr.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| AddKeyErrorOr::Store(sql_error(&e)))?
            .is_some();
        if already_present {
            return Ok(fpr);
        }

        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM device_keys WHERE account_id = ?1",
                params![account_id.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| AddKeyErrorOr::Store(sql_error(&e)))?;
        if n as usize >= cap {
            return Err(AddKeyError::Capacity.into());
        }

        checked_execute(
            &conn,
            "INSERT INTO device_keys (account_id, fingerprint, pubkey_pem) VALUES (?1, ?2, ?3)",
            3,
            params![account_id.as_str(), fpr.as_str(), pem],
        )
        .map_err(AddKeyErrorOr::Store)?;

        Ok(fpr)
    }

    fn remove(&self, account_id: &AccountId, fpr: &Fingerprint) -> trc::Result<()> {
        let conn = self.conn.lock();
        checked_execute(
            &conn,
            "DELETE FROM device_keys WHERE account_id = ?1 AND fingerprint = ?2",
            2,
            params![account_id.as_str(), fpr.as_str()],
        )?;
        Ok(())
    }

    fn all_keys(&self, account_id: &AccountId) -> trc::Result<Vec<DeviceKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT fingerprint, pubkey_pem FROM device_keys WHERE account_id = ?1 ORDER BY fingerprint ASC",
            )
            .map_err(|e| sql_error(&e))?;
        let rows = stmt
            .query_map(params![account_id.as_str()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .map_err(|e| sql_error(&e))?;
        rows.map(|r| {
            r.map(|(fpr, pem)| DeviceKey {
                fingerprint: Fingerprint(fpr.into()),
                pubkey_pem: pem,
                account_id: account_id.clone(),
            })
            .map_err(|e| sql_error(&e))
        })
        .collect()
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn uuid_like(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
