use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use directory::{AddKeyError, AddKeyErrorOr, DeviceKeyStore, Fingerprint};
use imap_proto::{Response, Status, Tag, Untagged};
use trc::{event, DeviceKeyEvent, Error, ErrorKind, EventType};

/// Fixed poll cadence; not user-configurable, unlike the keep-alive.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// One side of a sorted two-cursor diff: entries only in `old` are gone
/// (DELETED), entries only in `new` are new (CREATED).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Deleted(Fingerprint),
    Created(Fingerprint),
}

/// Walks two ascending-sorted fingerprint lists and emits the edit script
/// that turns `old` into `new`. Pure and total: no I/O, no store lookups —
/// the "applying the diff reconstructs `new`" property is checkable
/// directly against this function.
pub fn diff_fingerprints(old: &[Fingerprint], new: &[Fingerprint]) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Less => {
                ops.push(DiffOp::Deleted(old[i].clone()));
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                ops.push(DiffOp::Created(new[j].clone()));
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    while i < old.len() {
        ops.push(DiffOp::Deleted(old[i].clone()));
        i += 1;
    }
    while j < new.len() {
        ops.push(DiffOp::Created(new[j].clone()));
        j += 1;
    }
    ops
}

/// Handles one XKEYADD invocation end to end. The CITM core calls this
/// synchronously from `advance()`; it never suspends.
pub fn handle_xkeyadd(
    tag: &Tag,
    account_id: &directory::AccountId,
    pem: &[u8],
    cap: usize,
    store: &dyn DeviceKeyStore,
) -> Response {
    let pem_text = match std::str::from_utf8(pem) {
        Ok(s) => s,
        Err(_) => {
            return Response::Tagged {
                tag: tag.clone(),
                status: Status::Bad,
                code: None,
                text: "invalid PEM encoding".to_string(),
            }
        }
    };

    match store.add(account_id, pem_text, cap) {
        Ok(fpr) => {
            event!(
                EventType::DeviceKey(DeviceKeyEvent::Added),
                "account" = account_id.as_str(),
                "fpr" = fpr.as_str()
            );
            Response::Tagged {
                tag: tag.clone(),
                status: Status::Ok,
                code: Some(format!("XKEYADD {fpr}").into()),
                text: "key added".to_string(),
            }
        }
        Err(AddKeyErrorOr::Typed(AddKeyError::InvalidPem)) => Response::Tagged {
            tag: tag.clone(),
            status: Status::Bad,
            code: None,
            text: "not a valid public key".to_string(),
        },
        Err(AddKeyErrorOr::Typed(AddKeyError::Capacity)) => {
            event!(
                EventType::DeviceKey(DeviceKeyEvent::CapacityReached),
                "account" = account_id.as_str()
            );
            Response::Tagged {
                tag: tag.clone(),
                status: Status::No,
                code: None,
                text: "device limit reached, remove a device before adding another".to_string(),
            }
        }
        Err(AddKeyErrorOr::Store(e)) => {
            event!(
                EventType::DeviceKey(DeviceKeyEvent::SyncError),
                "error" = e.to_string()
            );
            Response::Tagged {
                tag: tag.clone(),
                status: Status::Bad,
                code: None,
                text: "internal server failure".to_string(),
            }
        }
    }
}

/// One live `XKEYSYNC` invocation. `known` is the last fingerprint set we
/// believe the client has been told about — updated after every diff so
/// the next poll is incremental.
pub struct XkeysyncContext {
    pub tag: Tag,
    pub account_id: directory::AccountId,
    known: Vec<Fingerprint>,
    retry_count: u32,
    poll_interval: Duration,
    keepalive_interval: Duration,
    last_poll: Instant,
    last_keepalive: Instant,
}

/// What the poll/keep-alive timers tell the CITM core to emit, bundled so
/// one call can drive both the change packet and its terminator.
pub struct DiffPacket {
    pub updates: VecDeque<Response>,
    pub changed: bool,
}

impl XkeysyncContext {
    /// `client_fprs` need not arrive sorted; only the server-side ordering
    /// is authoritative. `keepalive_base_ms` is randomized against
    /// `identity`/`client_ip` so a fleet of mobile clients don't all wake up
    /// on the same tick.
    pub fn new(
        tag: Tag,
        account_id: directory::AccountId,
        mut client_fprs: Vec<Fingerprint>,
        identity: &str,
        client_ip: IpAddr,
        keepalive_base_ms: u64,
    ) -> Self {
        client_fprs.sort();
        client_fprs.dedup();
        let now = Instant::now();
        let keepalive_ms = utils::keepalive_jitter_ms(keepalive_base_ms, identity, client_ip);
        XkeysyncContext {
            tag,
            account_id,
            known: client_fprs,
            retry_count: 0,
            poll_interval: POLL_INTERVAL,
            keepalive_interval: Duration::from_millis(keepalive_ms),
            last_poll: now,
            last_keepalive: now,
        }
    }

    /// Whether the poll timer (step 5) is due to fire.
    pub fn poll_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_poll) >= self.poll_interval
    }

    /// Whether the keep-alive timer (step 6) is due to fire.
    pub fn keepalive_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_keepalive) >= self.keepalive_interval
    }

    pub fn mark_polled(&mut self, now: Instant) {
        self.last_poll = now;
    }

    pub fn mark_keepalive(&mut self, now: Instant) {
        self.last_keepalive = now;
    }

    /// Computes the current server-side set vs `known`, builds the untagged
    /// diff packet, and advances `known` to the new server snapshot.
    /// Invariant (i): a CREATED whose pubkey cannot be found is fatal.
    fn diff_against_store(&mut self, store: &dyn DeviceKeyStore) -> trc::Result<DiffPacket> {
        let current = store.list_fingerprints(&self.account_id)?;
        let ops = diff_fingerprints(&self.known, &current);

        let mut updates = VecDeque::new();
        for op in &ops {
            match op {
                DiffOp::Deleted(fpr) => {
                    updates.push_back(Response::Untagged(Untagged::XkeySyncDeleted {
                        fpr: fpr.as_str().into(),
                    }));
                }
                DiffOp::Created(fpr) => {
                    let pem = store.get_pubkey(&self.account_id, fpr)?.ok_or_else(|| {
                        event!(
                            EventType::DeviceKey(DeviceKeyEvent::SyncError),
                            "account" = self.account_id.as_str(),
                            "fpr" = fpr.as_str()
                        );
                        Error::new(
                            ErrorKind::Internal,
                            format!("fingerprint {fpr} vanished mid-diff (concurrent delete race)"),
                        )
                    })?;
                    updates.push_back(Response::Untagged(Untagged::XkeySyncCreated {
                        pem: pem.into_bytes(),
                    }));
                }
            }
        }

        let changed = !ops.is_empty();
        self.known = current;
        Ok(DiffPacket { updates, changed })
    }

    /// Step 2-3: immediate diff on invocation, always followed by `+ OK`.
    pub fn initial_diff(&mut self, store: &dyn DeviceKeyStore) -> trc::Result<Vec<Response>> {
        let packet = self.diff_against_store(store)?;
        let mut out: Vec<Response> = packet.updates.into();
        out.push(Response::Untagged(Untagged::XkeySyncOk));
        out.push(Response::Continuation { text: "OK".to_string() });
        Ok(out)
    }

    /// Step 5: poll-timer fire. Per invariant (iii), `* XKEYSYNC OK` is only
    /// emitted when the poll actually produced changes.
    pub fn poll_tick(&mut self, store: &dyn DeviceKeyStore) -> trc::Result<Vec<Response>> {
        let packet = self.diff_against_store(store)?;
        if !packet.changed {
            return Ok(Vec::new());
        }
        let mut out: Vec<Response> = packet.updates.into();
        out.push(Response::Untagged(Untagged::XkeySyncOk));
        Ok(out)
    }

    /// Step 6: keep-alive fire with nothing pending to say.
    pub fn keepalive_tick(&self) -> Response {
        Response::Untagged(Untagged::StillSyncing)
    }

    pub fn record_poll_failure(&mut self) -> bool {
        self.retry_count += 1;
        self.retry_count >= 3
    }

    pub fn record_poll_success(&mut self) {
        self.retry_count = 0;
    }

    /// Step 7: one line read from the client while XKEYSYNC holds the
    /// connection. `Some(response)` means the context is done.
    pub fn handle_client_line(&self, line: &[u8]) -> Response {
        if imap_proto::is_done_line(line) {
            Response::Tagged {
                tag: self.tag.clone(),
                status: Status::Ok,
                code: None,
                text: "xkeysync complete".to_string(),
            }
        } else {
            Response::Tagged {
                tag: self.tag.clone(),
                status: Status::Bad,
                code: None,
                text: "expected DONE".to_string(),
            }
        }
    }

    pub fn retry_exhausted_response(&self) -> Response {
        Response::Tagged {
            tag: self.tag.clone(),
            status: Status::Bad,
            code: None,
            text: "internal server failure".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fpr(c: char) -> Fingerprint {
        Fingerprint(std::iter::repeat(c).take(40).collect::<String>().into())
    }

    #[test]
    fn diff_emits_nothing_for_identical_sets() {
        let a = vec![fpr('a'), fpr('b')];
        assert!(diff_fingerprints(&a, &a).is_empty());
    }

    #[test]
    fn diff_finds_deletions_and_creations() {
        let old = vec![fpr('a'), fpr('c')];
        let new = vec![fpr('a'), fpr('b')];
        let ops = diff_fingerprints(&old, &new);
        assert_eq!(ops, vec![DiffOp::Deleted(fpr('c')), DiffOp::Created(fpr('b'))]);
    }

    #[test]
    fn diff_applies_cleanly_old_to_new() {
        // applying the emitted ops to `old` should yield `new`.
        let old = vec![fpr('a'), fpr('c'), fpr('e')];
        let new = vec![fpr('b'), fpr('c'), fpr('d')];
        let ops = diff_fingerprints(&old, &new);
        let mut applied: Vec<Fingerprint> = old.clone();
        for op in &ops {
            match op {
                DiffOp::Deleted(f) => applied.retain(|x| x != f),
                DiffOp::Created(f) => applied.push(f.clone()),
            }
        }
        applied.sort();
        let mut expected = new.clone();
        expected.sort();
        assert_eq!(applied, expected);
    }

    #[test]
    fn handles_all_deletions_when_new_is_empty() {
        let old = vec![fpr('a'), fpr('b')];
        let ops = diff_fingerprints(&old, &[]);
        assert_eq!(ops, vec![DiffOp::Deleted(fpr('a')), DiffOp::Deleted(fpr('b'))]);
    }

    fn ctx(account_id: directory::AccountId) -> XkeysyncContext {
        let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();
        XkeysyncContext::new(compact_str::CompactString::from("a1"), account_id, vec![], "alice@example.com", ip, 120_000)
    }

    #[test]
    fn poll_tick_emits_nothing_when_unchanged() {
        let store = directory::MemoryStore::new();
        let account_id = store.seed_account("alice@example.com", "hash", 20);
        let mut c = ctx(account_id);
        c.initial_diff(&store).unwrap();
        assert!(c.poll_tick(&store).unwrap().is_empty());
    }

    #[test]
    fn poll_tick_emits_ok_after_initial_diff_when_store_changes() {
        let store = directory::MemoryStore::new();
        let account_id = store.seed_account("alice@example.com", "hash", 20);
        let mut c = ctx(account_id.clone());
        c.initial_diff(&store).unwrap();

        let pem = directory::fingerprint::testutil::p256_generator_pubkey_pem();
        store.add(&account_id, &pem, 20).unwrap();

        let updates = c.poll_tick(&store).unwrap();
        assert!(updates.iter().any(|r| matches!(r, Response::Untagged(Untagged::XkeySyncCreated { .. }))));
        assert!(matches!(updates.last(), Some(Response::Untagged(Untagged::XkeySyncOk))));
    }

    #[test]
    fn keepalive_tick_is_still_syncing() {
        let store = directory::MemoryStore::new();
        let account_id = store.seed_account("alice@example.com", "hash", 20);
        let c = ctx(account_id);
        assert!(matches!(c.keepalive_tick(), Response::Untagged(Untagged::StillSyncing)));
    }

    #[test]
    fn retry_counter_trips_on_third_consecutive_failure() {
        let store = directory::MemoryStore::new();
        let account_id = store.seed_account("alice@example.com", "hash", 20);
        let mut c = ctx(account_id);
        assert!(!c.record_poll_failure());
        assert!(!c.record_poll_failure());
        assert!(c.record_poll_failure());
    }

    #[test]
    fn transient_failure_resets_retry_counter() {
        let store = directory::MemoryStore::new();
        let account_id = store.seed_account("alice@example.com", "hash", 20);
        let mut c = ctx(account_id);
        c.record_poll_failure();
        c.record_poll_success();
        assert!(!c.record_poll_failure());
        assert!(!c.record_poll_failure());
    }

    #[test]
    fn done_line_finishes_the_context_and_anything_else_is_bad() {
        let store = directory::MemoryStore::new();
        let account_id = store.seed_account("alice@example.com", "hash", 20);
        let c = ctx(account_id);
        assert!(matches!(c.handle_client_line(b"DONE\r\n"), Response::Tagged { status: Status::Ok, .. }));
        assert!(matches!(c.handle_client_line(b"nope\r\n"), Response::Tagged { status: Status::Bad, .. }));
    }
}
