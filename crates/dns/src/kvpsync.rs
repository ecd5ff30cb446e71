//! kvpsync replication: an update carries a `type` tag (START/INSERT/FLUSH)
//! plus `sync_id`/`update_id`, and every processed update is ACKed with the
//! pair it was processed under. The wire layout below (tag byte +
//! big-endian fields) is this crate's own fixed-width encoding, documented
//! in DESIGN.md.

use ahash::AHashMap;
use arc_swap::ArcSwap;
use std::sync::Arc;
use trc::{KvpSyncEvent, event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub sync_id: u64,
    pub update_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Start { sync_id: u64, update_id: u64, resync_id: u64 },
    Insert { sync_id: u64, update_id: u64, key: String, val: String },
    Flush { sync_id: u64, update_id: u64, ok_expiry: u64 },
}

impl Update {
    pub fn sync_id(&self) -> u64 {
        match self {
            Update::Start { sync_id, .. } | Update::Insert { sync_id, .. } | Update::Flush { sync_id, .. } => *sync_id,
        }
    }

    pub fn update_id(&self) -> u64 {
        match self {
            Update::Start { update_id, .. } | Update::Insert { update_id, .. } | Update::Flush { update_id, .. } => *update_id,
        }
    }
}

const TAG_ACK: u8 = 0;
const TAG_START: u8 = 1;
const TAG_INSERT: u8 = 2;
const TAG_FLUSH: u8 = 3;

pub fn write_ack(ack: &Ack, out: &mut Vec<u8>) {
    out.push(TAG_ACK);
    out.extend_from_slice(&ack.sync_id.to_be_bytes());
    out.extend_from_slice(&ack.update_id.to_be_bytes());
}

pub fn read_ack(buf: &[u8]) -> Option<Ack> {
    if buf.len() != 17 || buf[0] != TAG_ACK {
        return None;
    }
    Some(Ack {
        sync_id: u64::from_be_bytes(buf[1..9].try_into().ok()?),
        update_id: u64::from_be_bytes(buf[9..17].try_into().ok()?),
    })
}

pub fn write_update(update: &Update, out: &mut Vec<u8>) {
    match update {
        Update::Start { sync_id, update_id, resync_id } => {
            out.push(TAG_START);
            out.extend_from_slice(&sync_id.to_be_bytes());
            out.extend_from_slice(&update_id.to_be_bytes());
            out.extend_from_slice(&resync_id.to_be_bytes());
        }
        Update::Insert { sync_id, update_id, key, val } => {
            out.push(TAG_INSERT);
            out.extend_from_slice(&sync_id.to_be_bytes());
            out.extend_from_slice(&update_id.to_be_bytes());
            out.extend_from_slice(&(key.len() as u16).to_be_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(val.len() as u16).to_be_bytes());
            out.extend_from_slice(val.as_bytes());
        }
        Update::Flush { sync_id, update_id, ok_expiry } => {
            out.push(TAG_FLUSH);
            out.extend_from_slice(&sync_id.to_be_bytes());
            out.extend_from_slice(&update_id.to_be_bytes());
            out.extend_from_slice(&ok_expiry.to_be_bytes());
        }
    }
}

pub fn read_update(buf: &[u8]) -> Option<Update> {
    if buf.is_empty() {
        return None;
    }
    let sync_id = u64::from_be_bytes(buf.get(1..9)?.try_into().ok()?);
    let update_id = u64::from_be_bytes(buf.get(9..17)?.try_into().ok()?);
    match buf[0] {
        TAG_START => {
            let resync_id = u64::from_be_bytes(buf.get(17..25)?.try_into().ok()?);
            Some(Update::Start { sync_id, update_id, resync_id })
        }
        TAG_INSERT => {
            let klen = u16::from_be_bytes(buf.get(17..19)?.try_into().ok()?) as usize;
            let key_start = 19;
            let key = std::str::from_utf8(buf.get(key_start..key_start + klen)?).ok()?.to_string();
            let vlen_start = key_start + klen;
            let vlen = u16::from_be_bytes(buf.get(vlen_start..vlen_start + 2)?.try_into().ok()?) as usize;
            let val_start = vlen_start + 2;
            let val = std::str::from_utf8(buf.get(val_start..val_start + vlen)?).ok()?.to_string();
            Some(Update::Insert { sync_id, update_id, key, val })
        }
        TAG_FLUSH => {
            let ok_expiry = u64::from_be_bytes(buf.get(17..25)?.try_into().ok()?);
            Some(Update::Flush { sync_id, update_id, ok_expiry })
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum PeerState {
    Unsynced,
    Syncing { sync_id: u64, pending: AHashMap<String, String> },
    Live { sync_id: u64, ok_expiry: u64 },
}

/// One producer's replication session. `recv_id` is this receiver's own
/// per-peer generation token, handed out on boot and echoed back in the
/// peer's `UPDATE_START.resync_id` so a stale START from a prior boot can't
/// be mistaken for the current one.
struct Peer {
    recv_id: u64,
    state: PeerState,
    last_acked: (u64, u64),
}

/// Receives kvpsync updates from one or more peers and exposes the most
/// recently flushed key/val snapshot to the DNS responder. A single shared
/// `live` map is fine even with multiple peers: they're redundant producers
/// of the same logical dataset, so the last FLUSH wins.
pub struct KvpReceiver {
    peers: parking_lot::Mutex<Vec<Peer>>,
    live: ArcSwap<AHashMap<String, String>>,
}

impl KvpReceiver {
    pub fn new(peer_recv_ids: Vec<u64>) -> Self {
        KvpReceiver {
            peers: parking_lot::Mutex::new(
                peer_recv_ids
                    .into_iter()
                    .map(|recv_id| Peer {
                        recv_id,
                        state: PeerState::Unsynced,
                        last_acked: (recv_id, 0),
                    })
                    .collect(),
            ),
        live: ArcSwap::from_pointee(AHashMap::default()),
        }
    }

    /// The boot-time ACK each peer should be sent: `sync_id` is this
    /// receiver's own `recv_id`, `update_id` is 0.
    pub fn boot_acks(&self) -> Vec<Ack> {
        self.peers
            .lock()
            .iter()
            .map(|p| Ack { sync_id: p.recv_id, update_id: 0 })
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.live.load().get(key).cloned()
    }

    /// Any peer `Live` with `ok_expiry` after `now_ns` makes synced data
    /// trustworthy.
    pub fn any_peer_live(&self, now_ns: u64) -> bool {
        self.peers
            .lock()
            .iter()
            .any(|p| matches!(p.state, PeerState::Live { ok_expiry, .. } if ok_expiry > now_ns))
    }

    /// Applies one inbound update from `peer_idx` and returns the ACK to
    /// send back.
    pub fn apply(&self, peer_idx: usize, update: Update) -> Ack {
        let mut peers = self.peers.lock();
        let peer = &mut peers[peer_idx];

        match &update {
            Update::Start { sync_id, resync_id, .. } => {
                if *resync_id != peer.recv_id {
                    event!(trc::EventType::KvpSync(KvpSyncEvent::UpdateIgnored), "reason" = "resync_id mismatch");
                    return Ack { sync_id: peer.last_acked.0, update_id: peer.last_acked.1 };
                }
                peer.state = PeerState::Syncing { sync_id: *sync_id, pending: AHashMap::default() };
                peer.last_acked = (update.sync_id(), update.update_id());
                event!(trc::EventType::KvpSync(KvpSyncEvent::PeerResync), "sync_id" = *sync_id as i64);
                Ack { sync_id: update.sync_id(), update_id: update.update_id() }
            }
            Update::Insert { sync_id, key, val, .. } => {
                let current_sync = current_sync_id(&peer.state);
                if current_sync != Some(*sync_id) {
                    event!(trc::EventType::KvpSync(KvpSyncEvent::UpdateIgnored), "sync_id" = *sync_id as i64);
                    return Ack { sync_id: peer.last_acked.0, update_id: peer.last_acked.1 };
                }
                if let PeerState::Syncing { pending, .. } = &mut peer.state {
                    pending.insert(key.clone(), val.clone());
                }
                peer.last_acked = (update.sync_id(), update.update_id());
                event!(trc::EventType::KvpSync(KvpSyncEvent::UpdateApplied), "key" = key.as_str());
                Ack { sync_id: update.sync_id(), update_id: update.update_id() }
            }
            Update::Flush { sync_id, ok_expiry, .. } => {
                let current_sync = current_sync_id(&peer.state);
                if current_sync != Some(*sync_id) {
                    event!(trc::EventType::KvpSync(KvpSyncEvent::UpdateIgnored), "sync_id" = *sync_id as i64);
                    return Ack { sync_id: peer.last_acked.0, update_id: peer.last_acked.1 };
                }
                if let PeerState::Syncing { pending, .. } = std::mem::replace(&mut peer.state, PeerState::Unsynced) {
                    self.live.store(Arc::new(pending));
                }
                peer.state = PeerState::Live { sync_id: *sync_id, ok_expiry: *ok_expiry };
                peer.last_acked = (update.sync_id(), update.update_id());
                event!(trc::EventType::KvpSync(KvpSyncEvent::UpdateApplied), "sync_id" = *sync_id as i64);
                Ack { sync_id: update.sync_id(), update_id: update.update_id() }
            }
        }
    }
}

fn current_sync_id(state: &PeerState) -> Option<u64> {
    match state {
        PeerState::Unsynced => None,
        PeerState::Syncing { sync_id, .. } => Some(*sync_id),
        PeerState::Live { sync_id, .. } => Some(*sync_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_roundtrips() {
        let ack = Ack { sync_id: 7, update_id: 3 };
        let mut buf = Vec::new();
        write_ack(&ack, &mut buf);
        assert_eq!(read_ack(&buf), Some(ack));
    }

    #[test]
    fn update_variants_roundtrip() {
        for update in [
            Update::Start { sync_id: 10, update_id: 1, resync_id: 99 },
            Update::Insert { sync_id: 10, update_id: 2, key: "x".into(), val: "abcd".into() },
            Update::Flush { sync_id: 10, update_id: 3, ok_expiry: 12345 },
        ] {
            let mut buf = Vec::new();
            write_update(&update, &mut buf);
            assert_eq!(read_update(&buf), Some(update));
        }
    }

    /// Before FLUSH, inserted keys aren't visible; after, they are.
    #[test]
    fn insert_not_visible_until_flush() {
        let recv = KvpReceiver::new(vec![99]);
        let boot = recv.boot_acks();
        assert_eq!(boot, vec![Ack { sync_id: 99, update_id: 0 }]);

        let start_ack = recv.apply(0, Update::Start { sync_id: 10, update_id: 1, resync_id: 99 });
        assert_eq!(start_ack, Ack { sync_id: 10, update_id: 1 });

        let insert_ack = recv.apply(
            0,
            Update::Insert { sync_id: 10, update_id: 2, key: "x".into(), val: "abcd".into() },
        );
        assert_eq!(insert_ack, Ack { sync_id: 10, update_id: 2 });
        assert_eq!(recv.get("x"), None, "not visible before FLUSH");

        let flush_ack = recv.apply(0, Update::Flush { sync_id: 10, update_id: 3, ok_expiry: 1_000_000 });
        assert_eq!(flush_ack, Ack { sync_id: 10, update_id: 3 });
        assert_eq!(recv.get("x").as_deref(), Some("abcd"));
    }

    /// After ok_expiry elapses with no further FLUSH, the peer is no longer
    /// trusted live.
    #[test]
    fn peer_expires_without_flush() {
        let recv = KvpReceiver::new(vec![1]);
        recv.apply(0, Update::Start { sync_id: 10, update_id: 1, resync_id: 1 });
        recv.apply(0, Update::Insert { sync_id: 10, update_id: 2, key: "x".into(), val: "abcd".into() });
        recv.apply(0, Update::Flush { sync_id: 10, update_id: 3, ok_expiry: 100 });

        assert!(recv.any_peer_live(50));
        assert!(!recv.any_peer_live(150));
    }

    #[test]
    fn mismatched_sync_id_is_ignored_and_reacked_with_current_state() {
        let recv = KvpReceiver::new(vec![1]);
        recv.apply(0, Update::Start { sync_id: 10, update_id: 1, resync_id: 1 });
        let ack = recv.apply(
            0,
            Update::Insert { sync_id: 999, update_id: 5, key: "stale".into(), val: "v".into() },
        );
        assert_eq!(ack, Ack { sync_id: 10, update_id: 1 });
        assert_eq!(recv.get("stale"), None);
    }
}
