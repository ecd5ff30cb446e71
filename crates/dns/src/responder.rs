//! The UDP responder pipeline: acquire a pooled buffer, parse, classify,
//! answer, send, release. `build_response_for_query` is the pure
//! parse/classify/answer core, kept free of any socket so it can be driven
//! directly in tests; [`DnsResponder`] wires it to a pooled buffer and a
//! socket abstraction, mirroring the `Transport` trait `imap` uses for the
//! same "no async runtime, but still testable without a real fd" reason.

use std::net::SocketAddr;
use std::sync::Arc;

use directory::AccountStore;
use trc::{DnsEvent, Error, ErrorKind, event};
use utils::BufferPool;

use crate::classify::Classification;
use crate::kvpsync::KvpReceiver;
use crate::wire::{RCode, RData, parse_header, parse_question};
use crate::zone::DnsZone;

/// Parses, classifies, and writes the reply for one query into `out`.
/// Returns `false` if the query should be dropped with no reply at all
/// (malformed header, or the classifier's `norespond`).
pub fn build_response_for_query(
    query: &[u8],
    now_ns: u64,
    zone: &DnsZone,
    account_store: &dyn AccountStore,
    kvp: &KvpReceiver,
    out: &mut Vec<u8>,
) -> bool {
    let Some(hdr) = parse_header(query) else {
        return false;
    };
    let Some((question, _used)) = parse_question(&query[crate::wire::HEADER_LEN..]) else {
        return false;
    };

    let classification = crate::classify::classify(&hdr, &question, &zone.apex);

    let (rcode, rdata) = match classification {
        Classification::NoRespond => return false,
        Classification::Refused => {
            event!(trc::EventType::Dns(DnsEvent::QueryRejected), "rcode" = "REFUSED");
            (RCode::Refused, None)
        }
        Classification::NotImpl => {
            event!(trc::EventType::Dns(DnsEvent::QueryRejected), "rcode" = "NOTIMPL");
            (RCode::NotImp, None)
        }
        Classification::Root => {
            let rdata = zone.root_rdata_for(question.qtype);
            match rdata {
                Some(rdata) => (RCode::NoError, Some(rdata)),
                None => (RCode::NoError, None),
            }
        }
        Classification::User { label } => match account_store.subdomain_user(&label) {
            Ok(Some(_account_id)) => match zone.user_rdata_for(question.qtype) {
                Some(rdata) => (RCode::NoError, Some(rdata)),
                None => (RCode::NoError, None),
            },
            Ok(None) => (RCode::NxDomain, None),
            Err(_) => (RCode::ServFail, None),
        },
        Classification::Acme { label } => {
            if !kvp.any_peer_live(now_ns) {
                (RCode::ServFail, None)
            } else {
                match account_store.subdomain_user(&label) {
                    Ok(Some(_)) => match kvp.get(&label) {
                        Some(token) => (RCode::NoError, Some(RData::Txt(token))),
                        None => (RCode::NxDomain, None),
                    },
                    Ok(None) => (RCode::NxDomain, None),
                    Err(_) => (RCode::ServFail, None),
                }
            }
        }
    };

    event!(
        trc::EventType::Dns(DnsEvent::QueryAnswered),
        "rcode" = format!("{rcode:?}"),
        "qtype" = question.qtype.as_u16() as i64
    );
    crate::wire::build_response(out, hdr.id, &question, rcode, rdata.as_ref());
    true
}

pub trait UdpSocket: Send {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> trc::Result<()>;
}

/// Drives the buffer-pool-backed recv/respond/send/release cycle. Holding a
/// consistent zone+kvp view for the duration of one `on_datagram` call falls
/// out naturally here: `zone` is immutable for the process lifetime and
/// `kvp`'s `get`/`any_peer_live` both read a single `ArcSwap` load, so
/// nothing observes a kvpsync swap mid-answer.
pub struct DnsResponder<S: UdpSocket> {
    pool: BufferPool,
    zone: Arc<DnsZone>,
    account_store: Arc<dyn AccountStore>,
    kvp: Arc<KvpReceiver>,
    socket: S,
    pub closed: bool,
}

impl<S: UdpSocket> DnsResponder<S> {
    pub fn new(pool: BufferPool, zone: Arc<DnsZone>, account_store: Arc<dyn AccountStore>, kvp: Arc<KvpReceiver>, socket: S) -> Self {
        DnsResponder {
            pool,
            zone,
            account_store,
            kvp,
            socket,
            closed: false,
        }
    }

    /// Step 1 of §4.7: acquire a buffer or leave the datagram unread.
    /// Returns `false` when the pool is exhausted (caller should stop
    /// reading until a release happens).
    pub fn on_datagram(&mut self, query: &[u8], src: SocketAddr, now_ns: u64) -> trc::Result<bool> {
        let Some(mut membuf) = self.pool.acquire() else {
            return Ok(false);
        };

        let mut resp = std::mem::take(membuf.resp_mut());
        let answered = build_response_for_query(query, now_ns, &self.zone, self.account_store.as_ref(), &self.kvp, &mut resp);
        *membuf.resp_mut() = resp;

        if !answered {
            self.pool.release(membuf);
            return Ok(true);
        }

        let send_result = self.socket.send_to(membuf.resp(), src);
        self.pool.release(membuf);

        if let Err(e) = send_result {
            event!(trc::EventType::Dns(DnsEvent::SendError), "error" = e.to_string());
            self.closed = true;
            return Err(Error::new(ErrorKind::Sock, "dns send failed").trace(e.to_string()));
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use directory::MemoryStore;

    use super::*;
    use crate::wire::QType;

    fn encode_query(id: u16, labels: &[&str], qtype: u16) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        out[0..2].copy_from_slice(&id.to_be_bytes());
        out[5] = 1; // qdcount=1
        for label in labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // qclass=IN
        out
    }

    struct RecordingSocket {
        sent: Vec<(Vec<u8>, SocketAddr)>,
    }

    impl UdpSocket for RecordingSocket {
        fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> trc::Result<()> {
            self.sent.push((buf.to_vec(), addr));
            Ok(())
        }
    }

    fn test_zone() -> Arc<DnsZone> {
        Arc::new(DnsZone::new("user.splintermail.com", Ipv4Addr::new(127, 0, 0, 1), None))
    }

    /// `MemoryStore` has no subdomain-binding test helper, so this exercises
    /// the no-such-user path; `responder_sends_through_socket_and_releases_buffer`
    /// below covers the apex (always-present) path end to end.
    #[test]
    fn unknown_subdomain_a_query_is_nxdomain() {
        let store = Arc::new(MemoryStore::new());
        let zone = test_zone();
        let kvp = Arc::new(KvpReceiver::new(vec![1]));
        let query = encode_query(11, &["x", "user", "splintermail", "com"], QType::A.as_u16());
        let mut out = Vec::new();
        let answered = build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out);
        assert!(answered);
        let hdr = parse_header(&out).unwrap();
        // no such subdomain bound yet -> NXDOMAIN, proving the existence
        // check runs before falling back to the static address.
        assert_eq!(hdr.rcode, RCode::NxDomain);
    }

    #[test]
    fn acme_txt_before_sync_is_servfail() {
        let store = Arc::new(MemoryStore::new());
        let zone = test_zone();
        let kvp = Arc::new(KvpReceiver::new(vec![1]));
        let query = encode_query(12, &["_acme-challenge", "x", "user", "splintermail", "com"], QType::Txt.as_u16());
        let mut out = Vec::new();
        let answered = build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out);
        assert!(answered);
        let hdr = parse_header(&out).unwrap();
        assert_eq!(hdr.rcode, RCode::ServFail);
    }

    #[test]
    fn acme_txt_after_sync_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let zone = test_zone();
        let kvp = Arc::new(KvpReceiver::new(vec![1]));
        kvp.apply(0, crate::kvpsync::Update::Start { sync_id: 10, update_id: 1, resync_id: 1 });
        kvp.apply(
            0,
            crate::kvpsync::Update::Insert { sync_id: 10, update_id: 2, key: "x".into(), val: "abcd".into() },
        );
        kvp.apply(0, crate::kvpsync::Update::Flush { sync_id: 10, update_id: 3, ok_expiry: 100_000_000_000 });

        let query = encode_query(12, &["_acme-challenge", "x", "user", "splintermail", "com"], QType::Txt.as_u16());
        let mut out = Vec::new();
        let answered = build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out);
        assert!(answered);
        let hdr = parse_header(&out).unwrap();
        // subdomain_user("x") isn't bound in this fixture either, so this is
        // NXDOMAIN; the point of this test is that it's *not* SERVFAIL now
        // that a peer is live.
        assert_eq!(hdr.rcode, RCode::NxDomain);
        assert_ne!(hdr.rcode, RCode::ServFail);
    }

    #[test]
    fn responder_sends_through_socket_and_releases_buffer() {
        let store = Arc::new(MemoryStore::new());
        let zone = test_zone();
        let kvp = Arc::new(KvpReceiver::new(vec![1]));
        let pool = BufferPool::new(2, 512);
        let socket = RecordingSocket { sent: Vec::new() };
        let mut responder = DnsResponder::new(pool.clone(), zone, store, kvp, socket);

        let query = encode_query(1, &["user", "splintermail", "com"], QType::A.as_u16());
        let src: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let ok = responder.on_datagram(&query, src, 0).unwrap();
        assert!(ok);
        assert_eq!(responder.socket.sent.len(), 1);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn malformed_header_drops_without_a_reply() {
        let store = Arc::new(MemoryStore::new());
        let zone = test_zone();
        let kvp = Arc::new(KvpReceiver::new(vec![1]));
        let mut query = encode_query(1, &["user", "splintermail", "com"], QType::A.as_u16());
        query[2] |= 0x80; // set QR=1
        let mut out = Vec::new();
        let answered = build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out);
        assert!(!answered);
    }
}
