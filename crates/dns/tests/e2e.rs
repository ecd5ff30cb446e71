use std::net::Ipv4Addr;
use std::sync::Arc;

use directory::MemoryStore;
use dns::{KvpReceiver, QType, RCode, Update, build_response_for_query};
use dns::{DnsZone, wire};

fn encode_query(id: u16, labels: &[&str], qtype: QType) -> Vec<u8> {
    let mut out = vec![0u8; 12];
    out[0..2].copy_from_slice(&id.to_be_bytes());
    out[5] = 1; // qdcount = 1
    for label in labels {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.as_u16().to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // qclass = IN
    out
}

fn test_zone() -> Arc<DnsZone> {
    Arc::new(DnsZone::new("user.splintermail.com", Ipv4Addr::new(127, 0, 0, 1), None))
}

/// A root-apex A query always resolves to this proxy's own configured
/// address, with no dependency on account state.
#[test]
fn apex_a_query_resolves_to_configured_address() {
    let store = Arc::new(MemoryStore::new());
    let zone = test_zone();
    let kvp = Arc::new(KvpReceiver::new(vec![1]));

    let query = encode_query(11, &["user", "splintermail", "com"], QType::A);
    let mut out = Vec::new();
    assert!(build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out));

    let hdr = wire::parse_header(&out).unwrap();
    assert_eq!(hdr.rcode, RCode::NoError);
    assert_eq!(hdr.ancount, 1);
}

/// No peer is Live yet, so a TXT query that depends on synced data returns
/// SERVFAIL.
#[test]
fn acme_txt_before_sync_is_servfail() {
    let store = Arc::new(MemoryStore::new());
    let zone = test_zone();
    let kvp = Arc::new(KvpReceiver::new(vec![1]));

    let query = encode_query(12, &["_acme-challenge", "x", "user", "splintermail", "com"], QType::Txt);
    let mut out = Vec::new();
    assert!(build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out));

    let hdr = wire::parse_header(&out).unwrap();
    assert_eq!(hdr.rcode, RCode::ServFail);
}

/// After a full START/INSERT/FLUSH sequence the same TXT query is no
/// longer SERVFAIL (the exact rcode then depends on whether the subdomain
/// is bound in the account store).
#[test]
fn acme_txt_after_sync_is_not_servfail() {
    let store = Arc::new(MemoryStore::new());
    let zone = test_zone();
    let kvp = Arc::new(KvpReceiver::new(vec![1]));

    kvp.apply(0, Update::Start { sync_id: 10, update_id: 1, resync_id: 1 });
    kvp.apply(0, Update::Insert { sync_id: 10, update_id: 2, key: "x".into(), val: "abcd".into() });
    kvp.apply(0, Update::Flush { sync_id: 10, update_id: 3, ok_expiry: 100_000_000_000 });

    let query = encode_query(13, &["_acme-challenge", "x", "user", "splintermail", "com"], QType::Txt);
    let mut out = Vec::new();
    assert!(build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out));

    let hdr = wire::parse_header(&out).unwrap();
    assert_ne!(hdr.rcode, RCode::ServFail);
}

/// Table of query-classification outcomes across zone membership, qtype
/// acceptance, and apex-vs-subdomain depth.
#[test]
fn classification_rcodes() {
    let store = Arc::new(MemoryStore::new());
    let zone = test_zone();
    let kvp = Arc::new(KvpReceiver::new(vec![1]));
    kvp.apply(0, Update::Start { sync_id: 1, update_id: 1, resync_id: 1 });
    kvp.apply(0, Update::Flush { sync_id: 1, update_id: 2, ok_expiry: 100_000_000_000 });

    let cases: &[(&[&str], QType, RCode)] = &[
        (&["user", "splintermail", "com"], QType::A, RCode::NoError),
        (&["splintermail", "com"], QType::A, RCode::Refused),
        (&["user", "splintermail", "com"], QType::Other(17), RCode::NotImp),
        (&["x", "x", "user", "splintermail", "com"], QType::A, RCode::Refused),
    ];

    for (labels, qtype, expected) in cases {
        let query = encode_query(1, labels, *qtype);
        let mut out = Vec::new();
        assert!(build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out));
        let hdr = wire::parse_header(&out).unwrap();
        assert_eq!(hdr.rcode, *expected, "labels={labels:?} qtype={qtype:?}");
    }
}

/// Malformed headers (QR=1) are dropped with no reply at all.
#[test]
fn malformed_query_is_dropped() {
    let store = Arc::new(MemoryStore::new());
    let zone = test_zone();
    let kvp = Arc::new(KvpReceiver::new(vec![1]));

    let mut query = encode_query(1, &["user", "splintermail", "com"], QType::A);
    query[2] |= 0x80; // QR=1 marks this as a response, not a query
    let mut out = Vec::new();
    assert!(!build_response_for_query(&query, 0, &zone, store.as_ref(), &kvp, &mut out));
}
