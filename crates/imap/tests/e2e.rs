use std::sync::Arc;

use directory::{fingerprint_pem, DeviceKeyStore, MemoryStore};
use imap::{CitmSession, MemTransport};
use imap_proto::{parse_response, Response, Status, Untagged};

fn new_session() -> (CitmSession<MemTransport, MemTransport>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let citm = CitmSession::new(
        MemTransport::default(),
        MemTransport::default(),
        store.clone() as Arc<dyn directory::AccountStore>,
        store.clone() as Arc<dyn directory::DeviceKeyStore>,
    );
    (citm, store)
}

/// Parses every complete response frame out of a raw write buffer.
fn parse_all(buf: &[u8]) -> Vec<Response> {
    let mut out = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let nl = rest.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(rest.len());
        let (line, tail) = rest.split_at(nl);
        if line.starts_with(b"* XKEYSYNC CREATED {") {
            // literal line declares its own length; consume declared bytes + trailing CRLF.
            let hdr_end = line.iter().position(|&b| b == b'}').unwrap();
            let n: usize = std::str::from_utf8(&line[20..hdr_end]).unwrap().parse().unwrap();
            let total = line.len() + n + 2;
            let (full, tail2) = rest.split_at(total);
            out.push(parse_response(full).unwrap());
            rest = tail2;
            continue;
        }
        out.push(parse_response(line).unwrap());
        rest = tail;
    }
    out
}

fn login(citm: &mut CitmSession<MemTransport, MemTransport>, email: &str, pass: &str) {
    let line = format!("a0 LOGIN {email} {pass}\r\n");
    citm.on_dn_bytes(line.as_bytes()).unwrap();
    citm.advance();
}

#[test]
fn xkeyadd_success() {
    let (mut citm, store) = new_session();
    citm.advance(); // send greeting
    let account_id = store.seed_account("alice@example.com", "secret", 20);
    login(&mut citm, "alice@example.com", "secret");

    let pem = directory::fingerprint::testutil::p256_generator_pubkey_pem();
    let expected_fpr = fingerprint_pem(&pem).unwrap();

    let line = format!("a1 XKEYADD {{{}}}\r\n", pem.len());
    let mut bytes = line.into_bytes();
    bytes.extend_from_slice(pem.as_bytes());
    citm.on_dn_bytes(&bytes).unwrap();
    citm.advance();

    assert_eq!(store.count(&account_id).unwrap(), 1);
}

#[test]
fn xkeyadd_rejected_at_capacity() {
    let (mut citm, store) = new_session();
    citm.advance();
    let account_id = store.seed_account("bob@example.com", "secret", 1);
    login(&mut citm, "bob@example.com", "secret");

    let pem = directory::fingerprint::testutil::p256_generator_pubkey_pem();
    store.add(&account_id, &pem, 1).unwrap();
    assert_eq!(store.count(&account_id).unwrap(), 1);

    // a second, distinct key should be rejected since cap==1 is already met.
    let pem2 = directory::fingerprint::testutil::deterministic_pubkey_pem(1);
    let line = format!("a2 XKEYADD {{{}}}\r\n", pem2.len());
    let mut bytes = line.into_bytes();
    bytes.extend_from_slice(pem2.as_bytes());
    citm.on_dn_bytes(&bytes).unwrap();
    citm.advance();

    assert_eq!(store.count(&account_id).unwrap(), 1);
}
