//! Query classification, grounded on the original's `sort_pkt`/`test_sort_pkt`
//! (`server/dns/test_dns.c`): a fixed decision table over header validity,
//! zone membership, accepted qtypes, and label depth under the zone apex.

use crate::wire::{Header, Question, is_internet_class};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Malformed header; drop without responding.
    NoRespond,
    Refused,
    NotImpl,
    Root,
    User { label: String },
    Acme { label: String },
}

/// `apex` is given TLD-first (e.g. `["com", "splintermail", "user"]`) to
/// match directly against a reversed QNAME without re-reversing per query.
pub fn classify(hdr: &Header, q: &Question, apex: &[String]) -> Classification {
    if hdr.qr || hdr.opcode != 0 || hdr.qdcount != 1 || !is_internet_class(q.qclass) {
        return Classification::NoRespond;
    }

    let mut reversed: Vec<&str> = q.labels.iter().rev().map(String::as_str).collect();
    // case-insensitive compare against apex, per standard DNS name matching.
    let apex_refs: Vec<&str> = apex.iter().map(String::as_str).collect();
    if reversed.len() < apex_refs.len()
        || !reversed[..apex_refs.len()]
            .iter()
            .zip(apex_refs.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    {
        return Classification::Refused;
    }
    let extra: Vec<&str> = reversed.split_off(apex_refs.len());

    if !q.qtype.is_accepted() {
        return Classification::NotImpl;
    }

    match extra.len() {
        0 => Classification::Root,
        1 => Classification::User { label: extra[0].to_string() },
        2 if extra[1].eq_ignore_ascii_case("_acme-challenge") => Classification::Acme { label: extra[0].to_string() },
        // more than one extra label, or two that don't match the
        // `_acme-challenge.<label>` shape: not a name this zone carves out
        // any special handling for.
        _ => Classification::Refused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::QType;

    fn apex() -> Vec<String> {
        vec!["com".into(), "splintermail".into(), "user".into()]
    }

    fn hdr() -> Header {
        Header {
            id: 0,
            qr: false,
            opcode: 0,
            aa: false,
            tc: false,
            rd: false,
            ra: false,
            rcode: crate::wire::RCode::NoError,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    fn labels(s: &str) -> Vec<String> {
        s.split('.').map(String::from).collect()
    }

    fn q(name: &str, qtype: QType) -> Question {
        Question { labels: labels(name), qtype, qclass: 1 }
    }

    #[test]
    fn malformed_header_norespond() {
        let mut h = hdr();
        h.qr = true;
        assert_eq!(
            classify(&h, &q("user.splintermail.com", QType::A), &apex()),
            Classification::NoRespond
        );
    }

    #[test]
    fn refuses_bad_name_before_checking_qtype() {
        assert_eq!(
            classify(&hdr(), &q("x.splintermail.com", QType::Other(255)), &apex()),
            Classification::Refused
        );
    }

    #[test]
    fn rejects_unaccepted_qtype_at_apex() {
        assert_eq!(
            classify(&hdr(), &q("user.splintermail.com", QType::Other(17)), &apex()),
            Classification::NotImpl
        );
    }

    #[test]
    fn classifies_root_user_and_acme() {
        assert_eq!(classify(&hdr(), &q("user.splintermail.com", QType::A), &apex()), Classification::Root);
        assert_eq!(
            classify(&hdr(), &q("x.user.splintermail.com", QType::A), &apex()),
            Classification::User { label: "x".into() }
        );
        assert_eq!(
            classify(&hdr(), &q("_acme-challenge.x.user.splintermail.com", QType::Txt), &apex()),
            Classification::Acme { label: "x".into() }
        );
    }

    #[test]
    fn deeper_non_acme_names_are_refused() {
        assert_eq!(
            classify(&hdr(), &q("x.x.user.splintermail.com", QType::A), &apex()),
            Classification::Refused
        );
        assert_eq!(
            classify(&hdr(), &q("x._acme-challenge.x.user.splintermail.com", QType::A), &apex()),
            Classification::Refused
        );
    }

    #[test]
    fn refuses_names_outside_zone() {
        assert_eq!(classify(&hdr(), &q("splintermail.com", QType::A), &apex()), Classification::Refused);
        assert_eq!(
            classify(&hdr(), &q("_acme-challenge.x.user.splintermail.x", QType::A), &apex()),
            Classification::Refused
        );
    }
}
