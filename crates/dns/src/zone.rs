//! Static zone configuration: the apex, its root-level records, and the
//! single address this CITM instance answers with for every live user (every
//! user's mail connects through the same proxy, so `<label>.apex` always
//! resolves to this server's own configured address once the user is known
//! to exist).

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::wire::RData;

#[derive(Debug, Clone)]
pub struct DnsZone {
    /// TLD-first labels, e.g. `["com", "splintermail", "user"]`.
    pub apex: Vec<String>,
    pub root_records: Vec<RData>,
    pub server_v4: Ipv4Addr,
    pub server_v6: Option<Ipv6Addr>,
}

impl DnsZone {
    pub fn new(apex_dotted: &str, server_v4: Ipv4Addr, server_v6: Option<Ipv6Addr>) -> Self {
        let mut apex: Vec<String> = apex_dotted.split('.').filter(|l| !l.is_empty()).map(String::from).collect();
        apex.reverse();
        DnsZone {
            apex,
            root_records: Vec::new(),
            server_v4,
            server_v6,
        }
    }

    pub fn with_root_records(mut self, records: Vec<RData>) -> Self {
        self.root_records = records;
        self
    }

    /// Root records matching the queried type, falling back to the
    /// configured user address for A/AAAA if no explicit root record exists.
    pub fn root_rdata_for(&self, qtype: crate::wire::QType) -> Option<RData> {
        for r in &self.root_records {
            if matches_qtype(r, qtype) {
                return Some(r.clone());
            }
        }
        match qtype {
            crate::wire::QType::A => Some(RData::A(self.server_v4)),
            crate::wire::QType::Aaaa => self.server_v6.map(RData::Aaaa),
            _ => None,
        }
    }

    pub fn user_rdata_for(&self, qtype: crate::wire::QType) -> Option<RData> {
        match qtype {
            crate::wire::QType::A => Some(RData::A(self.server_v4)),
            crate::wire::QType::Aaaa => self.server_v6.map(RData::Aaaa),
            _ => None,
        }
    }
}

fn matches_qtype(r: &RData, qtype: crate::wire::QType) -> bool {
    matches!(
        (r, qtype),
        (RData::A(_), crate::wire::QType::A)
            | (RData::Aaaa(_), crate::wire::QType::Aaaa)
            | (RData::Ns(_), crate::wire::QType::Ns)
            | (RData::Soa { .. }, crate::wire::QType::Soa)
            | (RData::Txt(_), crate::wire::QType::Txt)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::QType;

    #[test]
    fn apex_is_reversed_tld_first() {
        let zone = DnsZone::new("user.splintermail.com", Ipv4Addr::new(127, 0, 0, 1), None);
        assert_eq!(zone.apex, vec!["com", "splintermail", "user"]);
    }

    #[test]
    fn falls_back_to_server_address_for_a_without_explicit_root_record() {
        let zone = DnsZone::new("user.splintermail.com", Ipv4Addr::new(127, 0, 0, 1), None);
        match zone.root_rdata_for(QType::A) {
            Some(RData::A(addr)) => assert_eq!(addr, Ipv4Addr::new(127, 0, 0, 1)),
            other => panic!("expected A record, got {other:?}"),
        }
    }
}
