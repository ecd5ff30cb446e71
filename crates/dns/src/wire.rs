//! Minimal RFC 1035 message codec: just enough header/question/answer
//! handling to serve the fixed record shapes this zone needs (§4.7). No
//! compression pointers on the way in (queries are a single question and
//! never carry them); answers use the standard 0xC00C back-pointer to the
//! question name, since every answer here echoes the question's owner.

use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: RCode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
}

impl RCode {
    pub fn as_u8(self) -> u8 {
        match self {
            RCode::NoError => 0,
            RCode::FormErr => 1,
            RCode::ServFail => 2,
            RCode::NxDomain => 3,
            RCode::NotImp => 4,
            RCode::Refused => 5,
        }
    }
}

/// The record types this zone ever answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType {
    A,
    Ns,
    Soa,
    Txt,
    Aaaa,
    Other(u16),
}

impl QType {
    pub fn from_u16(n: u16) -> Self {
        match n {
            1 => QType::A,
            2 => QType::Ns,
            6 => QType::Soa,
            16 => QType::Txt,
            28 => QType::Aaaa,
            other => QType::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            QType::A => 1,
            QType::Ns => 2,
            QType::Soa => 6,
            QType::Txt => 16,
            QType::Aaaa => 28,
            QType::Other(n) => n,
        }
    }

    /// The qtypes this zone is willing to answer at all.
    pub fn is_accepted(self) -> bool {
        matches!(self, QType::A | QType::Ns | QType::Soa | QType::Txt | QType::Aaaa)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Labels in wire order (leftmost/most-specific label first).
    pub labels: Vec<String>,
    pub qtype: QType,
    pub qclass: u16,
}

const IN_CLASS: u16 = 1;

pub const HEADER_LEN: usize = 12;

/// Parses a 12-byte header; `None` if `buf` is short, matching `parse_hdr`'s
/// `BAD_PARSE` on truncated input.
pub fn parse_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags1 = buf[2];
    let flags2 = buf[3];
    let rcode = match flags2 & 0x0f {
        0 => RCode::NoError,
        1 => RCode::FormErr,
        2 => RCode::ServFail,
        3 => RCode::NxDomain,
        4 => RCode::NotImp,
        _ => RCode::Refused,
    };
    Some(Header {
        id,
        qr: flags1 & 0x80 != 0,
        opcode: (flags1 & 0x78) >> 3,
        aa: flags1 & 0x04 != 0,
        tc: flags1 & 0x02 != 0,
        rd: flags1 & 0x01 != 0,
        ra: flags2 & 0x80 != 0,
        rcode,
        qdcount: u16::from_be_bytes([buf[4], buf[5]]),
        ancount: u16::from_be_bytes([buf[6], buf[7]]),
        nscount: u16::from_be_bytes([buf[8], buf[9]]),
        arcount: u16::from_be_bytes([buf[10], buf[11]]),
    })
}

/// Parses one question starting at `qdcount`'s first byte, per `parse_qstn`;
/// only `qdcount == 1` is ever accepted by the classifier, but parsing itself
/// doesn't assume that (so a malformed-qdcount packet still parses cleanly
/// and can be rejected by the classifier rather than by a parse failure).
pub fn parse_question(buf: &[u8]) -> Option<(Question, usize)> {
    let mut used = 0;
    let mut labels = Vec::new();
    loop {
        if used >= buf.len() {
            return None;
        }
        let l = buf[used] as usize;
        used += 1;
        if l == 0 {
            break;
        }
        if used + l > buf.len() {
            return None;
        }
        let label = std::str::from_utf8(&buf[used..used + l]).ok()?.to_string();
        labels.push(label);
        used += l;
    }
    if used + 4 > buf.len() {
        return None;
    }
    let qtype = QType::from_u16(u16::from_be_bytes([buf[used], buf[used + 1]]));
    let qclass = u16::from_be_bytes([buf[used + 2], buf[used + 3]]);
    used += 4;
    Some((Question { labels, qtype, qclass }, used))
}

pub fn is_internet_class(qclass: u16) -> bool {
    qclass == IN_CLASS
}

fn encode_name(labels: &[String], out: &mut Vec<u8>) {
    for label in labels {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// RDATA for the answer types this zone ever emits.
#[derive(Debug, Clone)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Txt(String),
    Ns(String),
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
}

impl RData {
    fn qtype(&self) -> QType {
        match self {
            RData::A(_) => QType::A,
            RData::Aaaa(_) => QType::Aaaa,
            RData::Txt(_) => QType::Txt,
            RData::Ns(_) => QType::Ns,
            RData::Soa { .. } => QType::Soa,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => out.extend_from_slice(&addr.octets()),
            RData::Txt(s) => {
                // one TXT segment per RFC 1035 §3.3.14; callers keep segments <=255 bytes.
                out.push(s.len() as u8);
                out.extend_from_slice(s.as_bytes());
            }
            RData::Ns(name) => {
                let labels: Vec<String> = name.split('.').filter(|l| !l.is_empty()).map(String::from).collect();
                encode_name(&labels, out);
            }
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                let mname_labels: Vec<String> = mname.split('.').filter(|l| !l.is_empty()).map(String::from).collect();
                let rname_labels: Vec<String> = rname.split('.').filter(|l| !l.is_empty()).map(String::from).collect();
                encode_name(&mname_labels, out);
                encode_name(&rname_labels, out);
                out.extend_from_slice(&serial.to_be_bytes());
                out.extend_from_slice(&refresh.to_be_bytes());
                out.extend_from_slice(&retry.to_be_bytes());
                out.extend_from_slice(&expire.to_be_bytes());
                out.extend_from_slice(&minimum.to_be_bytes());
            }
        }
    }
}

/// Builds a response datagram into `out`: header (echoing `id`, `qr=1`,
/// `aa=1`, `rcode`), the original question verbatim, and (if `rdata` is
/// `Some`) one answer RR pointing back at the question's owner name.
pub fn build_response(out: &mut Vec<u8>, id: u16, q: &Question, rcode: RCode, rdata: Option<&RData>) {
    out.clear();
    let ancount: u16 = if rdata.is_some() { 1 } else { 0 };
    out.extend_from_slice(&id.to_be_bytes());
    let flags1 = 0x80u8 | 0x04; // qr=1, aa=1
    let flags2 = rcode.as_u8();
    out.push(flags1);
    out.push(flags2);
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount

    encode_name(&q.labels, out);
    out.extend_from_slice(&q.qtype.as_u16().to_be_bytes());
    out.extend_from_slice(&IN_CLASS.to_be_bytes());

    if let Some(rdata) = rdata {
        out.extend_from_slice(&[0xc0, 0x0c]); // name pointer -> offset 12 (the question's owner)
        out.extend_from_slice(&rdata.qtype().as_u16().to_be_bytes());
        out.extend_from_slice(&IN_CLASS.to_be_bytes());
        out.extend_from_slice(&60u32.to_be_bytes()); // ttl
        let rdlen_pos = out.len();
        out.extend_from_slice(&0u16.to_be_bytes());
        let rdata_start = out.len();
        rdata.encode(out);
        let rdlen = (out.len() - rdata_start) as u16;
        out[rdlen_pos..rdlen_pos + 2].copy_from_slice(&rdlen.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_fields() {
        let mut buf = vec![0u8; 12];
        buf[0] = 0x12;
        buf[1] = 0x34;
        buf[2] = 0x01; // qr=0,opcode=0,aa=0,tc=0,rd=1
        buf[3] = 0x00;
        buf[5] = 1; // qdcount=1
        let hdr = parse_header(&buf).unwrap();
        assert_eq!(hdr.id, 0x1234);
        assert!(!hdr.qr);
        assert_eq!(hdr.opcode, 0);
        assert!(hdr.rd);
        assert_eq!(hdr.qdcount, 1);
    }

    #[test]
    fn question_parses_labels_and_trailer() {
        let mut buf = Vec::new();
        buf.push(1);
        buf.push(b'x');
        buf.push(4);
        buf.extend_from_slice(b"user");
        buf.push(0);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        let (q, used) = parse_question(&buf).unwrap();
        assert_eq!(q.labels, vec!["x", "user"]);
        assert_eq!(q.qtype, QType::A);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn build_response_roundtrips_through_parse() {
        let q = Question {
            labels: vec!["x".into(), "user".into(), "splintermail".into(), "com".into()],
            qtype: QType::A,
            qclass: IN_CLASS,
        };
        let mut out = Vec::new();
        build_response(&mut out, 11, &q, RCode::NoError, Some(&RData::A(Ipv4Addr::new(127, 0, 0, 1))));
        let hdr = parse_header(&out).unwrap();
        assert_eq!(hdr.id, 11);
        assert!(hdr.qr);
        assert_eq!(hdr.ancount, 1);
        assert_eq!(hdr.rcode, RCode::NoError);
    }
}
