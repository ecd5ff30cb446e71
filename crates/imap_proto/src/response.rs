use compact_str::{CompactString, ToCompactString};

use crate::command::Tag;
use crate::error::CodecError;
use crate::token::{self, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    Bye,
    PreAuth,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
            Status::Bye => "BYE",
            Status::PreAuth => "PREAUTH",
        }
    }

    fn parse(s: &str) -> Option<Status> {
        Some(match s.to_ascii_uppercase().as_str() {
            "OK" => Status::Ok,
            "NO" => Status::No,
            "BAD" => Status::Bad,
            "BYE" => Status::Bye,
            "PREAUTH" => Status::PreAuth,
            _ => return None,
        })
    }
}

/// A parsed IMAP response. `Untagged::Generic` carries raw relayed text
/// verbatim (the UP session does not need to understand a real mail store's
/// untagged grammar beyond tag routing); the `XkeySync*`/`StillSyncing`
/// variants are the specific extension responses this server itself emits
/// and round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Tagged {
        tag: Tag,
        status: Status,
        code: Option<CompactString>,
        text: String,
    },
    Untagged(Untagged),
    /// `+ OK` and the literal-continuation `+ ` prompt.
    Continuation { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Untagged {
    Generic(String),
    XkeySyncDeleted { fpr: CompactString },
    XkeySyncCreated { pem: Vec<u8> },
    XkeySyncOk,
    StillSyncing,
}

pub fn parse_response(buf: &[u8]) -> Result<Response, CodecError> {
    let line = strip_crlf(buf)?;

    if let Some(rest) = line.strip_prefix(b"+") {
        let text = decode_text(trim_leading_space(rest))?;
        return Ok(Response::Continuation { text });
    }

    if let Some(rest) = line.strip_prefix(b"* ") {
        return Ok(Response::Untagged(parse_untagged(rest)?));
    }

    // tagged: tag SP status [SP "[" code "]"] SP text
    let sp = line.iter().position(|&b| b == b' ').ok_or(CodecError::BadSyntax)?;
    let tag: Tag = std::str::from_utf8(&line[..sp])
        .map_err(|_| CodecError::BadSyntax)?
        .to_compact_string();
    let rest = &line[sp + 1..];
    let sp2 = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
    let status_str = std::str::from_utf8(&rest[..sp2]).map_err(|_| CodecError::BadSyntax)?;
    let status = Status::parse(status_str).ok_or(CodecError::BadSyntax)?;
    let mut remainder = if sp2 < rest.len() { &rest[sp2 + 1..] } else { &rest[rest.len()..] };

    let mut code = None;
    if remainder.first() == Some(&b'[') {
        let close = remainder.iter().position(|&b| b == b']').ok_or(CodecError::BadSyntax)?;
        code = Some(
            std::str::from_utf8(&remainder[1..close])
                .map_err(|_| CodecError::BadSyntax)?
                .to_compact_string(),
        );
        remainder = trim_leading_space(&remainder[close + 1..]);
    }
    let text = decode_text(remainder)?;

    Ok(Response::Tagged {
        tag,
        status,
        code,
        text,
    })
}

fn parse_untagged(rest: &[u8]) -> Result<Untagged, CodecError> {
    if rest.eq_ignore_ascii_case(b"XKEYSYNC OK") {
        return Ok(Untagged::XkeySyncOk);
    }
    if rest.eq_ignore_ascii_case(b"OK still syncing") {
        return Ok(Untagged::StillSyncing);
    }
    if let Some(fpr) = rest.strip_prefix(b"XKEYSYNC DELETED ") {
        let s = std::str::from_utf8(fpr).map_err(|_| CodecError::BadSyntax)?;
        return Ok(Untagged::XkeySyncDeleted {
            fpr: s.to_compact_string(),
        });
    }
    if let Some(lit) = rest.strip_prefix(b"XKEYSYNC CREATED ") {
        let toks = token::tokenize(lit)?;
        let [Token::Literal(pem)] = <[Token; 1]>::try_from(toks).map_err(|_| CodecError::BadSyntax)?
        else {
            return Err(CodecError::BadSyntax);
        };
        return Ok(Untagged::XkeySyncCreated { pem });
    }
    Ok(Untagged::Generic(decode_text(rest)?))
}

fn decode_text(b: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(b)
        .map(str::to_string)
        .map_err(|_| CodecError::BadSyntax)
}

fn trim_leading_space(b: &[u8]) -> &[u8] {
    if b.first() == Some(&b' ') { &b[1..] } else { b }
}

fn strip_crlf(buf: &[u8]) -> Result<&[u8], CodecError> {
    if buf.len() < 2 || &buf[buf.len() - 2..] != b"\r\n" {
        return Err(CodecError::BadSyntax);
    }
    Ok(&buf[..buf.len() - 2])
}

/// Serializes a [`Response`] to wire bytes, CRLF-terminated.
pub fn serialize_response(resp: &Response, out: &mut Vec<u8>) {
    match resp {
        Response::Tagged {
            tag,
            status,
            code,
            text,
        } => {
            out.extend_from_slice(tag.as_bytes());
            out.push(b' ');
            out.extend_from_slice(status.as_str().as_bytes());
            if let Some(code) = code {
                out.push(b' ');
                out.push(b'[');
                out.extend_from_slice(code.as_bytes());
                out.push(b']');
            }
            if !text.is_empty() {
                out.push(b' ');
                out.extend_from_slice(text.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        Response::Untagged(u) => {
            out.extend_from_slice(b"* ");
            match u {
                Untagged::Generic(text) => out.extend_from_slice(text.as_bytes()),
                Untagged::XkeySyncDeleted { fpr } => {
                    out.extend_from_slice(b"XKEYSYNC DELETED ");
                    out.extend_from_slice(fpr.as_bytes());
                }
                Untagged::XkeySyncCreated { pem } => {
                    out.extend_from_slice(b"XKEYSYNC CREATED {");
                    out.extend_from_slice(pem.len().to_string().as_bytes());
                    out.extend_from_slice(b"}\r\n");
                    out.extend_from_slice(pem);
                }
                Untagged::XkeySyncOk => out.extend_from_slice(b"XKEYSYNC OK"),
                Untagged::StillSyncing => out.extend_from_slice(b"OK still syncing"),
            }
            out.extend_from_slice(b"\r\n");
        }
        Response::Continuation { text } => {
            out.push(b'+');
            if !text.is_empty() {
                out.push(b' ');
                out.extend_from_slice(text.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
    }
}

pub fn serialize_to_vec(resp: &Response) -> Vec<u8> {
    let mut out = Vec::new();
    serialize_response(resp, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_tagged_ok() {
        let r = Response::Tagged {
            tag: "A1".into(),
            status: Status::Ok,
            code: Some("XKEYADD abc".into()),
            text: "key added".to_string(),
        };
        let bytes = serialize_to_vec(&r);
        assert_eq!(parse_response(&bytes).unwrap(), r);
    }

    #[test]
    fn round_trips_untagged_generic() {
        let r = Response::Untagged(Untagged::Generic("15 EXISTS".to_string()));
        let bytes = serialize_to_vec(&r);
        assert_eq!(parse_response(&bytes).unwrap(), r);
    }

    #[test]
    fn round_trips_xkeysync_created_literal() {
        let r = Response::Untagged(Untagged::XkeySyncCreated {
            pem: b"-----BEGIN PUBLIC KEY-----".to_vec(),
        });
        let bytes = serialize_to_vec(&r);
        assert_eq!(parse_response(&bytes).unwrap(), r);
    }

    #[test]
    fn round_trips_continuation() {
        let r = Response::Continuation {
            text: "OK".to_string(),
        };
        let bytes = serialize_to_vec(&r);
        assert_eq!(bytes, b"+ OK\r\n");
        assert_eq!(parse_response(&bytes).unwrap(), r);
    }
}
