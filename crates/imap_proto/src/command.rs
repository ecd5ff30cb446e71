use compact_str::{CompactString, ToCompactString};

use crate::error::CodecError;
use crate::token::{self, Token};

pub type Tag = CompactString;

/// A parsed IMAP command. Only the verbs the CITM core and the device-key
/// subsystem need to understand structurally are broken out; everything
/// else forwards upstream byte-for-byte as [`Command::Other`] — per spec
/// §1's Non-goal ("not a general-purpose IMAP server").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Capability,
    Noop,
    Logout,
    Login { user: Vec<u8>, pass: Vec<u8> },
    Select { mailbox: Vec<u8> },
    Enable { capabilities: Vec<CompactString> },
    XkeySync { fprs: Vec<CompactString> },
    XkeyAdd { pem: Vec<u8> },
    /// Anything else, forwarded upstream exactly as received.
    Other {
        verb: CompactString,
        raw_args: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub tag: Tag,
    pub command: Command,
}

/// The 40-character lowercase hex fingerprint format.
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Parses one complete, CRLF-terminated command (as isolated by
/// [`crate::scan::scan`]) into a [`Request`].
pub fn parse_command(buf: &[u8]) -> Result<Request, CodecError> {
    let line = strip_crlf(buf)?;

    let sp = line.iter().position(|&b| b == b' ').ok_or(CodecError::BadSyntax)?;
    let tag_bytes = &line[..sp];
    if tag_bytes.is_empty() {
        return Err(CodecError::BadSyntax);
    }
    let tag: Tag = std::str::from_utf8(tag_bytes)
        .map_err(|_| CodecError::BadSyntax)?
        .to_compact_string();

    let rest = &line[sp + 1..];
    let (verb_bytes, args) = match rest.iter().position(|&b| b == b' ') {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, &rest[rest.len()..]),
    };
    if verb_bytes.is_empty() {
        return Err(CodecError::BadSyntax);
    }
    let verb = std::str::from_utf8(verb_bytes).map_err(|_| CodecError::BadSyntax)?;
    let verb_upper = verb.to_ascii_uppercase();

    let command = match verb_upper.as_str() {
        "CAPABILITY" => {
            require_no_args(args)?;
            Command::Capability
        }
        "NOOP" => {
            require_no_args(args)?;
            Command::Noop
        }
        "LOGOUT" => {
            require_no_args(args)?;
            Command::Logout
        }
        "LOGIN" => {
            let toks = token::tokenize(args)?;
            let [user, pass] = <[Token; 2]>::try_from(toks).map_err(|_| CodecError::BadSyntax)?;
            Command::Login {
                user: user.as_bytes(),
                pass: pass.as_bytes(),
            }
        }
        "SELECT" => {
            let toks = token::tokenize(args)?;
            let [mailbox] = <[Token; 1]>::try_from(toks).map_err(|_| CodecError::BadSyntax)?;
            Command::Select {
                mailbox: mailbox.as_bytes(),
            }
        }
        "ENABLE" => {
            let toks = token::tokenize(args)?;
            if toks.is_empty() {
                return Err(CodecError::BadSyntax);
            }
            let capabilities = toks
                .iter()
                .map(|t| t.as_str().map(CompactString::from).ok_or(CodecError::BadSyntax))
                .collect::<Result<Vec<_>, _>>()?;
            Command::Enable { capabilities }
        }
        "XKEYSYNC" => {
            let toks = token::tokenize(args)?;
            let fprs = toks
                .iter()
                .map(|t| {
                    let s = t.as_str().ok_or(CodecError::BadSyntax)?;
                    if !is_fingerprint(s) {
                        return Err(CodecError::BadSyntax);
                    }
                    Ok(CompactString::from(s))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Command::XkeySync { fprs }
        }
        "XKEYADD" => {
            let toks = token::tokenize(args)?;
            let [pem] = <[Token; 1]>::try_from(toks).map_err(|_| CodecError::BadSyntax)?;
            Command::XkeyAdd { pem: pem.as_bytes() }
        }
        _ => Command::Other {
            verb: CompactString::from(verb),
            raw_args: args.to_vec(),
        },
    };

    Ok(Request { tag, command })
}

/// Serializes a [`Request`] back to wire bytes. Byte-valued arguments
/// (`LOGIN`, `SELECT`, `XKEYADD`) always go out as non-synchronizing
/// literals (`{n+}`) rather than quoted strings, so re-serialization never
/// has to worry about quoting/escaping edge cases in arbitrary bytes.
pub fn serialize_request(req: &Request) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(req.tag.as_bytes());
    out.push(b' ');
    match &req.command {
        Command::Capability => out.extend_from_slice(b"CAPABILITY"),
        Command::Noop => out.extend_from_slice(b"NOOP"),
        Command::Logout => out.extend_from_slice(b"LOGOUT"),
        Command::Login { user, pass } => {
            out.extend_from_slice(b"LOGIN ");
            push_literal(&mut out, user);
            out.push(b' ');
            push_literal(&mut out, pass);
        }
        Command::Select { mailbox } => {
            out.extend_from_slice(b"SELECT ");
            push_literal(&mut out, mailbox);
        }
        Command::Enable { capabilities } => {
            out.extend_from_slice(b"ENABLE");
            for cap in capabilities {
                out.push(b' ');
                out.extend_from_slice(cap.as_bytes());
            }
        }
        Command::XkeySync { fprs } => {
            out.extend_from_slice(b"XKEYSYNC");
            for fpr in fprs {
                out.push(b' ');
                out.extend_from_slice(fpr.as_bytes());
            }
        }
        Command::XkeyAdd { pem } => {
            out.extend_from_slice(b"XKEYADD ");
            push_literal(&mut out, pem);
        }
        Command::Other { verb, raw_args } => {
            out.extend_from_slice(verb.as_bytes());
            if !raw_args.is_empty() {
                out.push(b' ');
                out.extend_from_slice(raw_args);
            }
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn push_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'{');
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.extend_from_slice(b"+}\r\n");
    out.extend_from_slice(bytes);
}

fn require_no_args(args: &[u8]) -> Result<(), CodecError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(CodecError::BadSyntax)
    }
}

fn strip_crlf(buf: &[u8]) -> Result<&[u8], CodecError> {
    if buf.len() < 2 || &buf[buf.len() - 2..] != b"\r\n" {
        return Err(CodecError::BadSyntax);
    }
    Ok(&buf[..buf.len() - 2])
}

/// A bare `DONE` line (case-insensitive), the only input XKEYSYNC's
/// continuation state accepts.
pub fn is_done_line(line: &[u8]) -> bool {
    let line = line
        .strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line);
    line.eq_ignore_ascii_case(b"DONE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_capability() {
        let req = parse_command(b"A1 CAPABILITY\r\n").unwrap();
        assert_eq!(req.tag, "A1");
        assert_eq!(req.command, Command::Capability);
    }

    #[test]
    fn rejects_capability_with_args() {
        assert_eq!(
            parse_command(b"A1 CAPABILITY foo\r\n"),
            Err(CodecError::BadSyntax)
        );
    }

    #[test]
    fn parses_login() {
        let req = parse_command(b"A1 LOGIN alice secret\r\n").unwrap();
        assert_eq!(
            req.command,
            Command::Login {
                user: b"alice".to_vec(),
                pass: b"secret".to_vec()
            }
        );
    }

    #[test]
    fn parses_xkeysync_with_fprs() {
        let fpr = "a".repeat(40);
        let line = format!("A1 XKEYSYNC {fpr}\r\n");
        let req = parse_command(line.as_bytes()).unwrap();
        assert_eq!(
            req.command,
            Command::XkeySync {
                fprs: vec![CompactString::from(fpr.as_str())]
            }
        );
    }

    #[test]
    fn rejects_xkeysync_bad_fpr() {
        let line = b"A1 XKEYSYNC nothex\r\n";
        assert_eq!(parse_command(line), Err(CodecError::BadSyntax));
    }

    #[test]
    fn parses_xkeyadd_literal() {
        let mut line = b"A1 XKEYADD {5}\r\n".to_vec();
        line.extend_from_slice(b"hello\r\n");
        let req = parse_command(&line).unwrap();
        assert_eq!(
            req.command,
            Command::XkeyAdd {
                pem: b"hello".to_vec()
            }
        );
    }

    #[test]
    fn forwards_unknown_verb_verbatim() {
        let req = parse_command(b"A1 FETCH 1:* (FLAGS)\r\n").unwrap();
        assert_eq!(
            req.command,
            Command::Other {
                verb: "FETCH".into(),
                raw_args: b"1:* (FLAGS)".to_vec(),
            }
        );
    }

    #[test]
    fn recognizes_done_line() {
        assert!(is_done_line(b"DONE\r\n"));
        assert!(is_done_line(b"done\r\n"));
        assert!(!is_done_line(b"DONE SOMETHING\r\n"));
    }
}
