/*
 * Literal-aware command/response boundary scanner.
 *
 * IMAP framing can't be split on plain CRLF: a `{n}` or `{n+}` literal
 * announcement at the end of a line means the next `n` raw bytes (which may
 * contain embedded CRLFs) belong to the current command, and scanning must
 * resume looking for the real terminating CRLF only after consuming them.
 */

/// Default ceiling on a single literal's declared size, rejected outright
/// (before reading) as `LiteralTooBig`.
pub const DEFAULT_MAX_LITERAL: usize = 32 * 1024 * 1024;

/// Ceiling on the non-literal portion of a command: a line that never
/// terminates and never declares a literal is `Overlong`.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    /// `{n}` declared a literal bigger than the configured maximum.
    LiteralTooBig,
    /// The fixed-size parser buffer would be exhausted without completing a
    /// command (a line that never terminates and declares no literal).
    Overlong,
    /// Structurally invalid framing (unbalanced quote, bad literal spec).
    BadSyntax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// A full command/response occupies `buf[..len]`, CRLF included.
    Complete(usize),
    /// Need more bytes; no action required from the caller.
    Incomplete,
    /// Need more bytes, but first the caller (server side only) must emit a
    /// `+ OK` continuation prompt exactly once before more data can arrive,
    /// because a synchronizing literal (`{n}`, without `+`) was declared.
    NeedsContinuation,
}

/// Scans `buf` for one complete framed unit, starting at offset 0.
///
/// `max_literal` / `max_line` are the configured ceilings; `is_server` picks
/// whether a bare `{n}` (synchronizing literal) should request a
/// continuation prompt (true, server parsing client commands) or simply be
/// treated as already satisfied by however many bytes are present (false,
/// client-side parsing of server responses, which never waits for a prompt
/// it would have to emit itself).
pub fn scan(
    buf: &[u8],
    max_literal: usize,
    max_line: usize,
    is_server: bool,
) -> Result<ScanStatus, ScanError> {
    let mut i = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut line_start = 0usize;

    while i < buf.len() {
        let b = buf[i];

        if in_quotes {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quotes = false;
            } else if b == b'\r' || b == b'\n' {
                return Err(ScanError::BadSyntax);
            }
            i += 1;
            continue;
        }

        match b {
            b'"' => {
                in_quotes = true;
                i += 1;
            }
            b'\r' if buf.get(i + 1) == Some(&b'\n') => {
                // candidate line end: check for a trailing literal spec
                let line = &buf[line_start..i];
                match trailing_literal_spec(line) {
                    Some(Ok((n, sync))) => {
                        if n > max_literal {
                            return Err(ScanError::LiteralTooBig);
                        }
                        let lit_start = i + 2;
                        if sync && is_server && buf.len() < lit_start + n {
                            return Ok(ScanStatus::NeedsContinuation);
                        }
                        if buf.len() < lit_start + n {
                            return Ok(ScanStatus::Incomplete);
                        }
                        // literal satisfied; resume scanning right after it
                        i = lit_start + n;
                        line_start = i;
                        continue;
                    }
                    Some(Err(())) => return Err(ScanError::BadSyntax),
                    None => return Ok(ScanStatus::Complete(i + 2)),
                }
            }
            b'\n' => return Err(ScanError::BadSyntax),
            _ => {
                i += 1;
            }
        }

        if i - line_start > max_line {
            return Err(ScanError::Overlong);
        }
    }

    if i - line_start > max_line {
        return Err(ScanError::Overlong);
    }
    Ok(ScanStatus::Incomplete)
}

/// Returns `Some(Ok((n, synchronizing)))` if `line` ends in `{n}` or `{n+}`,
/// `Some(Err(()))` if it looks like a literal spec but is malformed, or
/// `None` if the line has no literal spec at all.
fn trailing_literal_spec(line: &[u8]) -> Option<Result<(usize, bool), ()>> {
    if line.last() != Some(&b'}') {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let mut body = &line[open + 1..line.len() - 1];
    let sync = if body.last() == Some(&b'+') {
        body = &body[..body.len() - 1];
        false
    } else {
        true
    };
    if body.is_empty() || !body.iter().all(u8::is_ascii_digit) {
        return Some(Err(()));
    }
    let s = std::str::from_utf8(body).ok()?;
    let n: usize = s.parse().ok()?;
    Some(Ok((n, sync)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_complete() {
        let buf = b"A1 NOOP\r\n";
        assert_eq!(
            scan(buf, DEFAULT_MAX_LITERAL, DEFAULT_MAX_LINE, true),
            Ok(ScanStatus::Complete(buf.len()))
        );
    }

    #[test]
    fn incomplete_without_crlf() {
        let buf = b"A1 NOO";
        assert_eq!(
            scan(buf, DEFAULT_MAX_LITERAL, DEFAULT_MAX_LINE, true),
            Ok(ScanStatus::Incomplete)
        );
    }

    #[test]
    fn sync_literal_needs_continuation_when_short() {
        let buf = b"A1 XKEYADD {10}\r\n";
        assert_eq!(
            scan(buf, DEFAULT_MAX_LITERAL, DEFAULT_MAX_LINE, true),
            Ok(ScanStatus::NeedsContinuation)
        );
    }

    #[test]
    fn sync_literal_completes_once_bytes_present() {
        let mut buf = b"A1 XKEYADD {5}\r\n".to_vec();
        buf.extend_from_slice(b"hello\r\n");
        assert_eq!(
            scan(&buf, DEFAULT_MAX_LITERAL, DEFAULT_MAX_LINE, true),
            Ok(ScanStatus::Complete(buf.len()))
        );
    }

    #[test]
    fn literal_content_with_embedded_crlf_does_not_end_early() {
        let mut buf = b"A1 APPEND inbox {7}\r\n".to_vec();
        buf.extend_from_slice(b"a\r\nbcd");
        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            scan(&buf, DEFAULT_MAX_LITERAL, DEFAULT_MAX_LINE, true),
            Ok(ScanStatus::Complete(buf.len()))
        );
    }

    #[test]
    fn literal_too_big_rejected() {
        let buf = b"A1 XKEYADD {999999999}\r\n";
        assert_eq!(
            scan(buf, DEFAULT_MAX_LITERAL, DEFAULT_MAX_LINE, true),
            Err(ScanError::LiteralTooBig)
        );
    }

    #[test]
    fn overlong_line_rejected() {
        let buf = vec![b'A'; DEFAULT_MAX_LINE + 10];
        assert_eq!(
            scan(&buf, DEFAULT_MAX_LITERAL, DEFAULT_MAX_LINE, true),
            Err(ScanError::Overlong)
        );
    }
}
