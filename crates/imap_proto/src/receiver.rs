use crate::command::{self, Request};
use crate::error::CodecError;
use crate::response::{self, Response};
use crate::scan::{self, ScanStatus, DEFAULT_MAX_LINE, DEFAULT_MAX_LITERAL};

/// Outcome of one [`Receiver::poll`] call.
pub enum PollOutcome<T> {
    /// No complete unit yet; wait for more bytes from the socket.
    NeedMore,
    /// A synchronizing literal (`{n}`) was declared; the server side must
    /// emit a `+ OK` continuation prompt before more bytes can arrive.
    NeedContinuationPrompt,
    Parsed(T),
    Error(CodecError),
}

/// Incremental, literal-aware parser shared by the DN (parsing client
/// commands) and UP (parsing store responses) sessions. Bytes accumulate in
/// an internal buffer; [`Receiver::poll`] drains exactly one complete frame
/// at a time.
pub struct Receiver<T> {
    buf: Vec<u8>,
    max_literal: usize,
    max_line: usize,
    is_server: bool,
    continuation_sent: bool,
    parse: fn(&[u8]) -> Result<T, CodecError>,
}

impl<T> Receiver<T> {
    fn new(is_server: bool, parse: fn(&[u8]) -> Result<T, CodecError>) -> Self {
        Receiver {
            buf: Vec::new(),
            max_literal: DEFAULT_MAX_LITERAL,
            max_line: DEFAULT_MAX_LINE,
            is_server,
            continuation_sent: false,
            parse,
        }
    }

    pub fn with_limits(mut self, max_literal: usize, max_line: usize) -> Self {
        self.max_literal = max_literal;
        self.max_line = max_line;
        self
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn poll(&mut self) -> PollOutcome<T> {
        match scan::scan(&self.buf, self.max_literal, self.max_line, self.is_server) {
            Ok(ScanStatus::Complete(n)) => {
                let frame: Vec<u8> = self.buf.drain(..n).collect();
                self.continuation_sent = false;
                match (self.parse)(&frame) {
                    Ok(t) => PollOutcome::Parsed(t),
                    Err(e) => PollOutcome::Error(e),
                }
            }
            Ok(ScanStatus::Incomplete) => PollOutcome::NeedMore,
            Ok(ScanStatus::NeedsContinuation) => {
                if self.continuation_sent {
                    PollOutcome::NeedMore
                } else {
                    self.continuation_sent = true;
                    PollOutcome::NeedContinuationPrompt
                }
            }
            Err(e) => {
                // the buffer no longer represents a recoverable frame boundary
                self.buf.clear();
                self.continuation_sent = false;
                PollOutcome::Error(e.into())
            }
        }
    }
}

pub fn command_receiver() -> Receiver<Request> {
    Receiver::new(true, command::parse_command)
}

pub fn response_receiver() -> Receiver<Response> {
    Receiver::new(false, response::parse_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_multiple_commands_in_one_feed() {
        let mut r = command_receiver();
        r.feed(b"A1 NOOP\r\nA2 CAPABILITY\r\n");
        let first = matches!(r.poll(), PollOutcome::Parsed(req) if req.tag == "A1");
        assert!(first);
        let second = matches!(r.poll(), PollOutcome::Parsed(req) if req.tag == "A2");
        assert!(second);
        assert!(matches!(r.poll(), PollOutcome::NeedMore));
    }

    #[test]
    fn requests_continuation_for_sync_literal() {
        let mut r = command_receiver();
        r.feed(b"A1 XKEYADD {5}\r\n");
        assert!(matches!(r.poll(), PollOutcome::NeedContinuationPrompt));
        assert!(matches!(r.poll(), PollOutcome::NeedMore));
        r.feed(b"hello\r\n");
        assert!(matches!(r.poll(), PollOutcome::Parsed(_)));
    }
}
