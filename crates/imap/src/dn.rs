use imap_proto::{
    capability_string, command_receiver, serialize_response, PollOutcome, Receiver, Request,
    Response, Status,
};
use trc::{Error, ErrorKind};

use crate::transport::Transport;

/// `Unauth → (LOGIN | AUTH PLAIN) → Auth → SELECT → Selected`, plus the
/// terminal pair every session eventually reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnState {
    Connecting,
    Greeting,
    Unauth,
    Auth,
    Selected,
    Closing,
    Closed,
}

/// One TLS-terminated client connection. `on_bytes` never blocks on I/O: it
/// only feeds the codec and hands back fully-parsed commands for the CITM
/// core to enqueue.
pub struct DnSession<W: Transport> {
    pub state: DnState,
    receiver: Receiver<Request>,
    writer: W,
    xkey_loaded: bool,
}

impl<W: Transport> DnSession<W> {
    pub fn new(writer: W, xkey_loaded: bool) -> Self {
        DnSession {
            state: DnState::Connecting,
            receiver: command_receiver(),
            writer,
            xkey_loaded,
        }
    }

    /// Sends `* OK [CAPABILITY ...] ...` and moves to `Unauth`.
    pub fn start(&mut self) -> trc::Result<()> {
        let caps = capability_string(self.xkey_loaded);
        let line = format!("* OK [CAPABILITY {caps}] server ready\r\n");
        self.writer.write_all(line.as_bytes())?;
        self.state = DnState::Unauth;
        Ok(())
    }

    /// Feeds `bytes` to the incremental codec; returns every command parsed
    /// to completion. A synchronizing literal triggers a `+ ` prompt written
    /// immediately (§4.2); a malformed line is rejected with a synchronous
    /// `BAD` and does not appear in the returned list.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> trc::Result<Vec<Request>> {
        self.receiver.feed(bytes);
        let mut out = Vec::new();
        loop {
            match self.receiver.poll() {
                PollOutcome::NeedMore => break,
                PollOutcome::NeedContinuationPrompt => {
                    self.writer.write_all(b"+ \r\n")?;
                }
                PollOutcome::Parsed(req) => out.push(req),
                PollOutcome::Error(e) => {
                    // structurally invalid: DN answers synchronously, not CITM.
                    self.writer
                        .write_all(format!("* BAD {e}\r\n").as_bytes())?;
                }
            }
        }
        Ok(out)
    }

    pub fn send_resp(&mut self, resp: &Response) -> trc::Result<()> {
        let mut buf = Vec::new();
        serialize_response(resp, &mut buf);
        self.writer.write_all(&buf)
    }

    /// Idempotent: a second `close` is a no-op, matching the membuf
    /// release-idempotence pattern elsewhere in this codebase.
    pub fn close(&mut self, reason: &str) -> trc::Result<()> {
        if self.state == DnState::Closed {
            return Ok(());
        }
        self.state = DnState::Closing;
        let bye = Response::Tagged {
            tag: "*".into(),
            status: Status::Bye,
            code: None,
            text: reason.to_string(),
        };
        let _ = self.send_resp(&bye);
        self.writer.shutdown()?;
        self.state = DnState::Closed;
        Ok(())
    }
}

/// Helper for the CITM core: a command whose precondition is unmet given the
/// current `state` is rejected locally; `None` means the precondition holds.
pub fn precondition_error(state: DnState, verb_needs_auth: bool, verb_needs_selected: bool) -> Option<Error> {
    if verb_needs_selected && state != DnState::Selected {
        return Some(Error::new(ErrorKind::Internal, "no mailbox selected"));
    }
    if verb_needs_auth && state == DnState::Unauth {
        return Some(Error::new(ErrorKind::Internal, "not authenticated"));
    }
    None
}
