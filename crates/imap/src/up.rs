use ahash::AHashSet;
use compact_str::ToCompactString;
use imap_proto::{response_receiver, Command, PollOutcome, Receiver, Request, Response, Status, Tag, Untagged};
use trc::{Error, ErrorKind};

use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpState {
    Connecting,
    Greeting,
    Unauth,
    Auth,
    Selected,
    Closing,
    Closed,
}

/// What `on_bytes` hands back: an untagged response to relay, or notice that
/// a tagged one arrived and was resolved against the inflight table (the
/// caller looks up `up_tag` in its own tag-rewrite map — see `pending_tags_up`
/// on the CITM core).
pub enum UpEvent {
    Tagged { up_tag: Tag, response: Response },
    Untagged(Untagged),
}

/// One outbound connection to the mail store. `inflight` is the set of
/// UP-issued tags awaiting a tagged response, minus the callback: callback
/// dispatch is the CITM core's job, since it is the one holding the
/// tag-rewrite map back to the DN-visible tag.
pub struct UpSession<W: Transport> {
    pub state: UpState,
    tag_counter: u64,
    inflight: AHashSet<Tag>,
    receiver: Receiver<Response>,
    writer: W,
}

impl<W: Transport> UpSession<W> {
    pub fn new(writer: W) -> Self {
        UpSession {
            state: UpState::Connecting,
            tag_counter: 0,
            inflight: AHashSet::default(),
            receiver: response_receiver(),
            writer,
        }
    }

    /// Rewrites to a fresh session-local tag, registers it as inflight,
    /// serializes, and writes. Returns the tag the caller must remember.
    pub fn send_cmd(&mut self, command: Command) -> trc::Result<Tag> {
        self.tag_counter += 1;
        let tag: Tag = format!("u{}", self.tag_counter).to_compact_string();
        self.inflight.insert(tag.clone());
        let req = Request {
            tag: tag.clone(),
            command,
        };
        self.writer.write_all(&imap_proto::serialize_request(&req))?;
        Ok(tag)
    }

    /// Feeds the codec; untagged responses come back for relay, tagged ones
    /// are resolved against `inflight` and returned for the CITM core to
    /// rewrite back to the DN-visible tag and deliver.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> trc::Result<Vec<UpEvent>> {
        self.receiver.feed(bytes);
        let mut out = Vec::new();
        loop {
            match self.receiver.poll() {
                PollOutcome::NeedMore => break,
                PollOutcome::NeedContinuationPrompt => {
                    // the mail store does not expect us to answer its own
                    // continuation prompts on this side of the codec.
                }
                PollOutcome::Parsed(Response::Tagged { tag, status, code, text }) => {
                    if !self.inflight.remove(&tag) {
                        return Err(Error::new(
                            ErrorKind::Response,
                            format!("tagged response for unknown tag {tag}"),
                        ));
                    }
                    out.push(UpEvent::Tagged {
                        up_tag: tag.clone(),
                        response: Response::Tagged { tag, status, code, text },
                    });
                }
                PollOutcome::Parsed(Response::Untagged(u)) => out.push(UpEvent::Untagged(u)),
                PollOutcome::Parsed(Response::Continuation { .. }) => {}
                PollOutcome::Error(e) => {
                    return Err(Error::new(ErrorKind::Response, e.to_string()));
                }
            }
        }
        Ok(out)
    }

    /// Invokes every outstanding tag with a synthesized BYE and purges the
    /// table. Returns the canceled tags so the CITM core can rewrite and
    /// deliver the synthesized responses to DN.
    pub fn cancel_all(&mut self, reason: &str) -> Vec<(Tag, Response)> {
        let tags: Vec<Tag> = self.inflight.drain().collect();
        tags.into_iter()
            .map(|tag| {
                let resp = Response::Tagged {
                    tag: tag.clone(),
                    status: Status::Bad,
                    code: None,
                    text: reason.to_string(),
                };
                (tag, resp)
            })
            .collect()
    }

    pub fn close(&mut self) -> trc::Result<()> {
        if self.state == UpState::Closed {
            return Ok(());
        }
        self.state = UpState::Closing;
        self.writer.shutdown()?;
        self.state = UpState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemTransport;

    #[test]
    fn rejects_tagged_response_for_unknown_tag() {
        let mut up = UpSession::new(MemTransport::default());
        let err = up.on_bytes(b"u1 OK done\r\n").unwrap_err();
        assert!(err.is(ErrorKind::Response));
    }

    #[test]
    fn send_cmd_then_tagged_response_resolves() {
        let mut up = UpSession::new(MemTransport::default());
        let tag = up.send_cmd(Command::Noop).unwrap();
        let events = up.on_bytes(format!("{tag} OK done\r\n").as_bytes()).unwrap();
        assert!(matches!(events.as_slice(), [UpEvent::Tagged { up_tag, .. }] if *up_tag == tag));
    }

    #[test]
    fn cancel_all_drains_inflight() {
        let mut up = UpSession::new(MemTransport::default());
        up.send_cmd(Command::Noop).unwrap();
        up.send_cmd(Command::Capability).unwrap();
        let canceled = up.cancel_all("shutting down");
        assert_eq!(canceled.len(), 2);
        assert!(up.on_bytes(b"u1 OK done\r\n").is_err());
    }
}
