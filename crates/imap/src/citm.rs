use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use compact_str::ToCompactString;
use directory::{AccountId, AccountStore, DeviceKeyStore, Fingerprint};
use imap_proto::{Command, Request, Response, Status, Tag};
use trc::{event, DeviceKeyEvent, Error, ImapEvent, EventType};

use crate::devicekey::{handle_xkeyadd, XkeysyncContext};
use crate::dn::DnSession;
use crate::pool::Advance;
use crate::transport::Transport;
use crate::up::{UpEvent, UpSession};

const DEVICE_CAP_DEFAULT: usize = 20;
const KEEPALIVE_BASE_MS_DEFAULT: u64 = 120_000;

/// The two queues that cross a thread boundary: commands arrive from the
/// reactor thread that owns DN's socket, untagged responses arrive from the
/// reactor thread that owns UP's socket. Outbound writes happen
/// synchronously inside `advance()`, which is always called with the CITM
/// mutex held by exactly one worker, so no separate outbound queue is
/// needed.
#[derive(Default)]
struct Queues {
    unhandled_cmds: VecDeque<Request>,
    unhandled_resps: VecDeque<Response>,
}

/// Joins one DN and one UP into a single-threaded proxy state machine.
/// `advance()` is the entire contract; everything else only mutates the
/// queues.
pub struct CitmSession<WD: Transport, WU: Transport> {
    dn: DnSession<WD>,
    up: UpSession<WU>,
    queues: Queues,
    greeting_sent: bool,
    pub closed: bool,
    pub dead: bool,
    pub error: Option<Error>,

    /// DN-issued tags currently awaiting a response of any kind.
    pending_tags_dn: ahash::AHashSet<Tag>,
    /// UP-issued tag -> the DN tag to restore on completion.
    pending_tags_up: AHashMap<Tag, Tag>,

    account_store: Arc<dyn AccountStore>,
    device_store: Arc<dyn DeviceKeyStore>,
    account_id: Option<AccountId>,
    device_cap: usize,
    keepalive_base_ms: u64,
    client_ip: IpAddr,
    xkeysync: Option<XkeysyncContext>,
    /// Raw bytes read while XKEYSYNC owns the connection but not yet
    /// terminated by a newline; carried across `on_dn_bytes` calls the same
    /// way the command receiver buffers a partial command line.
    xkeysync_buf: Vec<u8>,
}

impl<WD: Transport, WU: Transport> CitmSession<WD, WU> {
    pub fn new(
        dn_writer: WD,
        up_writer: WU,
        account_store: Arc<dyn AccountStore>,
        device_store: Arc<dyn DeviceKeyStore>,
    ) -> Self {
        CitmSession {
            dn: DnSession::new(dn_writer, true),
            up: UpSession::new(up_writer),
            queues: Queues::default(),
            greeting_sent: false,
            closed: false,
            dead: false,
            error: None,
            pending_tags_dn: ahash::AHashSet::default(),
            pending_tags_up: AHashMap::default(),
            account_store,
            device_store,
            account_id: None,
            device_cap: DEVICE_CAP_DEFAULT,
            keepalive_base_ms: KEEPALIVE_BASE_MS_DEFAULT,
            client_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            xkeysync: None,
            xkeysync_buf: Vec::new(),
        }
    }

    /// Called by the reactor thread when bytes arrive on the client socket.
    /// Parses and enqueues; does not itself call `advance()` — the caller is
    /// expected to schedule the CITM onto the worker pool afterward.
    pub fn on_dn_bytes(&mut self, bytes: &[u8]) -> trc::Result<()> {
        if self.xkeysync.is_some() {
            // while XKEYSYNC owns the connection, raw lines are interpreted
            // directly rather than re-entering the command parser: any full
            // line is either DONE or a BAD. Partial lines are carried in
            // `xkeysync_buf` across calls the same way the command receiver
            // buffers an incomplete command.
            self.xkeysync_buf.extend_from_slice(bytes);
            while let Some(line_end) = self.xkeysync_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.xkeysync_buf.drain(..=line_end).collect();
                let Some(ctx) = &self.xkeysync else { break };
                let resp = ctx.handle_client_line(&line);
                let finished = matches!(&resp, Response::Tagged { .. });
                self.dn.send_resp(&resp)?;
                if finished {
                    self.xkeysync = None;
                    self.xkeysync_buf.clear();
                    break;
                }
            }
            return Ok(());
        }
        let reqs = self.dn.on_bytes(bytes)?;
        self.queues.unhandled_cmds.extend(reqs);
        Ok(())
    }

    /// Called by the reactor thread when bytes arrive on the upstream
    /// socket. Tagged responses are resolved and delivered to DN
    /// immediately; untagged ones are queued for `advance()` to relay.
    pub fn on_up_bytes(&mut self, bytes: &[u8]) -> trc::Result<()> {
        let events = self.up.on_bytes(bytes)?;
        for ev in events {
            match ev {
                UpEvent::Tagged { up_tag, response } => {
                    let dn_tag = self
                        .pending_tags_up
                        .remove(&up_tag)
                        .ok_or_else(|| Error::new(trc::ErrorKind::Internal, "untracked up tag"))?;
                    self.pending_tags_dn.remove(&dn_tag);
                    let rewritten = rewrite_tag(response, dn_tag);
                    self.dn.send_resp(&rewritten)?;
                    event!(EventType::Imap(ImapEvent::ResponseForwarded));
                }
                UpEvent::Untagged(u) => {
                    self.queues.unhandled_resps.push_back(Response::Untagged(u));
                }
            }
        }
        Ok(())
    }

    /// The one entry point the worker pool calls; single-threaded per CITM
    /// by construction (the pool only ever holds one `&mut CitmSession` at a
    /// time per instance — see `pool.rs`).
    pub fn advance(&mut self) {
        if self.closed {
            self.drain_and_free();
            return;
        }

        if !self.greeting_sent {
            if let Err(e) = self.dn.start() {
                self.fail(e);
                return;
            }
            self.greeting_sent = true;
            event!(EventType::Imap(ImapEvent::GreetingSent));
        }

        while let Some(req) = self.queues.unhandled_cmds.pop_front() {
            if let Err(e) = self.dispatch_command(req) {
                self.fail(e);
                return;
            }
        }

        while let Some(resp) = self.queues.unhandled_resps.pop_front() {
            if let Err(e) = self.dn.send_resp(&resp) {
                self.fail(e);
                return;
            }
        }

        if let Err(e) = self.drive_xkeysync() {
            self.fail(e);
        }
    }

    /// Steps 5-6 and 8 of the XKEYSYNC algorithm: fires whichever timers are
    /// due on every `advance()`, since the worker pool re-drives this CITM
    /// periodically while XKEYSYNC is live (see the per-connection ticker
    /// thread in the server binary).
    fn drive_xkeysync(&mut self) -> trc::Result<()> {
        if self.xkeysync.is_none() {
            return Ok(());
        }
        let now = Instant::now();

        if self.xkeysync.as_ref().is_some_and(|ctx| ctx.poll_due(now)) {
            let ctx = self.xkeysync.as_mut().expect("checked above");
            ctx.mark_polled(now);
            match ctx.poll_tick(self.device_store.as_ref()) {
                Ok(updates) => {
                    let ctx = self.xkeysync.as_mut().expect("checked above");
                    ctx.record_poll_success();
                    if !updates.is_empty() {
                        ctx.mark_keepalive(now);
                        for resp in updates {
                            self.dn.send_resp(&resp)?;
                        }
                    }
                }
                Err(e) => {
                    event!(EventType::DeviceKey(DeviceKeyEvent::SyncError), "error" = e.to_string());
                    let ctx = self.xkeysync.as_mut().expect("checked above");
                    if ctx.record_poll_failure() {
                        let resp = ctx.retry_exhausted_response();
                        self.dn.send_resp(&resp)?;
                        self.xkeysync = None;
                        self.xkeysync_buf.clear();
                        return Ok(());
                    }
                }
            }
        }

        if let Some(ctx) = self.xkeysync.as_mut() {
            if ctx.keepalive_due(now) {
                ctx.mark_keepalive(now);
                let resp = ctx.keepalive_tick();
                self.dn.send_resp(&resp)?;
            }
        }

        Ok(())
    }

    fn dispatch_command(&mut self, req: Request) -> trc::Result<()> {
        let Request { tag, command } = req;
        self.pending_tags_dn.insert(tag.clone());

        match command {
            Command::Capability => self.answer_locally(tag, "capability list"),
            Command::Noop => self.answer_locally(tag, "noop"),
            Command::Logout => {
                let bye = Response::Tagged {
                    tag: "*".to_compact_string(),
                    status: Status::Bye,
                    code: None,
                    text: "logging out".to_string(),
                };
                self.dn.send_resp(&bye)?;
                self.answer_locally(tag, "logout complete")?;
                self.closed = true;
                Ok(())
            }
            Command::Enable { capabilities } => {
                let known = capabilities.iter().all(|c| c.eq_ignore_ascii_case("XKEY"));
                if known {
                    self.answer_locally(tag, "enabled")
                } else {
                    self.dn.send_resp(&Response::Tagged {
                        tag,
                        status: Status::Bad,
                        code: None,
                        text: "unknown capability".to_string(),
                    })
                }
            }
            Command::Login { user, pass } => self.handle_login(tag, user, pass),
            Command::XkeyAdd { pem } => {
                let Some(account_id) = self.account_id.clone() else {
                    return self.not_authenticated(tag);
                };
                let resp = handle_xkeyadd(&tag, &account_id, &pem, self.device_cap, self.device_store.as_ref());
                self.dn.send_resp(&resp)
            }
            Command::XkeySync { fprs } => {
                let Some(account_id) = self.account_id.clone() else {
                    return self.not_authenticated(tag);
                };
                let fprs: Vec<Fingerprint> = fprs.into_iter().map(Fingerprint).collect();
                let identity = account_id.as_str().to_string();
                let mut ctx = XkeysyncContext::new(tag, account_id, fprs, &identity, self.client_ip, self.keepalive_base_ms);
                for resp in ctx.initial_diff(self.device_store.as_ref())? {
                    self.dn.send_resp(&resp)?;
                }
                self.xkeysync = Some(ctx);
                Ok(())
            }
            Command::Select { mailbox } => self.forward(tag, Command::Select { mailbox }),
            Command::Other { verb, raw_args } => self.forward(tag, Command::Other { verb, raw_args }),
        }
    }

    fn handle_login(&mut self, tag: Tag, user: Vec<u8>, pass: Vec<u8>) -> trc::Result<()> {
        let (email, password) = match (String::from_utf8(user), String::from_utf8(pass)) {
            (Ok(e), Ok(p)) => (e, p),
            _ => {
                return self.dn.send_resp(&Response::Tagged {
                    tag,
                    status: Status::Bad,
                    code: None,
                    text: "credentials must be valid UTF-8".to_string(),
                })
            }
        };
        match self.account_store.validate_login(&email, &password) {
            Ok(account_id) => {
                self.account_id = Some(account_id);
                self.answer_locally(tag, "LOGIN completed")
            }
            Err(e) if e.is(trc::ErrorKind::UserMsg) => self.dn.send_resp(&Response::Tagged {
                tag,
                status: Status::No,
                code: None,
                text: e.user_message().unwrap_or("invalid credentials").to_string(),
            }),
            Err(e) => {
                event!(EventType::Server(trc::ServerEvent::Bug), "error" = e.to_string());
                self.dn.send_resp(&Response::Tagged {
                    tag,
                    status: Status::Bad,
                    code: None,
                    text: "internal server failure".to_string(),
                })
            }
        }
    }

    fn not_authenticated(&mut self, tag: Tag) -> trc::Result<()> {
        self.dn.send_resp(&Response::Tagged {
            tag,
            status: Status::No,
            code: None,
            text: "not authenticated".to_string(),
        })
    }

    fn answer_locally(&mut self, tag: Tag, text: &str) -> trc::Result<()> {
        self.pending_tags_dn.remove(&tag);
        self.dn.send_resp(&Response::Tagged {
            tag,
            status: Status::Ok,
            code: None,
            text: text.to_string(),
        })
    }

    /// Overrides the per-connection device-key capacity; defaults to
    /// `DEVICE_CAP_DEFAULT`.
    #[must_use]
    pub fn with_device_cap(mut self, cap: usize) -> Self {
        self.device_cap = cap;
        self
    }

    /// Client IP used to jitter the XKEYSYNC keep-alive interval; defaults to
    /// unspecified for sessions that never set it (e.g. tests).
    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = ip;
        self
    }

    /// Overrides the XKEYSYNC keep-alive base interval before jitter;
    /// defaults to `KEEPALIVE_BASE_MS_DEFAULT`.
    #[must_use]
    pub fn with_keepalive_base_ms(mut self, ms: u64) -> Self {
        self.keepalive_base_ms = ms;
        self
    }

    /// Forwards a command upstream: assigns a fresh UP tag, remembers the
    /// rewrite, and lets a later `on_up_bytes` call complete it.
    fn forward(&mut self, dn_tag: Tag, command: Command) -> trc::Result<()> {
        let up_tag = self.up.send_cmd(command)?;
        self.pending_tags_up.insert(up_tag, dn_tag);
        Ok(())
    }

    fn fail(&mut self, e: Error) {
        event!(EventType::Imap(ImapEvent::CommandError), "error" = e.to_string());
        self.closed = true;
        self.dead = true;
        self.error = Some(e);
        let reason = "internal server failure";
        for (up_tag, resp) in self.up.cancel_all(reason) {
            if let Some(dn_tag) = self.pending_tags_up.remove(&up_tag) {
                let rewritten = rewrite_tag(resp, dn_tag);
                let _ = self.dn.send_resp(&rewritten);
            }
        }
        let _ = self.dn.close(reason);
        let _ = self.up.close();
    }

    fn drain_and_free(&mut self) {
        self.queues.unhandled_cmds.clear();
        self.queues.unhandled_resps.clear();
        self.pending_tags_dn.clear();
        self.pending_tags_up.clear();
        self.xkeysync = None;
        self.xkeysync_buf.clear();
        event!(EventType::Imap(ImapEvent::SessionClosed));
    }
}

impl<WD: Transport, WU: Transport> Advance for CitmSession<WD, WU> {
    fn advance(&mut self) {
        CitmSession::advance(self)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn rewrite_tag(resp: Response, dn_tag: Tag) -> Response {
    match resp {
        Response::Tagged { status, code, text, .. } => Response::Tagged {
            tag: dn_tag,
            status,
            code,
            text,
        },
        other => other,
    }
}
