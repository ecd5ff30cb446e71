use crate::event::{Event, Level};

/// A sink that receives every [`Event`] whose level clears its threshold.
///
/// A flat level filter is enough here: this server only ever runs one or
/// two subscribers, so per-`EventType` interest bitsets and a lossy
/// delivery mode would be unused machinery.
pub trait Subscriber: Send + Sync {
    fn min_level(&self) -> Level;
    fn handle(&self, event: &Event);
}

/// Writes one line per event to stderr: `LEVEL domain.event key=val key=val`.
pub struct TextSubscriber {
    pub min_level: Level,
}

impl Subscriber for TextSubscriber {
    fn min_level(&self) -> Level {
        self.min_level
    }

    fn handle(&self, event: &Event) {
        let ts: chrono::DateTime<chrono::Utc> = event.timestamp.into();
        let mut line = format!(
            "{} {:?} {}",
            ts.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            event.level,
            event_name(event)
        );
        for (k, v) in &event.keys {
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(&v.to_string());
        }
        eprintln!("{line}");
    }
}

fn event_name(event: &Event) -> &'static str {
    use crate::event::{DeviceKeyEvent, DnsEvent, EventType, ImapEvent, KvpSyncEvent, NetworkEvent, ServerEvent};
    match event.typ {
        EventType::Network(NetworkEvent::AcceptError) => "network.accept-error",
        EventType::Network(NetworkEvent::ConnectionStart) => "network.connection-start",
        EventType::Network(NetworkEvent::ConnectionEnd) => "network.connection-end",
        EventType::Network(NetworkEvent::Closed) => "network.closed",
        EventType::Imap(ImapEvent::GreetingSent) => "imap.greeting-sent",
        EventType::Imap(ImapEvent::CommandParsed) => "imap.command-parsed",
        EventType::Imap(ImapEvent::CommandError) => "imap.command-error",
        EventType::Imap(ImapEvent::ResponseForwarded) => "imap.response-forwarded",
        EventType::Imap(ImapEvent::SessionClosed) => "imap.session-closed",
        EventType::DeviceKey(DeviceKeyEvent::Added) => "devicekey.added",
        EventType::DeviceKey(DeviceKeyEvent::CapacityReached) => "devicekey.capacity-reached",
        EventType::DeviceKey(DeviceKeyEvent::SyncDiff) => "devicekey.sync-diff",
        EventType::DeviceKey(DeviceKeyEvent::SyncPoll) => "devicekey.sync-poll",
        EventType::DeviceKey(DeviceKeyEvent::SyncError) => "devicekey.sync-error",
        EventType::Dns(DnsEvent::QueryRejected) => "dns.query-rejected",
        EventType::Dns(DnsEvent::QueryAnswered) => "dns.query-answered",
        EventType::Dns(DnsEvent::SendError) => "dns.send-error",
        EventType::KvpSync(KvpSyncEvent::PeerResync) => "kvpsync.peer-resync",
        EventType::KvpSync(KvpSyncEvent::UpdateApplied) => "kvpsync.update-applied",
        EventType::KvpSync(KvpSyncEvent::UpdateIgnored) => "kvpsync.update-ignored",
        EventType::KvpSync(KvpSyncEvent::Expired) => "kvpsync.expired",
        EventType::Server(ServerEvent::Startup) => "server.startup",
        EventType::Server(ServerEvent::ConfigLoaded) => "server.config-loaded",
        EventType::Server(ServerEvent::Bug) => "server.bug",
    }
}
