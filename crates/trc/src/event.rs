use std::time::SystemTime;

use compact_str::CompactString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEvent {
    AcceptError,
    ConnectionStart,
    ConnectionEnd,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImapEvent {
    GreetingSent,
    CommandParsed,
    CommandError,
    ResponseForwarded,
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKeyEvent {
    Added,
    CapacityReached,
    SyncDiff,
    SyncPoll,
    SyncError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsEvent {
    QueryRejected,
    QueryAnswered,
    SendError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvpSyncEvent {
    PeerResync,
    UpdateApplied,
    UpdateIgnored,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    Startup,
    ConfigLoaded,
    /// Escalated the way the original's `badbadbad_alert` escalates a
    /// genuine-bug trace beyond the regular log.
    Bug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Network(NetworkEvent),
    Imap(ImapEvent),
    DeviceKey(DeviceKeyEvent),
    Dns(DnsEvent),
    KvpSync(KvpSyncEvent),
    Server(ServerEvent),
}

impl EventType {
    pub const fn default_level(self) -> Level {
        match self {
            EventType::Network(NetworkEvent::AcceptError) => Level::Warn,
            EventType::Imap(ImapEvent::CommandError) => Level::Debug,
            EventType::DeviceKey(DeviceKeyEvent::SyncError) => Level::Warn,
            EventType::Dns(DnsEvent::SendError) => Level::Warn,
            EventType::Server(ServerEvent::Bug) => Level::Error,
            _ => Level::Info,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Str(CompactString),
    Int(i64),
    Bool(bool),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

macro_rules! impl_value_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v.into())
            }
        }
    };
}

impl_value_from!(&str, Str);
impl_value_from!(String, Str);
impl_value_from!(CompactString, Str);
impl_value_from!(i64, Int);
impl_value_from!(u64, Int);
impl_value_from!(usize, Int);
impl_value_from!(bool, Bool);

#[derive(Debug, Clone)]
pub struct Event {
    pub typ: EventType,
    pub level: Level,
    pub timestamp: SystemTime,
    pub keys: Vec<(&'static str, Value)>,
}

impl Event {
    pub fn new(typ: EventType, level: Level) -> Self {
        Event {
            typ,
            level,
            timestamp: SystemTime::now(),
            keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.keys.push((key, value.into()));
        self
    }
}

/// Build an [`Event`] and hand it to the global [`crate::Collector`].
///
/// ```ignore
/// trc::event!(Imap(ImapEvent::CommandParsed), Level::Debug, "tag" = tag);
/// ```
#[macro_export]
macro_rules! event {
    ($typ:expr $(, $level:expr)? $(, $key:literal = $val:expr)* $(,)?) => {{
        #[allow(unused_mut, unused_variables)]
        let mut ev = $crate::Event::new($typ, $crate::__event_level!($typ $(, $level)?));
        $( ev = ev.with($key, $val); )*
        $crate::Collector::dispatch(ev);
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __event_level {
    ($typ:expr, $level:expr) => {
        $level
    };
    ($typ:expr) => {
        $crate::EventType::default_level($typ)
    };
}
