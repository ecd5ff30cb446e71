/*
 * Structured error handling and event logging shared by every crate in this
 * workspace: a closed error kind enum instead of string-matched error
 * groups, and a small typed event facade instead of ad hoc `log::info!`
 * call sites.
 */

pub mod collector;
pub mod error;
pub mod event;
pub mod subscriber;

pub use collector::Collector;
pub use error::{Error, ErrorKind, Result};
pub use event::{
    DeviceKeyEvent, DnsEvent, Event, EventType, ImapEvent, KvpSyncEvent, Level, NetworkEvent,
    ServerEvent, Value,
};
pub use subscriber::{Subscriber, TextSubscriber};
