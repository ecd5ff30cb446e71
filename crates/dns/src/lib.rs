pub mod classify;
pub mod kvpsync;
pub mod responder;
pub mod wire;
pub mod zone;

pub use classify::Classification;
pub use kvpsync::{read_ack, read_update, write_ack, write_update, Ack, KvpReceiver, Update};
pub use responder::{DnsResponder, UdpSocket, build_response_for_query};
pub use wire::{Header, QType, Question, RCode, RData};
pub use zone::DnsZone;
