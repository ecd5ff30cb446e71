/*
 * The IMAP wire codec: parse/serialize commands and responses, including
 * literals, tagged status codes, and the XKEYSYNC/XKEYADD extension grammar.
 * Deliberately does not parse every IMAP extension — unknown commands
 * forward upstream verbatim as [`command::Command::Other`].
 */

pub mod capability;
pub mod command;
pub mod error;
pub mod receiver;
pub mod response;
pub mod scan;
pub mod token;

pub use capability::capability_string;
pub use command::{Command, Request, Tag, is_done_line, is_fingerprint, serialize_request};
pub use error::CodecError;
pub use receiver::{PollOutcome, Receiver, command_receiver, response_receiver};
pub use response::{Response, Status, Untagged, serialize_response, serialize_to_vec};
