//! Escalation sink for `ServerEvent::Bug`: bugs get written somewhere
//! distinct from the regular log line, prefixed so they're easy to grep
//! and alert on separately.

use trc::{Event, EventType, Level, ServerEvent, Subscriber};

pub struct BugAlertSubscriber;

impl Subscriber for BugAlertSubscriber {
    fn min_level(&self) -> Level {
        Level::Error
    }

    fn handle(&self, event: &Event) {
        if !matches!(event.typ, EventType::Server(ServerEvent::Bug)) {
            return;
        }
        let mut line = String::from("BADBADBAD");
        for (k, v) in &event.keys {
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(&v.to_string());
        }
        eprintln!("{line}");
    }
}
