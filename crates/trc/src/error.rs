use std::fmt;

use compact_str::CompactString;

/// Closed set of error kinds the CITM core and its collaborators can raise.
///
/// Mirrors the `derr_type_t` kinds from the original C implementation, but as
/// a closed Rust sum type instead of a registry of global pointers: callers
/// match on `ErrorKind` directly rather than comparing string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Nomem,
    Sock,
    Conn,
    Value,
    Fixedsize,
    Os,
    BadIdx,
    Open,
    Param,
    Internal,
    Fs,
    Response,
    UserMsg,
    Canceled,
    Busy,
    Sql,
    SqlDup,
    Uv,
    NoRaise,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Nomem => "NOMEM",
            ErrorKind::Sock => "SOCK",
            ErrorKind::Conn => "CONN",
            ErrorKind::Value => "VALUE",
            ErrorKind::Fixedsize => "FIXEDSIZE",
            ErrorKind::Os => "OS",
            ErrorKind::BadIdx => "BADIDX",
            ErrorKind::Open => "OPEN",
            ErrorKind::Param => "PARAM",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Fs => "FS",
            ErrorKind::Response => "RESPONSE",
            ErrorKind::UserMsg => "USERMSG",
            ErrorKind::Canceled => "CANCELED",
            ErrorKind::Busy => "BUSY",
            ErrorKind::Sql => "SQL",
            ErrorKind::SqlDup => "SQLDUP",
            ErrorKind::Uv => "UV",
            ErrorKind::NoRaise => "NORAISE",
        };
        f.write_str(s)
    }
}

/// An error plus the trace of context strings accumulated as it propagated.
///
/// `UserMsg` errors are special: `user_message()` strips the `ERROR: ` prefix
/// and returns only the first line, which is the only part ever surfaced
/// across the wire to an IMAP client.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    msg: CompactString,
    trace: Vec<CompactString>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<CompactString>) -> Self {
        Error {
            kind,
            msg: msg.into(),
            trace: Vec::new(),
        }
    }

    /// Build a user-facing error. By convention the message is stored with
    /// the `ERROR: ` prefix so `user_message()` can strip it uniformly.
    pub fn user_msg(msg: impl fmt::Display) -> Self {
        Error::new(ErrorKind::UserMsg, format!("ERROR: {msg}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Push one more line of context onto the trace, innermost-first.
    #[must_use]
    pub fn trace(mut self, ctx: impl Into<CompactString>) -> Self {
        self.trace.push(ctx.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// The single line presentable to an end user: only the first line,
    /// with the `ERROR: ` prefix removed.
    pub fn user_message(&self) -> Option<&str> {
        if self.kind != ErrorKind::UserMsg {
            return None;
        }
        let first_line = self.msg.lines().next().unwrap_or(&self.msg);
        Some(first_line.strip_prefix("ERROR: ").unwrap_or(first_line))
    }

    pub fn trace_lines(&self) -> &[CompactString] {
        &self.trace
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)?;
        for line in self.trace.iter().rev() {
            write!(f, "\n  caused by: {line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::ConnectionReset | IoKind::ConnectionAborted | IoKind::BrokenPipe => {
                ErrorKind::Conn
            }
            IoKind::NotFound | IoKind::PermissionDenied => ErrorKind::Open,
            _ => ErrorKind::Os,
        };
        Error::new(kind, e.to_string())
    }
}

/// Helper equivalent to the source's `ORIG`: build-and-return an error in one
/// expression.
#[macro_export]
macro_rules! orig {
    ($kind:expr, $($arg:tt)*) => {
        $crate::Error::new($kind, format!($($arg)*))
    };
}
