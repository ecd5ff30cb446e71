use crate::scan::ScanError;
use crate::token::TokenError;

/// The codec's own closed error set, distinct from the wider
/// `trc::ErrorKind`, since these three map directly onto what the DN
/// session tells the client (`BadSyntax` → tagged `BAD`, `LiteralTooBig` →
/// rejected before read, `Overlong` → parser buffer exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    BadSyntax,
    LiteralTooBig,
    Overlong,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CodecError::BadSyntax => "bad syntax",
            CodecError::LiteralTooBig => "literal too big",
            CodecError::Overlong => "line too long",
        };
        f.write_str(s)
    }
}

impl From<ScanError> for CodecError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::LiteralTooBig => CodecError::LiteralTooBig,
            ScanError::Overlong => CodecError::Overlong,
            ScanError::BadSyntax => CodecError::BadSyntax,
        }
    }
}

impl From<TokenError> for CodecError {
    fn from(_: TokenError) -> Self {
        CodecError::BadSyntax
    }
}
