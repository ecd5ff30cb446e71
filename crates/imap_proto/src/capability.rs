/// Base capability string with `XKEY` appended iff the key-extension module
/// is loaded.
pub fn capability_string(xkey_loaded: bool) -> String {
    if xkey_loaded {
        "IMAP4rev1 XKEY".to_string()
    } else {
        "IMAP4rev1".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_xkey_when_loaded() {
        assert_eq!(capability_string(true), "IMAP4rev1 XKEY");
        assert_eq!(capability_string(false), "IMAP4rev1");
    }
}
