//! Log redaction helpers.
//!
//! Fingerprints are public identifiers but still get shortened in logs to
//! keep traffic analysis of log files uninteresting; key material never
//! appears at all.

use std::fmt;

/// Shows only the first four characters of a fingerprint.
pub struct ShortFp<'a>(pub &'a str);

impl fmt::Display for ShortFp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() >= 4 {
            write!(f, "{}…", &self.0[..4])
        } else {
            write!(f, "[short fp]")
        }
    }
}

impl fmt::Debug for ShortFp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Replaces any value with `[REDACTED]` when formatted.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Shows only the length of a byte slice.
pub struct ByteLen<'a>(pub &'a [u8]);

impl fmt::Display for ByteLen<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for ByteLen<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_fp_truncates() {
        assert_eq!(format!("{}", ShortFp("3a91bc04d2e7f015")), "3a91…");
        assert_eq!(format!("{}", ShortFp("ab")), "[short fp]");
    }

    #[test]
    fn redacted_hides_value() {
        assert_eq!(format!("{}", Redacted("secret key bytes")), "[REDACTED]");
        assert_eq!(format!("{:?}", Redacted(42)), "[REDACTED]");
    }

    #[test]
    fn byte_len_shows_only_length() {
        assert_eq!(format!("{}", ByteLen(&[1, 2, 3])), "[3 bytes]");
    }
}
