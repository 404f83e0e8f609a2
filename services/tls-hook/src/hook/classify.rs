//! First-bytes classification of a freshly accepted connection.
//!
//! A TLS connection opens with a record header:
//! - byte 0: content type (0x16 = Handshake)
//! - bytes 1-2: protocol version (major 0x03, minor 0x01..=0x04)
//!
//! Three bytes are enough to tell a ClientHello from `GET `, `POST`, `HEAD`
//! or any other plaintext a browser may send to the TLS port.

use std::time::Duration;

/// Number of leading bytes needed to decide.
pub const PEEK_LEN: usize = 3;

/// Default time to wait for the leading bytes.
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(3);

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Major byte shared by SSL 3.0 and every TLS version.
const VERSION_MAJOR: u8 = 0x03;

/// Record-layer minor versions accepted as TLS (1.0 through 1.3).
const VERSION_MINOR_MIN: u8 = 0x01;
const VERSION_MINOR_MAX: u8 = 0x04;

/// Result of classifying the leading bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// Bytes form a TLS handshake record header.
    Tls,
    /// Bytes cannot start a TLS handshake record.
    NotTls,
    /// Too few bytes to decide; the prefix is still consistent with TLS.
    Indeterminate,
}

impl RecordClass {
    /// Collapse `Indeterminate` into `NotTls`.
    ///
    /// An undecided connection is answered with a redirect rather than left
    /// hanging.
    pub fn resolve(self) -> Self {
        match self {
            RecordClass::Indeterminate => RecordClass::NotTls,
            other => other,
        }
    }

    /// Returns true for a TLS classification.
    pub fn is_tls(self) -> bool {
        self == RecordClass::Tls
    }
}

/// Classify up to [`PEEK_LEN`] leading bytes.
///
/// Bytes beyond the first three are ignored. A prefix that already deviates
/// from the TLS shape is `NotTls` without waiting for more data.
pub fn classify(peek: &[u8]) -> RecordClass {
    match peek {
        [] | [CONTENT_TYPE_HANDSHAKE] | [CONTENT_TYPE_HANDSHAKE, VERSION_MAJOR] => {
            RecordClass::Indeterminate
        }
        [CONTENT_TYPE_HANDSHAKE, VERSION_MAJOR, minor, ..]
            if (VERSION_MINOR_MIN..=VERSION_MINOR_MAX).contains(minor) =>
        {
            RecordClass::Tls
        }
        _ => RecordClass::NotTls,
    }
}
