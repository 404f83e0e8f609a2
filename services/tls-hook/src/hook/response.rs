//! Synthetic HTTP redirect sent to plaintext clients on the TLS port.
//!
//! Response layout:
//! ```text
//! HTTP/1.1 302 Found\r\n
//! Location: https://<local addr><path>\r\n
//! Date: <RFC 1123>\r\n
//! <extra headers>\r\n
//! Content-Length: <body len>\r\n
//! \r\n
//! <body>
//! ```

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use http::{HeaderName, HeaderValue, StatusCode};
use tracing::warn;

use crate::error::ConfigError;

/// Status sent when none is configured.
pub const DEFAULT_STATUS: u16 = 302;

/// Path appended to the redirect URL when none is configured.
pub const DEFAULT_REDIRECT_PATH: &str = "/";

/// Placeholder replaced by the redirect URL in body templates.
pub const URL_PLACEHOLDER: &str = "%s";

/// Body used when no template is configured.
pub const DEFAULT_BODY_TEMPLATE: &str = "<html><head><meta http-equiv=\"refresh\" content=\"0;url=%s\"></head>\
<body><script>location.protocol='https:'</script></body></html>";

const HTTP_VERSION: &str = "HTTP/1.1";
const CRLF: &str = "\r\n";

/// RFC 1123 date as used in HTTP `Date` headers.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// How the redirect response is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConfig {
    /// Path of the https:// URL clients are sent to.
    pub redirect_path: String,
    /// Body template; `%s` is replaced by the URL. Empty selects the built-in body.
    pub body_template: String,
    /// Status code; 0 selects [`DEFAULT_STATUS`].
    pub status_code: u16,
    /// Headers added in order. `Location` and `Date` here replace the computed values.
    pub extra_headers: Vec<(String, String)>,
    /// Complete response sent verbatim (after `%s` substitution) instead of a built one.
    pub raw_response: Option<String>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            redirect_path: DEFAULT_REDIRECT_PATH.to_string(),
            body_template: String::new(),
            status_code: 0,
            extra_headers: Vec::new(),
            raw_response: None,
        }
    }
}

impl RedirectConfig {
    /// Check status code, redirect path and header syntax.
    ///
    /// A configured `Content-Length` is not an error but is never sent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.status_code != 0 && StatusCode::from_u16(self.status_code).is_err() {
            return Err(ConfigError::InvalidStatus(self.status_code));
        }

        // The path lands in the Location header and the URL
        if self
            .redirect_path
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(ConfigError::InvalidRedirectPath(self.redirect_path.clone()));
        }

        for (name, value) in &self.extra_headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(ConfigError::InvalidHeaderName(name.clone()));
            }
            if HeaderValue::from_str(value).is_err() {
                return Err(ConfigError::InvalidHeaderValue { name: name.clone() });
            }
            if name.eq_ignore_ascii_case("content-length") {
                warn!(header = %name, "Configured Content-Length is ignored; it is computed from the body");
            }
        }

        Ok(())
    }

    /// Effective status code.
    pub fn status(&self) -> u16 {
        if self.status_code == 0 {
            DEFAULT_STATUS
        } else {
            self.status_code
        }
    }

    /// URL the client is redirected to, built from the address it connected to.
    pub fn redirect_url(&self, local_addr: SocketAddr) -> String {
        if self.redirect_path.starts_with('/') {
            format!("https://{}{}", local_addr, self.redirect_path)
        } else {
            format!("https://{}/{}", local_addr, self.redirect_path)
        }
    }

    /// Build the response bytes, stamped with the current time.
    pub fn build(&self, local_addr: SocketAddr) -> Vec<u8> {
        self.build_at(local_addr, Utc::now())
    }

    /// Build the response bytes with an explicit `Date`.
    pub fn build_at(&self, local_addr: SocketAddr, now: DateTime<Utc>) -> Vec<u8> {
        let url = self.redirect_url(local_addr);

        if let Some(raw) = &self.raw_response {
            return raw.replace(URL_PLACEHOLDER, &url).into_bytes();
        }

        let template = if self.body_template.is_empty() {
            DEFAULT_BODY_TEMPLATE
        } else {
            self.body_template.as_str()
        };
        let body = template.replace(URL_PLACEHOLDER, &url);

        let mut location = url;
        let mut date = now.format(HTTP_DATE_FORMAT).to_string();
        let mut extra = Vec::with_capacity(self.extra_headers.len());
        for (name, value) in &self.extra_headers {
            if name.eq_ignore_ascii_case("location") {
                location = value.clone();
            } else if name.eq_ignore_ascii_case("date") {
                date = value.clone();
            } else if !name.eq_ignore_ascii_case("content-length") {
                extra.push((name.as_str(), value.as_str()));
            }
        }

        let status = self.status();
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");

        let mut head = String::with_capacity(256);
        head.push_str(&format!("{} {} {}{}", HTTP_VERSION, status, reason, CRLF));
        push_header(&mut head, "Location", &location);
        push_header(&mut head, "Date", &date);
        for (name, value) in extra {
            push_header(&mut head, name, value);
        }
        push_header(&mut head, "Content-Length", &body.len().to_string());
        head.push_str(CRLF);

        let mut out = head.into_bytes();
        out.extend_from_slice(body.as_bytes());
        out
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str(CRLF);
}
