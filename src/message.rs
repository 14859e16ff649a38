//! Raw message handling.
//!
//! Messages come out of public-inbox commits as raw RFC 5322 bytes with
//! Unix line endings. [`RawMessage`] wraps those bytes, parses headers
//! lazily with `mailparse`, normalizes line endings to CRLF for mail
//! protocols, and can inject a provenance trace header on the way out.

use std::cell::OnceCell;

use chrono::Utc;
use mailparse::MailHeaderMap;

/// Physical line limit for the folded trace header.
const TRACE_FOLD_WIDTH: usize = 75;

#[derive(Default)]
struct ParsedHeaders {
    message_id: Option<String>,
    from: Option<String>,
    subject: Option<String>,
}

/// Immutable wrapper for raw email bytes with lazy header extraction.
///
/// Header values are extracted on first access and cached. A message
/// that fails to parse yields absent headers, never an error.
pub struct RawMessage {
    raw: Vec<u8>,
    headers: OnceCell<ParsedHeaders>,
}

impl RawMessage {
    pub fn new(raw: Vec<u8>) -> Self {
        Self {
            raw,
            headers: OnceCell::new(),
        }
    }

    /// The untouched raw bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn headers(&self) -> &ParsedHeaders {
        self.headers.get_or_init(|| {
            let Ok(parsed) = mailparse::parse_mail(&self.raw) else {
                return ParsedHeaders::default();
            };
            ParsedHeaders {
                message_id: parsed
                    .headers
                    .get_first_value("Message-ID")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
                from: parsed
                    .headers
                    .get_first_value("From")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
                subject: parsed
                    .headers
                    .get_first_value("Subject")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
            }
        })
    }

    /// The stripped Message-ID header (angle brackets included), if any.
    pub fn message_id(&self) -> Option<&str> {
        self.headers().message_id.as_deref()
    }

    /// The raw From header value, if any.
    pub fn from_header(&self) -> Option<&str> {
        self.headers().from.as_deref()
    }

    /// The Subject header, or a placeholder for state files.
    pub fn subject_or_default(&self) -> &str {
        self.headers().subject.as_deref().unwrap_or("(no subject)")
    }

    /// The Message-ID, or a placeholder for state files.
    pub fn message_id_or_default(&self) -> &str {
        self.headers()
            .message_id
            .as_deref()
            .unwrap_or("(no message-id)")
    }

    /// Message bytes ready for transmission to a target.
    ///
    /// Line endings are normalized to CRLF: CRLF is first collapsed to
    /// LF, then every LF is expanded back, so the operation is
    /// idempotent and mixed input cannot produce CR-CR-LF. When both
    /// `feed_name` and `delivery_name` are given, an
    /// `X-Korgalore-Trace` header is inserted immediately before the
    /// header/body separator, folded so no physical line exceeds 75
    /// characters.
    pub fn as_bytes(&self, feed_name: Option<&str>, delivery_name: Option<&str>) -> Vec<u8> {
        let mut out = normalize_crlf(&self.raw);

        if let (Some(feed), Some(delivery)) = (feed_name, delivery_name) {
            let header = fold_trace_header(&trace_header_value(feed, delivery));
            out = inject_header(out, &header);
        }

        out
    }
}

/// Collapse CRLF to LF, then expand every LF to CRLF.
fn normalize_crlf(raw: &[u8]) -> Vec<u8> {
    let mut lf = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\r' && raw.get(i + 1) == Some(&b'\n') {
            lf.push(b'\n');
            i += 2;
        } else {
            lf.push(raw[i]);
            i += 1;
        }
    }

    let mut out = Vec::with_capacity(lf.len() + lf.len() / 16);
    for b in lf {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

fn trace_header_value(feed: &str, delivery: &str) -> String {
    format!(
        "X-Korgalore-Trace: from feed={} for delivery={}; v{}; {}",
        feed,
        delivery,
        crate::VERSION,
        Utc::now().to_rfc2822()
    )
}

/// Fold a header at word boundaries; continuation lines begin with a
/// single space.
fn fold_trace_header(header: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in header.split(' ') {
        if current.is_empty() {
            current.push_str(word);
            continue;
        }
        if current.len() + 1 + word.len() > TRACE_FOLD_WIDTH {
            lines.push(current);
            current = format!(" {}", word);
        } else {
            current.push(' ');
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    lines.join("\r\n")
}

/// Insert a folded header line before the header/body separator of an
/// already CRLF-normalized message. Messages without a separator get
/// the header appended after the existing headers.
fn inject_header(message: Vec<u8>, header: &str) -> Vec<u8> {
    let separator = b"\r\n\r\n";
    let pos = message
        .windows(separator.len())
        .position(|w| w == separator);

    let mut out = Vec::with_capacity(message.len() + header.len() + 4);
    match pos {
        Some(idx) => {
            // Keep the terminating CRLF of the last header line, then
            // add ours ahead of the blank separator line.
            out.extend_from_slice(&message[..idx + 2]);
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&message[idx + 2..]);
        }
        None => {
            out.extend_from_slice(&message);
            if !out.ends_with(b"\r\n") {
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out
}
