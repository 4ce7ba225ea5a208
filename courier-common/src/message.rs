//! The outbound message envelope
//!
//! The dispatcher treats the content as opaque; only the recipients are
//! inspected, to derive the key handed to the rate limiter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single transactional message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Locally assigned identifier, used for log correlation
    #[serde(default = "new_id")]
    pub id: String,

    /// Envelope sender
    pub from: String,

    /// Envelope recipients
    pub to: Vec<String>,

    pub subject: String,

    /// Plain text body
    #[serde(default)]
    pub text: String,

    /// Optional HTML alternative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    /// Additional headers, passed through verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

impl Message {
    /// Create a message with a freshly generated identifier
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: impl IntoIterator<Item = impl Into<String>>,
        subject: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
            subject: subject.into(),
            text: text.into(),
            html: None,
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Key used for admission control: the lowercased domain of the first
    /// recipient, or `"unknown"` when there is none.
    #[must_use]
    pub fn recipient_key(&self) -> String {
        self.to
            .first()
            .and_then(|rcpt| rcpt.rsplit_once('@'))
            .map_or_else(
                || "unknown".to_string(),
                |(_, domain)| domain.trim_end_matches('>').to_ascii_lowercase(),
            )
    }

    /// Render the message as RFC 5322 text with CRLF line endings.
    ///
    /// Lines starting with a dot are dot-stuffed so the result can be written
    /// straight into an SMTP DATA section.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.from));
        out.push_str(&format!("To: {}\r\n", self.to.join(", ")));
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str(&format!("Message-ID: <{}@courier>\r\n", self.id));
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str("\r\n");

        for line in self.text.lines() {
            if line.starts_with('.') {
                out.push('.');
            }
            out.push_str(line);
            out.push_str("\r\n");
        }

        out
    }
}
