//! Provider error payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

use super::PayloadFormat;
use crate::ErrorKind;

/// One entry of a provider error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Provider error code, e.g. `INVALID_FIELD`.
    #[serde(rename = "errorCode")]
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Fields the error refers to.
    #[serde(default)]
    pub fields: BTreeSet<String>,
}

/// Decoded non-2xx REST response.
///
/// Built from the response body when it holds a provider error list in the negotiated
/// format; otherwise holds a single entry with the status code and reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code.
    pub status: u16,
    /// Error entries in the order the provider sent them.
    pub entries: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
struct XmlErrors {
    #[serde(rename = "Error", default)]
    errors: Vec<XmlErrorEntry>,
}

#[derive(Deserialize)]
struct XmlErrorEntry {
    #[serde(rename = "errorCode")]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    fields: Vec<String>,
}

impl From<XmlErrorEntry> for ErrorEntry {
    fn from(entry: XmlErrorEntry) -> Self {
        ErrorEntry {
            code: entry.code,
            message: entry.message,
            fields: entry.fields.into_iter().collect(),
        }
    }
}

impl ApiError {
    /// Decodes an error body, falling back to `{status, reason}`.
    pub fn decode(status: u16, reason: &str, body: &[u8], format: PayloadFormat) -> Self {
        if body.is_empty() {
            return Self::from_reason(status, reason);
        }

        match parse_entries(body, format) {
            Ok(entries) if !entries.is_empty() => ApiError { status, entries },
            Ok(_) => Self::from_reason(status, reason),
            Err(e) => {
                warn!(
                    status,
                    format = ?format,
                    error = %e,
                    "undecodable error body, using reason phrase"
                );
                Self::from_reason(status, reason)
            }
        }
    }

    /// Builds an error carrying only the status code and reason phrase.
    pub fn from_reason(status: u16, reason: &str) -> Self {
        ApiError {
            status,
            entries: vec![ErrorEntry {
                code: status.to_string(),
                message: reason.to_string(),
                fields: BTreeSet::new(),
            }],
        }
    }

    /// Returns `true` if any entry carries `code`.
    pub fn has_code(&self, code: &str) -> bool {
        self.entries.iter().any(|e| e.code == code)
    }

    /// Classifies this error by status code.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_status(self.status)
    }
}

fn parse_entries(
    body: &[u8],
    format: PayloadFormat,
) -> Result<Vec<ErrorEntry>, Box<dyn std::error::Error + Send + Sync>> {
    match format {
        PayloadFormat::Json => Ok(serde_json::from_slice::<Vec<ErrorEntry>>(body)?),
        PayloadFormat::Xml => {
            let text = std::str::from_utf8(body)?;
            let document: XmlErrors = quick_xml::de::from_str(text)?;
            Ok(document.errors.into_iter().map(ErrorEntry::from).collect())
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.status)?;
        for (i, entry) in self.entries.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {}", entry.code, entry.message)?;
            if !entry.fields.is_empty() {
                let fields: Vec<&str> = entry.fields.iter().map(String::as_str).collect();
                write!(f, " [{}]", fields.join(", "))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}
