// src/message.rs
//! Source messages as handed over by the ingestion collaborator.
//!
//! The pipeline only reads `id`/`text` and writes the status triple
//! (`parse_status`, `error_reason`, `prompt_version`).

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable, globally unique message identifier.
///
/// Chat platforms hand out numeric snowflakes, but imported archives may carry
/// arbitrary strings; both are accepted. Numeric ids order numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new<S: Into<String>>(raw: S) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse::<u64>().ok()
    }

    /// Key in the per-message lock space.
    ///
    /// Numeric ids map directly (wrapping into i64 like a Postgres advisory key);
    /// anything else goes through the first 8 bytes of its SHA-256 digest.
    pub fn lock_key(&self) -> i64 {
        if let Some(n) = self.numeric() {
            return n as i64;
        }
        let digest = Sha256::digest(self.0.as_bytes());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(buf)
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::new(s)
    }
}

impl From<u64> for MessageId {
    fn from(n: u64) -> Self {
        MessageId(n.to_string())
    }
}

/// Per-message processing state.
///
/// `Pending` is the only non-terminal state. Terminal states are left only
/// through an explicit reset back to `Pending` (forced reprocessing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Pending,
    Ok,
    Error,
    Skipped,
    Noise,
}

impl ParseStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ParseStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Ok => "ok",
            ParseStatus::Error => "error",
            ParseStatus::Skipped => "skipped",
            ParseStatus::Noise => "noise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ParseStatus::Pending),
            "ok" => Some(ParseStatus::Ok),
            "error" => Some(ParseStatus::Error),
            "skipped" => Some(ParseStatus::Skipped),
            "noise" => Some(ParseStatus::Noise),
            _ => None,
        }
    }
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub parse_status: ParseStatus,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub prompt_version: Option<String>,
}

impl Message {
    /// Fresh message as the ingestion side would insert it.
    pub fn new<I, S>(id: I, channel: S, author: S, text: S, created_at: DateTime<Utc>) -> Self
    where
        I: Into<MessageId>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            channel: channel.into(),
            author: author.into(),
            text: text.into(),
            created_at,
            parse_status: ParseStatus::Pending,
            error_reason: None,
            prompt_version: None,
        }
    }
}

/// Short content fingerprint for logs; raw text is never logged.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_order_numerically() {
        let mut ids = vec![
            MessageId::from("10"),
            MessageId::from("9"),
            MessageId::from("abc"),
            MessageId::from("100"),
        ];
        ids.sort();
        let raw: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
        assert_eq!(raw, vec!["9", "10", "100", "abc"]);
    }

    #[test]
    fn lock_key_is_direct_for_numeric_and_stable_for_strings() {
        assert_eq!(MessageId::from(42u64).lock_key(), 42);
        let a = MessageId::from("import-7f3a").lock_key();
        let b = MessageId::from("import-7f3a").lock_key();
        assert_eq!(a, b);
        assert_ne!(a, MessageId::from("import-7f3b").lock_key());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            ParseStatus::Pending,
            ParseStatus::Ok,
            ParseStatus::Error,
            ParseStatus::Skipped,
            ParseStatus::Noise,
        ] {
            assert_eq!(ParseStatus::parse(s.as_str()), Some(s));
        }
        assert!(!ParseStatus::Pending.is_terminal());
        assert!(ParseStatus::Noise.is_terminal());
    }
}
