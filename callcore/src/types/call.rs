use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque call identifier issued by the remote signaling side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Phone-number-like identifier of the other party.
///
/// Only non-emptiness is validated; formatting is the backend's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteParty(String);

impl RemoteParty {
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits only, as used for `sip:+<digits>@domain` targets.
    pub fn digits(&self) -> String {
        self.0.chars().filter(|c| c.is_ascii_digit()).collect()
    }
}

impl fmt::Display for RemoteParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Formats an elapsed call duration as `mm:ss`.
///
/// Minutes are not wrapped at the hour; negative inputs clamp to `00:00`.
pub fn format_duration(elapsed: Duration) -> String {
    let total_secs = elapsed.num_seconds().max(0);
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;
    format!("{minutes:02}:{seconds:02}")
}

pub const ZERO_DURATION: &str = "00:00";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::milliseconds(125_000)), "02:05");
        assert_eq!(format_duration(Duration::milliseconds(999)), "00:00");
        assert_eq!(format_duration(Duration::seconds(3600 + 61)), "61:01");
        assert_eq!(format_duration(Duration::seconds(-5)), ZERO_DURATION);
    }

    #[test]
    fn test_remote_party_validation() {
        assert!(RemoteParty::parse("").is_none());
        assert!(RemoteParty::parse("   ").is_none());

        let party = RemoteParty::parse(" +91 97515-77309 ").unwrap();
        assert_eq!(party.as_str(), "+91 97515-77309");
        assert_eq!(party.digits(), "919751577309");
    }
}
