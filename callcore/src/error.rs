//! User-facing call error taxonomy.
//!
//! Every upstream failure (media device, signaling transport, SIP response,
//! WhatsApp Business API message) ends up as a [`CallError`] with one of the
//! closed [`ErrorCategory`] values before it reaches a consumer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PermissionDenied,
    DeviceUnavailable,
    TransportDisconnected,
    InvalidState,
    NegotiationFailed,
    RateLimited,
    Forbidden,
    NotFound,
    Busy,
    TemporarilyUnavailable,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::DeviceUnavailable => "device_unavailable",
            Self::TransportDisconnected => "transport_disconnected",
            Self::InvalidState => "invalid_state",
            Self::NegotiationFailed => "negotiation_failed",
            Self::RateLimited => "rate_limited",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized error shown to the user and kept in the diagnostic history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallError {
    pub category: ErrorCategory,
    pub title: String,
    pub message: String,
    /// HTTP or SIP status code, when the failure carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Daily call limit reported by a rate-limit error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Unix epoch seconds after which calling is allowed again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
    /// Fields the matching rule expected but could not parse.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<&'static str>,
    /// The upstream text this error was derived from.
    pub raw: String,
    pub occurred_at: DateTime<Utc>,
}

impl CallError {
    pub fn new(
        category: ErrorCategory,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            category,
            title: title.into(),
            raw: message.clone(),
            message,
            code: None,
            limit: None,
            retry_after: None,
            missing_fields: Vec::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::PermissionDenied,
            "Microphone Access Denied",
            "Microphone access is required for voice calls.",
        )
        .with_raw(detail)
    }

    pub fn device_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::DeviceUnavailable,
            "Microphone Unavailable",
            "No usable audio input device was found.",
        )
        .with_raw(detail)
    }

    pub fn transport_disconnected(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::TransportDisconnected,
            "Disconnected from server",
            "The signaling connection was lost.",
        )
        .with_raw(detail)
    }

    pub fn invalid_state(command: &str, state: impl fmt::Display) -> Self {
        Self::new(
            ErrorCategory::InvalidState,
            "Action Not Available",
            format!("Cannot {command} while the call is {state}."),
        )
    }

    pub fn negotiation_failed(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::NegotiationFailed,
            "Connection Failed",
            "The media connection could not be negotiated.",
        )
        .with_raw(detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            "Call Timeout",
            "The call attempt timed out. The recipient may be unreachable or there may be network issues.",
        )
        .with_raw(detail)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({}): {}", self.title, code, self.message),
            None => write!(f, "{}: {}", self.title, self.message),
        }
    }
}

pub const DEFAULT_ERROR_HISTORY: usize = 5;

/// Rolling window of the most recent errors, oldest first.
#[derive(Debug, Clone)]
pub struct ErrorHistory {
    entries: VecDeque<CallError>,
    capacity: usize,
}

impl Default for ErrorHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ERROR_HISTORY)
    }
}

impl ErrorHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, error: CallError) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(error);
    }

    pub fn latest(&self) -> Option<&CallError> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallError> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<CallError> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_last_five() {
        let mut history = ErrorHistory::default();
        for i in 0..7 {
            history.push(CallError::new(
                ErrorCategory::Unknown,
                "Call Failed",
                format!("failure {i}"),
            ));
        }

        assert_eq!(history.len(), 5);
        let messages: Vec<_> = history.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            ["failure 2", "failure 3", "failure 4", "failure 5", "failure 6"]
        );
        assert_eq!(history.latest().unwrap().message, "failure 6");
    }

    #[test]
    fn test_serialization_omits_absent_fields() {
        let err = CallError::new(ErrorCategory::Busy, "Line Busy (486)", "busy").with_code(486);
        let json = serde_json::to_value(&err).unwrap();

        assert_eq!(json["category"], "busy");
        assert_eq!(json["code"], 486);
        assert!(json.get("limit").is_none());
        assert!(json.get("retry_after").is_none());
        assert!(json.get("missing_fields").is_none());
    }

    #[test]
    fn test_display() {
        let err = CallError::invalid_state("mute", "idle");
        assert_eq!(err.category, ErrorCategory::InvalidState);
        assert_eq!(
            err.to_string(),
            "Action Not Available: Cannot mute while the call is idle."
        );
    }
}
