//! Classification of raw upstream failure text into [`CallError`]s.
//!
//! Rules are evaluated in order and the first match wins. The table is plain
//! data so new detectors can be added without touching the control flow.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CallError, ErrorCategory};

const RATE_LIMIT_MARKER: &str = "Business initiated calls daily limit hit";

static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"limit: (\d+)").expect("valid regex"));
static NEXT_ALLOWED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Next allowed unix epoch time in seconds: (\d+)").expect("valid regex")
});

/// A single ordered detector in the classification table.
#[derive(Clone, Copy)]
pub struct ClassifierRule {
    pub name: &'static str,
    pub category: ErrorCategory,
    pub matches: fn(&str, Option<u16>) -> bool,
    pub build: fn(&str, Option<u16>) -> CallError,
}

impl std::fmt::Debug for ClassifierRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierRule")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

fn has_status(raw: &str, code: Option<u16>, status: u16) -> bool {
    code == Some(status) || raw.contains(&status.to_string())
}

/// The status code to report: the one we were given, or the one found in the text.
fn reported_code(raw: &str, code: Option<u16>, status: u16) -> Option<u16> {
    code.or_else(|| raw.contains(&status.to_string()).then_some(status))
}

fn is_rate_limit(raw: &str, _code: Option<u16>) -> bool {
    raw.contains(RATE_LIMIT_MARKER)
}

fn build_rate_limit(raw: &str, code: Option<u16>) -> CallError {
    let limit = LIMIT_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());
    let retry_after = NEXT_ALLOWED_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok());

    let message = match limit {
        Some(limit) => {
            format!("You've reached the daily limit of {limit} business-initiated calls.")
        }
        None => "You've reached the daily limit of business-initiated calls (limit unknown)."
            .to_string(),
    };

    let mut err = CallError::new(
        ErrorCategory::RateLimited,
        "WhatsApp Daily Call Limit Exceeded",
        message,
    )
    .with_raw(raw);
    err.code = code;
    err.limit = limit;
    err.retry_after = retry_after;
    if limit.is_none() {
        err.missing_fields.push("limit");
    }
    if retry_after.is_none() {
        err.missing_fields.push("retry_after");
    }
    err
}

fn is_forbidden(raw: &str, code: Option<u16>) -> bool {
    has_status(raw, code, 403) || raw.contains("Forbidden")
}

fn build_forbidden(raw: &str, code: Option<u16>) -> CallError {
    // Q.850 cause 21 means the callee side rejected the call.
    let (title, message) = if raw.contains("Q.850") || raw.contains("cause=21") {
        (
            "Call Rejected (403)",
            "The call was rejected by the recipient or due to service restrictions. This may be due to WhatsApp business call limits, user privacy settings, or network restrictions.",
        )
    } else {
        (
            "Call Forbidden (403)",
            "Call not permitted. This could be due to daily call limits, account restrictions, or recipient settings.",
        )
    };
    let mut err = CallError::new(ErrorCategory::Forbidden, title, message).with_raw(raw);
    err.code = code.or(Some(403));
    err
}

fn is_not_found(raw: &str, code: Option<u16>) -> bool {
    has_status(raw, code, 404)
}

fn build_not_found(raw: &str, code: Option<u16>) -> CallError {
    let mut err = CallError::new(
        ErrorCategory::NotFound,
        "Number Not Found (404)",
        "The number you're trying to reach is not available or doesn't exist.",
    )
    .with_raw(raw);
    err.code = reported_code(raw, code, 404);
    err
}

fn is_busy(raw: &str, code: Option<u16>) -> bool {
    has_status(raw, code, 486) || raw.contains("Busy")
}

fn build_busy(raw: &str, code: Option<u16>) -> CallError {
    let mut err = CallError::new(
        ErrorCategory::Busy,
        "Line Busy (486)",
        "The person you're calling is currently busy.",
    )
    .with_raw(raw);
    err.code = reported_code(raw, code, 486);
    err
}

fn is_unavailable(raw: &str, code: Option<u16>) -> bool {
    has_status(raw, code, 480) || raw.contains("Temporarily Unavailable")
}

fn build_unavailable(raw: &str, code: Option<u16>) -> CallError {
    let mut err = CallError::new(
        ErrorCategory::TemporarilyUnavailable,
        "Temporarily Unavailable (480)",
        "The person you're calling is temporarily unavailable.",
    )
    .with_raw(raw);
    err.code = reported_code(raw, code, 480);
    err
}

fn is_timeout(raw: &str, code: Option<u16>) -> bool {
    raw.contains("timeout") || raw.contains("Timeout") || code == Some(408)
}

fn build_timeout(raw: &str, code: Option<u16>) -> CallError {
    let mut err = CallError::timeout(raw);
    err.code = code;
    err
}

/// Built-in detectors, in evaluation order.
pub static DEFAULT_RULES: &[ClassifierRule] = &[
    ClassifierRule {
        name: "whatsapp_rate_limit",
        category: ErrorCategory::RateLimited,
        matches: is_rate_limit,
        build: build_rate_limit,
    },
    ClassifierRule {
        name: "forbidden",
        category: ErrorCategory::Forbidden,
        matches: is_forbidden,
        build: build_forbidden,
    },
    ClassifierRule {
        name: "not_found",
        category: ErrorCategory::NotFound,
        matches: is_not_found,
        build: build_not_found,
    },
    ClassifierRule {
        name: "busy",
        category: ErrorCategory::Busy,
        matches: is_busy,
        build: build_busy,
    },
    ClassifierRule {
        name: "temporarily_unavailable",
        category: ErrorCategory::TemporarilyUnavailable,
        matches: is_unavailable,
        build: build_unavailable,
    },
    ClassifierRule {
        name: "timeout",
        category: ErrorCategory::Timeout,
        matches: is_timeout,
        build: build_timeout,
    },
];

/// Ordered rule table with an `Unknown` fallback.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassifierRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
        }
    }
}

impl Classifier {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Inserts a rule ahead of all existing ones.
    pub fn with_priority_rule(mut self, rule: ClassifierRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Appends a rule after all existing ones.
    pub fn with_rule(mut self, rule: ClassifierRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, raw: &str, code: Option<u16>) -> CallError {
        for rule in &self.rules {
            if (rule.matches)(raw, code) {
                return (rule.build)(raw, code);
            }
        }

        let message = if raw.is_empty() {
            "An unknown error occurred during the call attempt.".to_string()
        } else {
            raw.to_string()
        };
        let mut err = CallError::new(ErrorCategory::Unknown, "Call Failed", message).with_raw(raw);
        err.code = code;
        err
    }
}

static DEFAULT_CLASSIFIER: Lazy<Classifier> = Lazy::new(Classifier::default);

/// Classifies with the built-in rule table.
pub fn classify(raw: &str, code: Option<u16>) -> CallError {
    DEFAULT_CLASSIFIER.classify(raw, code)
}
