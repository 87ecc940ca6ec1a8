//! Classify bridge bot notices as success replies, error replies, or noise.
//!
//! Matching is loose: any line starting with `Failed ...:` is an error, any
//! `... chat with <name> (!room:server)` is a success. A message that fits both
//! shapes is an error.

use once_cell::sync::Lazy;
use regex::Regex;

static DEFAULT_ERROR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Failed[^:\n]*:\s*(.+?)\s*$").unwrap());

static DEFAULT_SUCCESS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)chat with .+? \((![^)\s]+)\)").unwrap());

/// Outcome of matching one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Irrelevant,
    /// Captured conversation id (e.g. `!abc:example.com`).
    Success(String),
    /// Captured failure reason.
    Failure(String),
}

/// Error and success rules for one channel. Both patterns use capture group 1 as the payload.
#[derive(Debug, Clone)]
pub struct ReplyMatcher {
    error: Regex,
    success: Regex,
}

impl Default for ReplyMatcher {
    fn default() -> Self {
        Self {
            error: (*DEFAULT_ERROR_PATTERN).clone(),
            success: (*DEFAULT_SUCCESS_PATTERN).clone(),
        }
    }
}

impl ReplyMatcher {
    /// Build a matcher, replacing either default pattern with a custom one.
    pub fn with_patterns(error: Option<&str>, success: Option<&str>) -> Result<Self, regex::Error> {
        let mut m = Self::default();
        if let Some(p) = error {
            m.error = Regex::new(p)?;
        }
        if let Some(p) = success {
            m.success = Regex::new(p)?;
        }
        Ok(m)
    }

    pub fn classify(&self, body: &str) -> Classification {
        if let Some(reason) = capture(&self.error, body) {
            return Classification::Failure(reason);
        }
        if let Some(id) = capture(&self.success, body) {
            return Classification::Success(id);
        }
        Classification::Irrelevant
    }
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    let caps = re.captures(body)?;
    let m = caps.get(1).or_else(|| caps.get(0))?;
    Some(m.as_str().to_string())
}
