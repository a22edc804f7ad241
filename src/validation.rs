//! Input validation: task content sanity checks and the conversation-history
//! rules a caller-supplied `TaskContext` must satisfy (§6).
//!
//! Grounded on the teacher's `validation.rs` `TaskContentValidator` for the
//! length-limit/dangerous-pattern-allowlist shape; the HTML-escaping step
//! it used is dropped along with `html_escape` since nothing in this crate
//! renders task content as HTML.

use crate::constants::{
    MAX_CONVERSATION_MESSAGES, MAX_CONVERSATION_TOTAL_BYTES, MAX_ORCHESTRATOR_MESSAGE_CHARS,
    MAX_USER_MESSAGE_CHARS, MIN_RETAINED_RECENT_MESSAGES,
};
use crate::error::{Result, SpiralError};
use crate::models::ConversationMessage;
use regex::Regex;
use std::collections::HashSet;

pub const MAX_TASK_CONTENT_LENGTH: usize = 10_000;
pub const MAX_CONTEXT_KEY_LENGTH: usize = 100;
pub const MAX_CONTEXT_VALUE_LENGTH: usize = 1_000;

static SAFE_TASK_CONTENT_REGEX: &str =
    r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "`del",
    "$(rm",
    "$(del",
    "';",
    "\";",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
    "c:\\windows\\system32",
];

#[derive(Debug, Clone)]
pub struct TaskContentValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl TaskContentValidator {
    pub fn new() -> Result<Self> {
        let safe_content_regex = Regex::new(SAFE_TASK_CONTENT_REGEX)
            .map_err(|e| SpiralError::ConfigurationError(format!("invalid regex pattern: {e}")))?;
        let dangerous_patterns = DANGEROUS_PATTERNS.iter().map(|s| s.to_lowercase()).collect();
        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    pub fn validate_task_content(&self, content: &str) -> Result<()> {
        if content.len() > MAX_TASK_CONTENT_LENGTH {
            return Err(SpiralError::InvalidArgument(format!(
                "task content exceeds maximum length of {MAX_TASK_CONTENT_LENGTH} characters"
            )));
        }
        if content.trim().is_empty() {
            return Err(SpiralError::InvalidArgument(
                "task content cannot be empty".to_string(),
            ));
        }
        self.reject_dangerous(content, "task content")?;
        if !self.safe_content_regex.is_match(content) {
            return Err(SpiralError::InvalidArgument(
                "task content contains invalid characters".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_context_key(&self, key: &str) -> Result<()> {
        if key.is_empty() || key.len() > MAX_CONTEXT_KEY_LENGTH {
            return Err(SpiralError::InvalidArgument(format!(
                "context key must be non-empty and under {MAX_CONTEXT_KEY_LENGTH} characters"
            )));
        }
        if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(SpiralError::InvalidArgument(
                "context keys may only contain alphanumeric characters and underscores".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_context_value(&self, value: &str) -> Result<()> {
        if value.len() > MAX_CONTEXT_VALUE_LENGTH {
            return Err(SpiralError::InvalidArgument(format!(
                "context value exceeds maximum length of {MAX_CONTEXT_VALUE_LENGTH} characters"
            )));
        }
        self.reject_dangerous(value, "context value")
    }

    fn reject_dangerous(&self, text: &str, label: &str) -> Result<()> {
        let lower = text.to_lowercase();
        if self.dangerous_patterns.iter().any(|p| lower.contains(p)) {
            return Err(SpiralError::InvalidArgument(format!(
                "{label} contains a disallowed pattern"
            )));
        }
        Ok(())
    }
}

impl Default for TaskContentValidator {
    fn default() -> Self {
        Self::new().expect("static regex must compile")
    }
}

/// Result of conversation-history validation: the (possibly truncated)
/// messages plus warnings and a human-readable summary of what changed.
pub struct ConversationValidationResult {
    pub messages: Vec<ConversationMessage>,
    pub warnings: Vec<String>,
    pub truncation_summary: Option<String>,
}

const VALID_ROLES: &[&str] = &["user", "assistant", "orchestrator"];

/// Applies the §6 conversation-history rules: caps the message count,
/// per-role character truncation, a 15KiB residual-size budget enforced by
/// dropping the oldest messages while keeping the most recent ones, and
/// warnings (never hard errors) for malformed entries.
pub fn validate_conversation_history(
    history: Vec<ConversationMessage>,
) -> Result<ConversationValidationResult> {
    if history.len() > MAX_CONVERSATION_MESSAGES {
        return Err(SpiralError::ConversationHistoryInvalid(format!(
            "conversation history has {} messages, exceeding the cap of {MAX_CONVERSATION_MESSAGES}",
            history.len()
        )));
    }

    let mut warnings = Vec::new();
    let mut messages: Vec<ConversationMessage> = Vec::with_capacity(history.len());

    for mut message in history {
        if message.content.trim().is_empty() {
            warnings.push(format!("dropped empty {} message", message.role));
            continue;
        }
        if !VALID_ROLES.contains(&message.role.as_str()) {
            warnings.push(format!("unknown role {:?}, kept as-is", message.role));
        }
        if message.timestamp.is_none() {
            warnings.push(format!("missing timestamp on a {} message, filled with now", message.role));
            message.timestamp = Some(chrono::Utc::now());
        }

        let limit = if message.role == "user" {
            MAX_USER_MESSAGE_CHARS
        } else {
            MAX_ORCHESTRATOR_MESSAGE_CHARS
        };
        if message.content.chars().count() > limit {
            message.content = truncate_chars(&message.content, limit);
            message.content.push_str(" [truncated]");
        }

        messages.push(message);
    }

    let mut truncation_summary = None;
    let total_bytes: usize = messages.iter().map(|m| m.content.len()).sum();
    if total_bytes > MAX_CONVERSATION_TOTAL_BYTES {
        let original_count = messages.len();
        let mut dropped = 0;
        while messages.len() > MIN_RETAINED_RECENT_MESSAGES
            && messages.iter().map(|m| m.content.len()).sum::<usize>() > MAX_CONVERSATION_TOTAL_BYTES
        {
            messages.remove(0);
            dropped += 1;
        }
        truncation_summary = Some(format!(
            "dropped {dropped} of {original_count} oldest messages to fit the {MAX_CONVERSATION_TOTAL_BYTES}-byte budget"
        ));
    }

    Ok(ConversationValidationResult {
        messages,
        warnings,
        truncation_summary,
    })
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_content_passes() {
        let validator = TaskContentValidator::new().unwrap();
        assert!(validator
            .validate_task_content("Create a hello world function in Rust")
            .is_ok());
    }

    #[test]
    fn script_injection_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        assert!(validator
            .validate_task_content("Create a function <script>alert('xss')</script>")
            .is_err());
    }

    #[test]
    fn command_injection_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        assert!(validator
            .validate_task_content("Create file && rm -rf /")
            .is_err());
    }

    #[test]
    fn empty_content_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        assert!(validator.validate_task_content("").is_err());
    }

    #[test]
    fn content_too_long_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        let long_content = "x".repeat(MAX_TASK_CONTENT_LENGTH + 1);
        assert!(validator.validate_task_content(&long_content).is_err());
    }

    #[test]
    fn invalid_context_keys_rejected() {
        let validator = TaskContentValidator::new().unwrap();
        for key in ["", "key with spaces", "key-with-dashes", "key/with/slashes"] {
            assert!(validator.validate_context_key(key).is_err(), "{key}");
        }
        assert!(validator.validate_context_key("project_type").is_ok());
    }

    fn msg(role: &str, content: &str) -> ConversationMessage {
        ConversationMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn over_cap_message_count_is_rejected() {
        let history = (0..60).map(|i| msg("user", &format!("msg {i}"))).collect();
        let result = validate_conversation_history(history);
        assert!(matches!(result, Err(SpiralError::ConversationHistoryInvalid(_))));
    }

    #[test]
    fn long_user_message_is_truncated() {
        let history = vec![msg("user", &"x".repeat(500))];
        let result = validate_conversation_history(history).unwrap();
        assert!(result.messages[0].content.len() < 500);
        assert!(result.messages[0].content.ends_with("[truncated]"));
    }

    #[test]
    fn empty_message_is_dropped_with_warning() {
        let history = vec![msg("user", "   "), msg("user", "hello")];
        let result = validate_conversation_history(history).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn oversized_total_drops_oldest_but_keeps_minimum_recent() {
        let history: Vec<ConversationMessage> = (0..10)
            .map(|i| msg("orchestrator", &"y".repeat(2000 + i)))
            .collect();
        let result = validate_conversation_history(history).unwrap();
        assert!(result.truncation_summary.is_some());
        assert!(result.messages.len() >= MIN_RETAINED_RECENT_MESSAGES);
    }

    #[test]
    fn missing_timestamp_is_filled_with_warning() {
        let history = vec![ConversationMessage {
            role: "user".to_string(),
            content: "hi".to_string(),
            timestamp: None,
        }];
        let result = validate_conversation_history(history).unwrap();
        assert!(result.messages[0].timestamp.is_some());
        assert!(!result.warnings.is_empty());
    }
}
