//! Message type naming convention: `domain.action.vN`.
//!
//! Recommended families are `channel.<provider>.<action>.vN`,
//! `agent.<action>.vN`, `system.<action>.vN` and
//! `plugin.<domain>.<action>.vN`. The convention is not enforced by the
//! dispatcher; these helpers only validate and build names.

use std::sync::LazyLock;

use regex::Regex;

static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z][a-z0-9_-]*$").expect("valid segment regex"));
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v([1-9][0-9]*)$").expect("valid version regex"));

/// A parsed message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageType {
    /// Every segment before the version, e.g. `["channel", "lark", "message"]`.
    pub segments: Vec<String>,
    pub version: u32,
}

impl MessageType {
    /// First segment, e.g. `channel`.
    pub fn domain(&self) -> &str {
        &self.segments[0]
    }
}

/// Parse a type name; `None` if it does not follow the convention.
pub fn parse(message_type: &str) -> Option<MessageType> {
    let parts: Vec<&str> = message_type.split('.').collect();
    let (version, segments) = parts.split_last()?;
    if segments.len() < 2 || !segments.iter().all(|s| SEGMENT.is_match(s)) {
        return None;
    }
    let version = VERSION.captures(version)?.get(1)?.as_str().parse().ok()?;
    Some(MessageType {
        segments: segments.iter().map(|s| s.to_string()).collect(),
        version,
    })
}

/// Whether `message_type` follows the naming grammar.
pub fn is_valid(message_type: &str) -> bool {
    parse(message_type).is_some()
}

/// `channel.<provider>.<action>.v<version>`
pub fn channel(provider: &str, action: &str, version: u32) -> String {
    format!("channel.{provider}.{action}.v{version}")
}

/// `agent.<action>.v<version>`
pub fn agent(action: &str, version: u32) -> String {
    format!("agent.{action}.v{version}")
}

/// `system.<action>.v<version>`
pub fn system(action: &str, version: u32) -> String {
    format!("system.{action}.v{version}")
}

/// `plugin.<domain>.<action>.v<version>`
pub fn plugin(domain: &str, action: &str, version: u32) -> String {
    format!("plugin.{domain}.{action}.v{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_conventional_names() {
        assert!(is_valid("agent.chat.v1"));
        assert!(is_valid("channel.lark.message_received.v2"));
        assert!(is_valid("plugin.knowledge.index-doc.v10"));
        assert!(is_valid("System.Local_Task.v1"));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(!is_valid("agent.v1"));
        assert!(!is_valid("agent.chat"));
        assert!(!is_valid("agent.chat.v0"));
        assert!(!is_valid("agent.chat.V1"));
        assert!(!is_valid("agent.1chat.v1"));
        assert!(!is_valid("agent..v1"));
        assert!(!is_valid(""));
    }

    #[test]
    fn parses_segments_and_version() {
        let parsed = parse("channel.lark.message.v3").unwrap();
        assert_eq!(parsed.domain(), "channel");
        assert_eq!(parsed.segments, vec!["channel", "lark", "message"]);
        assert_eq!(parsed.version, 3);
    }

    #[test]
    fn builders_produce_valid_names() {
        assert_eq!(channel("lark", "message", 1), "channel.lark.message.v1");
        assert_eq!(agent("chat", 2), "agent.chat.v2");
        assert_eq!(system("local_task", 1), "system.local_task.v1");
        assert_eq!(plugin("kb", "sync", 1), "plugin.kb.sync.v1");
        assert!(is_valid(&plugin("kb", "sync", 1)));
    }
}
