//! Key namespace shared by every backend:
//! `session:{session_id}` and `message:{session_id}:{message_id}`.

use crate::core::{MessageId, SessionId};
use once_cell::sync::Lazy;
use regex::Regex;

pub const SESSION_PREFIX: &str = "session:";
pub const MESSAGE_PREFIX: &str = "message:";

static KEY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:session:(?P<session>[^:]+)|message:(?P<owner>[^:]+):(?P<message>.+))$")
        .expect("valid key regex")
});

pub fn session_key(session_id: &SessionId) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

pub fn message_key(session_id: &SessionId, message_id: &MessageId) -> String {
    format!("{}{}:{}", MESSAGE_PREFIX, session_id, message_id)
}

/// Prefix matching every message key of one session
pub fn message_prefix(session_id: &SessionId) -> String {
    format!("{}{}:", MESSAGE_PREFIX, session_id)
}

/// A parsed persistence key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistKey {
    Session(SessionId),
    Message(SessionId, MessageId),
}

impl PersistKey {
    pub fn parse(key: &str) -> Option<Self> {
        let captures = KEY_PATTERN.captures(key)?;
        if let Some(session) = captures.name("session") {
            return Some(PersistKey::Session(session.as_str().into()));
        }
        match (captures.name("owner"), captures.name("message")) {
            (Some(owner), Some(message)) => Some(PersistKey::Message(
                owner.as_str().into(),
                message.as_str().into(),
            )),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            PersistKey::Session(session_id) => session_key(session_id),
            PersistKey::Message(session_id, message_id) => message_key(session_id, message_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_key() {
        assert_eq!(
            PersistKey::parse("session:abc"),
            Some(PersistKey::Session("abc".into()))
        );
    }

    #[test]
    fn test_parse_message_key_keeps_colons_in_message_id() {
        assert_eq!(
            PersistKey::parse("message:abc:msg:7"),
            Some(PersistKey::Message("abc".into(), "msg:7".into()))
        );
    }

    #[test]
    fn test_rejects_foreign_keys() {
        assert_eq!(PersistKey::parse("settings:theme"), None);
        assert_eq!(PersistKey::parse("session:"), None);
        assert_eq!(PersistKey::parse("message:abc"), None);
    }

    #[test]
    fn test_render_matches_helpers() {
        let key = PersistKey::Message("s".into(), "m".into());
        assert_eq!(key.render(), message_key(&"s".into(), &"m".into()));
        assert!(key.render().starts_with(&message_prefix(&"s".into())));
    }
}
