use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    /// Chat role name used by reply services
    pub fn as_role(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Agent => "assistant",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "Driver"),
            Speaker::Agent => write!(f, "Host"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Speaker,
    pub text: String,
    pub spoken_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Speaker, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            spoken_at: Utc::now(),
        }
    }
}

/// Append-only, ordered record of a conversation
#[derive(Debug, Clone, Default)]
pub struct TurnLog {
    turns: Vec<Turn>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn last_speaker(&self) -> Option<Speaker> {
        self.turns.last().map(|t| t.role)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut log = TurnLog::new();
        log.append(Turn::new(Speaker::User, "hi"));
        log.append(Turn::new(Speaker::Agent, "hello"));

        assert_eq!(log.len(), 2);
        assert_eq!(log.turns()[0].text, "hi");
        assert_eq!(log.last_speaker(), Some(Speaker::Agent));
    }

    #[test]
    fn test_roles() {
        assert_eq!(Speaker::User.as_role(), "user");
        assert_eq!(Speaker::Agent.as_role(), "assistant");
    }

    #[test]
    fn test_clear() {
        let mut log = TurnLog::new();
        log.append(Turn::new(Speaker::User, "hi"));
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.last(), None);
    }
}
