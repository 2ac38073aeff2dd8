use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A destination chat as the user typed it: a numeric id or a public handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatRef(String);

/// How a [`ChatRef`] is looked up on the account side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerTarget {
    Username(String),
    /// Bare id: `-100` channel prefix and `-` group sign already stripped.
    Id(i64),
}

impl ChatRef {
    /// Normalizes `@name`, `https://t.me/name`, `t.me/name` and numeric ids.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let handle = trimmed
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("t.me/")
            .trim_start_matches('@')
            .trim_end_matches('/');
        if handle.is_empty() || handle.chars().any(char::is_whitespace) {
            return Err(ValidationError::EmptyInput);
        }
        // `t.me/+hash` and `t.me/joinchat/hash` are invite links, not handles
        if handle.starts_with('+') || handle.contains('/') {
            return Err(ValidationError::Chat(trimmed.to_string()));
        }
        if handle.parse::<i64>().is_ok() {
            return Ok(ChatRef(handle.to_string()));
        }
        Ok(ChatRef(format!("@{}", handle)))
    }

    /// Wraps a value that was normalized by [`ChatRef::parse`] before it was persisted.
    pub(crate) fn from_stored(raw: String) -> Self {
        ChatRef(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn target(&self) -> PeerTarget {
        match self.0.parse::<i64>() {
            Ok(id) => {
                let text = id.to_string();
                let bare = match text.strip_prefix("-100") {
                    Some(rest) if !rest.is_empty() => rest.parse().unwrap_or(id),
                    _ => id.abs(),
                };
                PeerTarget::Id(bare)
            }
            Err(_) => PeerTarget::Username(self.0.trim_start_matches('@').to_string()),
        }
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
