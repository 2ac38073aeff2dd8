use std::time::Duration;

use regex::Regex;
use thiserror::Error;

lazy_static::lazy_static! {
    static ref FLOOD_WAIT: Regex =
        Regex::new(r"FLOOD_WAIT_(\d+)|FLOOD_WAIT.*?value: (\d+)").unwrap();
}

/// Failures reported by the session layer (MTProto account sessions).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Distinguished sign-in outcome: the account has a cloud password.
    #[error("two-step verification password required")]
    SecondFactorRequired,
    #[error("the login code is invalid or expired")]
    InvalidCode,
    #[error("the password is incorrect")]
    InvalidPassword,
    #[error("the phone number is invalid")]
    InvalidPhone,
    #[error("flood limit reached, retry in {0}s")]
    FloodWait(u32),
    #[error("session is not authorized, please login")]
    Unauthorized,
    #[error("chat not found: {0}")]
    ChatNotFound(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rpc(String),
}

impl ProviderError {
    /// Maps a raw RPC error rendering onto the taxonomy.
    pub fn classify(text: &str) -> Self {
        if let Some(secs) = extract_flood_wait(text) {
            return ProviderError::FloodWait(secs);
        }
        if text.contains("PHONE_NUMBER_INVALID") || text.contains("PHONE_NUMBER_BANNED") {
            return ProviderError::InvalidPhone;
        }
        if text.contains("PHONE_CODE_INVALID") || text.contains("PHONE_CODE_EXPIRED") {
            return ProviderError::InvalidCode;
        }
        if text.contains("SESSION_PASSWORD_NEEDED") {
            return ProviderError::SecondFactorRequired;
        }
        if text.contains("PASSWORD_HASH_INVALID") {
            return ProviderError::InvalidPassword;
        }
        if text.contains("AUTH_KEY_UNREGISTERED") || text.contains("SESSION_REVOKED") {
            return ProviderError::Unauthorized;
        }
        if text.contains("USERNAME_NOT_OCCUPIED")
            || text.contains("USERNAME_INVALID")
            || text.contains("PEER_ID_INVALID")
            || text.contains("CHANNEL_INVALID")
        {
            return ProviderError::ChatNotFound(text.to_string());
        }
        if text.contains("read 0 bytes")
            || text.contains("ConnectionReset")
            || text.contains("Connection lost")
        {
            return ProviderError::Connect(text.to_string());
        }
        ProviderError::Rpc(text.to_string())
    }
}

fn extract_flood_wait(error_str: &str) -> Option<u32> {
    FLOOD_WAIT
        .captures(error_str)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .and_then(|m| m.as_str().parse().ok())
}

/// Malformed user input. Never changes any state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid phone format, use +919999999999")]
    Phone,
    #[error("send the code like: code12345")]
    CodeFormat,
    #[error("interval must be a positive number of seconds, got {0:?}")]
    Interval(String),
    #[error("input must not be empty")]
    EmptyInput,
    #[error("{0:?} is not a chat id or public username (invite links are not supported)")]
    Chat(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt chat list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("database task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("already running")]
    AlreadyRunning,
    #[error("not running")]
    NotRunning,
    #[error("no chats configured")]
    NoChats,
    #[error("no message configured")]
    NoMessage,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A cycle failure outside per-destination handling. Retried after a backoff.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("session unavailable: {0}")]
    Session(#[from] ProviderError),
    #[error("configuration unavailable: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_flood_wait() {
        assert_eq!(extract_flood_wait("FLOOD_WAIT_31"), Some(31));
        assert_eq!(
            extract_flood_wait("rpc error 420: FLOOD_WAIT caused by auth.sendCode (value: 120)"),
            Some(120)
        );
        assert_eq!(extract_flood_wait("PEER_FLOOD"), None);
    }

    #[test]
    fn test_classify() {
        assert_eq!(ProviderError::classify("FLOOD_WAIT_12"), ProviderError::FloodWait(12));
        assert_eq!(
            ProviderError::classify("rpc error 400: PHONE_NUMBER_INVALID"),
            ProviderError::InvalidPhone
        );
        assert_eq!(
            ProviderError::classify("rpc error 401: SESSION_PASSWORD_NEEDED"),
            ProviderError::SecondFactorRequired
        );
        assert_eq!(
            ProviderError::classify("rpc error 401: AUTH_KEY_UNREGISTERED"),
            ProviderError::Unauthorized
        );
        assert!(matches!(ProviderError::classify("something odd"), ProviderError::Rpc(_)));
    }
}
