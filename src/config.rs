use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

/// Process-wide settings, read once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub api_id: i32,
    pub api_hash: String,
    pub database_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub default_interval_secs: u64,
    pub provider_timeout: Duration,
    pub retry_backoff: Duration,
    /// `None` disables login expiry.
    pub auth_timeout: Option<Duration>,
    /// `None` means unlimited attempts per login step.
    pub auth_max_attempts: Option<u32>,
    /// `None` means a job retries systemic failures forever.
    pub broadcast_max_failures: Option<u32>,
    pub resume_on_start: bool,
}

pub fn load_environment() -> Result<()> {
    match dotenv::dotenv() {
        Ok(path) => log::info!("Loaded environment from {:?}", path),
        Err(e) if e.not_found() => log::info!("No .env file found, using process environment"),
        Err(e) => return Err(anyhow!("Failed to read .env: {}", e)),
    }
    if env::var("TELOXIDE_TOKEN").is_err() {
        return Err(anyhow!("TELOXIDE_TOKEN must be set"));
    }
    Ok(())
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_id: i32 = get("TELEGRAM_API_ID")
            .ok_or_else(|| anyhow!("TELEGRAM_API_ID must be set"))?
            .parse()
            .context("TELEGRAM_API_ID must be an integer")?;
        let api_hash =
            get("TELEGRAM_API_HASH").ok_or_else(|| anyhow!("TELEGRAM_API_HASH must be set"))?;

        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let database_path = get("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("data.db"));
        let sessions_dir = get("SESSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sessions"));

        let number = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{} must be a non-negative integer", key)),
                None => Ok(default),
            }
        };

        let default_interval_secs = number("DEFAULT_INTERVAL_SECS", 5)?;
        if default_interval_secs == 0 {
            return Err(anyhow!("DEFAULT_INTERVAL_SECS must be greater than zero"));
        }
        let provider_timeout = Duration::from_secs(number("PROVIDER_TIMEOUT_SECS", 60)?.max(1));
        let retry_backoff = Duration::from_secs(number("RETRY_BACKOFF_SECS", 5)?);
        let auth_timeout = match number("AUTH_TIMEOUT_SECS", 600)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let limit = |key: &str| -> Result<Option<u32>> {
            match number(key, 0)? {
                0 => Ok(None),
                n => Ok(Some(u32::try_from(n).with_context(|| format!("{} is too large", key))?)),
            }
        };
        let auth_max_attempts = limit("AUTH_MAX_ATTEMPTS")?;
        let broadcast_max_failures = limit("BROADCAST_MAX_FAILURES")?;

        let resume_on_start = match get("RESUME_ON_START").map(|v| v.to_lowercase()) {
            None => true,
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => return Err(anyhow!("RESUME_ON_START must be a boolean, got {:?}", other)),
            },
        };

        Ok(Settings {
            api_id,
            api_hash,
            database_path,
            sessions_dir,
            default_interval_secs,
            provider_timeout,
            retry_backoff,
            auth_timeout,
            auth_max_attempts,
            broadcast_max_failures,
            resume_on_start,
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("adbroadcast"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[
            ("TELEGRAM_API_ID", "12345"),
            ("TELEGRAM_API_HASH", "abc"),
            ("DATA_DIR", "/tmp/ads"),
        ])
        .unwrap();
        assert_eq!(s.api_id, 12345);
        assert_eq!(s.database_path, PathBuf::from("/tmp/ads/data.db"));
        assert_eq!(s.sessions_dir, PathBuf::from("/tmp/ads/sessions"));
        assert_eq!(s.default_interval_secs, 5);
        assert_eq!(s.retry_backoff, Duration::from_secs(5));
        assert_eq!(s.auth_timeout, Some(Duration::from_secs(600)));
        assert_eq!(s.auth_max_attempts, None);
        assert_eq!(s.broadcast_max_failures, None);
        assert!(s.resume_on_start);
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            ("TELEGRAM_API_ID", "1"),
            ("TELEGRAM_API_HASH", "h"),
            ("DATABASE_PATH", "/var/ads.db"),
            ("AUTH_TIMEOUT_SECS", "0"),
            ("AUTH_MAX_ATTEMPTS", "3"),
            ("BROADCAST_MAX_FAILURES", "10"),
            ("RESUME_ON_START", "off"),
        ])
        .unwrap();
        assert_eq!(s.database_path, PathBuf::from("/var/ads.db"));
        assert_eq!(s.auth_timeout, None);
        assert_eq!(s.auth_max_attempts, Some(3));
        assert_eq!(s.broadcast_max_failures, Some(10));
        assert!(!s.resume_on_start);
    }

    #[test]
    fn test_missing_credentials() {
        assert!(settings(&[("TELEGRAM_API_HASH", "h")]).is_err());
        let result = settings(&[("TELEGRAM_API_ID", "x"), ("TELEGRAM_API_HASH", "h")]);
        assert!(result.is_err());
        assert!(settings(&[("TELEGRAM_API_ID", "1")]).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = settings(&[
            ("TELEGRAM_API_ID", "1"),
            ("TELEGRAM_API_HASH", "h"),
            ("DEFAULT_INTERVAL_SECS", "0"),
        ]);
        assert!(result.is_err());
    }
}
