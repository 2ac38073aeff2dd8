use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::error::{ProviderError, ValidationError};
use crate::session::{LoginToken, SessionPool, with_timeout};
use crate::store::UserId;
use crate::utils::KeyedLocks;

lazy_static::lazy_static! {
    static ref PHONE: Regex = Regex::new(r"^\+\d{5,15}$").unwrap();
    static ref CODE: Regex = Regex::new(r"(?i)^code\s*(\d+)$").unwrap();
}

pub const PHONE_PROMPT: &str = "📱 Send phone number with country code\nExample:\n+919999999999";
pub const CODE_PROMPT: &str = "📩 Send OTP like:\ncode12345";
pub const PASSWORD_PROMPT: &str = "🔐 Send your 2FA password";
pub const LOGIN_OK: &str = "✅ Login successful";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStep {
    Phone,
    Otp,
    TwoFactor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Still in the flow, waiting for input at this step.
    Pending(AuthStep),
    Authenticated,
    /// The flow was dropped (expired, too many attempts, or never started).
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthReply {
    pub outcome: AuthOutcome,
    pub text: String,
}

impl AuthReply {
    fn new(outcome: AuthOutcome, text: impl Into<String>) -> Self {
        Self {
            outcome,
            text: text.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AuthLimits {
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

#[derive(Clone)]
enum Stage {
    Phone,
    Otp { token: Arc<LoginToken> },
    TwoFactor,
}

impl Stage {
    fn step(&self) -> AuthStep {
        match self {
            Stage::Phone => AuthStep::Phone,
            Stage::Otp { .. } => AuthStep::Otp,
            Stage::TwoFactor => AuthStep::TwoFactor,
        }
    }
}

#[derive(Clone)]
struct AuthState {
    stage: Stage,
    started: Instant,
    failures: u32,
}

impl AuthState {
    fn at(stage: Stage, started: Instant) -> Self {
        Self {
            stage,
            started,
            failures: 0,
        }
    }
}

pub fn validate_phone(text: &str) -> Result<&str, ValidationError> {
    let phone = text.trim();
    if PHONE.is_match(phone) {
        Ok(phone)
    } else {
        Err(ValidationError::Phone)
    }
}

/// Accepts `code12345` (any case, optional spaces) and returns the digits.
pub fn parse_code(text: &str) -> Result<String, ValidationError> {
    CODE.captures(text.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ValidationError::CodeFormat)
}

/// Stepwise login per user: phone, one-time code, optional cloud password.
///
/// This is the only writer of login state and the only caller of the
/// session sign-in operations. Inputs for one user are serialized; different
/// users never wait on each other. A user's state stays visible while one of
/// their inputs is being processed, so follow-up input queues behind it.
pub struct AuthMachine {
    pool: Arc<SessionPool>,
    states: Mutex<HashMap<UserId, AuthState>>,
    locks: KeyedLocks<UserId>,
    limits: AuthLimits,
}

impl AuthMachine {
    pub fn new(pool: Arc<SessionPool>, limits: AuthLimits) -> Self {
        Self {
            pool,
            states: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
            limits,
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<UserId, AuthState>> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take(&self, uid: UserId) -> Option<AuthState> {
        self.states().remove(&uid)
    }

    fn put(&self, uid: UserId, state: AuthState) {
        self.states().insert(uid, state);
    }

    /// Resets any previous attempt and waits for a phone number.
    pub async fn begin_login(&self, uid: UserId) -> String {
        let _guard = self.locks.lock(&uid).await;
        self.put(uid, AuthState::at(Stage::Phone, Instant::now()));
        log::info!("User {} started login", uid);
        PHONE_PROMPT.to_string()
    }

    pub async fn cancel(&self, uid: UserId) -> bool {
        let _guard = self.locks.lock(&uid).await;
        let cancelled = self.take(uid).is_some();
        if cancelled {
            log::info!("User {} cancelled login", uid);
        }
        cancelled
    }

    pub fn is_active(&self, uid: UserId) -> bool {
        self.states().contains_key(&uid)
    }

    pub fn step(&self, uid: UserId) -> Option<AuthStep> {
        self.states().get(&uid).map(|state| state.stage.step())
    }

    /// Drives the flow with one piece of user input. Callers must filter out
    /// menu keywords before handing text over.
    pub async fn handle_input(&self, uid: UserId, text: &str) -> AuthReply {
        let _guard = self.locks.lock(&uid).await;

        let current = self.states().get(&uid).cloned();
        let Some(state) = current else {
            return AuthReply::new(
                AuthOutcome::Abandoned,
                "No login in progress. Press Login to start.",
            );
        };

        if let Some(limit) = self.limits.timeout {
            if state.started.elapsed() > limit {
                log::info!("Login for user {} expired at step {:?}", uid, state.stage.step());
                self.take(uid);
                return AuthReply::new(
                    AuthOutcome::Abandoned,
                    "⌛ Login expired, press Login to start again.",
                );
            }
        }

        match state.stage {
            Stage::Phone => self.phone_step(uid, text, state.started).await,
            Stage::Otp { token } => self.code_step(uid, text, &token, state.started).await,
            Stage::TwoFactor => self.password_step(uid, text).await,
        }
    }

    async fn phone_step(&self, uid: UserId, text: &str, started: Instant) -> AuthReply {
        let phone = match validate_phone(text) {
            Ok(phone) => phone.to_string(),
            Err(e) => {
                return AuthReply::new(AuthOutcome::Pending(AuthStep::Phone), format!("❌ {}", e));
            }
        };

        let timeout = self.pool.call_timeout();
        let result = async {
            let session = self.pool.acquire(uid).await?;
            with_timeout(timeout, session.request_login_code(&phone)).await
        }
        .await;

        match result {
            Ok(token) => {
                log::info!("Login code requested for user {}", uid);
                let stage = Stage::Otp {
                    token: Arc::new(token),
                };
                self.put(uid, AuthState::at(stage, started));
                AuthReply::new(AuthOutcome::Pending(AuthStep::Otp), CODE_PROMPT)
            }
            Err(e) => {
                log::warn!("Login code request for user {} failed: {}", uid, e);
                self.fail(uid, "Failed sending OTP", &e)
            }
        }
    }

    async fn code_step(
        &self,
        uid: UserId,
        text: &str,
        token: &LoginToken,
        started: Instant,
    ) -> AuthReply {
        let code = match parse_code(text) {
            Ok(code) => code,
            Err(e) => {
                return AuthReply::new(AuthOutcome::Pending(AuthStep::Otp), format!("❌ {}", e));
            }
        };

        let timeout = self.pool.call_timeout();
        let result = async {
            let session = self.pool.acquire(uid).await?;
            with_timeout(timeout, session.sign_in(token, &code)).await
        }
        .await;

        match result {
            Ok(()) => {
                log::info!("User {} signed in", uid);
                self.take(uid);
                AuthReply::new(AuthOutcome::Authenticated, LOGIN_OK)
            }
            Err(ProviderError::SecondFactorRequired) => {
                log::info!("User {} needs a 2FA password", uid);
                self.put(uid, AuthState::at(Stage::TwoFactor, started));
                AuthReply::new(AuthOutcome::Pending(AuthStep::TwoFactor), PASSWORD_PROMPT)
            }
            Err(e) => {
                log::warn!("Sign-in for user {} failed: {}", uid, e);
                self.fail(uid, "OTP failed", &e)
            }
        }
    }

    async fn password_step(&self, uid: UserId, text: &str) -> AuthReply {
        let password = text.trim();
        if password.is_empty() {
            return AuthReply::new(
                AuthOutcome::Pending(AuthStep::TwoFactor),
                format!("❌ {}", ValidationError::EmptyInput),
            );
        }

        let timeout = self.pool.call_timeout();
        let result = async {
            let session = self.pool.acquire(uid).await?;
            with_timeout(timeout, session.check_password(password)).await
        }
        .await;

        match result {
            Ok(()) => {
                log::info!("User {} signed in with 2FA", uid);
                self.take(uid);
                AuthReply::new(AuthOutcome::Authenticated, LOGIN_OK)
            }
            Err(e) => {
                log::warn!("2FA for user {} failed: {}", uid, e);
                self.fail(uid, "2FA failed", &e)
            }
        }
    }

    /// Counts a failed provider attempt. The user stays at the current step
    /// unless the attempt limit is hit.
    fn fail(&self, uid: UserId, what: &str, error: &ProviderError) -> AuthReply {
        let mut states = self.states();
        let Some(state) = states.get_mut(&uid) else {
            return AuthReply::new(AuthOutcome::Abandoned, format!("❌ {}:\n{}", what, error));
        };
        state.failures += 1;
        if self.limits.max_attempts.is_some_and(|max| state.failures >= max) {
            log::warn!("User {} exceeded {} login attempts, dropping login", uid, state.failures);
            states.remove(&uid);
            return AuthReply::new(
                AuthOutcome::Abandoned,
                format!(
                    "❌ {}:\n{}\nToo many failed attempts, press Login to start again.",
                    what, error
                ),
            );
        }
        let step = state.stage.step();
        AuthReply::new(AuthOutcome::Pending(step), format!("❌ {}:\n{}", what, error))
    }
}
