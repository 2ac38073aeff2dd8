//! Scripted in-memory provider used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::peers::ChatRef;
use crate::session::{LoginToken, Session, SessionProvider};
use crate::store::UserId;

pub struct Script {
    pub connect_error: Option<ProviderError>,
    pub code_error: Option<ProviderError>,
    pub valid_code: String,
    /// When set, a correct code yields `SecondFactorRequired`.
    pub password: Option<String>,
    pub failing_chats: HashSet<ChatRef>,
    pub send_delay: Option<Duration>,
    pub code_delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connect_error: None,
            code_error: None,
            valid_code: "12345".into(),
            password: None,
            failing_chats: HashSet::new(),
            send_delay: None,
            code_delay: None,
        }
    }
}

#[derive(Default)]
struct FakeState {
    script: Mutex<Script>,
    sent: Mutex<Vec<(UserId, ChatRef, String)>>,
    authorized: Mutex<HashSet<UserId>>,
    credentials: Mutex<HashSet<UserId>>,
    sessions: Mutex<HashMap<UserId, Arc<FakeSession>>>,
    connects: AtomicUsize,
    reconnects: AtomicUsize,
    code_requests: AtomicUsize,
    logouts: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeProvider {
    state: Arc<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, edit: impl FnOnce(&mut Script)) {
        edit(&mut self.state.script.lock().unwrap());
    }

    pub fn authorize(&self, uid: UserId) {
        self.state.authorized.lock().unwrap().insert(uid);
        self.state.credentials.lock().unwrap().insert(uid);
    }

    pub fn is_authorized(&self, uid: UserId) -> bool {
        self.state.authorized.lock().unwrap().contains(&uid)
    }

    pub fn sent(&self) -> Vec<(UserId, ChatRef, String)> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat: &str) -> Vec<String> {
        let chat = ChatRef::parse(chat).unwrap();
        self.sent()
            .into_iter()
            .filter(|(_, c, _)| *c == chat)
            .map(|(_, _, text)| text)
            .collect()
    }

    /// Polls until at least `count` messages were sent or `limit` elapses.
    pub async fn wait_for_sent(&self, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.state.sent.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn drop_connections(&self) {
        for session in self.state.sessions.lock().unwrap().values() {
            session.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.state.reconnects.load(Ordering::SeqCst)
    }

    pub fn code_requests(&self) -> usize {
        self.state.code_requests.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.state.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn connect(&self, uid: UserId) -> Result<Arc<dyn Session>, ProviderError> {
        if let Some(err) = self.state.script.lock().unwrap().connect_error.clone() {
            return Err(err);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(FakeSession {
            uid,
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(true),
        });
        self.state.sessions.lock().unwrap().insert(uid, Arc::clone(&session));
        Ok(session)
    }

    fn has_credentials(&self, uid: UserId) -> bool {
        self.state.credentials.lock().unwrap().contains(&uid)
    }
}

pub struct FakeSession {
    uid: UserId,
    state: Arc<FakeState>,
    connected: AtomicBool,
}

impl FakeSession {
    fn authorize(&self) {
        self.state.authorized.lock().unwrap().insert(self.uid);
        self.state.credentials.lock().unwrap().insert(self.uid);
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), ProviderError> {
        self.state.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool, ProviderError> {
        Ok(self.state.authorized.lock().unwrap().contains(&self.uid))
    }

    async fn request_login_code(&self, phone: &str) -> Result<LoginToken, ProviderError> {
        self.state.code_requests.fetch_add(1, Ordering::SeqCst);
        let (delay, error) = {
            let script = self.state.script.lock().unwrap();
            (script.code_delay, script.code_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = error {
            return Err(err);
        }
        Ok(LoginToken::new(format!("hash-{}", phone)))
    }

    async fn sign_in(&self, token: &LoginToken, code: &str) -> Result<(), ProviderError> {
        if token.downcast_ref::<String>().is_none() {
            return Err(ProviderError::Rpc("foreign login token".into()));
        }
        let needs_password = {
            let script = self.state.script.lock().unwrap();
            if code != script.valid_code {
                return Err(ProviderError::InvalidCode);
            }
            script.password.is_some()
        };
        if needs_password {
            return Err(ProviderError::SecondFactorRequired);
        }
        self.authorize();
        Ok(())
    }

    async fn check_password(&self, password: &str) -> Result<(), ProviderError> {
        let correct = self.state.script.lock().unwrap().password.as_deref() == Some(password);
        if !correct {
            return Err(ProviderError::InvalidPassword);
        }
        self.authorize();
        Ok(())
    }

    async fn send_message(&self, chat: &ChatRef, text: &str) -> Result<(), ProviderError> {
        let (delay, fails) = {
            let script = self.state.script.lock().unwrap();
            (script.send_delay, script.failing_chats.contains(chat))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(ProviderError::Rpc(format!("CHAT_WRITE_FORBIDDEN in {}", chat)));
        }
        self.state
            .sent
            .lock()
            .unwrap()
            .push((self.uid, chat.clone(), text.to_string()));
        Ok(())
    }

    async fn log_out(&self) -> Result<(), ProviderError> {
        self.state.logouts.fetch_add(1, Ordering::SeqCst);
        self.state.authorized.lock().unwrap().remove(&self.uid);
        self.state.credentials.lock().unwrap().remove(&self.uid);
        Ok(())
    }
}
