use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::auth::{AuthMachine, AuthOutcome, AuthStep};
use crate::commands::MenuAction;
use crate::error::{SchedulerError, StoreError, ValidationError};
use crate::peers::ChatRef;
use crate::scheduler::Scheduler;
use crate::session::SessionPool;
use crate::store::{ConfigStore, UserId, parse_interval};

const STORE_FAILED: &str = "❌ Storage error, please try again.";
const MENU_HINT: &str = "Use the menu buttons below.";

/// Follow-up input a menu action is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prompt {
    AddChat,
    RemoveChat,
    SetMessage,
    SetInterval,
    LogChat,
}

/// Everything the bot front end talks to, constructed once at startup.
pub struct BotService {
    store: Arc<ConfigStore>,
    pool: Arc<SessionPool>,
    auth: AuthMachine,
    scheduler: Arc<Scheduler>,
    prompts: Mutex<HashMap<UserId, Prompt>>,
}

fn store_failed(uid: UserId, e: StoreError) -> String {
    log::error!("Storage error for user {}: {}", uid, e);
    STORE_FAILED.to_string()
}

impl BotService {
    pub fn new(
        store: Arc<ConfigStore>,
        pool: Arc<SessionPool>,
        auth: AuthMachine,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            pool,
            auth,
            scheduler,
            prompts: Mutex::new(HashMap::new()),
        }
    }

    fn set_prompt(&self, uid: UserId, prompt: Prompt) {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).insert(uid, prompt);
    }

    fn take_prompt(&self, uid: UserId) -> Option<Prompt> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).remove(&uid)
    }

    #[cfg(test)]
    fn pending_prompt(&self, uid: UserId) -> Option<Prompt> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).get(&uid).copied()
    }

    /// Routes one inbound text: menu keyword first, then a login in
    /// progress, then a pending prompt.
    pub async fn handle_text(&self, uid: UserId, text: &str) -> String {
        if let Some(action) = MenuAction::from_label(text) {
            return self.handle_action(uid, action).await;
        }
        if self.auth.is_active(uid) {
            let reply = self.auth.handle_input(uid, text).await;
            match reply.outcome {
                AuthOutcome::Authenticated => log::info!("User {} is ready to broadcast", uid),
                AuthOutcome::Pending(step) => {
                    log::debug!("User {} login waits for {:?}", uid, step)
                }
                AuthOutcome::Abandoned => log::debug!("User {} login abandoned", uid),
            }
            return reply.text;
        }
        match self.take_prompt(uid) {
            Some(prompt) => self.handle_prompt(uid, prompt, text).await,
            None => MENU_HINT.to_string(),
        }
    }

    pub async fn cancel(&self, uid: UserId) -> String {
        let login = self.auth.cancel(uid).await;
        let prompt = self.take_prompt(uid).is_some();
        if login || prompt {
            "Cancelled.".to_string()
        } else {
            "Nothing to cancel.".to_string()
        }
    }

    pub async fn handle_action(&self, uid: UserId, action: MenuAction) -> String {
        log::debug!("User {} pressed {:?}", uid, action);
        if action.interrupts_login() {
            self.auth.cancel(uid).await;
        }
        self.take_prompt(uid);

        match action {
            MenuAction::Login => self.auth.begin_login(uid).await,
            MenuAction::Logout => self.logout(uid).await,
            MenuAction::AddChat => {
                self.set_prompt(uid, Prompt::AddChat);
                "Send chat id or username".to_string()
            }
            MenuAction::RemoveChat => match self.store.list_chats(uid).await {
                Ok(chats) if chats.is_empty() => "No chats".to_string(),
                Ok(_) => {
                    self.set_prompt(uid, Prompt::RemoveChat);
                    "Send chat id or username to remove".to_string()
                }
                Err(e) => store_failed(uid, e),
            },
            MenuAction::ListChats => match self.store.list_chats(uid).await {
                Ok(chats) if chats.is_empty() => "No chats".to_string(),
                Ok(chats) => chats.iter().map(ChatRef::to_string).collect::<Vec<_>>().join("\n"),
                Err(e) => store_failed(uid, e),
            },
            MenuAction::SetMessage => {
                self.set_prompt(uid, Prompt::SetMessage);
                "Send new message".to_string()
            }
            MenuAction::SetInterval => {
                self.set_prompt(uid, Prompt::SetInterval);
                "Send seconds".to_string()
            }
            MenuAction::ToggleLogs => match self.store.toggle_logging(uid).await {
                Ok(true) => {
                    self.set_prompt(uid, Prompt::LogChat);
                    "📝 Logs enabled. Send log channel id/username".to_string()
                }
                Ok(false) => "Logs disabled".to_string(),
                Err(e) => store_failed(uid, e),
            },
            MenuAction::StartAds => match self.scheduler.start(uid).await {
                Ok(()) => "▶ Ads started".to_string(),
                Err(SchedulerError::AlreadyRunning) => "Ads already running".to_string(),
                Err(SchedulerError::NoChats) => "Add at least one chat first".to_string(),
                Err(SchedulerError::NoMessage) => "Set a message first".to_string(),
                Err(e) => {
                    log::error!("Failed to start ads for user {}: {}", uid, e);
                    format!("❌ Could not start ads: {}", e)
                }
            },
            MenuAction::StopAds => match self.scheduler.stop(uid).await {
                Ok(()) => "⏹ Ads stopped".to_string(),
                Err(SchedulerError::NotRunning) => "Ads are not running".to_string(),
                Err(e) => {
                    log::error!("Failed to stop ads for user {}: {}", uid, e);
                    format!("❌ Could not stop ads: {}", e)
                }
            },
            MenuAction::Status => self.status(uid).await,
            MenuAction::Reset => {
                self.stop_quietly(uid).await;
                match self.store.remove(uid).await {
                    Ok(_) => "🗑 Configuration cleared".to_string(),
                    Err(e) => store_failed(uid, e),
                }
            }
        }
    }

    async fn stop_quietly(&self, uid: UserId) {
        match self.scheduler.stop(uid).await {
            Ok(()) | Err(SchedulerError::NotRunning) => {}
            Err(e) => log::warn!("Failed to stop ads for user {}: {}", uid, e),
        }
    }

    async fn logout(&self, uid: UserId) -> String {
        self.stop_quietly(uid).await;
        match self.pool.release(uid).await {
            Ok(true) => "🚪 Logged out".to_string(),
            Ok(false) => "You are not logged in.".to_string(),
            Err(e) => {
                log::warn!("Logout for user {} failed: {}", uid, e);
                format!("❌ Logout failed:\n{}", e)
            }
        }
    }

    async fn status(&self, uid: UserId) -> String {
        let record = match self.store.get(uid).await {
            Ok(record) => record,
            Err(e) => return store_failed(uid, e),
        };
        let logs = match (&record.logging_enabled, &record.log_chat) {
            (true, Some(chat)) => format!("on → {}", chat),
            (true, None) => "on (no log chat)".to_string(),
            (false, _) => "off".to_string(),
        };
        let session = match self.auth.step(uid) {
            Some(AuthStep::Phone) => "login: waiting for phone",
            Some(AuthStep::Otp) => "login: waiting for code",
            Some(AuthStep::TwoFactor) => "login: waiting for password",
            None if self.pool.contains(uid) => "connected",
            None => "not connected",
        };
        format!(
            "📊 Status\nSession: {}\nChats: {}\nInterval: {}s\nRunning: {}\nLogs: {}",
            session,
            record.chats.len(),
            record.interval_secs,
            self.scheduler.is_running(uid),
            logs
        )
    }

    async fn handle_prompt(&self, uid: UserId, prompt: Prompt, text: &str) -> String {
        let result = match prompt {
            Prompt::AddChat => match ChatRef::parse(text) {
                Ok(chat) => {
                    let reply = format!("✅ Added {}", chat);
                    self.store.add_chat(uid, chat).await.map(|_| reply)
                }
                Err(e) => return self.retry(uid, prompt, e),
            },
            Prompt::RemoveChat => match ChatRef::parse(text) {
                Ok(chat) => {
                    let name = chat.to_string();
                    self.store.remove_chat(uid, chat).await.map(|removed| {
                        if removed {
                            format!("✅ Removed {}", name)
                        } else {
                            format!("{} is not in your list", name)
                        }
                    })
                }
                Err(e) => return self.retry(uid, prompt, e),
            },
            Prompt::SetMessage => {
                if text.trim().is_empty() {
                    return self.retry(uid, prompt, ValidationError::EmptyInput);
                }
                self.store
                    .set_message(uid, text.to_string())
                    .await
                    .map(|_| "✅ Message saved".to_string())
            }
            Prompt::SetInterval => match parse_interval(text) {
                Ok(secs) => self
                    .store
                    .set_interval(uid, secs)
                    .await
                    .map(|_| format!("✅ Interval set to {}s", secs)),
                Err(e) => return self.retry(uid, prompt, e),
            },
            Prompt::LogChat => match ChatRef::parse(text) {
                Ok(chat) => {
                    let reply = format!("✅ Logs will be sent to {}", chat);
                    self.store.set_log_chat(uid, Some(chat)).await.map(|_| reply)
                }
                Err(e) => return self.retry(uid, prompt, e),
            },
        };
        result.unwrap_or_else(|e| store_failed(uid, e))
    }

    /// Keeps the prompt open after malformed input.
    fn retry(&self, uid: UserId, prompt: Prompt, error: ValidationError) -> String {
        self.set_prompt(uid, prompt);
        format!("❌ {}", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthLimits;
    use crate::handlers::ui::*;
    use crate::notifier::testing::RecordingNotifier;
    use crate::scheduler::SchedulerConfig;
    use crate::session::fake::FakeProvider;
    use crate::store::tests::temp_store;
    use std::time::Duration;
    use tempfile::TempDir;

    const UID: UserId = 7;

    fn service() -> (TempDir, FakeProvider, Arc<ConfigStore>, BotService) {
        let (dir, store) = temp_store();
        let provider = FakeProvider::new();
        let pool = Arc::new(SessionPool::new(Arc::new(provider.clone()), Duration::from_secs(1)));
        let auth = AuthMachine::new(Arc::clone(&pool), AuthLimits::default());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::new(RecordingNotifier::default()),
            SchedulerConfig {
                retry_backoff: Duration::from_millis(50),
                max_failures: None,
            },
        ));
        let service = BotService::new(Arc::clone(&store), pool, auth, scheduler);
        (dir, provider, store, service)
    }

    #[tokio::test]
    async fn test_add_list_remove_round_trip() {
        let (_dir, _provider, _store, service) = service();
        assert_eq!(service.handle_text(UID, BTN_LIST_CHATS).await, "No chats");

        service.handle_text(UID, BTN_ADD_CHAT).await;
        assert_eq!(service.pending_prompt(UID), Some(Prompt::AddChat));
        service.handle_text(UID, "x").await;
        assert_eq!(service.pending_prompt(UID), None);
        service.handle_text(UID, BTN_ADD_CHAT).await;
        service.handle_text(UID, "-100555").await;
        assert_eq!(service.handle_text(UID, BTN_LIST_CHATS).await, "@x\n-100555");

        service.handle_text(UID, BTN_REMOVE_CHAT).await;
        assert_eq!(service.handle_text(UID, "@x").await, "✅ Removed @x");
        assert!(!service.handle_text(UID, BTN_LIST_CHATS).await.contains("@x"));
    }

    #[tokio::test]
    async fn test_invite_link_keeps_prompt_open() {
        let (_dir, _provider, store, service) = service();
        service.handle_text(UID, BTN_ADD_CHAT).await;
        assert!(service.handle_text(UID, "https://t.me/+AbCdEf").await.starts_with("❌"));
        assert_eq!(service.pending_prompt(UID), Some(Prompt::AddChat));
        assert!(store.list_chats(UID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_interval() {
        let (_dir, _provider, store, service) = service();
        service.handle_text(UID, BTN_INTERVAL).await;
        let reply = service.handle_text(UID, "abc").await;
        assert!(reply.starts_with("❌"));
        assert_eq!(store.get(UID).await.unwrap().interval_secs, 5);
        assert_eq!(service.pending_prompt(UID), Some(Prompt::SetInterval));

        assert_eq!(service.handle_text(UID, "30").await, "✅ Interval set to 30s");
        assert_eq!(store.get(UID).await.unwrap().interval_secs, 30);
    }

    #[tokio::test]
    async fn test_toggle_logs_asks_for_destination() {
        let (_dir, _provider, store, service) = service();
        let reply = service.handle_text(UID, BTN_TOGGLE_LOGS).await;
        assert!(reply.contains("Logs enabled"));
        service.handle_text(UID, "@mylogs").await;
        let record = store.get(UID).await.unwrap();
        assert!(record.logging_enabled);
        assert_eq!(record.log_chat, Some(ChatRef::parse("@mylogs").unwrap()));

        assert_eq!(service.handle_text(UID, BTN_TOGGLE_LOGS).await, "Logs disabled");
        assert_eq!(service.pending_prompt(UID), None);
    }

    #[tokio::test]
    async fn test_menu_keyword_is_never_auth_input() {
        let (_dir, provider, _store, service) = service();
        service.handle_text(UID, BTN_LOGIN).await;

        assert_eq!(service.handle_text(UID, BTN_LIST_CHATS).await, "No chats");
        assert!(service.handle_text(UID, BTN_STATUS).await.contains("login: waiting for phone"));
        assert_eq!(service.auth.step(UID), Some(AuthStep::Phone));
        assert_eq!(provider.code_requests(), 0);

        service.handle_text(UID, BTN_SET_MESSAGE).await;
        assert!(!service.auth.is_active(UID));
    }

    #[tokio::test]
    async fn test_login_then_broadcast_then_logout() {
        let (_dir, provider, _store, service) = service();
        assert!(service.handle_text(UID, BTN_LOGIN).await.contains("phone number"));
        assert!(service.handle_text(UID, "+15550001111").await.contains("code12345"));
        assert_eq!(service.handle_text(UID, "code12345").await, crate::auth::LOGIN_OK);

        service.handle_text(UID, BTN_SET_MESSAGE).await;
        service.handle_text(UID, "Hello world").await;
        service.handle_text(UID, BTN_ADD_CHAT).await;
        service.handle_text(UID, "@target").await;

        assert_eq!(service.handle_text(UID, BTN_START_ADS).await, "▶ Ads started");
        assert_eq!(service.handle_text(UID, BTN_START_ADS).await, "Ads already running");
        assert!(provider.wait_for_sent(1, Duration::from_secs(2)).await);
        assert_eq!(provider.sent_to("@target"), vec!["Hello world".to_string()]);

        let status = service.handle_text(UID, BTN_STATUS).await;
        assert!(status.contains("Chats: 1"));
        assert!(status.contains("Running: true"));

        assert_eq!(service.handle_text(UID, BTN_LOGOUT).await, "🚪 Logged out");
        assert!(!service.scheduler.is_running(UID));
        assert!(!provider.is_authorized(UID));
        assert_eq!(service.handle_text(UID, BTN_STOP_ADS).await, "Ads are not running");
    }

    #[tokio::test]
    async fn test_input_during_slow_login_call_is_not_dropped() {
        let (_dir, provider, _store, service) = service();
        provider.script(|s| s.code_delay = Some(Duration::from_millis(300)));
        let service = Arc::new(service);
        service.handle_text(UID, BTN_LOGIN).await;

        let phone = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.handle_text(UID, "+15550001111").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = service.handle_text(UID, BTN_STATUS).await;
        assert!(status.contains("login: waiting for phone"), "{}", status);
        assert_eq!(service.handle_text(UID, "code12345").await, crate::auth::LOGIN_OK);
        assert!(phone.await.unwrap().contains("code12345"));
        assert!(provider.is_authorized(UID));
    }

    #[tokio::test]
    async fn test_start_without_chats() {
        let (_dir, _provider, _store, service) = service();
        assert_eq!(service.handle_text(UID, BTN_START_ADS).await, "Add at least one chat first");
        assert_eq!(service.handle_text(UID, BTN_STOP_ADS).await, "Ads are not running");
    }

    #[tokio::test]
    async fn test_cancel_and_reset() {
        let (_dir, _provider, store, service) = service();
        assert_eq!(service.cancel(UID).await, "Nothing to cancel.");
        service.handle_text(UID, BTN_ADD_CHAT).await;
        assert_eq!(service.cancel(UID).await, "Cancelled.");
        assert_eq!(service.handle_text(UID, "x").await, MENU_HINT);

        store.set_message(UID, "hi".into()).await.unwrap();
        service.handle_text(UID, BTN_RESET).await;
        assert!(store.find(UID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_without_session() {
        let (_dir, _provider, _store, service) = service();
        assert_eq!(service.handle_text(UID, BTN_LOGOUT).await, "You are not logged in.");
    }
}
