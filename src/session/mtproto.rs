use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use grammers_client::client::InitParams;
use grammers_client::types::{LoginToken as MtLoginToken, PasswordToken};
use grammers_client::{Client, Config, SignInError};
use grammers_mtsender::InvocationError;
use grammers_session::{PackedChat, Session as MtSession};
use grammers_tl_types as tl;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::peers::{ChatRef, PeerTarget};
use crate::session::{LoginToken, Session, SessionProvider};
use crate::store::UserId;

const PEER_CACHE_SIZE: usize = 256;

/// Opens one grammers client per user, each backed by `<sessions_dir>/<uid>.session`.
pub struct GrammersProvider {
    api_id: i32,
    api_hash: String,
    sessions_dir: PathBuf,
}

impl GrammersProvider {
    pub fn new(api_id: i32, api_hash: String, sessions_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            api_id,
            api_hash,
            sessions_dir,
        })
    }

    fn session_path(&self, uid: UserId) -> PathBuf {
        self.sessions_dir.join(format!("{}.session", uid))
    }
}

#[async_trait]
impl SessionProvider for GrammersProvider {
    async fn connect(&self, uid: UserId) -> Result<Arc<dyn Session>, ProviderError> {
        let path = self.session_path(uid);
        let client = open_client(&path, self.api_id, &self.api_hash).await?;
        Ok(Arc::new(GrammersSession {
            uid,
            path,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            client: Mutex::new(client),
            peers: StdMutex::new(LruCache::new(
                NonZeroUsize::new(PEER_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        }))
    }

    fn has_credentials(&self, uid: UserId) -> bool {
        self.session_path(uid).exists()
    }
}

fn init_params() -> InitParams {
    InitParams {
        device_model: "Desktop".to_string(),
        system_version: "Windows 10".to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        system_lang_code: "en".to_string(),
        lang_code: "en".to_string(),
        catch_up: false,
        server_addr: None,
        flood_sleep_threshold: 60,
        update_queue_limit: Some(100),
        ..Default::default()
    }
}

async fn open_client(path: &Path, api_id: i32, api_hash: &str) -> Result<Client, ProviderError> {
    let session = MtSession::load_file_or_create(path)
        .map_err(|e| ProviderError::Connect(format!("cannot load session {:?}: {}", path, e)))?;
    Client::connect(Config {
        session,
        api_id,
        api_hash: api_hash.to_string(),
        params: init_params(),
    })
    .await
    .map_err(|e| ProviderError::Connect(e.to_string()))
}

fn invocation_error(error: InvocationError) -> ProviderError {
    ProviderError::classify(&error.to_string())
}

pub struct GrammersSession {
    uid: UserId,
    path: PathBuf,
    api_id: i32,
    api_hash: String,
    /// Replaced wholesale on reconnect.
    client: Mutex<Client>,
    peers: StdMutex<LruCache<ChatRef, PackedChat>>,
}

impl GrammersSession {
    async fn client(&self) -> Client {
        self.client.lock().await.clone()
    }

    fn save(&self, client: &Client) -> Result<(), ProviderError> {
        client
            .session()
            .save_to_file(&self.path)
            .map_err(|e| ProviderError::Rpc(format!("cannot save session {:?}: {}", self.path, e)))
    }

    async fn resolve(&self, client: &Client, chat: &ChatRef) -> Result<PackedChat, ProviderError> {
        let cached = self
            .peers
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(chat).copied());
        if let Some(packed) = cached {
            return Ok(packed);
        }

        let packed = match chat.target() {
            PeerTarget::Username(name) => client
                .resolve_username(&name)
                .await
                .map_err(invocation_error)?
                .map(|found| found.pack())
                .ok_or_else(|| ProviderError::ChatNotFound(chat.to_string()))?,
            PeerTarget::Id(id) => {
                // Bare ids carry no access hash; the account must already have the dialog.
                let mut dialogs = client.iter_dialogs();
                let mut found = None;
                while let Some(dialog) = dialogs.next().await.map_err(invocation_error)? {
                    let candidate = dialog.chat();
                    if candidate.id() == id {
                        found = Some(candidate.pack());
                        break;
                    }
                }
                found.ok_or_else(|| ProviderError::ChatNotFound(chat.to_string()))?
            }
        };

        if let Ok(mut cache) = self.peers.lock() {
            cache.put(chat.clone(), packed);
        }
        Ok(packed)
    }
}

#[async_trait]
impl Session for GrammersSession {
    async fn is_connected(&self) -> bool {
        let client = self.client().await;
        match client.invoke(&tl::functions::updates::GetState {}).await {
            Ok(_) => true,
            // The server answered, so the transport is fine even if unauthorized.
            Err(InvocationError::Rpc(_)) => true,
            Err(e) => {
                log::debug!("Keep-alive ping for user {} failed: {:?}", self.uid, e);
                false
            }
        }
    }

    async fn reconnect(&self) -> Result<(), ProviderError> {
        let mut client_guard = self.client.lock().await;
        if let Err(e) = self.save(&client_guard) {
            log::warn!("Could not persist session for user {} before reconnect: {}", self.uid, e);
        }
        let new_client = open_client(&self.path, self.api_id, &self.api_hash).await?;
        *client_guard = new_client;
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool, ProviderError> {
        self.client().await.is_authorized().await.map_err(invocation_error)
    }

    async fn request_login_code(&self, phone: &str) -> Result<LoginToken, ProviderError> {
        let client = self.client().await;
        let token = client
            .request_login_code(phone)
            .await
            .map_err(|e| ProviderError::classify(&e.to_string()))?;
        Ok(LoginToken::new(token))
    }

    async fn sign_in(&self, token: &LoginToken, code: &str) -> Result<(), ProviderError> {
        let token = token
            .downcast_ref::<MtLoginToken>()
            .ok_or_else(|| ProviderError::Rpc("login token belongs to another provider".into()))?;
        let client = self.client().await;
        match client.sign_in(token, code).await {
            Ok(_) => self.save(&client),
            Err(SignInError::PasswordRequired(_)) => Err(ProviderError::SecondFactorRequired),
            Err(SignInError::InvalidCode) => Err(ProviderError::InvalidCode),
            Err(e) => Err(ProviderError::classify(&e.to_string())),
        }
    }

    async fn check_password(&self, password: &str) -> Result<(), ProviderError> {
        let client = self.client().await;
        // A fresh challenge per attempt lets the user retry a wrong password.
        let tl::enums::account::Password::Password(info) = client
            .invoke(&tl::functions::account::GetPassword {})
            .await
            .map_err(invocation_error)?;
        match client.check_password(PasswordToken::new(info), password.as_bytes()).await {
            Ok(_) => self.save(&client),
            Err(SignInError::InvalidPassword) => Err(ProviderError::InvalidPassword),
            Err(e) => Err(ProviderError::classify(&e.to_string())),
        }
    }

    async fn send_message(&self, chat: &ChatRef, text: &str) -> Result<(), ProviderError> {
        let client = self.client().await;
        let peer = self.resolve(&client, chat).await?;
        client.send_message(peer, text).await.map_err(invocation_error)?;
        Ok(())
    }

    async fn log_out(&self) -> Result<(), ProviderError> {
        let client = self.client().await;
        let result = client.sign_out().await.map(|_| ()).map_err(invocation_error);
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove session file {:?}: {}", self.path, e);
            }
        }
        if let Ok(mut cache) = self.peers.lock() {
            cache.clear();
        }
        result
    }
}
