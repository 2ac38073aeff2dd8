use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CycleError, ProviderError, SchedulerError};
use crate::notifier::Notifier;
use crate::peers::ChatRef;
use crate::session::{Session, SessionPool, with_timeout};
use crate::store::{ConfigStore, UserId, UserRecord};
use crate::utils::KeyedLocks;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Pause after a cycle that failed outside per-destination handling.
    pub retry_backoff: Duration,
    /// Consecutive failed cycles before a job gives up; `None` retries forever.
    pub max_failures: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(5),
            max_failures: None,
        }
    }
}

struct Job {
    id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    store: Arc<ConfigStore>,
    pool: Arc<SessionPool>,
    notifier: Arc<dyn Notifier>,
    jobs: Mutex<HashMap<UserId, Job>>,
    locks: KeyedLocks<UserId>,
    config: SchedulerConfig,
}

impl Shared {
    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Job>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Zero or one broadcast job per user.
///
/// `start` and `stop` for the same user are serialized, so the Idle to
/// Running transition and the persisted `running` flag always move together.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(
        store: Arc<ConfigStore>,
        pool: Arc<SessionPool>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                pool,
                notifier,
                jobs: Mutex::new(HashMap::new()),
                locks: KeyedLocks::new(),
                config,
            }),
        }
    }

    pub fn is_running(&self, uid: UserId) -> bool {
        self.shared.jobs().contains_key(&uid)
    }

    pub fn running_count(&self) -> usize {
        self.shared.jobs().len()
    }

    pub async fn start(&self, uid: UserId) -> Result<(), SchedulerError> {
        let _guard = self.shared.locks.lock(&uid).await;
        if self.is_running(uid) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let record = self.shared.store.get(uid).await?;
        if record.chats.is_empty() {
            return Err(SchedulerError::NoChats);
        }
        if record.message.trim().is_empty() {
            return Err(SchedulerError::NoMessage);
        }

        self.shared.store.update(uid, |r| r.running = true).await?;
        self.spawn(uid);
        Ok(())
    }

    pub async fn stop(&self, uid: UserId) -> Result<(), SchedulerError> {
        let _guard = self.shared.locks.lock(&uid).await;
        let job = self.shared.jobs().remove(&uid);
        let Some(job) = job else {
            // A flag left behind by an unclean shutdown is cleared on the way out.
            self.shared.store.set_running(uid, false).await?;
            return Err(SchedulerError::NotRunning);
        };

        job.cancel.cancel();
        if let Err(e) = job.handle.await {
            log::error!("Broadcast job {} for user {} panicked: {}", job.id, uid, e);
        }
        self.shared.store.set_running(uid, false).await?;
        log::info!("Broadcast job {} for user {} stopped", job.id, uid);
        Ok(())
    }

    /// Reconciles `running=true` records left over from the previous process:
    /// either restarts their jobs or clears the flags. Returns how many
    /// records were touched.
    pub async fn resume(&self, restart: bool) -> Result<usize, SchedulerError> {
        let users = self.shared.store.running_users().await?;
        for &uid in &users {
            let _guard = self.shared.locks.lock(&uid).await;
            if self.is_running(uid) {
                continue;
            }
            if restart {
                log::info!("Resuming broadcast for user {}", uid);
                self.spawn(uid);
            } else {
                log::info!("Clearing stale running flag for user {}", uid);
                self.shared.store.set_running(uid, false).await?;
            }
        }
        Ok(users.len())
    }

    /// Cancels and awaits every job. Persisted flags are left untouched so the
    /// next start can resume them.
    pub async fn shutdown(&self) {
        let jobs: Vec<(UserId, Job)> = self.shared.jobs().drain().collect();
        if jobs.is_empty() {
            return;
        }
        log::info!("Stopping {} broadcast job(s)...", jobs.len());
        let handles = jobs.into_iter().map(|(_, job)| {
            job.cancel.cancel();
            job.handle
        });
        for result in join_all(handles).await {
            if let Err(e) = result {
                log::error!("Broadcast job panicked during shutdown: {}", e);
            }
        }
    }

    /// Must be called with the user's lock held.
    fn spawn(&self, uid: UserId) {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let ctx = JobContext {
            uid,
            id,
            cancel: cancel.clone(),
            shared: Arc::clone(&self.shared),
        };
        let handle = tokio::spawn(ctx.run());
        self.shared.jobs().insert(uid, Job { id, cancel, handle });
        log::info!("Broadcast job {} for user {} started", id, uid);
    }
}

enum CycleOutcome {
    Completed { interval: Duration },
    ConfigurationMissing,
    Cancelled,
}

struct JobContext {
    uid: UserId,
    id: Uuid,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl JobContext {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.cycle().await {
                Ok(CycleOutcome::Completed { interval }) => {
                    failures = 0;
                    if !self.pause(interval).await {
                        break;
                    }
                }
                Ok(CycleOutcome::Cancelled) => break,
                Ok(CycleOutcome::ConfigurationMissing) => {
                    log::warn!("User {} has no configuration, stopping job {}", self.uid, self.id);
                    self.retire(
                        "⚠️ Ads stopped: no configuration found. \
                         Set a message and chats, then start again.",
                    )
                    .await;
                    break;
                }
                Err(e) => {
                    failures += 1;
                    log::error!(
                        "Broadcast cycle for user {} failed ({} in a row): {}",
                        self.uid,
                        failures,
                        e
                    );
                    if self.shared.config.max_failures.is_some_and(|max| failures >= max) {
                        let notice =
                            format!("⚠️ Ads stopped after {} failed attempts:\n{}", failures, e);
                        self.retire(&notice).await;
                        break;
                    }
                    if !self.pause(self.shared.config.retry_backoff).await {
                        break;
                    }
                }
            }
        }
        log::debug!("Broadcast job {} for user {} exited", self.id, self.uid);
    }

    /// Sleeps unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn cycle(&self) -> Result<CycleOutcome, CycleError> {
        let session = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            session = self.shared.pool.acquire(self.uid) => session?,
        };

        let record = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            record = self.shared.store.find(self.uid) => record?,
        };
        let Some(record) = record else {
            return Ok(CycleOutcome::ConfigurationMissing);
        };

        let timeout = self.shared.pool.call_timeout();
        let authorized = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            authorized = with_timeout(timeout, session.is_authorized()) => authorized?,
        };
        if !authorized {
            return Err(CycleError::Session(ProviderError::Unauthorized));
        }

        for chat in &record.chats {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
                result = with_timeout(timeout, session.send_message(chat, &record.message)) => {
                    result
                }
            };
            match result {
                Ok(()) => {
                    log::debug!("User {} sent ad to {}", self.uid, chat);
                    self.report(session.as_ref(), &record, format!("✅ Sent to {}", chat)).await;
                }
                Err(e) => {
                    log::warn!("User {} failed to send to {}: {}", self.uid, chat, e);
                    let text = format!("❌ Failed to send to {}:\n{}", chat, e);
                    self.report(session.as_ref(), &record, text).await;
                }
            }
        }

        Ok(CycleOutcome::Completed {
            interval: Duration::from_secs(record.interval_secs.max(1)),
        })
    }

    /// Best effort delivery to the user's log chat, if one is configured.
    async fn report(&self, session: &dyn Session, record: &UserRecord, text: String) {
        let Some(log_chat) = log_destination(record) else {
            return;
        };
        let timeout = self.shared.pool.call_timeout();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = with_timeout(timeout, session.send_message(log_chat, &text)) => result,
        };
        if let Err(e) = result {
            log::debug!("User {} could not write to log chat {}: {}", self.uid, log_chat, e);
        }
    }

    /// Terminates this job on its own: clears the flag, leaves the map and
    /// tells the user. A concurrent `stop` owns the cleanup instead.
    async fn retire(&self, notice: &str) {
        let _guard = tokio::select! {
            _ = self.cancel.cancelled() => return,
            guard = self.shared.locks.lock(&self.uid) => guard,
        };
        {
            let mut jobs = self.shared.jobs();
            if jobs.get(&self.uid).is_some_and(|job| job.id == self.id) {
                jobs.remove(&self.uid);
            }
        }
        if let Err(e) = self.shared.store.set_running(self.uid, false).await {
            log::error!("Failed to clear running flag for user {}: {}", self.uid, e);
        }
        self.shared.notifier.notify(self.uid, notice).await;
        log::info!("Broadcast job {} for user {} retired", self.id, self.uid);
    }
}

fn log_destination(record: &UserRecord) -> Option<&ChatRef> {
    if record.logging_enabled {
        record.log_chat.as_ref()
    } else {
        None
    }
}
