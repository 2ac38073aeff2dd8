use async_trait::async_trait;
use teloxide::prelude::*;

use crate::store::UserId;

/// Out-of-band messages from background jobs to the bot user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, uid: UserId, text: &str);
}

pub struct BotNotifier {
    bot: Bot,
}

impl BotNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for BotNotifier {
    async fn notify(&self, uid: UserId, text: &str) {
        if let Err(e) = self.bot.send_message(ChatId(uid), text).await {
            log::warn!("Failed to notify user {}: {}", uid, e);
        }
    }
}
