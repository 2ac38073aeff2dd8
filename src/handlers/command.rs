use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

use crate::commands::Command;
use crate::handlers::ui::get_main_reply_keyboard;
use crate::service::BotService;

const WELCOME: &str =
    "👋 Welcome! Login with your Telegram account, add chats and a message, then press Start Ads.";

pub async fn command_handler(
    bot: Bot,
    msg: Message,
    cmd: Command,
    service: Arc<BotService>,
) -> Result<(), anyhow::Error> {
    let user_id = msg.chat.id.0;
    log::debug!("User {} sent a command", user_id);

    let reply = match cmd {
        Command::Start => WELCOME.to_string(),
        Command::Help => Command::descriptions().to_string(),
        Command::Cancel => service.cancel(user_id).await,
    };

    bot.send_message(msg.chat.id, reply)
        .reply_markup(get_main_reply_keyboard())
        .await?;
    Ok(())
}
