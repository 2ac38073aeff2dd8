use std::sync::Arc;

use teloxide::prelude::*;

use crate::handlers::ui::get_main_reply_keyboard;
use crate::service::BotService;

/// Every non-command text message: menu buttons, login input and prompt answers.
pub async fn text_handler(
    bot: Bot,
    msg: Message,
    service: Arc<BotService>,
) -> Result<(), anyhow::Error> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let reply = service.handle_text(msg.chat.id.0, text).await;

    bot.send_message(msg.chat.id, reply)
        .reply_markup(get_main_reply_keyboard())
        .await?;
    Ok(())
}
