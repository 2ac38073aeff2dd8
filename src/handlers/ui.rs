use teloxide::types::{KeyboardButton, KeyboardMarkup};

pub const BTN_LOGIN: &str = "📱 Login";
pub const BTN_LOGOUT: &str = "🚪 Logout";
pub const BTN_ADD_CHAT: &str = "➕ Add Chat";
pub const BTN_REMOVE_CHAT: &str = "➖ Remove Chat";
pub const BTN_LIST_CHATS: &str = "📋 List Chats";
pub const BTN_SET_MESSAGE: &str = "✏️ Set Message";
pub const BTN_START_ADS: &str = "▶ Start Ads";
pub const BTN_STOP_ADS: &str = "⏹ Stop Ads";
pub const BTN_INTERVAL: &str = "⏱ Interval";
pub const BTN_STATUS: &str = "📊 Status";
pub const BTN_TOGGLE_LOGS: &str = "📝 Toggle Logs";
pub const BTN_RESET: &str = "🗑 Reset";

fn row(labels: &[&str]) -> Vec<KeyboardButton> {
    labels.iter().copied().map(KeyboardButton::new).collect()
}

pub fn get_main_reply_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        row(&[BTN_LOGIN, BTN_LOGOUT]),
        row(&[BTN_ADD_CHAT, BTN_REMOVE_CHAT]),
        row(&[BTN_LIST_CHATS]),
        row(&[BTN_SET_MESSAGE]),
        row(&[BTN_START_ADS, BTN_STOP_ADS]),
        row(&[BTN_INTERVAL, BTN_STATUS]),
        row(&[BTN_TOGGLE_LOGS, BTN_RESET]),
    ])
    .resize_keyboard()
}
