use teloxide::utils::command::BotCommands;

use crate::handlers::ui::{
    BTN_ADD_CHAT, BTN_INTERVAL, BTN_LIST_CHATS, BTN_LOGIN, BTN_LOGOUT, BTN_REMOVE_CHAT, BTN_RESET,
    BTN_SET_MESSAGE, BTN_START_ADS, BTN_STATUS, BTN_STOP_ADS, BTN_TOGGLE_LOGS,
};

#[derive(BotCommands, Clone)]
#[command(
    rename_rule = "lowercase",
    description = "These commands are supported:"
)]
pub enum Command {
    #[command(description = "display this text.")]
    Help,
    #[command(description = "show the menu.")]
    Start,
    #[command(description = "abort the current login or prompt.")]
    Cancel,
}

/// Menu keywords. Text equal to one of these is always a command, never
/// input for a pending login or prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuAction {
    Login,
    Logout,
    AddChat,
    RemoveChat,
    ListChats,
    SetMessage,
    SetInterval,
    ToggleLogs,
    StartAds,
    StopAds,
    Status,
    Reset,
}

impl MenuAction {
    pub fn from_label(text: &str) -> Option<Self> {
        let action = match text.trim() {
            BTN_LOGIN => MenuAction::Login,
            BTN_LOGOUT => MenuAction::Logout,
            BTN_ADD_CHAT => MenuAction::AddChat,
            BTN_REMOVE_CHAT => MenuAction::RemoveChat,
            BTN_LIST_CHATS => MenuAction::ListChats,
            BTN_SET_MESSAGE => MenuAction::SetMessage,
            BTN_INTERVAL => MenuAction::SetInterval,
            BTN_TOGGLE_LOGS => MenuAction::ToggleLogs,
            BTN_START_ADS => MenuAction::StartAds,
            BTN_STOP_ADS => MenuAction::StopAds,
            BTN_STATUS => MenuAction::Status,
            BTN_RESET => MenuAction::Reset,
            _ => return None,
        };
        Some(action)
    }

    /// Read-only or scheduler actions leave a login in progress untouched.
    pub fn interrupts_login(self) -> bool {
        !matches!(
            self,
            MenuAction::ListChats | MenuAction::Status | MenuAction::StartAds | MenuAction::StopAds
        )
    }
}
