pub mod command;
pub mod text;
pub mod ui;

pub use command::command_handler;
pub use text::text_handler;
