use std::sync::Arc;

use anyhow::Error;
use teloxide::dptree;
use teloxide::prelude::*;

use crate::auth::{AuthLimits, AuthMachine};
use crate::commands::Command;
use crate::config::Settings;
use crate::database::DatabasePool;
use crate::handlers::{command_handler, text_handler};
use crate::notifier::BotNotifier;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::service::BotService;
use crate::session::{GrammersProvider, SessionPool};
use crate::store::ConfigStore;

mod auth;
mod commands;
mod config;
mod database;
mod error;
mod handlers;
mod notifier;
mod peers;
mod scheduler;
mod service;
mod session;
mod store;
mod utils;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // --- Logging Setup ---
    use log::LevelFilter;
    use std::env;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::Mutex;

    let parse_level = |raw: &str| match raw.to_uppercase().as_str() {
        "ERROR" => Some(LevelFilter::Error),
        "WARN" => Some(LevelFilter::Warn),
        "INFO" | "ALL" => Some(LevelFilter::Info),
        "DEBUG" => Some(LevelFilter::Debug),
        _ => None,
    };

    let console_level = env::var("CONSOLE_LOG_LEVEL")
        .ok()
        .and_then(|raw| parse_level(&raw))
        .unwrap_or(LevelFilter::Info);
    // OFF or anything unknown disables the file sink
    let file_level_config = env::var("FILE_LOG_LEVEL")
        .ok()
        .and_then(|raw| parse_level(&raw));

    let max_level = std::cmp::max(console_level, file_level_config.unwrap_or(LevelFilter::Off));

    let log_file = if file_level_config.is_some() {
        let path = env::var("LOG_FILE").unwrap_or_else(|_| "bot_errors.log".to_string());
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Some(Arc::new(Mutex::new(file)))
    } else {
        None
    };

    let mut builder = pretty_env_logger::formatted_builder();
    builder
        .filter(None, max_level)
        .format(move |buf, record| {
            let formatted_record = format!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            );

            if record.level() <= console_level {
                writeln!(buf, "{}", formatted_record)?;
            }

            if let (Some(file_level), Some(file_handle)) = (file_level_config, &log_file) {
                if record.level() <= file_level {
                    if let Ok(mut guard) = file_handle.lock() {
                        let _ = writeln!(guard, "{}", formatted_record);
                    }
                }
            }
            Ok(())
        })
        .init();

    log::info!("Starting ad broadcast bot...");
    let start_time = std::time::Instant::now();

    if let Err(e) = crate::config::load_environment() {
        log::error!("Failed to load environment: {}", e);
        return Err(e);
    }
    let settings = Settings::from_env()?;

    if let Err(e) = database::init_database(&settings.database_path) {
        log::error!("Failed to initialize the database: {}", e);
        return Err(e.into());
    }

    let db_pool = Arc::new(DatabasePool::new(
        settings.database_path.clone(),
        3, // Maximum 3 simultaneous database connections
    ));
    log::info!("Database initialized at {:?}", db_pool.path());

    let store = Arc::new(ConfigStore::new(Arc::clone(&db_pool), settings.default_interval_secs));

    let provider = match GrammersProvider::new(
        settings.api_id,
        settings.api_hash.clone(),
        settings.sessions_dir.clone(),
    ) {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            log::error!(
                "Failed to prepare sessions directory {:?}: {}",
                settings.sessions_dir,
                e
            );
            return Err(e.into());
        }
    };
    let pool = Arc::new(SessionPool::new(provider, settings.provider_timeout));

    let auth = AuthMachine::new(
        Arc::clone(&pool),
        AuthLimits {
            timeout: settings.auth_timeout,
            max_attempts: settings.auth_max_attempts,
        },
    );

    let bot = Bot::from_env();

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::new(BotNotifier::new(bot.clone())),
        SchedulerConfig {
            retry_backoff: settings.retry_backoff,
            max_failures: settings.broadcast_max_failures,
        },
    ));

    match scheduler.resume(settings.resume_on_start).await {
        Ok(0) => {}
        Ok(count) if settings.resume_on_start => log::info!("Resumed {} broadcast job(s)", count),
        Ok(count) => log::info!("Cleared {} stale running flag(s)", count),
        Err(e) => log::error!("Failed to reconcile running broadcasts: {}", e),
    }

    let service = Arc::new(BotService::new(store, pool, auth, Arc::clone(&scheduler)));

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(command_handler),
        )
        .branch(Update::filter_message().endpoint(text_handler));

    log::info!("Bot initialization completed in {:.2?}", start_time.elapsed());
    log::info!("Starting to dispatch updates...");

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![service])
        .build();

    tokio::select! {
        _ = dispatcher.dispatch() => {},
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
    }

    log::info!("{} broadcast job(s) active at shutdown", scheduler.running_count());
    scheduler.shutdown().await;

    log::info!("Bot shutdown complete");
    Ok(())
}
