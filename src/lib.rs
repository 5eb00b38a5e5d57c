use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
mod alarms;
mod background;
mod clock;
mod commands;
mod config;
mod database;
mod engine;
mod ipc;
mod models;
mod observer;
mod rollover;
mod router;
mod schedule;
mod store;
pub use crate::alarms::{AlarmInfo, AlarmRegistry, FiredAlarm};
pub use crate::background::{initialize_defaults, Background};
pub use crate::clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use crate::commands::{format_hms, parse_tracked_url, Panel, PanelSnapshot, StatusLine, UrlError};
pub use crate::config::TrackerConfig;
pub use crate::engine::{SessionState, SessionSummary, SessionTimer, StatsClient};
pub use crate::ipc::{keys, ActionMessage, StatsReply};
pub use crate::models::{DailyStats, HistoryEntry, HistoryLog, DEFAULT_TRACKED_URL, HISTORY_LIMIT};
pub use crate::observer::{ObserverHost, ObserverRegistrar, ObserverRegistration, StoreObserverHost};
pub use crate::rollover::{roll_over, RolloverOutcome};
pub use crate::router::{RouterError, RouterHandle, StatsRouter};
pub use crate::schedule::RolloverScheduler;
pub use crate::store::{MemoryStore, PersistentStore, StoreChange, StoreError, StoreMap};
pub use database::Database;


const HELP: &str = "Commands: start | end | task | url <pattern> | status | {json action} | quit";

pub fn run() {
    // Инициализация логирования: по умолчанию info (если RUST_LOG не задан)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = TrackerConfig::from_env();

    let db = match open_database(&config.data_dir) {
        Ok(db) => db,
        Err(e) => {
            error!("[SETUP] {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("[SETUP] Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(serve(db, config));
}

/// Create the data directory and open the database.
/// A corrupted file is moved aside and a fresh database is created once.
fn open_database(data_dir: &Path) -> Result<Database, String> {
    std::fs::create_dir_all(data_dir).map_err(|e| {
        let msg = match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                "Permission denied. Check the data directory is writable."
            }
            _ => "Failed to create data directory.",
        };
        format!("{} Path: {}: {}", msg, data_dir.display(), e)
    })?;

    let db_path = data_dir.join(config::DB_FILE_NAME);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| format!("Database path contains invalid UTF-8: {}", db_path.display()))?;

    match Database::new(db_path_str) {
        Ok(db) => Ok(db),
        Err(e) => {
            let err_str = e.to_string();
            let is_corruption = err_str.contains("corruption") || err_str.contains("integrity");
            if !is_corruption || !db_path.exists() {
                return Err(format!("Failed to initialize database: {}", e));
            }
            let backup_path = data_dir.join(format!(
                "{}.corrupted.{}",
                config::DB_FILE_NAME,
                chrono::Utc::now().timestamp()
            ));
            std::fs::rename(&db_path, &backup_path).map_err(|rename_e| {
                warn!(
                    "[DB] Failed to rename corrupted DB to {:?}: {}",
                    backup_path, rename_e
                );
                format!("Database corrupted and could not backup: {}", e)
            })?;
            info!("[DB] Corrupted DB backed up to {:?}, starting fresh", backup_path);
            Database::new(db_path_str).map_err(|e2| format!("Failed to create fresh database: {}", e2))
        }
    }
}

async fn serve(db: Database, config: TrackerConfig) {
    let watcher = db.spawn_change_watcher(config.store_poll_interval);
    let store: Arc<dyn PersistentStore> = Arc::new(db);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let host = Arc::new(StoreObserverHost::new(store.clone()));

    let background = Background::start(store.clone(), host, clock.clone(), &config).await;
    let router = background.router();
    let panel = Panel::open(store, Arc::new(router.clone()), clock, &config).await;

    print_status(&panel).await;
    println!("{}", HELP);

    let mut view = panel.subscribe_view();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    warn!("[PANEL] View closed");
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    print!("{}", panel.render(&snapshot));
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !execute(line.trim(), &panel, &router).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("[SETUP] Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("[SHUTDOWN] Ctrl-C received");
                break;
            }
        }
    }

    // Активная сессия остаётся в хранилище и продолжится при следующем открытии
    drop(panel);
    background.shutdown();
    watcher.abort();
}

/// Returns false when the loop should stop.
async fn execute(line: &str, panel: &Panel, router: &RouterHandle) -> bool {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "quit" | "exit" => return false,
        "start" => match panel.start_session().await {
            Ok(_) => println!("Session started."),
            Err(e) => println!("{}", e),
        },
        "end" => match panel.end_session().await {
            Ok(summary) => {
                println!("Session ended: {}", format_hms(summary.elapsed_seconds));
                if let Some(Err(e)) = summary.committed {
                    println!("Session time was not recorded: {}", e);
                }
            }
            Err(e) => println!("{}", e),
        },
        "task" => print_reply(router.send(ActionMessage::IncrementTaskCount).await),
        "url" => match panel.save_tracked_url(arg).await {
            Ok(true) => println!("{}", commands::URL_SAVED),
            Ok(false) => println!("Empty URL ignored."),
            Err(e) => println!("{}", e),
        },
        "status" => print_status(panel).await,
        _ if line.starts_with('{') => print_reply(router.dispatch_json(line).await),
        _ => println!("{}", HELP),
    }
    true
}

fn print_reply(reply: Option<StatsReply>) {
    match reply {
        Some(reply) => match serde_json::to_string(&reply) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("[ROUTER] Failed to serialize reply: {}", e),
        },
        None => println!("Accepted."),
    }
}

async fn print_status(panel: &Panel) {
    match panel.snapshot().await {
        Ok(snapshot) => print!("{}", panel.render(&snapshot)),
        Err(e) => println!("Failed to load stats: {}", e),
    }
}
