//! Display panel: today's totals, the 5-day history, the session timer and
//! the tracked-URL editor.
//!
//! A panel follows the store while open: stats, history and URL changes
//! refresh its view, and a session started or ended in another panel (or
//! another process) moves its timer without committing anything.

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::engine::{SessionState, SessionSummary, SessionTimer, StatsClient};
use crate::ipc::keys;
use crate::models::{resolve_tracked_url, DailyStats, HistoryLog};
use crate::store::{decode, PersistentStore, StoreChange, StoreError, StoreMap};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const URL_SAVED: &str = "URL saved!";
pub const INVALID_URL: &str = "Invalid URL format.";
pub const SAVE_FAILED: &str = "Failed to save URL.";
pub const NO_HISTORY: &str = "No history yet.";

#[derive(Debug, Clone, PartialEq)]
pub enum UrlError {
    Invalid(String),
    Persist(StoreError),
}

impl std::fmt::Display for UrlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlError::Invalid(reason) => write!(f, "{} ({})", INVALID_URL, reason),
            UrlError::Persist(e) => write!(f, "{} ({})", SAVE_FAILED, e),
        }
    }
}

impl std::error::Error for UrlError {}

/// Проверка введённого URL. `Ok(None)` - пустой ввод, игнорируется.
pub fn parse_tracked_url(input: &str) -> Result<Option<String>, UrlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    url::Url::parse(trimmed)
        .map(|_| Some(trimmed.to_string()))
        .map_err(|e| UrlError::Invalid(e.to_string()))
}

/// HH:MM:SS; hours are not wrapped at 24
pub fn format_hms(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[derive(Debug, Default)]
struct StatusState {
    text: Option<String>,
    generation: u64,
}

/// Transient status message that clears itself.
///
/// Each message bumps a generation counter; a clear timer only clears the
/// message it was started for.
pub struct StatusLine {
    state: Arc<Mutex<StatusState>>,
    clear_after: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl StatusLine {
    pub fn new(clear_after: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(StatusState::default())),
            clear_after,
            timer: Mutex::new(None),
        }
    }

    pub fn show(&self, message: impl Into<String>) {
        let generation = match self.state.lock() {
            Ok(mut state) => {
                state.generation += 1;
                state.text = Some(message.into());
                state.generation
            }
            Err(e) => {
                error!("[PANEL] Status mutex poisoned: {}", e);
                return;
            }
        };

        let state = self.state.clone();
        let clear_after = self.clear_after;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(clear_after).await;
            if let Ok(mut state) = state.lock() {
                if state.generation == generation {
                    state.text = None;
                }
            }
        });

        if let Ok(mut timer) = self.timer.lock() {
            if let Some(old) = timer.replace(handle) {
                old.abort();
            }
        }
    }

    pub fn current(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.text.clone())
    }
}

impl Drop for StatusLine {
    fn drop(&mut self) {
        if let Ok(timer) = self.timer.get_mut() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

/// Всё, что панель показывает при открытии
#[derive(Debug, Clone, PartialEq)]
pub struct PanelSnapshot {
    pub stats: DailyStats,
    pub history: HistoryLog,
    pub tracked_url: String,
}

async fn load_snapshot(
    store: &dyn PersistentStore,
    default_url: &str,
) -> Result<PanelSnapshot, StoreError> {
    let data = store
        .get(&[keys::DAILY_STATS, keys::HISTORY, keys::TRACKED_URL])
        .await?;
    let stored_url: Option<String> = decode(&data, keys::TRACKED_URL)?;
    Ok(PanelSnapshot {
        stats: decode(&data, keys::DAILY_STATS)?.unwrap_or_default(),
        history: decode(&data, keys::HISTORY)?.unwrap_or_default(),
        tracked_url: resolve_tracked_url(stored_url.as_deref(), default_url),
    })
}

/// Перечитать снимок и опубликовать его подписчикам view
async fn refresh_view(
    store: &dyn PersistentStore,
    view: &watch::Sender<Option<PanelSnapshot>>,
    default_url: &str,
) {
    match load_snapshot(store, default_url).await {
        Ok(snapshot) => {
            view.send_replace(Some(snapshot));
        }
        Err(e) => warn!("[PANEL] Failed to refresh view: {}", e),
    }
}

/// `sessionStartTime` changed in the store: follow it without committing
fn follow_session_start(timer: &SessionTimer, value: Option<&Value>) {
    let result = match value {
        None | Some(Value::Null) => timer.on_start_cleared(),
        Some(value) => match value.as_i64() {
            Some(started_at_ms) => timer.on_start_set(started_at_ms),
            None => {
                warn!("[PANEL] Ignoring unreadable session start {}", value);
                Ok(())
            }
        },
    };
    if let Err(e) = result {
        error!("[PANEL] Failed to follow session change: {}", e);
    }
}

fn spawn_store_sync(
    store: Arc<dyn PersistentStore>,
    timer: Arc<SessionTimer>,
    view: Arc<watch::Sender<Option<PanelSnapshot>>>,
    default_url: String,
) -> JoinHandle<()> {
    // Подписка до spawn: изменения между open() и стартом задачи не теряются
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        loop {
            let batch: Vec<StoreChange> = match changes.recv().await {
                Ok(batch) => batch,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("[PANEL] Missed {} store update(s), resyncing", n);
                    if let Err(e) = timer.resync().await {
                        warn!("[PANEL] Session resync failed: {}", e);
                    }
                    refresh_view(&*store, &view, &default_url).await;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let mut refresh = false;
            for change in &batch {
                match change.key.as_str() {
                    keys::SESSION_START => {
                        follow_session_start(&timer, change.new_value.as_ref());
                        refresh = true;
                    }
                    keys::DAILY_STATS | keys::HISTORY | keys::TRACKED_URL => refresh = true,
                    _ => {}
                }
            }
            if refresh {
                refresh_view(&*store, &view, &default_url).await;
            }
        }
    })
}

pub struct Panel {
    store: Arc<dyn PersistentStore>,
    client: Arc<dyn StatsClient>,
    timer: Arc<SessionTimer>,
    status: StatusLine,
    default_url: String,
    view: Arc<watch::Sender<Option<PanelSnapshot>>>,
    sync: JoinHandle<()>,
}

impl Panel {
    /// Open a panel; an already persisted session resumes its ticker.
    pub async fn open(
        store: Arc<dyn PersistentStore>,
        client: Arc<dyn StatsClient>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> Self {
        let timer = Arc::new(SessionTimer::new(
            store.clone(),
            client.clone(),
            clock,
            config.session_tick,
        ));
        let (view, _) = watch::channel(None);
        let view = Arc::new(view);
        let sync = spawn_store_sync(
            store.clone(),
            timer.clone(),
            view.clone(),
            config.default_tracked_url.clone(),
        );

        if let Err(e) = timer.resume_if_active().await {
            warn!("[PANEL] Could not restore session on open: {}", e);
        }
        refresh_view(&*store, &view, &config.default_tracked_url).await;

        Self {
            store,
            client,
            timer,
            status: StatusLine::new(config.status_clear_after),
            default_url: config.default_tracked_url.clone(),
            view,
            sync,
        }
    }

    pub fn timer(&self) -> &SessionTimer {
        &self.timer
    }

    pub fn status(&self) -> Option<String> {
        self.status.current()
    }

    /// Latest snapshot, refreshed whenever the store changes under the panel
    pub fn subscribe_view(&self) -> watch::Receiver<Option<PanelSnapshot>> {
        self.view.subscribe()
    }

    pub async fn snapshot(&self) -> Result<PanelSnapshot, StoreError> {
        load_snapshot(&*self.store, &self.default_url).await
    }

    pub fn render(&self, snapshot: &PanelSnapshot) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Today: {}  Tasks: {}\n",
            format_hms(snapshot.stats.time_spent_seconds),
            snapshot.stats.tasks_completed
        ));
        let session = match self.timer.state() {
            SessionState::Active { .. } => "active",
            SessionState::Idle => "idle",
        };
        out.push_str(&format!(
            "Session: {} ({})\n",
            format_hms(self.timer.elapsed_seconds()),
            session
        ));
        out.push_str(&format!("Tracked URL: {}\n", snapshot.tracked_url));
        out.push_str("Last 5 days:\n");
        if snapshot.history.is_empty() {
            out.push_str(&format!("  {}\n", NO_HISTORY));
        }
        for entry in snapshot.history.entries() {
            out.push_str(&format!(
                "  {}  {}  {} task(s)\n",
                entry.date,
                format_hms(entry.time_spent_seconds),
                entry.tasks_completed
            ));
        }
        if let Some(status) = self.status.current() {
            out.push_str(&format!("[{}]\n", status));
        }
        out
    }

    pub async fn start_session(&self) -> Result<SessionState, String> {
        self.timer.start().await
    }

    pub async fn end_session(&self) -> Result<SessionSummary, String> {
        self.timer.end().await
    }

    /// Returns `Ok(true)` when a URL was saved, `Ok(false)` for empty input.
    pub async fn save_tracked_url(&self, input: &str) -> Result<bool, UrlError> {
        let url = match parse_tracked_url(input) {
            Ok(Some(url)) => url,
            Ok(None) => {
                debug!("[PANEL] Empty tracked URL ignored");
                return Ok(false);
            }
            Err(e) => {
                warn!("[PANEL] Rejected tracked URL {:?}: {}", input.trim(), e);
                self.status.show(INVALID_URL);
                return Err(e);
            }
        };

        let mut items = StoreMap::new();
        items.insert(keys::TRACKED_URL.to_string(), Value::String(url.clone()));
        if let Err(e) = self.store.set(items).await {
            error!("[PANEL] Failed to save tracked URL: {}", e);
            self.status.show(SAVE_FAILED);
            return Err(UrlError::Persist(e));
        }

        if let Err(e) = self.client.notify_tracked_url_changed().await {
            error!("[PANEL] Failed to notify background about URL change: {}", e);
        }
        info!("[PANEL] Tracked URL saved: {}", url);
        self.status.show(URL_SAVED);
        Ok(true)
    }
}

impl Drop for Panel {
    fn drop(&mut self) {
        self.sync.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(125), "00:02:05");
        assert_eq!(format_hms(3 * 3600 + 7), "03:00:07");
        assert_eq!(format_hms(30 * 3600), "30:00:00");
    }

    #[test]
    fn test_parse_tracked_url() {
        assert_eq!(parse_tracked_url("   ").unwrap(), None);
        assert_eq!(
            parse_tracked_url(" https://example.com/tasks* ").unwrap(),
            Some("https://example.com/tasks*".to_string())
        );
        assert!(matches!(
            parse_tracked_url("not a url"),
            Err(UrlError::Invalid(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_clears_after_delay() {
        let status = StatusLine::new(Duration::from_secs(2));
        status.show(URL_SAVED);
        assert_eq!(status.current().as_deref(), Some(URL_SAVED));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(status.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_status_not_cleared_by_older_timer() {
        let status = StatusLine::new(Duration::from_secs(2));
        status.show(INVALID_URL);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        status.show(URL_SAVED);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(status.current().as_deref(), Some(URL_SAVED));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(status.current(), None);
    }
}
