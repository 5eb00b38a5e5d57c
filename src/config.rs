use crate::models::DEFAULT_TRACKED_URL;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const ENV_DATA_DIR: &str = "TASKTALLY_DATA_DIR";
pub const ENV_TRACKED_URL: &str = "TASKTALLY_TRACKED_URL";
pub const ENV_MAX_SESSION_SECS: &str = "TASKTALLY_MAX_SESSION_SECS";

pub const DB_FILE_NAME: &str = "tasktally.db";

/// Runtime settings. Defaults match the shipped behaviour; environment
/// variables override individual fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    /// Used when `trackedUrl` is not stored yet
    pub default_tracked_url: String,
    /// Верхняя граница одного addSessionTime (сек)
    pub max_session_seconds: u64,
    pub status_clear_after: Duration,
    pub session_tick: Duration,
    /// Как часто проверять коммиты других процессов в SQLite
    pub store_poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tasktally");
        Self {
            data_dir,
            default_tracked_url: DEFAULT_TRACKED_URL.to_string(),
            max_session_seconds: 24 * 60 * 60,
            status_clear_after: Duration::from_secs(2),
            session_tick: Duration::from_secs(1),
            store_poll_interval: Duration::from_millis(500),
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overrides from an arbitrary variable source; unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup(ENV_TRACKED_URL).filter(|v| !v.trim().is_empty()) {
            config.default_tracked_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_MAX_SESSION_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.max_session_seconds = secs,
                _ => warn!(
                    "[CONFIG] Ignoring invalid {}={:?}, using {}",
                    ENV_MAX_SESSION_SECS, raw, config.max_session_seconds
                ),
            }
        }
        config
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}
