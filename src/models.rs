use serde::{Deserialize, Serialize};

/// Трекаемый URL по умолчанию (первый запуск)
pub const DEFAULT_TRACKED_URL: &str = "https://www.multimango.com/tasks";

/// Сколько дней истории храним
pub const HISTORY_LIMIT: usize = 5;

/// Статистика за текущий день
/// Перезаписывается целиком при каждой мутации и при rollover
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    #[serde(alias = "timeSpent")]
    pub time_spent_seconds: u64,
    pub tasks_completed: u64,
}

impl DailyStats {
    pub fn is_empty(&self) -> bool {
        self.time_spent_seconds == 0 && self.tasks_completed == 0
    }
}

/// Снимок статистики за закрытый день
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// DD/MM/YYYY в целевой таймзоне
    pub date: String,
    #[serde(alias = "timeSpent")]
    pub time_spent_seconds: u64,
    pub tasks_completed: u64,
}

impl HistoryEntry {
    pub fn new(date: impl Into<String>, stats: DailyStats) -> Self {
        Self {
            date: date.into(),
            time_spent_seconds: stats.time_spent_seconds,
            tasks_completed: stats.tasks_completed,
        }
    }

    pub fn stats(&self) -> DailyStats {
        DailyStats {
            time_spent_seconds: self.time_spent_seconds,
            tasks_completed: self.tasks_completed,
        }
    }
}

/// История: новые записи первыми, не длиннее HISTORY_LIMIT
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<HistoryEntry>")]
pub struct HistoryLog(Vec<HistoryEntry>);

impl From<Vec<HistoryEntry>> for HistoryLog {
    fn from(entries: Vec<HistoryEntry>) -> Self {
        Self::from_entries(entries)
    }
}

impl HistoryLog {
    /// Trims on construction: an over-long persisted log never survives a read.
    pub fn from_entries(mut entries: Vec<HistoryEntry>) -> Self {
        entries.truncate(HISTORY_LIMIT);
        Self(entries)
    }

    /// Prepends and evicts the oldest entries beyond the limit.
    pub fn push_front(&mut self, entry: HistoryEntry) {
        self.0.insert(0, entry);
        self.0.truncate(HISTORY_LIMIT);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.0.first()
    }
}

/// Итоговый URL для трекинга: пустое или отсутствующее значение → default
pub fn resolve_tracked_url(stored: Option<&str>, default: &str) -> String {
    match stored.map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => {
            if default.trim().is_empty() {
                DEFAULT_TRACKED_URL.to_string()
            } else {
                default.trim().to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(day: u32) -> HistoryEntry {
        HistoryEntry::new(
            format!("{:02}/01/2024", day),
            DailyStats {
                time_spent_seconds: day as u64 * 60,
                tasks_completed: day as u64,
            },
        )
    }

    #[test]
    fn test_history_push_front_evicts_oldest() {
        let mut log = HistoryLog::default();
        for day in 1..=7 {
            log.push_front(entry(day));
        }
        assert_eq!(log.len(), HISTORY_LIMIT);
        assert_eq!(log.latest().unwrap().date, "07/01/2024");
        assert_eq!(log.entries().last().unwrap().date, "03/01/2024");
    }

    #[test]
    fn test_history_from_entries_truncates() {
        let log = HistoryLog::from_entries((1..=9).map(entry).collect());
        assert_eq!(log.len(), HISTORY_LIMIT);
        assert_eq!(log.latest().unwrap().date, "01/01/2024");
    }

    #[test]
    fn test_history_overlong_persisted_log_is_trimmed_on_read() {
        let raw = serde_json::to_value((1..=8).map(entry).collect::<Vec<_>>()).unwrap();
        let log: HistoryLog = serde_json::from_value(raw).unwrap();
        assert_eq!(log.len(), HISTORY_LIMIT);
        assert!(serde_json::to_value(&log).unwrap().is_array());
    }

    #[test]
    fn test_daily_stats_accepts_legacy_field_name() {
        let stats: DailyStats =
            serde_json::from_str(r#"{"timeSpent": 90, "tasksCompleted": 2}"#).unwrap();
        assert_eq!(stats.time_spent_seconds, 90);
        assert_eq!(stats.tasks_completed, 2);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["timeSpentSeconds"], 90);
    }

    #[test]
    fn test_daily_stats_rejects_negative_values() {
        let parsed = serde_json::from_str::<DailyStats>(
            r#"{"timeSpentSeconds": -5, "tasksCompleted": 0}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_history_entry_shape() {
        let json = serde_json::to_value(entry(4)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"date": "04/01/2024", "timeSpentSeconds": 240, "tasksCompleted": 4})
        );
    }

    #[test]
    fn test_resolve_tracked_url_fallbacks() {
        assert_eq!(
            resolve_tracked_url(Some("https://example.com/*"), DEFAULT_TRACKED_URL),
            "https://example.com/*"
        );
        assert_eq!(
            resolve_tracked_url(Some("   "), DEFAULT_TRACKED_URL),
            DEFAULT_TRACKED_URL
        );
        assert_eq!(resolve_tracked_url(None, ""), DEFAULT_TRACKED_URL);
    }
}
