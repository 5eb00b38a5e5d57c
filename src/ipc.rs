//! Centralized store keys, alarm names and the panel/detector → background message contract.
//! Prevents typos and keeps the wire shapes in one place.

use crate::models::DailyStats;
use serde::{Deserialize, Serialize};

/// Persisted key layout (PersistentStore)
pub mod keys {
    pub const TRACKED_URL: &str = "trackedUrl";
    pub const DAILY_STATS: &str = "dailyStats";
    pub const HISTORY: &str = "last5Days";
    /// Epoch milliseconds, present only while a session is active
    pub const SESSION_START: &str = "sessionStartTime";
    /// DD/MM/YYYY of the last closed-out day
    pub const LAST_ROLLOVER: &str = "lastRolloverDate";
    pub const OBSERVERS: &str = "observerRegistrations";
}

/// Alarm names (AlarmRegistry identity)
pub mod alarms {
    pub const DAILY_RESET: &str = "dailyReset";
}

/// Action names as they appear on the wire (serde derives the same strings)
pub mod actions {
    pub const UPDATE_TRACKED_URL: &str = "updateTrackedUrl";
    pub const INCREMENT_TASK_COUNT: &str = "incrementTaskCount";
    pub const ADD_SESSION_TIME: &str = "addSessionTime";
}

/// Inbound action message (`{"action": ...}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ActionMessage {
    /// Tracked URL changed; re-register the page observer. No reply.
    UpdateTrackedUrl,
    IncrementTaskCount,
    /// `time` is seconds; signed so that bad senders can be rejected explicitly
    AddSessionTime { time: i64 },
    /// Anything else: no-op, still answered
    #[serde(other)]
    Unknown,
}

impl ActionMessage {
    pub fn parse(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| format!("Malformed action message: {}", e))
    }

    /// Every action except updateTrackedUrl gets exactly one reply
    pub fn expects_reply(&self) -> bool {
        !matches!(self, ActionMessage::UpdateTrackedUrl)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionMessage::UpdateTrackedUrl => actions::UPDATE_TRACKED_URL,
            ActionMessage::IncrementTaskCount => actions::INCREMENT_TASK_COUNT,
            ActionMessage::AddSessionTime { .. } => actions::ADD_SESSION_TIME,
            ActionMessage::Unknown => "unknown",
        }
    }
}

/// Ответ роутера: либо актуальная статистика, либо ошибка
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_stats: Option<DailyStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatsReply {
    pub fn updated(stats: DailyStats) -> Self {
        Self {
            updated_stats: Some(stats),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            updated_stats: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<DailyStats, String> {
        match (self.updated_stats, self.error) {
            (_, Some(error)) => Err(error),
            (Some(stats), None) => Ok(stats),
            (None, None) => Err("Empty reply".to_string()),
        }
    }
}
