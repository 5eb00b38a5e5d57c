use crate::clock::Clock;
use crate::models::DailyStats;
use crate::store::PersistentStore;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
mod core;
mod db;

/// Канал к фоновому роутеру, через который таймер коммитит сессии
#[async_trait]
pub trait StatsClient: Send + Sync {
    /// Ждёт подтверждения от роутера
    async fn add_session_time(&self, seconds: u64) -> Result<DailyStats, String>;
    /// Fire-and-forget: tracked URL changed, re-register the observer
    async fn notify_tracked_url_changed(&self) -> Result<(), String>;
}

/// Session Timer - FSM Idle ⇄ Active
/// Источник истины о старте сессии - `sessionStartTime` в хранилище,
/// поэтому сессия переживает закрытие панели
pub struct SessionTimer {
    pub(crate) store: Arc<dyn PersistentStore>,
    pub(crate) client: Arc<dyn StatsClient>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<SessionState>,
    /// Тикер отображения; None в Idle
    pub(crate) ticker: Mutex<Option<JoinHandle<()>>>,
    /// Прошедшие секунды для отображения
    pub(crate) elapsed: Arc<watch::Sender<u64>>,
    pub(crate) tick: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "state")]
pub enum SessionState {
    Idle,
    Active { started_at_ms: i64 },
}

/// Итог завершённой сессии
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub elapsed_seconds: u64,
    /// Ответ роутера; None если коммитить было нечего
    pub committed: Option<Result<DailyStats, String>>,
}

impl SessionTimer {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        client: Arc<dyn StatsClient>,
        clock: Arc<dyn Clock>,
        tick: Duration,
    ) -> Self {
        let (elapsed, _) = watch::channel(0);
        Self {
            store,
            client,
            clock,
            state: Mutex::new(SessionState::Idle),
            ticker: Mutex::new(None),
            elapsed: Arc::new(elapsed),
            tick,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), SessionState::Active { .. })
    }

    /// Подписка на отображаемое время (секунды)
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.elapsed.subscribe()
    }

    pub fn elapsed_seconds(&self) -> u64 {
        *self.elapsed.borrow()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        if let Ok(ticker) = self.ticker.get_mut() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }
}
