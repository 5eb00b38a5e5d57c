use crate::engine::{SessionState, SessionSummary, SessionTimer};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Целые секунды между стартом и `now_ms`; часы назад дают 0
pub(crate) fn elapsed_between(started_at_ms: i64, now_ms: i64) -> u64 {
    let diff = now_ms.saturating_sub(started_at_ms);
    if diff < 0 {
        warn!(
            "[SESSION] Clock went backwards: now {} < start {}",
            now_ms, started_at_ms
        );
        return 0;
    }
    (diff / 1000) as u64
}

impl SessionTimer {
    /// Переход: Idle → Active
    /// Если в хранилище уже есть старт (другая панель, переоткрытие) - продолжаем его
    pub async fn start(&self) -> Result<SessionState, String> {
        if let SessionState::Active { .. } = self.state() {
            warn!("[FSM] Invalid transition: Active → Active (session already running)");
            return Err("Session is already active".to_string());
        }

        let (started_at_ms, existed) = self
            .claim_start(self.clock.now_ms())
            .await
            .map_err(|e| format!("Failed to persist session start: {}", e))?;
        if existed {
            info!("[SESSION] Resuming persisted session started at {}", started_at_ms);
        } else {
            info!("[SESSION] Session started at {}", started_at_ms);
        }

        self.activate(started_at_ms)?;
        Ok(self.state())
    }

    /// Переход: Active → Idle
    /// Коммитит только тот, кто забрал `sessionStartTime` из хранилища.
    /// Если старт уже снят другой панелью, сессия закрывается без коммита.
    pub async fn end(&self) -> Result<SessionSummary, String> {
        let was_active = self.is_active();

        // GUARD: при ошибке чтения состояние не меняем, сессия продолжается
        let claimed = self.take_start().await.map_err(|e| {
            error!("[SESSION] Failed to read session start on end: {}", e);
            format!("Failed to read session start: {}", e)
        })?;

        self.stop_ticker();
        self.set_idle()?;

        let Some(started_at_ms) = claimed else {
            if was_active {
                info!("[SESSION] Session already ended elsewhere, nothing to commit");
                return Ok(SessionSummary {
                    elapsed_seconds: 0,
                    committed: None,
                });
            }
            warn!("[FSM] Invalid transition: Idle → Idle (no session to end)");
            return Err("No active session".to_string());
        };

        let elapsed_seconds = elapsed_between(started_at_ms, self.clock.now_ms());
        let committed = if elapsed_seconds > 0 {
            let result = self.client.add_session_time(elapsed_seconds).await;
            match &result {
                Ok(stats) => info!(
                    "[SESSION] Committed {}s, day total {}s",
                    elapsed_seconds, stats.time_spent_seconds
                ),
                Err(e) => error!(
                    "[SESSION] Failed to commit {}s session: {}",
                    elapsed_seconds, e
                ),
            }
            Some(result)
        } else {
            debug!("[SESSION] Session shorter than a second, nothing to commit");
            None
        };

        Ok(SessionSummary {
            elapsed_seconds,
            committed,
        })
    }

    /// Старт снят в хранилище (другая панель завершила сессию): Idle без коммита
    pub fn on_start_cleared(&self) -> Result<(), String> {
        if !self.is_active() {
            return Ok(());
        }
        self.stop_ticker();
        self.set_idle()?;
        info!("[SESSION] Session ended by another view");
        Ok(())
    }

    /// Старт появился или изменился в хранилище (другая панель начала сессию)
    pub fn on_start_set(&self, started_at_ms: i64) -> Result<(), String> {
        if self.state() == (SessionState::Active { started_at_ms }) {
            return Ok(());
        }
        self.activate(started_at_ms)?;
        info!("[SESSION] Following session started at {} by another view", started_at_ms);
        Ok(())
    }

    /// Привести состояние к хранилищу (пропущенные уведомления)
    pub async fn resync(&self) -> Result<(), String> {
        let persisted = self
            .load_start()
            .await
            .map_err(|e| format!("Failed to read session start: {}", e))?;
        match persisted {
            Some(started_at_ms) => self.on_start_set(started_at_ms),
            None => self.on_start_cleared(),
        }
    }

    /// Восстановление при открытии панели: если сессия сохранена, запускаем тикер
    pub async fn resume_if_active(&self) -> Result<bool, String> {
        let persisted = self
            .load_start()
            .await
            .map_err(|e| format!("Failed to read session start: {}", e))?;
        match persisted {
            Some(started_at_ms) => {
                self.activate(started_at_ms)?;
                info!("[RECOVERY] Active session restored (started at {})", started_at_ms);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn activate(&self, started_at_ms: i64) -> Result<(), String> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;
        *state = SessionState::Active { started_at_ms };
        drop(state);

        self.elapsed
            .send_replace(elapsed_between(started_at_ms, self.clock.now_ms()));

        let clock = self.clock.clone();
        let elapsed = self.elapsed.clone();
        let tick = self.tick;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                elapsed.send_replace(elapsed_between(started_at_ms, clock.now_ms()));
            }
        });

        let mut ticker = self
            .ticker
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;
        if let Some(old) = ticker.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    fn stop_ticker(&self) {
        match self.ticker.lock() {
            Ok(mut ticker) => {
                if let Some(handle) = ticker.take() {
                    handle.abort();
                }
            }
            Err(e) => error!("[SESSION] Ticker mutex poisoned: {}", e),
        }
    }

    fn set_idle(&self) -> Result<(), String> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;
        *state = SessionState::Idle;
        drop(state);
        self.elapsed.send_replace(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_between_floors_to_seconds() {
        assert_eq!(elapsed_between(1_000, 126_999), 125);
        assert_eq!(elapsed_between(0, 999), 0);
    }

    #[test]
    fn test_elapsed_between_clock_backwards() {
        assert_eq!(elapsed_between(10_000, 5_000), 0);
    }
}
