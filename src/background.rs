use crate::alarms::AlarmRegistry;
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::ipc::alarms::DAILY_RESET;
use crate::ipc::keys;
use crate::models::{DailyStats, HistoryLog};
use crate::observer::{ObserverHost, ObserverRegistrar};
use crate::rollover::RolloverOutcome;
use crate::router::{spawn_alarm_pump, RouterError, RouterHandle, StatsRouter};
use crate::schedule::{
    closed_out_date, format_date_label, last_boundary, parse_date_label, RolloverScheduler,
};
use crate::store::{decode, encode, PersistentStore, StoreError, StoreMap};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Записать значения по умолчанию при первом запуске (нет dailyStats).
/// Уже сохранённые ключи не трогаем. Возвращает true, если это был первый запуск.
///
/// Проверка и запись идут одним `update`, так что два процесса, стартующие
/// одновременно, не затрут друг другу данные. Маркер последнего rollover
/// ставится на вчерашний день: до установки закрывать нечего.
pub async fn initialize_defaults(
    store: &dyn PersistentStore,
    default_tracked_url: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let default_tracked_url = default_tracked_url.to_string();
    let marker = format_date_label(closed_out_date(now));
    let written = store
        .update(
            &[
                keys::DAILY_STATS,
                keys::HISTORY,
                keys::TRACKED_URL,
                keys::LAST_ROLLOVER,
            ],
            Box::new(move |data: &StoreMap| {
                let present = |key: &str| data.get(key).is_some_and(|v| !v.is_null());
                let mut items = StoreMap::new();
                if present(keys::DAILY_STATS) {
                    return Ok(items);
                }

                items.insert(
                    keys::DAILY_STATS.to_string(),
                    encode(keys::DAILY_STATS, &DailyStats::default())?,
                );
                if !present(keys::HISTORY) {
                    items.insert(
                        keys::HISTORY.to_string(),
                        encode(keys::HISTORY, &HistoryLog::default())?,
                    );
                }
                if !present(keys::TRACKED_URL) {
                    items.insert(
                        keys::TRACKED_URL.to_string(),
                        Value::String(default_tracked_url),
                    );
                }
                if !present(keys::LAST_ROLLOVER) {
                    items.insert(keys::LAST_ROLLOVER.to_string(), Value::String(marker));
                }
                Ok(items)
            }),
        )
        .await?;

    if written.is_empty() {
        return Ok(false);
    }
    info!("[SETUP] First run: defaults initialized");
    Ok(true)
}

/// Границы, пропущенные пока процесс не работал: закрыть последний день одним
/// rollover. Несколько пропущенных дней дают одну запись (за вчера).
/// Без маркера (данные старше маркера) ничего не делаем.
async fn catch_up_missed_rollover(
    store: &dyn PersistentStore,
    router: &RouterHandle,
    now: DateTime<Utc>,
) -> Result<Option<RolloverOutcome>, RouterError> {
    let data = store.get(&[keys::LAST_ROLLOVER]).await?;
    let Some(marker) = decode::<String>(&data, keys::LAST_ROLLOVER)? else {
        return Ok(None);
    };
    let Some(last_closed) = parse_date_label(&marker) else {
        warn!("[ROLLOVER] Unreadable rollover marker '{}', skipping catch-up", marker);
        return Ok(None);
    };

    let boundary = last_boundary(now);
    if last_closed >= closed_out_date(boundary) {
        return Ok(None);
    }
    info!(
        "[ROLLOVER] Last closed day is {}, boundary at {} was missed while stopped; catching up",
        marker, boundary
    );
    router.roll_over(boundary).await.map(Some)
}

/// Background context: router worker, rollover alarm and observer registration.
pub struct Background {
    router: RouterHandle,
    scheduler: RolloverScheduler,
    tasks: Vec<JoinHandle<()>>,
}

impl Background {
    pub async fn start(
        store: Arc<dyn PersistentStore>,
        host: Arc<dyn ObserverHost>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> Self {
        // GUARD: сбой хранилища на старте не фатален, ключи останутся пустыми
        if let Err(e) =
            initialize_defaults(&*store, &config.default_tracked_url, clock.now()).await
        {
            error!("[SETUP] Failed to initialize defaults: {}", e);
        }

        let registrar = Arc::new(ObserverRegistrar::new(
            host,
            store.clone(),
            config.default_tracked_url.clone(),
        ));
        let (router, worker) = StatsRouter::new(
            store.clone(),
            registrar.clone(),
            clock.clone(),
            config.max_session_seconds,
        )
        .spawn();

        match catch_up_missed_rollover(&*store, &router, clock.now()).await {
            Ok(Some(RolloverOutcome::Rolled { entry, .. })) => {
                info!("[ROLLOVER] Caught up: closed {}", entry.date)
            }
            Ok(_) => {}
            Err(e) => error!("[ROLLOVER] Catch-up failed: {}", e),
        }

        let (registry, fired) = AlarmRegistry::new(clock.clone());
        let scheduler = RolloverScheduler::new(registry, clock);
        scheduler.install();

        registrar.refresh().await;

        let pump = spawn_alarm_pump(router.clone(), fired);
        info!("[SETUP] Background started");

        Self {
            router,
            scheduler,
            tasks: vec![worker, pump],
        }
    }

    pub fn router(&self) -> RouterHandle {
        self.router.clone()
    }

    pub fn scheduler(&self) -> &RolloverScheduler {
        &self.scheduler
    }

    /// Stop the alarm and the worker tasks. Queued requests get an error reply.
    pub fn shutdown(self) {
        self.scheduler.registry().clear(DAILY_RESET);
        for task in &self.tasks {
            task.abort();
        }
        info!("[SHUTDOWN] Background stopped");
    }
}
