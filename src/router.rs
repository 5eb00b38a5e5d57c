//! Stats router: the single writer of `dailyStats`, `last5Days` and
//! `lastRolloverDate`.
//!
//! Every mutation (counter actions and rollovers) goes through one mpsc queue
//! consumed by one worker task, so read-modify-write sequences never
//! interleave. Callers talk to it through a cloneable [`RouterHandle`].

use crate::alarms::FiredAlarm;
use crate::clock::Clock;
use crate::engine::StatsClient;
use crate::ipc::alarms::DAILY_RESET;
use crate::ipc::{keys, ActionMessage, StatsReply};
use crate::models::DailyStats;
use crate::observer::ObserverRegistrar;
use crate::rollover::{roll_over, RolloverOutcome};
use crate::store::{decode, encode, PersistentStore, StoreError, StoreMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ROUTER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RouterError {
    /// Воркер остановлен, очередь закрыта
    Closed,
    /// Воркер уронил запрос, не ответив
    NoReply,
    Store(StoreError),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::Closed => write!(f, "Stats router is not running"),
            RouterError::NoReply => write!(f, "Stats router dropped the request"),
            RouterError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RouterError {}

impl From<StoreError> for RouterError {
    fn from(e: StoreError) -> Self {
        RouterError::Store(e)
    }
}

enum Command {
    Action {
        message: ActionMessage,
        reply: Option<oneshot::Sender<StatsReply>>,
    },
    Rollover {
        fired_at: DateTime<Utc>,
        done: oneshot::Sender<Result<RolloverOutcome, StoreError>>,
    },
}

#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Command>,
}

impl RouterHandle {
    /// Отправить действие. `None` только для updateTrackedUrl (ответ не положен);
    /// все остальные получают ровно один ответ, даже если воркер уже остановлен.
    pub async fn send(&self, message: ActionMessage) -> Option<StatsReply> {
        if !message.expects_reply() {
            if let Err(e) = self.enqueue(message, None).await {
                warn!("[ROUTER] Dropping fire-and-forget action: {}", e);
            }
            return None;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(e) = self.enqueue(message, Some(reply_tx)).await {
            return Some(StatsReply::failed(e.to_string()));
        }
        Some(
            reply_rx
                .await
                .unwrap_or_else(|_| StatsReply::failed(RouterError::NoReply.to_string())),
        )
    }

    /// Raw JSON entry point used by detectors and the stdin loop.
    pub async fn dispatch_json(&self, raw: &str) -> Option<StatsReply> {
        match ActionMessage::parse(raw) {
            Ok(message) => self.send(message).await,
            Err(e) => {
                warn!("[ROUTER] {}", e);
                Some(StatsReply::failed(e))
            }
        }
    }

    /// Run a rollover on the worker, ordered with the pending actions.
    pub async fn roll_over(&self, fired_at: DateTime<Utc>) -> Result<RolloverOutcome, RouterError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Rollover {
                fired_at,
                done: done_tx,
            })
            .await
            .map_err(|_| RouterError::Closed)?;
        done_rx
            .await
            .map_err(|_| RouterError::NoReply)?
            .map_err(RouterError::from)
    }

    async fn enqueue(
        &self,
        message: ActionMessage,
        reply: Option<oneshot::Sender<StatsReply>>,
    ) -> Result<(), RouterError> {
        self.tx
            .send(Command::Action { message, reply })
            .await
            .map_err(|_| RouterError::Closed)
    }
}

#[async_trait]
impl StatsClient for RouterHandle {
    async fn add_session_time(&self, seconds: u64) -> Result<DailyStats, String> {
        let time = i64::try_from(seconds).unwrap_or(i64::MAX);
        match self.send(ActionMessage::AddSessionTime { time }).await {
            Some(reply) => reply.into_result(),
            None => Err(RouterError::NoReply.to_string()),
        }
    }

    async fn notify_tracked_url_changed(&self) -> Result<(), String> {
        self.enqueue(ActionMessage::UpdateTrackedUrl, None)
            .await
            .map_err(|e| e.to_string())
    }
}

pub struct StatsRouter {
    store: Arc<dyn PersistentStore>,
    registrar: Arc<ObserverRegistrar>,
    clock: Arc<dyn Clock>,
    max_session_seconds: u64,
}

impl StatsRouter {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        registrar: Arc<ObserverRegistrar>,
        clock: Arc<dyn Clock>,
        max_session_seconds: u64,
    ) -> Self {
        Self {
            store,
            registrar,
            clock,
            max_session_seconds,
        }
    }

    /// Start the worker. It stops once every handle is dropped.
    pub fn spawn(self) -> (RouterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ROUTER_QUEUE_CAPACITY);
        let worker = tokio::spawn(self.run(rx));
        (RouterHandle { tx }, worker)
    }

    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        info!("[ROUTER] Worker started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Action { message, reply } => {
                    let name = message.name();
                    let result = self.handle_action(message).await;
                    if let (Some(reply_tx), Some(result)) = (reply, result) {
                        if reply_tx.send(result).is_err() {
                            debug!("[ROUTER] Caller of '{}' went away before the reply", name);
                        }
                    }
                }
                Command::Rollover { fired_at, done } => {
                    let result = roll_over(&*self.store, fired_at, self.clock.now()).await;
                    if let Err(e) = &result {
                        error!("[ROLLOVER] Rollover for firing at {} aborted: {}", fired_at, e);
                    }
                    let _ = done.send(result);
                }
            }
        }
        info!("[ROUTER] Queue closed, worker stopped");
    }

    async fn handle_action(&self, message: ActionMessage) -> Option<StatsReply> {
        match message {
            ActionMessage::UpdateTrackedUrl => {
                self.registrar.refresh().await;
                None
            }
            ActionMessage::IncrementTaskCount => Some(
                self.mutate(|stats| {
                    stats.tasks_completed = stats.tasks_completed.saturating_add(1)
                })
                .await,
            ),
            ActionMessage::AddSessionTime { time } if time < 0 => {
                warn!("[ROUTER] Rejected negative session time: {}s", time);
                Some(self.current().await)
            }
            ActionMessage::AddSessionTime { time } => {
                let mut seconds = time as u64;
                if seconds > self.max_session_seconds {
                    warn!(
                        "[ROUTER] Session time {}s exceeds limit, clamped to {}s",
                        seconds, self.max_session_seconds
                    );
                    seconds = self.max_session_seconds;
                }
                Some(
                    self.mutate(move |stats| {
                        stats.time_spent_seconds = stats.time_spent_seconds.saturating_add(seconds)
                    })
                    .await,
                )
            }
            ActionMessage::Unknown => {
                debug!("[ROUTER] Unknown action, replying with current stats");
                Some(self.current().await)
            }
        }
    }

    async fn load(&self) -> Result<DailyStats, StoreError> {
        let data = self.store.get(&[keys::DAILY_STATS]).await?;
        Ok(decode(&data, keys::DAILY_STATS)?.unwrap_or_default())
    }

    async fn current(&self) -> StatsReply {
        match self.load().await {
            Ok(stats) => StatsReply::updated(stats),
            Err(e) => {
                error!("[ROUTER] Failed to read daily stats: {}", e);
                StatsReply::failed(e.to_string())
            }
        }
    }

    /// Read-modify-write of `dailyStats` as one store update, so a second
    /// router on the same file (another process) cannot lose increments.
    async fn mutate(&self, apply: impl FnOnce(&mut DailyStats) + Send + 'static) -> StatsReply {
        let result: Result<DailyStats, StoreError> = async {
            let written = self
                .store
                .update(
                    &[keys::DAILY_STATS],
                    Box::new(move |current: &StoreMap| {
                        let mut stats: DailyStats =
                            decode(current, keys::DAILY_STATS)?.unwrap_or_default();
                        apply(&mut stats);
                        let mut items = StoreMap::new();
                        items.insert(
                            keys::DAILY_STATS.to_string(),
                            encode(keys::DAILY_STATS, &stats)?,
                        );
                        Ok(items)
                    }),
                )
                .await?;
            Ok(decode(&written, keys::DAILY_STATS)?.unwrap_or_default())
        }
        .await;

        match result {
            Ok(stats) => {
                debug!(
                    "[ROUTER] Stats now {}s, {} task(s)",
                    stats.time_spent_seconds, stats.tasks_completed
                );
                StatsReply::updated(stats)
            }
            Err(e) => {
                error!("[ROUTER] Failed to update daily stats: {}", e);
                StatsReply::failed(e.to_string())
            }
        }
    }
}

/// Forward `dailyReset` firings into the router queue, in delivery order.
pub fn spawn_alarm_pump(
    router: RouterHandle,
    mut fired: mpsc::UnboundedReceiver<FiredAlarm>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(alarm) = fired.recv().await {
            if alarm.name != DAILY_RESET {
                debug!("[ALARM] Ignoring alarm '{}'", alarm.name);
                continue;
            }
            match router.roll_over(alarm.scheduled_time).await {
                Ok(RolloverOutcome::Rolled { entry, .. }) => {
                    debug!("[ALARM] dailyReset closed {}", entry.date)
                }
                Ok(RolloverOutcome::AlreadyRolled { .. }) => {}
                Err(RouterError::Closed) => {
                    warn!("[ALARM] Router stopped, alarm pump exiting");
                    return;
                }
                Err(e) => warn!("[ALARM] dailyReset failed: {}", e),
            }
        }
    })
}
