use crate::clock::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Сработавший будильник
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredAlarm {
    pub name: String,
    /// Момент, на который срабатывание было запланировано (не фактическая доставка)
    pub scheduled_time: DateTime<Utc>,
}

/// Описание установленного будильника
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmInfo {
    pub name: String,
    pub first_fire: DateTime<Utc>,
    pub period: Option<ChronoDuration>,
}

struct AlarmEntry {
    info: AlarmInfo,
    handle: JoinHandle<()>,
}

/// Recurring triggers keyed by stable name.
///
/// `create` with an existing name replaces the old registration. Firings are
/// queued on an unbounded channel, so a busy consumer never loses one.
pub struct AlarmRegistry {
    alarms: Mutex<HashMap<String, AlarmEntry>>,
    fired_tx: mpsc::UnboundedSender<FiredAlarm>,
    clock: Arc<dyn Clock>,
}

impl AlarmRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> (Arc<Self>, mpsc::UnboundedReceiver<FiredAlarm>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            alarms: Mutex::new(HashMap::new()),
            fired_tx,
            clock,
        });
        (registry, fired_rx)
    }

    /// Установить (или заменить) будильник
    /// Первое срабатывание в `when`, затем каждые `period` (если задан)
    pub fn create(&self, name: &str, when: DateTime<Utc>, period: Option<ChronoDuration>) {
        let info = AlarmInfo {
            name: name.to_string(),
            first_fire: when,
            period,
        };
        let handle = self.spawn_alarm(info.clone());

        let previous = match self.alarms.lock() {
            Ok(mut alarms) => alarms.insert(name.to_string(), AlarmEntry { info, handle }),
            Err(e) => {
                warn!("[ALARM] Registry mutex poisoned: {}", e);
                handle.abort();
                return;
            }
        };
        if let Some(old) = previous {
            old.handle.abort();
            debug!("[ALARM] Replaced existing alarm '{}'", name);
        }
        info!("[ALARM] Alarm '{}' set, first fire at {}", name, when);
    }

    pub fn clear(&self, name: &str) -> bool {
        let removed = self
            .alarms
            .lock()
            .ok()
            .and_then(|mut alarms| alarms.remove(name));
        match removed {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<AlarmInfo> {
        self.alarms
            .lock()
            .ok()
            .and_then(|alarms| alarms.get(name).map(|e| e.info.clone()))
    }

    pub fn count(&self) -> usize {
        self.alarms.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn spawn_alarm(&self, info: AlarmInfo) -> JoinHandle<()> {
        let tx = self.fired_tx.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let period = info.period.filter(|p| *p > ChronoDuration::zero());
            let mut scheduled = info.first_fire;
            loop {
                // Момент в прошлом → срабатываем сразу
                sleep_until_wall_clock(&*clock, scheduled).await;

                if let Some(period) = period {
                    // Сон системы мог пропустить несколько периодов: доставляем только последний
                    let now = clock.now();
                    let mut skipped = 0;
                    while scheduled + period <= now {
                        scheduled += period;
                        skipped += 1;
                    }
                    if skipped > 0 {
                        warn!(
                            "[ALARM] '{}' skipped {} missed period(s), firing for {}",
                            info.name, skipped, scheduled
                        );
                    }
                }

                let fired = FiredAlarm {
                    name: info.name.clone(),
                    scheduled_time: scheduled,
                };
                if tx.send(fired).is_err() {
                    // Получатель закрыт, срабатывать некуда
                    return;
                }
                match period {
                    Some(period) => scheduled += period,
                    None => return,
                }
            }
        })
    }
}

/// Longest single sleep. Monotonic timers stop while the host is suspended,
/// so the remaining wall-clock time is re-read at least this often.
const WALL_CLOCK_RECHECK: std::time::Duration = std::time::Duration::from_secs(60);

/// Ждать, пока `clock.now()` не дойдёт до `target`
async fn sleep_until_wall_clock(clock: &dyn Clock, target: DateTime<Utc>) {
    loop {
        let remaining = match (target - clock.now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return,
        };
        tokio::time::sleep(remaining.min(WALL_CLOCK_RECHECK)).await;
    }
}

impl Drop for AlarmRegistry {
    fn drop(&mut self) {
        if let Ok(alarms) = self.alarms.get_mut() {
            for (_, entry) in alarms.drain() {
                entry.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use chrono::TimeZone;

    fn clock() -> Arc<TokioClock> {
        Arc::new(TokioClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_fires_at_time_then_periodically() {
        let clock = clock();
        let (registry, mut rx) = AlarmRegistry::new(clock.clone());
        let first = clock.now() + ChronoDuration::minutes(10);
        registry.create("tick", first, Some(ChronoDuration::hours(24)));

        let start = tokio::time::Instant::now();
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.name, "tick");
        assert_eq!(fired.scheduled_time, first);
        let waited = start.elapsed();
        assert!(waited >= std::time::Duration::from_secs(600));
        assert!(waited < std::time::Duration::from_secs(601));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.scheduled_time, first + ChronoDuration::hours(24));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreate_replaces_instead_of_duplicating() {
        let clock = clock();
        let (registry, mut rx) = AlarmRegistry::new(clock.clone());
        let when = clock.now() + ChronoDuration::minutes(1);
        registry.create("dailyReset", when, None);
        registry.create("dailyReset", when, None);
        assert_eq!(registry.count(), 1);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.name, "dailyReset");
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        assert!(rx.try_recv().is_err(), "replaced alarm must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_time_fires_immediately() {
        let clock = clock();
        let (registry, mut rx) = AlarmRegistry::new(clock.clone());
        registry.create("late", clock.now() - ChronoDuration::hours(1), None);
        let start = tokio::time::Instant::now();
        rx.recv().await.unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_alarm() {
        let clock = clock();
        let (registry, mut rx) = AlarmRegistry::new(clock.clone());
        registry.create("gone", clock.now() + ChronoDuration::minutes(5), None);
        assert!(registry.clear("gone"));
        assert!(!registry.clear("gone"));
        assert!(registry.get("gone").is_none());
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_host_fires_at_wall_clock_time() {
        let clock = clock();
        let (registry, mut rx) = AlarmRegistry::new(clock.clone());
        let first = clock.now() + ChronoDuration::minutes(10);
        registry.create("dailyReset", first, Some(ChronoDuration::hours(24)));
        rx.recv().await.unwrap();

        // 23 часа сна: монотонное время стоит, настенное ушло вперёд
        let after_first = tokio::time::Instant::now();
        clock.jump(ChronoDuration::hours(23));

        let next = rx.recv().await.unwrap();
        assert_eq!(next.scheduled_time, first + ChronoDuration::hours(24));
        assert!(clock.now() >= next.scheduled_time);
        assert!(after_first.elapsed() < std::time::Duration::from_secs(2 * 3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_periods_collapse_into_one_firing() {
        let clock = clock();
        let (registry, mut rx) = AlarmRegistry::new(clock.clone());
        let first = clock.now() + ChronoDuration::minutes(10);
        registry.create("dailyReset", first, Some(ChronoDuration::hours(24)));
        rx.recv().await.unwrap();

        clock.jump(ChronoDuration::hours(73));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.scheduled_time, first + ChronoDuration::hours(72));

        let following = rx.recv().await.unwrap();
        assert_eq!(following.scheduled_time, first + ChronoDuration::hours(96));
    }
}
