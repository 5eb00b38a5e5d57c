use crate::ipc::keys;
use crate::models::{DailyStats, HistoryEntry, HistoryLog};
use crate::schedule::{closed_out_date, format_date_label, target_date};
use crate::store::{decode, encode, PersistentStore, StoreError, StoreMap};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Результат срабатывания dailyReset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloverOutcome {
    /// Статистика перенесена в историю и обнулена
    Rolled {
        entry: HistoryEntry,
        history_len: usize,
    },
    /// Этот день уже закрыт (повторное срабатывание), ничего не записано
    AlreadyRolled { date: String },
}

/// Snapshot today's stats into the history log and reset them.
///
/// Runs as one store `update`: the marker check, the reset, the new history
/// and the marker commit together, so two writers on the same file cannot
/// both close the same day or lose an increment made in between.
/// A read failure aborts without writing.
pub async fn roll_over(
    store: &dyn PersistentStore,
    fired_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<RolloverOutcome, StoreError> {
    let date = format_date_label(closed_out_date(fired_at));

    let label = date.clone();
    let written = store
        .update(
            &[keys::DAILY_STATS, keys::HISTORY, keys::LAST_ROLLOVER],
            Box::new(move |data: &StoreMap| {
                let last_rolled: Option<String> = decode(data, keys::LAST_ROLLOVER)?;
                if last_rolled.as_deref() == Some(label.as_str()) {
                    return Ok(StoreMap::new());
                }

                let stats: DailyStats = decode(data, keys::DAILY_STATS)?.unwrap_or_default();
                let mut history: HistoryLog = decode(data, keys::HISTORY)?.unwrap_or_default();
                // push_front также обрезает лог, пришедший из хранилища длиннее лимита
                history.push_front(HistoryEntry::new(label.clone(), stats));

                let mut items = StoreMap::new();
                items.insert(
                    keys::DAILY_STATS.to_string(),
                    encode(keys::DAILY_STATS, &DailyStats::default())?,
                );
                items.insert(keys::HISTORY.to_string(), encode(keys::HISTORY, &history)?);
                items.insert(
                    keys::LAST_ROLLOVER.to_string(),
                    encode(keys::LAST_ROLLOVER, &label)?,
                );
                Ok(items)
            }),
        )
        .await?;

    let history: HistoryLog = match decode(&written, keys::HISTORY)? {
        Some(history) => history,
        None => {
            warn!(
                "[ROLLOVER] Day {} already rolled over, skipping duplicate firing",
                date
            );
            return Ok(RolloverOutcome::AlreadyRolled { date });
        }
    };
    let entry = match history.latest() {
        Some(entry) => entry.clone(),
        None => HistoryEntry::new(date.clone(), DailyStats::default()),
    };

    // Доставка с опозданием больше суток (процесс спал)
    let lag_days = (target_date(now) - target_date(fired_at)).num_days();
    if lag_days >= 1 {
        warn!(
            "[ROLLOVER] Firing for {} delivered {} day(s) late; stats accumulated since then are attributed to {}",
            fired_at, lag_days, date
        );
    }

    let stats = entry.stats();
    if stats.is_empty() {
        info!(
            "[ROLLOVER] Closed {} with no activity; history now {} day(s)",
            date,
            history.len()
        );
    } else {
        info!(
            "[ROLLOVER] Closed {}: {}s, {} task(s); history now {} day(s)",
            date,
            stats.time_spent_seconds,
            stats.tasks_completed,
            history.len()
        );
    }
    Ok(RolloverOutcome::Rolled {
        entry,
        history_len: history.len(),
    })
}
