//! Target-timezone day boundaries and the `dailyReset` alarm.
//!
//! All boundaries are computed as absolute instants in a fixed UTC+5:30 zone,
//! independent of the host's zone. The host offset only shows up when the
//! next reset is logged in host-local wall-clock time.
//!
//! Known limitation: the alarm repeats every 24h of absolute time after the
//! first firing. The target zone has no DST so boundaries never drift; a
//! host-local reading of the reset time will shift by an hour across host DST
//! transitions.

use crate::alarms::AlarmRegistry;
use crate::clock::Clock;
use crate::ipc::alarms::DAILY_RESET;
use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, Offset, Utc};
use std::sync::Arc;
use tracing::info;

/// UTC+5:30
pub const TARGET_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Формат метки дня в истории
pub const DATE_LABEL_FORMAT: &str = "%d/%m/%Y";

pub fn target_timezone() -> FixedOffset {
    // Константа в пределах ±24h, fallback на UTC недостижим
    FixedOffset::east_opt(TARGET_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Календарная дата в целевой таймзоне
pub fn target_date(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&target_timezone()).date_naive()
}

/// Следующая полночь (00:00:00) в целевой таймзоне строго после `now`
pub fn next_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = target_date(now) + Duration::days(1);
    // FixedOffset: локальное время всегда однозначно, fallback недостижим
    tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|ndt| ndt.and_local_timezone(target_timezone()).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now + Duration::days(1))
}

/// Последняя полночь в целевой таймзоне, не позже `now`
pub fn last_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    next_boundary(now) - Duration::days(1)
}

/// Parse a stored `DD/MM/YYYY` label back into a date
pub fn parse_date_label(label: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(label.trim(), DATE_LABEL_FORMAT).ok()
}

/// The boundary reading in a host zone with the given UTC offset.
pub fn boundary_wall_clock(boundary: DateTime<Utc>, host_offset: FixedOffset) -> NaiveDateTime {
    boundary.with_timezone(&host_offset).naive_local()
}

/// День, который закрывает срабатывание в `fired_at`
pub fn closed_out_date(fired_at: DateTime<Utc>) -> NaiveDate {
    target_date(fired_at) - Duration::days(1)
}

pub fn format_date_label(date: NaiveDate) -> String {
    date.format(DATE_LABEL_FORMAT).to_string()
}

/// Installs the `dailyReset` alarm at the next target-timezone midnight.
pub struct RolloverScheduler {
    registry: Arc<AlarmRegistry>,
    clock: Arc<dyn Clock>,
}

impl RolloverScheduler {
    pub fn new(registry: Arc<AlarmRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    /// Идемпотентно: повторная установка заменяет прежний будильник
    pub fn install(&self) -> DateTime<Utc> {
        let next = next_boundary(self.clock.now());
        self.registry
            .create(DAILY_RESET, next, Some(Duration::hours(24)));
        let host_offset = *Local::now().offset();
        info!(
            "[ROLLOVER] Daily reset scheduled for {} (host local {})",
            next,
            boundary_wall_clock(next, host_offset).format("%Y-%m-%d %H:%M:%S")
        );
        next
    }

    pub fn registry(&self) -> &Arc<AlarmRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    #[test]
    fn test_next_boundary_before_target_midnight() {
        // 2024-03-10 17:00 UTC = 22:30 IST → следующая полночь IST 2024-03-11 = 2024-03-10 18:30 UTC
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 17, 0, 0).unwrap();
        assert_eq!(
            next_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 10, 18, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_next_boundary_after_target_midnight() {
        // 2024-03-10 19:00 UTC = 00:30 IST 11 марта → полночь 12 марта IST
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 19, 0, 0).unwrap();
        assert_eq!(
            next_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 11, 18, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_next_boundary_exactly_at_midnight_moves_forward() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 18, 30, 0).unwrap();
        assert_eq!(
            next_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 11, 18, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_boundary_is_target_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 20, 15, 0).unwrap();
        let local = next_boundary(now).with_timezone(&target_timezone());
        assert_eq!(local.format("%H:%M:%S").to_string(), "00:00:00");
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
    }

    #[test]
    fn test_boundary_wall_clock_for_host_offsets() {
        let boundary = Utc.with_ymd_and_hms(2024, 3, 10, 18, 30, 0).unwrap();
        let utc_host = FixedOffset::east_opt(0).unwrap();
        let ny_host = FixedOffset::west_opt(4 * 3600).unwrap();
        assert_eq!(
            boundary_wall_clock(boundary, utc_host).format("%H:%M").to_string(),
            "18:30"
        );
        assert_eq!(
            boundary_wall_clock(boundary, ny_host).format("%H:%M").to_string(),
            "14:30"
        );
        assert_eq!(
            boundary_wall_clock(boundary, target_timezone())
                .format("%H:%M")
                .to_string(),
            "00:00"
        );
    }

    #[test]
    fn test_closed_out_date_label() {
        // Срабатывание в полночь IST 11 марта закрывает 10 марта
        let fired = Utc.with_ymd_and_hms(2024, 3, 10, 18, 30, 0).unwrap();
        assert_eq!(format_date_label(closed_out_date(fired)), "10/03/2024");
        // Поздняя доставка утром всё ещё закрывает предыдущий день
        let late = Utc.with_ymd_and_hms(2024, 3, 11, 3, 0, 0).unwrap();
        assert_eq!(format_date_label(closed_out_date(late)), "10/03/2024");
    }

    #[test]
    fn test_target_timezone_offset() {
        assert_eq!(target_timezone().local_minus_utc(), 19_800);
    }

    #[test]
    fn test_last_boundary() {
        // 12:00 UTC = 17:30 IST 10 марта → последняя полночь IST 10 марта = 9 марта 18:30 UTC
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            last_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 9, 18, 30, 0).unwrap()
        );
        let exactly = Utc.with_ymd_and_hms(2024, 3, 10, 18, 30, 0).unwrap();
        assert_eq!(last_boundary(exactly), exactly);
        assert_eq!(format_date_label(closed_out_date(last_boundary(now))), "09/03/2024");
    }

    #[test]
    fn test_parse_date_label() {
        assert_eq!(
            parse_date_label("08/03/2024"),
            NaiveDate::from_ymd_opt(2024, 3, 8)
        );
        assert_eq!(parse_date_label("2024-03-08"), None);
    }

    #[test]
    fn test_closed_out_date_across_year() {
        let fired = Utc.with_ymd_and_hms(2023, 12, 31, 18, 30, 0).unwrap();
        assert_eq!(format_date_label(closed_out_date(fired)), "31/12/2023");
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_is_idempotent() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 10, 17, 0, 0).unwrap(),
        ));
        let (registry, _rx) = AlarmRegistry::new(clock.clone());
        let scheduler = RolloverScheduler::new(registry.clone(), clock.clone());

        let first = scheduler.install();
        let second = scheduler.install();
        assert_eq!(first, second);
        assert_eq!(registry.count(), 1);

        let info = registry.get(DAILY_RESET).unwrap();
        assert_eq!(info.first_fire, first);
        assert_eq!(info.period, Some(Duration::hours(24)));
    }
}
