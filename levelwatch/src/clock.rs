use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc, time::Instant};

/// Defines how the server determines the current time.
///
/// Every time-dependent decision (market day, square-off, heartbeats,
/// timestamps on trades and alert logs) goes through this indirection so tests
/// can supply a [`FakeClock`].
pub trait Clock
where
    Self: Debug + Send + Sync,
{
    fn now_wall(&self) -> DateTime<Utc>;

    fn now_mono(&self) -> Instant;

    /// Calendar date of `wall` in the configured market timezone.
    fn market_day_for(&self, wall: DateTime<Utc>) -> NaiveDate;

    /// Whether `wall` falls inside the configured end-of-day closing window.
    ///
    /// The window start is inclusive and the end exclusive, so a square-off
    /// check at exactly the opening boundary fires.
    fn is_square_off_window(&self, wall: DateTime<Utc>) -> bool;
}

/// Market calendar parameters shared by the clock implementations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct MarketCalendar {
    pub timezone: Tz,
    pub square_off_start: NaiveTime,
    pub square_off_end: NaiveTime,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Kolkata,
            square_off_start: NaiveTime::from_hms_opt(15, 15, 0).unwrap_or_default(),
            square_off_end: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
        }
    }
}

impl MarketCalendar {
    fn market_day_for(&self, wall: DateTime<Utc>) -> NaiveDate {
        wall.with_timezone(&self.timezone).date_naive()
    }

    fn is_square_off_window(&self, wall: DateTime<Utc>) -> bool {
        let local = wall.with_timezone(&self.timezone).time();
        self.square_off_start <= local && local < self.square_off_end
    }
}

/// Live `Clock` using `Utc::now()`.
#[derive(Debug, Clone)]
pub struct LiveClock {
    calendar: MarketCalendar,
}

impl LiveClock {
    pub fn new(calendar: MarketCalendar) -> Self {
        Self { calendar }
    }
}

impl Clock for LiveClock {
    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_mono(&self) -> Instant {
        Instant::now()
    }

    fn market_day_for(&self, wall: DateTime<Utc>) -> NaiveDate {
        self.calendar.market_day_for(wall)
    }

    fn is_square_off_window(&self, wall: DateTime<Utc>) -> bool {
        self.calendar.is_square_off_window(wall)
    }
}

/// Manually advanced `Clock` for tests.
///
/// Wall time only moves through [`FakeClock::set`] / [`FakeClock::advance`];
/// square-off and market-day derivations share the live implementation so a
/// test advancing into the window exercises the same code path.
#[derive(Debug, Clone)]
pub struct FakeClock {
    calendar: MarketCalendar,
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(calendar: MarketCalendar, now: DateTime<Utc>) -> Self {
        Self {
            calendar,
            now: Arc::new(RwLock::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    pub fn advance(&self, delta: chrono::TimeDelta) {
        let mut now = self.now.write();
        *now += delta;
    }
}

impl Clock for FakeClock {
    fn now_wall(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    fn now_mono(&self) -> Instant {
        Instant::now()
    }

    fn market_day_for(&self, wall: DateTime<Utc>) -> NaiveDate {
        self.calendar.market_day_for(wall)
    }

    fn is_square_off_window(&self, wall: DateTime<Utc>) -> bool {
        self.calendar.is_square_off_window(wall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calendar() -> MarketCalendar {
        MarketCalendar::default()
    }

    fn ist(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_market_day_respects_timezone() {
        let clock = FakeClock::new(calendar(), ist(2025, 6, 3, 0, 30, 0));
        // 00:30 IST is 19:00 UTC the previous evening
        let day = clock.market_day_for(clock.now_wall());
        assert_eq!(day, NaiveDate::from_ymd_opt(2025, 6, 3).unwrap());
    }

    #[test]
    fn test_square_off_window_boundaries() {
        struct TestCase {
            name: &'static str,
            wall: DateTime<Utc>,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                name: "one second before window",
                wall: ist(2025, 6, 3, 15, 14, 59),
                expected: false,
            },
            TestCase {
                name: "exactly on window start",
                wall: ist(2025, 6, 3, 15, 15, 0),
                expected: true,
            },
            TestCase {
                name: "inside window",
                wall: ist(2025, 6, 3, 15, 20, 0),
                expected: true,
            },
            TestCase {
                name: "exactly on window end",
                wall: ist(2025, 6, 3, 15, 30, 0),
                expected: false,
            },
        ];

        let clock = LiveClock::new(calendar());
        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(
                clock.is_square_off_window(test.wall),
                test.expected,
                "TC{index} ({}) failed",
                test.name
            );
        }
    }
}
