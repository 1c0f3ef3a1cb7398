//! Time source for the engine and RFC 3339 helpers for record timestamps.

use std::sync::{Mutex, PoisonError};

use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock, UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Format as `YYYY-MM-DDTHH:MM:SSZ` in UTC.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value, &Rfc3339)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn format_is_second_precision_utc() {
        let at = datetime!(2025-03-04 05:06:07.891 +02:00);
        assert_eq!(format_timestamp(at), "2025-03-04T03:06:07Z");
    }

    #[test]
    fn formatted_timestamps_parse_back() {
        let at = datetime!(2025-12-31 23:59:59 UTC);
        assert_eq!(parse_timestamp(&format_timestamp(at)).unwrap(), at);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2025-01-01 00:00 UTC));
        clock.advance(Duration::minutes(11));
        assert_eq!(clock.now(), datetime!(2025-01-01 00:11 UTC));
        clock.set(datetime!(2026-01-01 00:00 UTC));
        assert_eq!(format_timestamp(clock.now()), "2026-01-01T00:00:00Z");
    }
}
