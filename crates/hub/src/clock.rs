//! Wall-clock abstraction so tickers and tests can share one notion of "now".

#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Real clock, reporting local wall time at a fixed UTC offset taken from
/// config (schedules are defined in local time-of-day).
#[derive(Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// Settable clock for tests. Clones share the same instant.
#[cfg(test)]
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<OffsetDateTime>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn at(start: OffsetDateTime) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += by;
    }

    /// Set an arbitrary instant, including one in the past.
    pub fn set(&self, instant: OffsetDateTime) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = instant;
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn system_clock_uses_configured_offset() {
        let clock = SystemClock::new(offset!(+2));
        assert_eq!(clock.now().offset(), offset!(+2));
    }

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::at(datetime!(2024-06-01 06:00:00 UTC));
        clock.advance(Duration::from_secs(65));
        assert_eq!(clock.now(), datetime!(2024-06-01 06:01:05 UTC));
    }

    #[test]
    fn fake_clock_clones_share_time() {
        let a = FakeClock::at(datetime!(2024-06-01 06:00:00 UTC));
        let b = a.clone();
        b.set(datetime!(2024-05-31 23:00:00 UTC));
        assert_eq!(a.now(), datetime!(2024-05-31 23:00:00 UTC));
    }
}
