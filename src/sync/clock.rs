use chrono::{DateTime, Utc};

/// Source of wall-clock time for timestamps and catch-up decisions.
///
/// Interval timing uses tokio's clock, which tests pause and advance; this
/// trait covers the wall-clock side so it can be pinned as well.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Clock that only moves when told to.
    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn at(secs: i64) -> Self {
            Self(Mutex::new(
                DateTime::from_timestamp(secs, 0).unwrap_or_default(),
            ))
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}
