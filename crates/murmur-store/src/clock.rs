//! Server-side clock shared by the in-process backends.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Hands out strictly increasing timestamps so that documents created in the
/// same instant still have a total order.
#[derive(Debug)]
pub struct ServerClock {
    last: Mutex<DateTime<Utc>>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Utc::now();
        if now <= *last {
            now = *last + Duration::microseconds(1);
        }
        *last = now;
        now
    }

    pub fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}
