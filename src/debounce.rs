use std::time::Duration;
use tokio::time::Instant;

/// Time gate against hardware chatter. One instance per session, shared
/// across all of that session's report channels on purpose: a press on one
/// report id suppresses an immediately following press on another, so a
/// chattering remote cannot trigger the same action twice.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    last_admitted: Option<Instant>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Debouncer { interval, last_admitted: None }
    }

    /// True (and the window restarts) at most once per interval.
    pub fn admit(&mut self) -> bool {
        let now = Instant::now();

        if let Some(last) = self.last_admitted {
            if now.duration_since(last) < self.interval {
                return false;
            }
        }

        self.last_admitted = Some(now);
        true
    }
}
