//! Keepalive timer resource
//!
//! An owned, optional periodic timer. Replacing the period is
//! cancel-if-present, create, store; a stopped timer's `tick` never
//! completes, which keeps its branch inert inside `select!`.

use std::time::Duration;

use tokio::time::{self, Instant, Interval};

pub(crate) struct KeepaliveTimer {
    interval: Option<Interval>,
}

impl KeepaliveTimer {
    pub(crate) fn stopped() -> Self {
        Self { interval: None }
    }

    /// Arm the timer at `period`, discarding any previous schedule. The
    /// first tick comes one full period from now.
    pub(crate) fn restart(&mut self, period: Duration) {
        self.interval = Some(time::interval_at(Instant::now() + period, period));
    }

    pub(crate) fn stop(&mut self) {
        self.interval = None;
    }

    pub(crate) async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
