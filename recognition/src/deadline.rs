use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("time budget of {0:?} exhausted")]
pub struct Expired(pub Duration);

/// Time budget for one authentication attempt.
///
/// Extraction and matching poll it between units of work and bail out with
/// [`Expired`] once it runs out; nothing is interrupted from outside.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    opened_at: SystemTime,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            opened_at: SystemTime::now(),
            budget,
        }
    }

    pub fn unbounded() -> Self {
        Self::after(Duration::MAX)
    }

    /// Wall-clock time the budget started, for comparing against file
    /// timestamps.
    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn check(&self) -> Result<(), Expired> {
        if self.expired() {
            Err(Expired(self.budget))
        } else {
            Ok(())
        }
    }
}
