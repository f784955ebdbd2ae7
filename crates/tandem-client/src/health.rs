//! Half-open tracking of the primary cluster

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Remembers when the primary last failed.
///
/// After a failure the primary is in cooldown for `cooldown`; operations
/// started during that time go to the failovers first. A zero cooldown
/// never skips the primary.
#[derive(Debug)]
pub struct PrimaryHealth {
    cooldown: Duration,
    failed_at: Mutex<Option<Instant>>,
}

impl PrimaryHealth {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            failed_at: Mutex::new(None),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn record_failure(&self) {
        if self.cooldown.is_zero() {
            return;
        }
        let mut failed_at = self.failed_at.lock();
        if failed_at.is_none() {
            warn!(
                "Primary cluster failed, preferring failovers for {:?}",
                self.cooldown
            );
        }
        *failed_at = Some(Instant::now());
    }

    pub fn record_success(&self) {
        if self.failed_at.lock().take().is_some() {
            info!("Primary cluster recovered");
        }
    }

    /// Whether new operations should skip the primary
    pub fn in_cooldown(&self) -> bool {
        let mut failed_at = self.failed_at.lock();
        match *failed_at {
            Some(at) if at.elapsed() < self.cooldown => true,
            Some(_) => {
                *failed_at = None;
                false
            }
            None => false,
        }
    }
}
