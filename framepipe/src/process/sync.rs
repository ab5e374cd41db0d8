use std::thread;
use std::time::{Duration, Instant};

use crate::process::stage::{Status, SyncPoint, Synchronize};

/// Bounded wait on a completion token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(16),
        }
    }
}

/// Waits for `point` under `policy`.
///
/// The synchronizer is polled while it reports `InExecution`, sleeping
/// between polls with a doubling backoff. Returns `Status::Timeout` once the
/// deadline passes, otherwise the synchronizer's final status.
pub fn synchronize(sync: &mut dyn Synchronize, point: SyncPoint, policy: &SyncPolicy) -> Status {
    let deadline = Instant::now() + policy.timeout;
    let mut backoff = policy.initial_backoff;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = sync.sync_operation(point, remaining);
        if status != Status::InExecution {
            return status;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::warn!("Sync point {} timed out after {:?}", point.0, policy.timeout);
            return Status::Timeout;
        }
        thread::sleep(backoff.min(remaining));
        backoff = (backoff * 2).min(policy.max_backoff);
    }
}
