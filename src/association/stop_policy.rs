use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

/// Circuit breaker for one destination.
///
/// Counts consecutive failed calls and opens once the count reaches the
/// threshold. All updates are single atomic operations, so concurrent callers
/// never lose an increment or a reset. With a cooldown configured, an open
/// policy lets one trial call through after the cooldown elapsed; that call's
/// outcome closes or re-arms it.
#[derive(Debug)]
pub struct StopPolicy {
    name: String,
    threshold: u32,
    cooldown: Option<Duration>,
    failures: AtomicU32,
    /// Millisecond timestamp the policy last opened at, 0 when closed.
    opened_at_ms: AtomicI64,
}

impl StopPolicy {
    pub fn new(name: impl Into<String>, threshold: u32) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown: None,
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Whether the next call must be skipped.
    pub fn is_open(&self) -> bool {
        if self.failures() < self.threshold {
            return false;
        }
        let Some(cooldown) = self.cooldown else {
            return true;
        };
        let opened = self.opened_at_ms.load(Ordering::SeqCst);
        if opened == 0 {
            // Counted but not yet stamped by `record_failure`: it just opened.
            return true;
        }
        let now = Utc::now().timestamp_millis();
        if now.saturating_sub(opened) < cooldown.as_millis() as i64 {
            return true;
        }
        // Admit a single trial call; concurrent callers lose the race and stay blocked.
        self.opened_at_ms
            .compare_exchange(opened, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
    }

    pub fn record_failure(&self) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if count >= self.threshold {
            self.opened_at_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            if count == self.threshold {
                warn!(policy = %self.name, failures = count, "stop policy opened");
            }
        }
    }

    pub fn record_success(&self) {
        let previous = self.failures.swap(0, Ordering::SeqCst);
        self.opened_at_ms.store(0, Ordering::SeqCst);
        if previous >= self.threshold {
            info!(policy = %self.name, "stop policy closed");
        }
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.opened_at_ms.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_opens_at_threshold() {
        let policy = StopPolicy::new("cp", 3);
        policy.record_failure();
        policy.record_failure();
        assert!(!policy.is_open());
        policy.record_failure();
        assert!(policy.is_open());
        assert!(policy.is_open());
    }

    #[test]
    fn test_success_resets() {
        let policy = StopPolicy::new("cp", 2);
        policy.record_failure();
        policy.record_failure();
        assert!(policy.is_open());
        policy.record_success();
        assert_eq!(policy.failures(), 0);
        assert!(!policy.is_open());
    }

    #[test]
    fn test_cooldown_admits_one_trial_call() {
        let policy = StopPolicy::new("cp", 1).with_cooldown(Duration::from_millis(0));
        policy.record_failure();
        // Zero cooldown: each check after the window is a trial slot.
        assert!(!policy.is_open());

        let policy = StopPolicy::new("cp", 1).with_cooldown(Duration::from_secs(3600));
        policy.record_failure();
        assert!(policy.is_open());
        policy.reset();
        assert!(!policy.is_open());
    }

    #[test]
    fn test_unstamped_open_policy_admits_no_trial_call() {
        let policy = StopPolicy::new("cp", 2).with_cooldown(Duration::ZERO);
        // State between the counter increment and the timestamp store.
        policy.failures.store(2, Ordering::SeqCst);
        assert_eq!(policy.opened_at_ms.load(Ordering::SeqCst), 0);
        assert!(policy.is_open());
        assert!(policy.is_open());

        // Once stamped, the elapsed zero cooldown admits a trial call.
        policy.record_failure();
        assert!(!policy.is_open());
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let policy = Arc::new(StopPolicy::new("cp", 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let policy = Arc::clone(&policy);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        policy.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(policy.failures(), 800);
        assert!(!policy.is_open());
    }
}
