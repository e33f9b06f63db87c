//! Worker descriptors and per-machine health.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use rand::Rng as _;

/// Failures within this window of the previous one are treated as the same
/// incident (steps started in parallel fail together).
const FAILURE_WINDOW: Duration = Duration::from_secs(30);
const MAX_CONSECUTIVE_FAILURES: u32 = 4;
const JITTER_SECS: u64 = 30;

/// Shared per-machine failure history, read by the scheduler to decide
/// whether the machine is currently usable.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub consecutive_failures: u32,
    pub last_failure: Option<SystemTime>,
    pub disabled_until: Option<SystemTime>,
}

/// One remote worker.
#[derive(Debug)]
pub struct Machine {
    pub ssh_name: String,
    pub ssh_key: Option<PathBuf>,
    pub supported_features: BTreeSet<String>,
    connect_info: Mutex<ConnectInfo>,
}

impl Machine {
    pub fn new(ssh_name: impl Into<String>) -> Self {
        Self {
            ssh_name: ssh_name.into(),
            ssh_key: None,
            supported_features: BTreeSet::new(),
            connect_info: Mutex::new(ConnectInfo::default()),
        }
    }

    pub fn with_ssh_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.ssh_key = Some(key.into());
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Builds on this machine read the destination store directly instead
    /// of going through the session.
    pub fn is_localhost(&self) -> bool {
        matches!(self.ssh_name.as_str(), "localhost" | "ssh://localhost")
    }

    /// Snapshot of the failure history.
    pub fn connect_info(&self) -> ConnectInfo {
        self.connect_info.lock().unwrap().clone()
    }

    /// The machine answered; clear its failure streak.
    pub fn note_success(&self) {
        self.connect_info.lock().unwrap().consecutive_failures = 0;
    }

    /// Record a connection-level failure and back the machine off.
    ///
    /// A failure is absorbed when the streak is already being counted and
    /// the previous failure was less than 30 seconds ago. When it counts,
    /// the machine is disabled for
    /// `retry_interval * retry_backoff^(failures - 1)` seconds plus up to
    /// 30 seconds of jitter. Returns the disable interval when counted.
    pub fn note_failure(
        &self,
        retry_interval: u64,
        retry_backoff: f64,
        now: SystemTime,
    ) -> Option<u64> {
        let mut info = self.connect_info.lock().unwrap();
        let recent = info.last_failure.is_some_and(|last| {
            now.duration_since(last)
                .map_or(true, |elapsed| elapsed < FAILURE_WINDOW)
        });
        if info.consecutive_failures != 0 && recent {
            return None;
        }

        info.consecutive_failures = (info.consecutive_failures + 1).min(MAX_CONSECUTIVE_FAILURES);
        info.last_failure = Some(now);
        let base = retry_interval as f64 * retry_backoff.powi(info.consecutive_failures as i32 - 1);
        let delta = base as u64 + rand::thread_rng().gen_range(0..JITTER_SECS);
        info.disabled_until = Some(now + Duration::from_secs(delta));
        Some(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_failures_count_once() {
        let machine = Machine::new("worker-1");
        let now = SystemTime::now();

        assert!(machine.note_failure(10, 3.0, now).is_some());
        // Two more within five seconds: absorbed.
        assert!(machine
            .note_failure(10, 3.0, now + Duration::from_secs(2))
            .is_none());
        assert!(machine
            .note_failure(10, 3.0, now + Duration::from_secs(5))
            .is_none());

        let info = machine.connect_info();
        assert_eq!(info.consecutive_failures, 1);
        assert_eq!(info.last_failure, Some(now));
    }

    #[test]
    fn backoff_is_exponential_with_bounded_jitter() {
        let machine = Machine::new("worker-1");
        let mut now = SystemTime::now();

        for round in 1u32..=6 {
            let delta = machine.note_failure(10, 3.0, now).unwrap();
            let failures = round.min(MAX_CONSECUTIVE_FAILURES);
            let base = (10.0 * 3.0f64.powi(failures as i32 - 1)) as u64;
            assert!(
                (base..base + JITTER_SECS).contains(&delta),
                "round {round}: delta {delta} outside [{base}, {})",
                base + JITTER_SECS
            );

            let info = machine.connect_info();
            assert_eq!(info.consecutive_failures, failures);
            assert!(info.disabled_until >= info.last_failure);

            // Step past the absorption window for the next round.
            now += Duration::from_secs(31);
        }
    }

    #[test]
    fn success_resets_the_streak() {
        let machine = Machine::new("worker-1");
        let now = SystemTime::now();
        machine.note_failure(10, 3.0, now).unwrap();
        machine.note_success();
        assert_eq!(machine.connect_info().consecutive_failures, 0);

        // The next failure counts immediately again.
        assert!(machine
            .note_failure(10, 3.0, now + Duration::from_secs(1))
            .is_some());
    }

    #[test]
    fn old_failures_count_again() {
        let machine = Machine::new("worker-1");
        let now = SystemTime::now();
        machine.note_failure(10, 3.0, now).unwrap();
        assert!(machine
            .note_failure(10, 3.0, now + Duration::from_secs(31))
            .is_some());
        assert_eq!(machine.connect_info().consecutive_failures, 2);
    }

    #[test]
    fn localhost_detection() {
        assert!(Machine::new("localhost").is_localhost());
        assert!(Machine::new("ssh://localhost").is_localhost());
        assert!(!Machine::new("builder@10.0.0.7").is_localhost());
    }
}
