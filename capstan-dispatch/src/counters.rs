//! Runtime counters shared with the queue's status reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically updated counter; plain atomic addition, no ordering
/// guarantees beyond the value itself.
#[derive(Default, Debug)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub(&self, n: u64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Scoped counter bump: increments on creation, decrements on every exit
/// path when dropped.
pub struct MaintainCount<'a> {
    counter: &'a Counter,
}

impl<'a> MaintainCount<'a> {
    pub fn new(counter: &'a Counter) -> Self {
        counter.add(1);
        Self { counter }
    }
}

impl Drop for MaintainCount<'_> {
    fn drop(&mut self) {
        self.counter.sub(1);
    }
}

/// The dispatch core's contribution to queue-wide statistics.
#[derive(Default, Debug)]
pub struct DispatchCounters {
    pub nr_steps_waiting: Counter,
    pub nr_steps_copying_to: Counter,
    pub nr_steps_building: Counter,
    pub nr_steps_copying_from: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintain_count_decrements_on_drop() {
        let counter = Counter::default();
        {
            let _a = MaintainCount::new(&counter);
            let _b = MaintainCount::new(&counter);
            assert_eq!(counter.get(), 2);
        }
        assert_eq!(counter.get(), 0);
    }
}
