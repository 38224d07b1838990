// Time-bounded membership set.
//
// Used in two places with opposite polarities: the client keeps recently
// terminated subscriptions here to suppress duplicate unsubscribes during
// message bursts, and sockets keep per-stream heartbeat arrival times here
// to detect streams that went quiet.
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Tracks when each element was last touched and expires old ones.
///
/// ```
/// use cascade_common::TimeoutList;
/// use std::time::Duration;
///
/// let mut list: TimeoutList<u64> = TimeoutList::new();
/// list.touch(7);
/// assert!(list.contains(&7));
/// assert!(list.expire_older_than(Duration::from_secs(60)).is_empty());
/// ```
#[derive(Debug, Default)]
pub struct TimeoutList<T: Hash + Eq> {
    entries: HashMap<T, Instant>,
}

impl<T: Hash + Eq + Clone> TimeoutList<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Inserts the element or refreshes its timestamp.
    pub fn touch(&mut self, value: T) {
        self.entries.insert(value, Instant::now());
    }

    pub fn remove(&mut self, value: &T) -> bool {
        self.entries.remove(value).is_some()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.entries.contains_key(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every element last touched before `age` ago.
    pub fn expire_older_than(&mut self, age: Duration) -> Vec<T> {
        let cutoff = Instant::now() - age;
        let expired: Vec<T> = self
            .entries
            .iter()
            .filter(|(_, touched)| **touched < cutoff)
            .map(|(value, _)| value.clone())
            .collect();
        for value in &expired {
            self.entries.remove(value);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_and_contains() {
        let mut list = TimeoutList::new();
        assert!(!list.contains(&1u64));
        list.touch(1);
        assert!(list.contains(&1));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_reports_membership() {
        let mut list = TimeoutList::new();
        list.touch("a");
        assert!(list.remove(&"a"));
        assert!(!list.remove(&"a"));
        assert!(list.is_empty());
    }

    #[test]
    fn fresh_entries_do_not_expire() {
        let mut list = TimeoutList::new();
        list.touch(1u64);
        list.touch(2);
        let expired = list.expire_older_than(Duration::from_secs(60));
        assert!(expired.is_empty());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn zero_age_expires_everything() {
        let mut list = TimeoutList::new();
        list.touch(1u64);
        list.touch(2);
        std::thread::sleep(Duration::from_millis(2));
        let mut expired = list.expire_older_than(Duration::from_millis(1));
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 2]);
        assert!(list.is_empty());
    }
}
