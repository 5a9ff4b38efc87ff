//! Per-session outbound message counter.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

/// Upper bound (inclusive) of the random counter start, 2^28.
const MAX_INITIAL_COUNTER: u32 = 1 << 28;

/// Source of outbound message ids for one session.
///
/// Starts at a random value in `[1, 2^28]` and wraps modulo 2^32. Ids are
/// unique per session until the counter wraps; concurrent callers never
/// observe the same value.
#[derive(Debug)]
pub struct MessageCounter {
    next: AtomicU32,
}

impl MessageCounter {
    pub fn new() -> Self {
        let start = rand::thread_rng().gen_range(1..=MAX_INITIAL_COUNTER);
        Self::starting_at(start)
    }

    /// Counter whose first id is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Return the next message id and advance the counter.
    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_random_start_in_range() {
        for _ in 0..1_000 {
            let first = MessageCounter::new().next_id();
            assert!((1..=MAX_INITIAL_COUNTER).contains(&first));
        }
    }

    #[test]
    fn test_sequential_ids() {
        let counter = MessageCounter::starting_at(10);
        assert_eq!(counter.next_id(), 10);
        assert_eq!(counter.next_id(), 11);
        assert_eq!(counter.next_id(), 12);
    }

    #[test]
    fn test_wraps_at_u32_max() {
        let counter = MessageCounter::starting_at(u32::MAX);
        assert_eq!(counter.next_id(), u32::MAX);
        assert_eq!(counter.next_id(), 0);
        assert_eq!(counter.next_id(), 1);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let counter = Arc::new(MessageCounter::starting_at(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..1_000).map(|_| counter.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4_000);
    }
}
