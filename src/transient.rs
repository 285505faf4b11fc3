//! Reuse of short-lived GPU objects gated on the device timeline.
use std::collections::VecDeque;

/// A FIFO of objects that become reusable once the device timeline reaches the value
/// recorded when they were pushed.
///
/// The cache only decides *when* an entry may be reused. Callers decide what is cached
/// and make sure the factory passed to [`TransientResourceCache::pop_or_create`] produces
/// objects compatible with the cached ones.
#[derive(Debug)]
pub struct TransientResourceCache<T> {
    entries: VecDeque<(T, u64)>,
}

impl<T> Default for TransientResourceCache<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> TransientResourceCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `value`, reusable once the timeline reaches `ready_at`.
    pub fn push(&mut self, value: T, ready_at: u64) {
        self.entries.push_back((value, ready_at));
    }

    /// Returns true if the oldest entry is ready at timeline value `current`.
    pub fn can_pop(&self, current: u64) -> bool {
        self.entries
            .front()
            .is_some_and(|(_, ready_at)| *ready_at <= current)
    }

    /// Dequeues the oldest entry without checking readiness.
    ///
    /// Callers must have checked [`TransientResourceCache::can_pop`] first.
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front().map(|(value, _)| value)
    }

    /// Dequeues the oldest entry if it is ready at `current`.
    pub fn try_pop(&mut self, current: u64) -> Option<T> {
        if self.can_pop(current) {
            self.pop()
        } else {
            None
        }
    }

    /// Returns a ready entry, or a new one made by `factory`.
    pub fn pop_or_create<E>(
        &mut self,
        current: u64,
        factory: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        match self.try_pop(current) {
            Some(value) => Ok(value),
            None => factory(),
        }
    }

    /// Moves every entry of `other` to the back of this cache.
    pub fn append(&mut self, other: &mut Self) {
        self.entries.append(&mut other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = &(T, u64)> {
        self.entries.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (T, u64)> + '_ {
        self.entries.drain(..)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut cache = TransientResourceCache::new();
        cache.push("a", 1);
        cache.push("b", 2);
        assert_eq!(cache.try_pop(5), Some("a"));
        assert_eq!(cache.try_pop(5), Some("b"));
        assert_eq!(cache.try_pop(5), None);
    }

    #[test]
    fn test_never_pop_before_ready() {
        let mut cache = TransientResourceCache::new();
        let mut pushed = Vec::new();
        // Interleave pushes and pops with non-monotonic ready values.
        for (i, ready_at) in [3u64, 1, 4, 1, 5, 9, 2, 6].into_iter().enumerate() {
            cache.push(i, ready_at);
            pushed.push(ready_at);
            for current in 0..10 {
                if cache.can_pop(current) {
                    let (_, front_ready) = cache.iter().next().copied().unwrap();
                    assert!(front_ready <= current);
                }
            }
            if i % 3 == 0 {
                let current = 2;
                if let Some(value) = cache.try_pop(current) {
                    assert!(pushed[value] <= current);
                }
            }
        }
    }

    #[test]
    fn test_front_blocks_later_entries() {
        let mut cache = TransientResourceCache::new();
        cache.push(0, 10);
        cache.push(1, 1);
        assert!(!cache.can_pop(5));
        assert_eq!(cache.try_pop(5), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_pop_or_create() {
        let mut cache = TransientResourceCache::new();
        cache.push(7, 3);
        let created: Result<i32, ()> = cache.pop_or_create(2, || Ok(42));
        assert_eq!(created, Ok(42));
        let reused: Result<i32, ()> = cache.pop_or_create(3, || Ok(42));
        assert_eq!(reused, Ok(7));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_append() {
        let mut main = TransientResourceCache::new();
        let mut new = TransientResourceCache::new();
        main.push(1, 1);
        new.push(2, 2);
        main.append(&mut new);
        assert!(new.is_empty());
        assert_eq!(main.pop(), Some(1));
        assert_eq!(main.pop(), Some(2));
    }
}
