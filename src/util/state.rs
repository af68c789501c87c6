use std::fmt::{Debug, Formatter};

/// Mutable state that is only accessible through short, non-reentrant
/// closures executed under a single lock.
///
/// Closures receive the state for the duration of the call only. They must not
/// start new logical operations or wait on other coordinators, since the lock
/// is held while they run. Issuing adapter commands is done by queueing them
/// and flushing the queue after the closure returns.
#[derive(Default)]
pub(crate) struct SharedState<T>(parking_lot::Mutex<T>);

impl<T> SharedState<T> {
    /// Creates new shared state.
    #[inline]
    #[must_use]
    pub const fn new(v: T) -> Self {
        Self(parking_lot::const_mutex(v))
    }

    /// Calls `f` with shared access to the state and returns its result.
    #[inline]
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.0.lock())
    }

    /// Calls `f` with exclusive access to the state and returns its result.
    #[inline]
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.lock())
    }

    /// Calls `set` if `cmp` returns `true`, all under one lock acquisition.
    /// Returns whether `set` was called.
    #[inline]
    pub fn compare_and_set(&self, cmp: impl FnOnce(&T) -> bool, set: impl FnOnce(&mut T)) -> bool {
        let mut g = self.0.lock();
        let ok = cmp(&g);
        if ok {
            set(&mut g);
        }
        ok
    }
}

impl<T: Debug> Debug for SharedState<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.try_lock() {
            Some(g) => f.debug_tuple("SharedState").field(&*g).finish(),
            None => f.write_str("SharedState(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn read_write() {
        let s = SharedState::new(1_u32);
        s.write(|v| *v += 1);
        assert_eq!(s.read(|v| *v), 2);
        assert_eq!(s.write(|v| std::mem::replace(v, 5)), 2);
        assert_eq!(s.read(|v| *v * 2), 10);
    }

    #[test]
    fn compare_and_set() {
        let s = SharedState::new(BTreeSet::new());
        assert!(s.compare_and_set(|v| !v.contains(&1), |v| drop(v.insert(1))));
        assert!(!s.compare_and_set(|v| !v.contains(&1), |_| unreachable!()));
        assert_eq!(s.read(BTreeSet::len), 1);
    }

    #[test]
    fn concurrent_writers() {
        let s = Arc::new(SharedState::new(0_u64));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        s.write(|v| *v += 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(s.read(|v| *v), 8000);
    }

    #[test]
    fn debug_while_locked() {
        let s = SharedState::new(7);
        assert_eq!(format!("{s:?}"), "SharedState(7)");
        s.read(|_| assert_eq!(format!("{s:?}"), "SharedState(<locked>)"));
    }
}
