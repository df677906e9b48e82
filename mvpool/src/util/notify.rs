use std::{collections::hash_map::Entry, hash::Hash, sync::Arc};

use parking_lot::{Condvar, MutexGuard};
use rustc_hash::FxHashMap;

/// Tracks threads waiting for the I/O on a particular key to finish.
///
/// The table lives inside the state protected by a mutex, and waiters park on
/// a condition variable bound to that mutex, so checking the condition and
/// going to sleep can not race with a notification. Each key has its own
/// condition variable, a wakeup for one key never lands on a waiter of
/// another.
pub(crate) struct IoWaiters<K> {
    waiters: FxHashMap<K, Waiter>,
}

struct Waiter {
    cond: Arc<Condvar>,
    count: usize,
}

impl<K: Hash + Eq + Copy> IoWaiters<K> {
    pub(crate) fn new() -> Self {
        IoWaiters {
            waiters: FxHashMap::default(),
        }
    }

    /// Returns the number of threads waiting on `key`.
    #[cfg(test)]
    pub(crate) fn waiting(&self, key: K) -> usize {
        self.waiters.get(&key).map_or(0, |w| w.count)
    }

    /// Notifies a single thread waiting on `key`, if any.
    pub(crate) fn notify_one(&self, key: K) {
        if let Some(waiter) = self.waiters.get(&key) {
            waiter.cond.notify_one();
        }
    }

    /// Notifies all threads waiting on `key`.
    pub(crate) fn notify_all(&self, key: K) {
        if let Some(waiter) = self.waiters.get(&key) {
            waiter.cond.notify_all();
        }
    }

    fn register(&mut self, key: K) -> Arc<Condvar> {
        let waiter = self.waiters.entry(key).or_insert_with(|| Waiter {
            cond: Arc::new(Condvar::new()),
            count: 0,
        });
        waiter.count += 1;
        waiter.cond.clone()
    }

    fn unregister(&mut self, key: K) {
        if let Entry::Occupied(mut entry) = self.waiters.entry(key) {
            entry.get_mut().count -= 1;
            if entry.get().count == 0 {
                entry.remove();
            }
        }
    }
}

impl<K: Hash + Eq + Copy> Default for IoWaiters<K> {
    fn default() -> Self {
        IoWaiters::new()
    }
}

/// Blocks while `cond` holds, releasing `guard` during the wait.
///
/// A notification wakes one waiter of `key`; once that waiter sees `cond`
/// cleared it passes the wakeup on to the next one, the same way a mutex
/// hands itself from one blocked thread to the next.
pub(crate) fn wait_while<T, K, W, C>(guard: &mut MutexGuard<'_, T>, key: K, waiters: W, mut cond: C)
where
    K: Hash + Eq + Copy,
    W: Fn(&mut T) -> &mut IoWaiters<K>,
    C: FnMut(&mut T) -> bool,
{
    while cond(&mut *guard) {
        let cv = waiters(&mut *guard).register(key);
        cv.wait(guard);
        waiters(&mut *guard).unregister(key);
    }
    waiters(&mut *guard).notify_one(key);
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use parking_lot::Mutex;

    use super::*;

    struct State {
        busy: [bool; 2],
        waiters: IoWaiters<usize>,
    }

    #[test]
    fn wakeups_pass_between_waiters() {
        let state = Arc::new(Mutex::new(State {
            busy: [true, true],
            waiters: IoWaiters::new(),
        }));

        let mut handles = Vec::new();
        for key in [0usize, 0, 1] {
            let state = state.clone();
            handles.push(thread::spawn(move || {
                let mut guard = state.lock();
                wait_while(&mut guard, key, |s| &mut s.waiters, |s| s.busy[key]);
            }));
        }

        // Wait until all three threads are parked.
        loop {
            {
                let guard = state.lock();
                if guard.waiters.waiting(0) == 2 && guard.waiters.waiting(1) == 1 {
                    break;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }

        {
            let mut guard = state.lock();
            guard.busy[0] = false;
            guard.waiters.notify_one(0);
        }
        {
            let mut guard = state.lock();
            guard.busy[1] = false;
            guard.waiters.notify_all(1);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let guard = state.lock();
        assert_eq!(guard.waiters.waiting(0), 0);
        assert_eq!(guard.waiters.waiting(1), 0);
    }
}
