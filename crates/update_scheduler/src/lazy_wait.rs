use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// Condition variable that skips the notify when nobody waits on it.
///
/// The predicate is re-checked under the internal mutex, and `wake_all`
/// takes the same mutex, so a wake issued between the check and the wait
/// cannot be lost.
#[derive(Default)]
pub(crate) struct LazyWaitCondition {
    lock: Mutex<()>,
    condition: Condvar,
    waiters: AtomicUsize,
}

impl LazyWaitCondition {
    pub(crate) fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        while !done() {
            self.condition.wait(&mut guard);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn is_someone_waiting(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn wake_all(&self) {
        if !self.is_someone_waiting() {
            return;
        }
        let _guard = self.lock.lock();
        self.condition.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn returns_at_once_when_already_done() {
        let condition = LazyWaitCondition::default();
        condition.wait_until(|| true);
        assert!(!condition.is_someone_waiting());
    }

    #[test]
    fn waiter_wakes_after_flag_flips() {
        let condition = Arc::new(LazyWaitCondition::default());
        let flag = Arc::new(AtomicBool::new(false));
        let waiter = {
            let condition = Arc::clone(&condition);
            let flag = Arc::clone(&flag);
            thread::spawn(move || condition.wait_until(|| flag.load(Ordering::Acquire)))
        };
        while !condition.is_someone_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        flag.store(true, Ordering::Release);
        condition.wake_all();
        waiter.join().expect("waiter thread panicked");
        assert!(!condition.is_someone_waiting());
    }
}
