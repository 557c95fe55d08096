// src/sync.rs
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
/// Every structure guarded here stays consistent across a panic in a caller.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore built on a mutex and a condition variable.
///
/// Each `post` adds one permit and wakes at most one waiter.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Take a permit if one is available.
    pub fn try_wait(&self) -> bool {
        let mut permits = lock(&self.permits);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn post(&self) {
        *lock(&self.permits) += 1;
        self.cond.notify_one();
    }

    /// Add `n` permits at once, e.g. one per worker at shutdown.
    pub fn post_many(&self, n: usize) {
        *lock(&self.permits) += n;
        self.cond.notify_all();
    }

    pub fn permits(&self) -> usize {
        *lock(&self.permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_counting() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert_eq!(sem.permits(), 1);
        sem.wait();
        assert_eq!(sem.permits(), 0);
    }

    #[test]
    fn test_one_post_wakes_one_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    sem.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        sem.post();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        sem.post_many(2);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        assert_eq!(sem.permits(), 0);
    }
}
