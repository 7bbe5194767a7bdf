// src/sync.rs
use parking_lot::{Condvar, Mutex};

/// Counting semaphore. `wait` parks the calling thread until a permit is
/// available; `post` hands one out.
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

    /// Block until a permit can be taken.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn post(&self) {
        *self.permits.lock() += 1;
        self.cond.notify_one();
    }

    /// Release `n` permits at once, waking up to `n` waiters.
    pub fn post_many(&self, n: usize) {
        if n == 0 {
            return;
        }
        *self.permits.lock() += n;
        self.cond.notify_all();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_initial_permits_do_not_block() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.post();
        sem.wait();
        assert_eq!(*sem.permits.lock(), 0);
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn test_post_many_wakes_every_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.wait())
            })
            .collect();
        sem.post_many(3);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(*sem.permits.lock(), 0);
    }
}
