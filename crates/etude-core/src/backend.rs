// src/backend.rs
//! Backend handles lent to worker threads for the duration of one task.
//!
//! The pool never inspects a handle; it only guarantees that every handle it
//! acquires goes back through [`BackendPool::release`], whatever way the task
//! exits. [`BackendGuard`] is that guarantee.

use crate::sync::Semaphore;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Something that lends out handles (database connections, client sessions...).
///
/// Implementations must be internally synchronised: workers call `acquire`
/// and `release` concurrently.
pub trait BackendPool: Send + Sync + 'static {
    type Handle: Send;

    /// Take a handle, blocking until one is free.
    fn acquire(&self) -> Self::Handle;

    /// Give a handle back.
    fn release(&self, handle: Self::Handle);
}

/// Scoped handle: released back to its pool when dropped, including during
/// a panic unwind.
pub struct BackendGuard<'a, B: BackendPool> {
    pool: &'a B,
    handle: Option<B::Handle>,
}

impl<'a, B: BackendPool> BackendGuard<'a, B> {
    pub fn acquire(pool: &'a B) -> Self {
        let handle = pool.acquire();
        Self {
            pool,
            handle: Some(handle),
        }
    }
}

impl<B: BackendPool> Deref for BackendGuard<'_, B> {
    type Target = B::Handle;

    fn deref(&self) -> &B::Handle {
        // Only `Drop` takes the handle out.
        self.handle.as_ref().unwrap()
    }
}

impl<B: BackendPool> DerefMut for BackendGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B::Handle {
        self.handle.as_mut().unwrap()
    }
}

impl<B: BackendPool> Drop for BackendGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

/// Backend with nothing to lend; used when the server has no data store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackend;

impl BackendPool for NoBackend {
    type Handle = ();

    fn acquire(&self) {}

    fn release(&self, _handle: ()) {}
}

/// Fixed set of pre-built handles shared by all workers.
pub struct FixedPool<H> {
    idle: Mutex<Vec<H>>,
    free: Semaphore,
    size: usize,
}

impl<H: Send + 'static> FixedPool<H> {
    pub fn new(handles: Vec<H>) -> Self {
        let size = handles.len();
        Self {
            idle: Mutex::new(handles),
            free: Semaphore::new(size),
            size,
        }
    }

    /// Total handles owned by the pool, lent or not.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl<H: Send + 'static> BackendPool for FixedPool<H> {
    type Handle = H;

    fn acquire(&self) -> H {
        loop {
            self.free.wait();
            // A permit always has a handle behind it; the loop only guards
            // against a handle released without `release`.
            if let Some(handle) = self.idle.lock().pop() {
                return handle;
            }
        }
    }

    fn release(&self, handle: H) {
        self.idle.lock().push(handle);
        self.free.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_guard_returns_handle_on_drop() {
        let pool = FixedPool::new(vec![1u32, 2]);
        {
            let mut guard = BackendGuard::acquire(&pool);
            *guard += 10;
            assert_eq!(pool.idle(), 1);
        }
        assert_eq!(pool.idle(), 2);
        let mut seen: Vec<u32> = pool.idle.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 12]);
    }

    #[test]
    fn test_guard_returns_handle_on_panic() {
        let pool = FixedPool::new(vec![String::from("conn-0")]);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = BackendGuard::acquire(&pool);
            if pool.size() == 1 {
                panic!("task blew up");
            }
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_no_backend_is_free() {
        let pool = NoBackend;
        let guard = BackendGuard::acquire(&pool);
        let () = *guard;
        drop(guard);
    }
}
