use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{WaggleError, WaggleResult};

/// Counting semaphore with FIFO waiters and direct handoff.
///
/// A released slot is handed straight to the oldest live waiter without the
/// available count ever incrementing, so a late `acquire` can never jump the
/// queue ahead of a caller that is already waiting. Only when no waiter is
/// left does the count go back up.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
}

struct State {
    available: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

/// RAII slot guard. Dropping the permit releases the slot, so every exit
/// path (normal return, error, panic) frees it.
///
/// `None` means defused: the slot has already been reclaimed by the
/// semaphore and dropping does nothing.
pub struct Permit {
    inner: Option<Arc<Inner>>,
}

impl Semaphore {
    /// Create a semaphore with the given capacity.
    ///
    /// A capacity below 1 is a configuration error.
    pub fn new(capacity: usize) -> WaggleResult<Self> {
        if capacity < 1 {
            return Err(WaggleError::Config(format!(
                "semaphore capacity must be at least 1, got {capacity}"
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    available: capacity,
                    waiters: VecDeque::new(),
                }),
            }),
        })
    }

    /// Acquire a slot, suspending in FIFO order until one is available.
    pub async fn acquire(&self) -> Permit {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.available > 0 {
                state.available -= 1;
                return Permit {
                    inner: Some(Arc::clone(&self.inner)),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match rx.await {
            Ok(permit) => permit,
            // The sender side lives inside the semaphore; it is only dropped
            // if the semaphore itself is, which `&self` rules out.
            Err(_) => unreachable!("semaphore dropped while a caller was waiting"),
        }
    }

    /// Acquire a slot, run `f`, and release on every exit path.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }

    /// Slots currently available (not counting slots in handoff).
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Number of callers currently queued.
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

impl Inner {
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(tx) = state.waiters.pop_front() {
            let permit = Permit {
                inner: Some(Arc::clone(self)),
            };
            match tx.send(permit) {
                // Direct handoff: the waiter now owns the slot and the
                // available count never moved.
                Ok(()) => return,
                // Waiter gave up (future dropped). Defuse the returned
                // permit so its Drop does not re-enter release while we
                // hold the lock, and try the next waiter.
                Err(mut permit) => {
                    permit.inner = None;
                }
            }
        }
        state.available += 1;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_is_config_error() {
        let err = Semaphore::new(0).err().unwrap();
        assert!(matches!(err, WaggleError::Config(_)));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let sem = Semaphore::new(2).unwrap();
        assert_eq!(sem.available(), 2);
        let p1 = sem.acquire().await;
        let p2 = sem.acquire().await;
        assert_eq!(sem.available(), 0);
        drop(p1);
        assert_eq!(sem.available(), 1);
        drop(p2);
        assert_eq!(sem.available(), 2);
    }

    #[tokio::test]
    async fn test_fifo_handoff_order() {
        let sem = Semaphore::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = sem.acquire().await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let sem = sem.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _p = sem.acquire().await;
                order.lock().push(i);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(sem.waiter_count(), 3);
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_handoff_does_not_increment_available() {
        let sem = Semaphore::new(1).unwrap();
        let permit = sem.acquire().await;

        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move {
            let _p = sem2.acquire().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(permit);
        // While the waiter holds the handed-off slot the count stays at 0.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sem.available(), 0);
        waiter.await.unwrap();
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_slot() {
        let sem = Semaphore::new(1).unwrap();
        let permit = sem.acquire().await;

        let sem2 = sem.clone();
        let abandoned = tokio::spawn(async move {
            let _p = sem2.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(permit);
        // The abandoned waiter must not swallow the slot.
        let _p = sem.acquire().await;
    }

    #[tokio::test]
    async fn test_failed_handoff_does_not_leak_inner() {
        let sem = Semaphore::new(1).unwrap();
        let baseline = Arc::strong_count(&sem.inner);
        let permit = sem.acquire().await;

        let sem2 = sem.clone();
        let abandoned = tokio::spawn(async move {
            let _p = sem2.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        // The failed handoff must not hold a strong reference forever.
        drop(permit);
        assert_eq!(Arc::strong_count(&sem.inner), baseline);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_with_lock_sequential_under_capacity_one() {
        let sem = Semaphore::new(1).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let sem = sem.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                sem.with_lock(|| async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let sem = Semaphore::new(1).unwrap();
        let result: WaggleResult<()> = sem
            .with_lock(|| async { Err(WaggleError::Execution("boom".to_string())) })
            .await;
        assert!(result.is_err());
        assert_eq!(sem.available(), 1);
    }
}
