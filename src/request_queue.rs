//! Bounded request queue: caps the number of in-flight local backend calls.
//!
//! Waiters park on a fair (FIFO) semaphore instead of polling. Capacity can
//! only shrink at runtime (`degrade`); a shrink that cannot take an idle permit
//! right away is settled by the next slot that is released.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::GateError;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 2 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub max_concurrent: usize,
    pub current_concurrent: usize,
    pub waiting: usize,
    pub peak_concurrent: usize,
    pub total_acquired: u64,
}

#[derive(Debug)]
struct QueueState {
    max_concurrent: usize,
    current_concurrent: usize,
    /// Permits still to be retired because of a `degrade` issued while full.
    shrink_debt: usize,
    waiting: usize,
    peak_concurrent: usize,
    total_acquired: u64,
}

struct QueueInner {
    semaphore: Arc<Semaphore>,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct BoundedRequestQueue {
    inner: Arc<QueueInner>,
}

impl BoundedRequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        let max = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(QueueInner {
                semaphore: Arc::new(Semaphore::new(max)),
                state: Mutex::new(QueueState {
                    max_concurrent: max,
                    current_concurrent: 0,
                    shrink_debt: 0,
                    waiting: 0,
                    peak_concurrent: 0,
                    total_acquired: 0,
                }),
            }),
        }
    }

    /// Wait for a free slot. The slot is released when the returned guard drops.
    pub async fn acquire(&self) -> Result<QueueSlot, GateError> {
        let permit = {
            let _waiting = WaitingGuard::enter(&self.inner);
            self.inner
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GateError::Shutdown)?
        };

        let mut state = self.inner.lock();
        state.current_concurrent += 1;
        state.total_acquired += 1;
        state.peak_concurrent = state.peak_concurrent.max(state.current_concurrent);
        debug!(
            current = state.current_concurrent,
            max = state.max_concurrent,
            "request queue: slot acquired"
        );
        drop(state);

        Ok(QueueSlot {
            permit: Some(permit),
            inner: self.inner.clone(),
        })
    }

    /// Shed one unit of capacity (floor 1). Returns the new `max_concurrent`.
    pub fn degrade(&self) -> usize {
        let mut state = self.inner.lock();
        if state.max_concurrent <= 1 {
            debug!("request queue: degrade ignored, already at minimum capacity");
            return state.max_concurrent;
        }

        state.max_concurrent -= 1;
        if self.inner.semaphore.forget_permits(1) == 0 {
            // Every permit is held; retire one on the next release.
            state.shrink_debt += 1;
        }
        warn!(
            max_concurrent = state.max_concurrent,
            in_flight = state.current_concurrent,
            "request queue: capacity degraded"
        );
        state.max_concurrent
    }

    /// Close the queue. Pending and future `acquire` calls fail with `Shutdown`;
    /// slots already handed out stay valid until dropped.
    pub fn shutdown(&self) {
        self.inner.semaphore.close();
        info!("request queue: closed");
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().max_concurrent
    }

    pub fn current_concurrent(&self) -> usize {
        self.inner.lock().current_concurrent
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.lock();
        QueueSnapshot {
            max_concurrent: state.max_concurrent,
            current_concurrent: state.current_concurrent,
            waiting: state.waiting,
            peak_concurrent: state.peak_concurrent,
            total_acquired: state.total_acquired,
        }
    }
}

impl Default for BoundedRequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

/// Counts a task as waiting for as long as its `acquire` future is pending,
/// including when that future is dropped mid-wait.
struct WaitingGuard<'a> {
    inner: &'a QueueInner,
}

impl<'a> WaitingGuard<'a> {
    fn enter(inner: &'a QueueInner) -> Self {
        inner.lock().waiting += 1;
        Self { inner }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

/// One occupied queue slot.
pub struct QueueSlot {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<QueueInner>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.current_concurrent = state.current_concurrent.saturating_sub(1);
        if let Some(permit) = self.permit.take() {
            if state.shrink_debt > 0 {
                state.shrink_debt -= 1;
                permit.forget();
            }
        }
        debug!(
            current = state.current_concurrent,
            max = state.max_concurrent,
            "request queue: slot released"
        );
    }
}
