//! Once-only asynchronous initialization shared by the backend adapters.
//!
//! An adapter may be initialized from several tasks at once (an explicit
//! `init` racing a `subscribe`). [`OnceInit`] runs the first attempt, makes
//! every concurrent caller wait for it, and hands the same outcome to all of
//! them afterwards. A failed attempt is final for the adapter instance.

use crate::error::QueueError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Observable state of a [`OnceInit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Single-attempt async initializer
pub struct OnceInit<T> {
    cell: OnceCell<Result<T, Arc<QueueError>>>,
    started: AtomicBool,
}

impl<T> OnceInit<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Run `init` if no attempt has been made yet, otherwise wait for and
    /// return the stored outcome.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<&T, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let outcome = self
            .cell
            .get_or_init(|| async {
                self.started.store(true, Ordering::Release);
                init().await.map_err(Arc::new)
            })
            .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => Err(QueueError::InitializationFailed(Arc::clone(err))),
        }
    }

    /// The initialized value, if a successful attempt has completed
    pub fn get(&self) -> Option<&T> {
        match self.cell.get() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn state(&self) -> InitState {
        match self.cell.get() {
            Some(Ok(_)) => InitState::Ready,
            Some(Err(_)) => InitState::Failed,
            None if self.started.load(Ordering::Acquire) => InitState::Initializing,
            None => InitState::Uninitialized,
        }
    }
}

impl<T> Default for OnceInit<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "init_tests.rs"]
mod tests;
