//! Cancellation with an attached cause
//!
//! [`CancelScope`] wraps a [`CancellationToken`] and remembers why it was
//! cancelled. Child scopes are cancelled with their parent and report the
//! parent's cause.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a scope was cancelled
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    /// Process is shutting down
    #[error("shutdown requested")]
    Shutdown,
    /// The owning resource was closed
    #[error("closed")]
    Closed,
    /// A collaborator failed and the scope cannot make progress
    #[error("failed: {0}")]
    Failed(String),
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    cause: Mutex<Option<CancelCause>>,
    parent: Option<CancelScope>,
}

/// Cancellation signal shared by a tree of tasks
#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<Inner>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    /// Create a root scope
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Create a scope cancelled together with `self`
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel the scope and its children. The first cause sticks.
    pub fn cancel(&self, cause: CancelCause) {
        {
            let mut slot = self.inner.cause.lock();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.inner.token.cancel();
    }

    /// Check if the scope has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cause of cancellation, if cancelled
    #[must_use]
    pub fn cause(&self) -> Option<CancelCause> {
        if !self.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.inner.cause.lock().clone() {
            return Some(cause);
        }
        self.inner
            .parent
            .as_ref()
            .and_then(Self::cause)
            .or(Some(CancelCause::Shutdown))
    }

    /// Wait until cancelled and return the cause
    pub async fn cancelled(&self) -> CancelCause {
        self.inner.token.cancelled().await;
        self.cause().unwrap_or(CancelCause::Shutdown)
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// # Errors
    ///
    /// Returns the cancellation cause if the scope is cancelled before the
    /// delay elapses.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelCause> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drive `fut` to completion unless cancelled first
    ///
    /// # Errors
    ///
    /// Returns the cancellation cause if the scope is cancelled before `fut`
    /// completes; `fut` is dropped in that case.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelCause> {
        tokio::select! {
            biased;
            cause = self.cancelled() => Err(cause),
            out = fut => Ok(out),
        }
    }

    /// Underlying token, for APIs that take one directly
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
}
