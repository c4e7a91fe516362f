use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled or deadline exceeded")]
pub struct Cancelled;

/// Caller-supplied cancellation token, optionally carrying a deadline.
/// Cloning shares the cancellation flag; store operations race against it.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
    deadline: Option<Instant>,
}

struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner { flag: AtomicBool::new(false), notify: Notify::new() }),
            deadline: None,
        }
    }

    /// A token that also trips once the timeout elapses.
    pub fn with_deadline(timeout: Duration) -> Self {
        let mut token = Self::new();
        token.deadline = Some(Instant::now() + timeout);
        token
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Resolves when the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            match self.deadline {
                Some(d) => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = tokio::time::sleep_until(d) => return,
                    }
                }
                None => self.inner.notify.notified().await,
            }
        }
    }

    /// Race a future against this token.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = self.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
