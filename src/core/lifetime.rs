//! Cancellation scopes.
//!
//! A [`Lifetime`] is a cheap, cloneable handle that can be cancelled once and
//! awaited from any number of tasks. Lifetimes form a tree: a child is
//! cancelled when its parent is, but cancelling a child leaves the parent and
//! its siblings untouched. Children may also carry a deadline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Cloneable cancellation scope
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: watch::Sender<bool>,
    parent: Option<Lifetime>,
    deadline: Option<Instant>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifetime")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Lifetime {
    /// Create a new root lifetime
    pub fn new() -> Self {
        Self::build(None, None)
    }

    fn build(parent: Option<Lifetime>, deadline: Option<Instant>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cancelled,
                parent,
                deadline,
            }),
        }
    }

    /// Create a child that is cancelled together with this lifetime
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), None)
    }

    /// Create a child that additionally expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Some(self.clone()), Some(Instant::now() + timeout))
    }

    /// Cancel this lifetime and every child derived from it
    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Whether this lifetime's own deadline has passed
    pub fn deadline_exceeded(&self) -> bool {
        self.inner
            .deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
            || self.deadline_exceeded()
            || self
                .inner
                .parent
                .as_ref()
                .map(Lifetime::is_cancelled)
                .unwrap_or(false)
    }

    /// Resolves once this lifetime is cancelled, its deadline passes, or any
    /// ancestor is cancelled
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.inner.cancelled.subscribe();

            let own = async move {
                let woke = rx.wait_for(|c| *c).await.map(|_| ());
                if woke.is_err() {
                    std::future::pending::<()>().await;
                }
            };

            let deadline = async {
                match self.inner.deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            let parent = async {
                match &self.inner.parent {
                    Some(p) => p.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = own => {}
                _ = deadline => {}
                _ = parent => {}
            }
        })
    }
}
