//! Cancellation, deadline and key/value scope threaded through every call.
//!
//! A [`Context`] is a node in an immutable tree. Deriving a context
//! ([`Context::with_deadline`], [`Context::with_value`], ...) always creates a
//! new child node and never mutates the parent, so contexts can be shared
//! freely across tasks. Cancelling a node cancels every context derived from
//! it, but never its ancestors or siblings.
//!
//! # Examples
//!
//! ```
//! use skypipe::context::{Context, Key};
//! use std::time::Duration;
//!
//! let request_id: Key<String> = Key::new();
//!
//! let root = Context::new();
//! let scoped = root
//!     .with_timeout(Duration::from_secs(30))
//!     .with_value(&request_id, "abc".to_string());
//!
//! assert_eq!(scoped.value(&request_id).map(String::as_str), Some("abc"));
//! assert!(root.value(&request_id).is_none());
//!
//! root.cancel();
//! assert!(scoped.is_cancelled());
//! ```

use crate::{Error, Result};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// A typed key for storing values in a [`Context`].
///
/// Keys compare by identity: two keys created by separate [`Key::new`] calls
/// never collide, even for the same value type.
pub struct Key<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    /// Creates a new, unique key.
    pub fn new() -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Key<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.id).finish()
    }
}

struct Node {
    parent: Option<Arc<Node>>,
    // effective deadline: already the minimum over the lineage
    deadline: Option<Instant>,
    token: CancellationToken,
    value: Option<(u64, Box<dyn Any + Send + Sync>)>,
}

/// A cancellation/deadline/key-value scope.
///
/// Cloning a `Context` yields another handle to the same node: cancelling the
/// clone cancels the original. Use [`Context::with_cancellation`] to get an
/// independently cancellable child.
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// Creates a new root context with no deadline and no values.
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                deadline: None,
                token: CancellationToken::new(),
                value: None,
            }),
        }
    }

    /// Returns a handle to the process-wide application context.
    ///
    /// The application context is created on first use. See
    /// [`reset_application_context`] for its lifecycle.
    pub fn application() -> Self {
        application_slot()
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn derive(
        &self,
        deadline: Option<Instant>,
        value: Option<(u64, Box<dyn Any + Send + Sync>)>,
    ) -> Self {
        let deadline = match (self.node.deadline, deadline) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        Self {
            node: Arc::new(Node {
                parent: Some(Arc::clone(&self.node)),
                deadline,
                token: self.node.token.child_token(),
                value,
            }),
        }
    }

    /// Creates a child context that expires at `deadline`.
    ///
    /// The child's effective deadline is the earlier of `deadline` and this
    /// context's effective deadline: deadlines only ever tighten.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(Some(deadline), None)
    }

    /// Creates a child context that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.with_cancellation(),
        }
    }

    /// Creates a child context that can be cancelled without affecting this
    /// context.
    pub fn with_cancellation(&self) -> Self {
        self.derive(None, None)
    }

    /// Creates a child context binding `key` to `value`.
    ///
    /// Lookups for other keys fall through to this context; the nearest
    /// binding wins on collision.
    pub fn with_value<T>(&self, key: &Key<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.derive(None, Some((key.id, Box::new(value))))
    }

    /// Looks up the value bound to `key` in this context or its ancestors.
    pub fn value<T>(&self, key: &Key<T>) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        let mut node: &Node = &self.node;
        loop {
            if let Some((id, value)) = &node.value {
                if *id == key.id {
                    return value.downcast_ref::<T>();
                }
            }
            match &node.parent {
                Some(parent) => node = parent.as_ref(),
                None => return None,
            }
        }
    }

    /// Returns `true` if `key` is bound in this context or its ancestors.
    pub fn has_key<T>(&self, key: &Key<T>) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.value(key).is_some()
    }

    /// The effective deadline, or `None` if this context never expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    /// Time left before the deadline, or `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.node
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.node.token.cancel();
    }

    /// Returns `true` once this context was cancelled (directly or through an
    /// ancestor) or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if self.node.token.is_cancelled() {
            return true;
        }
        matches!(self.node.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Returns [`Error::Cancelled`] if this context is cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when this context is cancelled or its deadline passes.
    ///
    /// Race this against I/O or sleeps to make them interruptible.
    pub async fn cancelled(&self) {
        match self.node.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.node.token.cancelled() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                }
            }
            None => self.node.token.cancelled().await,
        }
    }

    /// Sleeps for `duration` unless the context is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the context is cancelled, or its
    /// deadline passes, before the sleep completes.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check_cancelled()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(Error::Cancelled),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.node.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn application_slot() -> &'static RwLock<Context> {
    static APPLICATION: OnceLock<RwLock<Context>> = OnceLock::new();
    APPLICATION.get_or_init(|| RwLock::new(Context::new()))
}

/// Replaces the process-wide application context with a fresh root.
///
/// The application context is initialized once, on first use of
/// [`Context::application`]. Cancelling it cancels every context derived
/// from it; resetting installs a new, uncancelled root. Contexts derived
/// before the reset keep their old lineage.
pub fn reset_application_context() {
    let mut slot = application_slot()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Context::new();
}
