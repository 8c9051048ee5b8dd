//! Last-request-wins guard for overlapping async lookups.
//!
//! Each call site (a search box, a drop-down loader) keeps one guard. Every
//! issued request takes a fresh token; a result is applied only if its token
//! is still the latest one when it resolves.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sequence number captured when a request is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn sequence(self) -> u64 {
        self.0
    }
}

/// Clones share one counter, so a guard can be moved into spawned tasks.
/// Separate call sites must use separate guards.
#[derive(Debug, Clone, Default)]
pub struct StaleResultGuard {
    counter: Arc<AtomicU64>,
}

impl StaleResultGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request; every earlier token becomes stale.
    pub fn issue(&self) -> RequestToken {
        RequestToken(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Discard everything in flight without issuing a request
    /// (e.g. the drop-down was closed).
    pub fn invalidate(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, token: RequestToken) -> bool {
        self.counter.load(Ordering::SeqCst) == token.0
    }

    /// Run `apply` with `value` only if `token` is still current.
    pub fn apply_if_current<T, F>(&self, token: RequestToken, value: T, apply: F) -> bool
    where
        F: FnOnce(T),
    {
        if !self.is_current(token) {
            return false;
        }
        apply(value);
        true
    }

    /// Issue a token now and await `request`; yields its output only if no
    /// newer request was issued meanwhile.
    ///
    /// The token is taken when this is called, not when the returned future
    /// is first polled, so issue order is call order.
    pub fn run<F>(&self, request: F) -> impl Future<Output = Option<F::Output>>
    where
        F: Future,
    {
        let token = self.issue();
        let guard = self.clone();
        async move {
            let output = request.await;
            guard.is_current(token).then_some(output)
        }
    }
}
