//! Thunk caches
//!
//! [`Lazy`] defers a synchronous computation, [`LazyFuture`] defers an
//! asynchronous one. Both evaluate at most once; concurrent forcers of a
//! [`LazyFuture`] share the single in-flight evaluation.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;

enum LazyState<T> {
    Unevaluated(Box<dyn FnOnce() -> T + Send>),
    Evaluating,
    Resolved(T),
}

/// Synchronously computed value, evaluated on first use
///
/// Forcing holds an internal lock for the duration of the computation; the
/// thunk must not force the same `Lazy`.
pub struct Lazy<T> {
    state: Mutex<LazyState<T>>,
}

impl<T: Clone> Lazy<T> {
    /// Create from a thunk
    pub fn new<F>(thunk: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            state: Mutex::new(LazyState::Unevaluated(Box::new(thunk))),
        }
    }

    /// Create already resolved
    pub fn resolved(value: T) -> Self {
        Self {
            state: Mutex::new(LazyState::Resolved(value)),
        }
    }

    /// Evaluate if needed and return the value
    pub fn force(&self) -> T {
        let mut state = self.state.lock();
        if let LazyState::Resolved(value) = &*state {
            return value.clone();
        }
        let thunk = match std::mem::replace(&mut *state, LazyState::Evaluating) {
            LazyState::Unevaluated(thunk) => thunk,
            _ => unreachable!("Lazy forced while evaluating"),
        };
        let value = thunk();
        *state = LazyState::Resolved(value.clone());
        value
    }

    /// Check if the value has been computed
    pub fn is_resolved(&self) -> bool {
        matches!(&*self.state.lock(), LazyState::Resolved(_))
    }
}

impl<T> core::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &*self.state.lock() {
            LazyState::Unevaluated(_) => "unevaluated",
            LazyState::Evaluating => "evaluating",
            LazyState::Resolved(_) => "resolved",
        };
        f.debug_struct("Lazy").field("state", &state).finish()
    }
}

// ============================================================================
// Async
// ============================================================================

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

enum LazyFutureState<T, E> {
    Unevaluated(Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>),
    Evaluating(SharedResult<T, E>),
    Resolved(Result<T, E>),
}

/// Asynchronously computed value, evaluated on first force
///
/// Errors are cached like values; a failed evaluation is not retried.
pub struct LazyFuture<T, E> {
    state: Mutex<LazyFutureState<T, E>>,
}

impl<T, E> LazyFuture<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create from an async thunk
    pub fn new<F, Fut>(thunk: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            state: Mutex::new(LazyFutureState::Unevaluated(Box::new(move || thunk().boxed()))),
        }
    }

    /// Create already resolved
    pub fn resolved(result: Result<T, E>) -> Self {
        Self {
            state: Mutex::new(LazyFutureState::Resolved(result)),
        }
    }

    /// Evaluate if needed and wait for the result
    pub async fn force(&self) -> Result<T, E> {
        let shared = {
            let mut state = self.state.lock();
            match &mut *state {
                LazyFutureState::Resolved(result) => return result.clone(),
                LazyFutureState::Evaluating(shared) => shared.clone(),
                LazyFutureState::Unevaluated(thunk) => {
                    let thunk = std::mem::replace(
                        thunk,
                        Box::new(|| futures_util::future::pending().boxed()),
                    );
                    let shared = thunk().shared();
                    *state = LazyFutureState::Evaluating(shared.clone());
                    shared
                }
            }
        };

        let result = shared.await;

        let mut state = self.state.lock();
        if matches!(&*state, LazyFutureState::Evaluating(_)) {
            *state = LazyFutureState::Resolved(result.clone());
        }
        result
    }

    /// Result, if evaluation has finished
    pub fn peek(&self) -> Option<Result<T, E>> {
        match &*self.state.lock() {
            LazyFutureState::Resolved(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Check if evaluation has started
    pub fn is_started(&self) -> bool {
        !matches!(&*self.state.lock(), LazyFutureState::Unevaluated(_))
    }
}

impl<T, E> core::fmt::Debug for LazyFuture<T, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &*self.state.lock() {
            LazyFutureState::Unevaluated(_) => "unevaluated",
            LazyFutureState::Evaluating(_) => "evaluating",
            LazyFutureState::Resolved(_) => "resolved",
        };
        f.debug_struct("LazyFuture").field("state", &state).finish()
    }
}
