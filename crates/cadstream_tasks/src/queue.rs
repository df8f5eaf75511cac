//! Bounded-concurrency task queue
//!
//! A [`TaskQueue`] holds lazily-started tasks and runs at most `max_active`
//! of them at once. Queued tasks start in FIFO order, or by a comparator
//! evaluated against each task's priority at pump time, so priorities that
//! change while queued are honored. An optional eligibility predicate keeps
//! tasks queued until it passes; call [`TaskQueue::pump`] after anything the
//! predicate depends on changes.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Failure of one queued task
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError<E> {
    /// The task itself failed
    #[error("{0}")]
    Task(E),

    /// The task was discarded before it started
    #[error("Task discarded before it started")]
    Cancelled,

    /// Another task of a failure-fails-all queue failed
    #[error("Batch failed")]
    BatchFailed,
}

impl<E> QueueError<E> {
    /// Get the task error, if the task ran and failed
    pub fn into_task_error(self) -> Option<E> {
        match self {
            Self::Task(e) => Some(e),
            _ => None,
        }
    }
}

/// A task that produces its future only when started
pub type LazyTask<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

type Comparator<P> = Arc<dyn Fn(&P, &P) -> Ordering + Send + Sync>;
type Eligibility<P> = Arc<dyn Fn(&P) -> bool + Send + Sync>;
type Reply<T, E> = oneshot::Sender<Result<T, QueueError<E>>>;

/// Handle resolving exactly once when its task settles
pub struct TaskHandle<T, E> {
    rx: oneshot::Receiver<Result<T, QueueError<E>>>,
}

impl<T, E> TaskHandle<T, E> {
    /// Handle that is already settled
    pub fn ready(result: Result<T, QueueError<E>>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<T, QueueError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(QueueError::Cancelled)))
    }
}

impl<T, E> core::fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

struct Queued<T, E, P> {
    priority: P,
    task: LazyTask<T, E>,
    reply: Reply<T, E>,
}

struct QueueState<T, E, P> {
    queued: Vec<Queued<T, E, P>>,
    active: usize,
    failed: bool,
}

struct QueueInner<T, E, P> {
    name: String,
    max_active: usize,
    comparator: Option<Comparator<P>>,
    eligibility: Option<Eligibility<P>>,
    fail_all: bool,
    state: Mutex<QueueState<T, E, P>>,
    pending: watch::Sender<usize>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`TaskQueue`]
pub struct TaskQueueBuilder<P> {
    name: String,
    max_active: usize,
    comparator: Option<Comparator<P>>,
    eligibility: Option<Eligibility<P>>,
    fail_all: bool,
}

impl<P: Send + Sync + 'static> TaskQueueBuilder<P> {
    /// Name used in log messages
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Maximum number of concurrently running tasks (at least 1)
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active.max(1);
        self
    }

    /// Start tasks by priority; `Ordering::Greater` starts the first argument first
    pub fn comparator<F>(mut self, compare: F) -> Self
    where
        F: Fn(&P, &P) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Some(Arc::new(compare));
        self
    }

    /// Keep tasks queued until the predicate passes
    pub fn eligibility<F>(mut self, eligible: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        self.eligibility = Some(Arc::new(eligible));
        self
    }

    /// Reject every queued task as soon as one task fails
    pub fn fail_all(mut self, fail_all: bool) -> Self {
        self.fail_all = fail_all;
        self
    }

    /// Build the queue
    pub fn build<T, E>(self) -> TaskQueue<T, E, P>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let (pending, _) = watch::channel(0);
        TaskQueue {
            inner: Arc::new(QueueInner {
                name: self.name,
                max_active: self.max_active,
                comparator: self.comparator,
                eligibility: self.eligibility,
                fail_all: self.fail_all,
                state: Mutex::new(QueueState {
                    queued: Vec::new(),
                    active: 0,
                    failed: false,
                }),
                pending,
            }),
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Queue running at most `max_active` lazily-started tasks at once
pub struct TaskQueue<T, E, P = ()> {
    inner: Arc<QueueInner<T, E, P>>,
}

impl<T, E, P> Clone for TaskQueue<T, E, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Send + Sync + 'static> TaskQueue<(), (), P> {
    /// Start building a queue
    pub fn builder() -> TaskQueueBuilder<P> {
        TaskQueueBuilder {
            name: "TaskQueue".to_string(),
            max_active: 1,
            comparator: None,
            eligibility: None,
            fail_all: false,
        }
    }
}

impl<T, E, P> TaskQueue<T, E, P>
where
    T: Send + 'static,
    E: Send + 'static,
    P: Send + Sync + 'static,
{
    /// Create a plain FIFO queue
    pub fn new(max_active: usize) -> Self {
        TaskQueue::<(), (), P>::builder().max_active(max_active).build()
    }

    /// Queue a task
    ///
    /// Must be called from within a tokio runtime. A failure-fails-all queue
    /// that has already failed rejects new tasks until [`TaskQueue::clear`].
    pub fn push<F, Fut>(&self, task: F, priority: P) -> TaskHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.failed {
                let _ = reply.send(Err(QueueError::BatchFailed));
                return TaskHandle { rx };
            }
            state.queued.push(Queued {
                priority,
                task: Box::new(move || -> BoxFuture<'static, Result<T, E>> { Box::pin(task()) }),
                reply,
            });
            self.inner.publish(&state);
        }
        QueueInner::pump(&self.inner);
        TaskHandle { rx }
    }

    /// Start as many eligible queued tasks as the concurrency limit allows
    pub fn pump(&self) {
        QueueInner::pump(&self.inner);
    }

    /// Discard every queued task; their handles resolve to `Cancelled`
    pub fn kill_deferred(&self) -> usize {
        self.kill_matching(|_| true)
    }

    /// Discard queued tasks whose priority matches the predicate
    pub fn kill_matching(&self, mut matches: impl FnMut(&P) -> bool) -> usize {
        let killed: Vec<_> = {
            let mut state = self.inner.state.lock();
            let (killed, kept) = std::mem::take(&mut state.queued)
                .into_iter()
                .partition(|q| matches(&q.priority));
            state.queued = kept;
            self.inner.publish(&state);
            killed
        };
        let count = killed.len();
        if count > 0 {
            log::debug!("{}: discarded {} queued task(s)", self.inner.name, count);
        }
        // Reply senders drop here, resolving handles to Cancelled
        drop(killed);
        count
    }

    /// Discard queued tasks and leave the failed state
    pub fn clear(&self) {
        self.kill_deferred();
        self.inner.state.lock().failed = false;
    }

    /// Wait until no task is queued or running
    ///
    /// Resolves to `BatchFailed` on a failure-fails-all queue that failed.
    pub async fn wait_for_idle(&self) -> Result<(), QueueError<E>> {
        let mut rx = self.inner.pending.subscribe();
        let _ = rx.wait_for(|pending| *pending == 0).await;
        if self.inner.state.lock().failed {
            return Err(QueueError::BatchFailed);
        }
        Ok(())
    }

    /// Number of queued tasks
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queued.len()
    }

    /// Number of running tasks
    pub fn active_len(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Check if nothing is queued or running
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.queued.is_empty() && state.active == 0
    }

    /// Check if a failure-fails-all queue has failed
    pub fn has_failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    /// Visit the priorities of queued tasks
    pub fn for_each_queued(&self, mut visit: impl FnMut(&P)) {
        for queued in self.inner.state.lock().queued.iter() {
            visit(&queued.priority);
        }
    }
}

impl<T, E, P> QueueInner<T, E, P>
where
    T: Send + 'static,
    E: Send + 'static,
    P: Send + Sync + 'static,
{
    fn publish(&self, state: &QueueState<T, E, P>) {
        self.pending.send_replace(state.queued.len() + state.active);
    }

    fn next_index(&self, queued: &[Queued<T, E, P>]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, candidate) in queued.iter().enumerate() {
            if let Some(eligible) = &self.eligibility {
                if !eligible(&candidate.priority) {
                    continue;
                }
            }
            best = match (best, &self.comparator) {
                (None, _) => Some(index),
                (Some(_), None) => break,
                (Some(current), Some(compare)) => {
                    // Strictly greater, so equal priorities stay FIFO
                    if compare(&candidate.priority, &queued[current].priority) == Ordering::Greater {
                        Some(index)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best
    }

    fn pump(this: &Arc<Self>) {
        loop {
            let started = {
                let mut state = this.state.lock();
                if state.active >= this.max_active {
                    return;
                }
                let Some(index) = this.next_index(&state.queued) else {
                    return;
                };
                let queued = state.queued.remove(index);
                state.active += 1;
                this.publish(&state);
                queued
            };

            let Queued { task, reply, .. } = started;
            let slot = ActiveSlot {
                inner: this.clone(),
                reply: Some(reply),
            };
            tokio::spawn(async move {
                let result = task().await;
                slot.finish(result);
            });
        }
    }
}

/// A running task's claim on `active`, released even if the task panics
struct ActiveSlot<T, E, P>
where
    T: Send + 'static,
    E: Send + 'static,
    P: Send + Sync + 'static,
{
    inner: Arc<QueueInner<T, E, P>>,
    reply: Option<Reply<T, E>>,
}

impl<T, E, P> ActiveSlot<T, E, P>
where
    T: Send + 'static,
    E: Send + 'static,
    P: Send + Sync + 'static,
{
    fn finish(mut self, result: Result<T, E>) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        let failed = result.is_err();
        let rejected = {
            let mut state = self.inner.state.lock();
            state.active -= 1;
            let rejected = if failed && self.inner.fail_all {
                state.failed = true;
                std::mem::take(&mut state.queued)
            } else {
                Vec::new()
            };
            self.inner.publish(&state);
            rejected
        };

        if !rejected.is_empty() {
            log::warn!(
                "{}: task failed, rejecting {} queued task(s)",
                self.inner.name,
                rejected.len()
            );
        }
        for queued in rejected {
            let _ = queued.reply.send(Err(QueueError::BatchFailed));
        }
        let _ = reply.send(result.map_err(QueueError::Task));
    }
}

impl<T, E, P> Drop for ActiveSlot<T, E, P>
where
    T: Send + 'static,
    E: Send + 'static,
    P: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Reply still held means the task panicked or was aborted
        if let Some(reply) = self.reply.take() {
            {
                let mut state = self.inner.state.lock();
                state.active -= 1;
                self.inner.publish(&state);
            }
            log::warn!("{}: task dropped before finishing", self.inner.name);
            drop(reply);
        }
        QueueInner::pump(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn counting_task(
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, String>> + Send + 'static {
        move || {
            Box::pin(async move {
                let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                peak.fetch_max(now, AtomicOrdering::SeqCst);
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                active.fetch_sub(1, AtomicOrdering::SeqCst);
                Ok(value)
            })
        }
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let queue: TaskQueue<u32, String> = TaskQueue::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| queue.push(counting_task(active.clone(), peak.clone(), i), ()))
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i as u32);
        }
        assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
        queue.wait_for_idle().await.unwrap();
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue: TaskQueue<(), String> = TaskQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = order.clone();
            queue.push(
                move || async move {
                    order.lock().push(i);
                    Ok(())
                },
                (),
            );
        }
        queue.wait_for_idle().await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_comparator_order() {
        let queue: TaskQueue<(), String, u32> = TaskQueue::builder()
            .max_active(1)
            .comparator(|a: &u32, b: &u32| a.cmp(b))
            .build();
        let order = Arc::new(Mutex::new(Vec::new()));

        // The first push starts immediately; the rest queue and start by priority
        for priority in [0u32, 1, 5, 3, 5] {
            let order = order.clone();
            queue.push(
                move || async move {
                    order.lock().push(priority);
                    Ok(())
                },
                priority,
            );
        }
        queue.wait_for_idle().await.unwrap();
        assert_eq!(*order.lock(), vec![0, 5, 5, 3, 1]);
    }

    #[tokio::test]
    async fn test_eligibility_holds_tasks() {
        let gate = Arc::new(AtomicUsize::new(0));
        let g = gate.clone();
        let queue: TaskQueue<u32, String, u32> = TaskQueue::builder()
            .max_active(4)
            .eligibility(move |p: &u32| *p <= g.load(AtomicOrdering::SeqCst) as u32)
            .build();

        let low = queue.push(|| async { Ok(1) }, 0);
        let high = queue.push(|| async { Ok(2) }, 3);
        assert_eq!(low.await.unwrap(), 1);
        assert_eq!(queue.queued_len(), 1);

        gate.store(3, AtomicOrdering::SeqCst);
        queue.pump();
        assert_eq!(high.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_kill_deferred_cancels_queued_only() {
        let queue: TaskQueue<u32, String> = TaskQueue::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = queue.push(
            move || async move {
                let _ = release_rx.await;
                Ok(1)
            },
            (),
        );
        let queued = queue.push(|| async { Ok(2) }, ());

        assert_eq!(queue.kill_deferred(), 1);
        let _ = release_tx.send(());

        assert_eq!(running.await.unwrap(), 1);
        assert_eq!(queued.await, Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_failure_isolated_by_default() {
        let queue: TaskQueue<u32, String> = TaskQueue::new(1);
        let bad = queue.push(|| async { Err("boom".to_string()) }, ());
        let good = queue.push(|| async { Ok(7) }, ());

        assert_eq!(bad.await, Err(QueueError::Task("boom".to_string())));
        assert_eq!(good.await.unwrap(), 7);
        assert!(queue.wait_for_idle().await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_task_frees_its_slot() {
        let queue: TaskQueue<u32, String> = TaskQueue::new(1);
        let explode = true;
        let bad = queue.push(
            move || async move {
                assert!(!explode, "task exploded");
                Ok(0)
            },
            (),
        );
        let good = queue.push(|| async { Ok(3) }, ());

        assert_eq!(bad.await, Err(QueueError::Cancelled));
        assert_eq!(good.await.unwrap(), 3);
        queue.wait_for_idle().await.unwrap();
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_failure_fails_all() {
        let queue: TaskQueue<u32, String> = TaskQueue::builder().max_active(1).fail_all(true).build();
        let bad = queue.push(|| async { Err("boom".to_string()) }, ());
        let queued = queue.push(|| async { Ok(7) }, ());

        assert!(matches!(bad.await, Err(QueueError::Task(_))));
        assert_eq!(queued.await, Err(QueueError::BatchFailed));
        assert_eq!(queue.wait_for_idle().await, Err(QueueError::BatchFailed));

        let late = queue.push(|| async { Ok(8) }, ());
        assert_eq!(late.await, Err(QueueError::BatchFailed));

        queue.clear();
        let retry = queue.push(|| async { Ok(9) }, ());
        assert_eq!(retry.await.unwrap(), 9);
    }
}
