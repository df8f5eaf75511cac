//! # cadstream_tasks - Bounded Concurrency Primitives
//!
//! Infrastructure for throttling and ordering asynchronous work:
//! - [`TaskQueue`]: at most N concurrent lazily-started tasks, FIFO or by
//!   comparator, with eligibility gating and failure-fails-all batches
//! - [`Lazy`] / [`LazyFuture`]: evaluate-once thunk caches
//! - [`CancelToken`]: cooperative cancellation flag
//!
//! ## Example
//!
//! ```ignore
//! use cadstream_tasks::TaskQueue;
//!
//! let queue: TaskQueue<u32, String> = TaskQueue::new(2);
//! let handle = queue.push(|| async { Ok(1) }, ());
//! assert_eq!(handle.await.unwrap(), 1);
//! queue.wait_for_idle().await?;
//! ```

pub mod cancel;
pub mod lazy;
pub mod queue;

pub use cancel::CancelToken;
pub use lazy::{Lazy, LazyFuture};
pub use queue::{LazyTask, QueueError, TaskHandle, TaskQueue, TaskQueueBuilder};
