//! Engine attach scheduling
//!
//! Every low-level attach runs through one priority queue bounded by
//! `max_concurrent_attachments`. Two feeders sit in front of it:
//! - the initial queue, failure-fails-all, for the session's first models
//! - the [`StreamCutoffAttachQueue`], which holds attachments until their
//!   projected size passes the streaming cutoff
//!
//! Queue order is re-evaluated whenever the priority manager recomputes.

use crate::priority::{AttachPriority, AttachPriorityManager};
use cadstream_core::config::StreamingConfig;
use cadstream_core::engine::{EngineAttachRequest, EngineAttachment, ModelSource, ScEngine};
use cadstream_core::error::{EngineError, LoadError, LoadResult};
use cadstream_core::id::{InclusionKey, ModelKey, RuntimeNodeId};
use cadstream_core::math::BoundingBox;
use cadstream_tasks::{QueueError, TaskHandle, TaskQueue};
use futures_util::stream::BoxStream;
use glam::Mat4;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

// ============================================================================
// Requests and results
// ============================================================================

/// One attach to schedule
#[derive(Clone, Debug)]
pub struct AttachRequest {
    pub source: ModelSource,
    pub label: String,
    pub parent_inclusion: Option<InclusionKey>,
    pub matrix: Mat4,
    pub invisible: bool,
    /// World bounds used for prioritization
    pub bounds: Option<BoundingBox>,
    /// Node the attached model will hang under
    pub anchor: Option<RuntimeNodeId>,
    /// Resolve an unknown model to an empty attach instead of failing
    pub allow_missing_model: bool,
    /// Schedule ahead of every size-ranked attachment
    pub direct_request: bool,
}

impl AttachRequest {
    /// Create a visible, identity-placed request
    pub fn new(source: ModelSource, label: impl Into<String>) -> Self {
        Self {
            source,
            label: label.into(),
            parent_inclusion: None,
            matrix: Mat4::IDENTITY,
            invisible: false,
            bounds: None,
            anchor: None,
            allow_missing_model: false,
            direct_request: false,
        }
    }

    pub fn with_parent_inclusion(mut self, parent: Option<InclusionKey>) -> Self {
        self.parent_inclusion = parent;
        self
    }

    pub fn with_matrix(mut self, matrix: Mat4) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn with_invisible(mut self, invisible: bool) -> Self {
        self.invisible = invisible;
        self
    }

    pub fn with_bounds(mut self, bounds: Option<BoundingBox>) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_anchor(mut self, anchor: RuntimeNodeId) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn with_allow_missing_model(mut self, allow: bool) -> Self {
        self.allow_missing_model = allow;
        self
    }

    pub fn with_direct_request(mut self, direct: bool) -> Self {
        self.direct_request = direct;
        self
    }

    fn engine_request(&self) -> EngineAttachRequest {
        EngineAttachRequest {
            source: self.source.clone(),
            label: self.label.clone(),
            parent_inclusion: self.parent_inclusion,
            matrix: self.matrix,
            invisible: self.invisible,
        }
    }
}

/// Outcome of one attach
///
/// An attach of a missing model that was allowed to be missing carries no
/// keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttachInfo {
    pub model_key: Option<ModelKey>,
    pub inclusion_key: Option<InclusionKey>,
    pub invisible: bool,
    pub prototype_instance_count: u32,
    pub assembly_data: Option<Arc<[u8]>>,
    pub bounds: Option<BoundingBox>,
    pub memory_bytes: u64,
}

impl AttachInfo {
    fn from_attachment(attachment: EngineAttachment, invisible: bool) -> Self {
        Self {
            model_key: Some(attachment.model_key),
            inclusion_key: Some(attachment.inclusion_key),
            invisible,
            prototype_instance_count: attachment.prototype_instance_count,
            assembly_data: attachment.assembly_data,
            bounds: attachment.bounds,
            memory_bytes: attachment.memory_bytes,
        }
    }

    fn missing(invisible: bool) -> Self {
        Self {
            invisible,
            ..Default::default()
        }
    }

    /// Check if nothing was attached
    pub fn is_empty(&self) -> bool {
        self.inclusion_key.is_none()
    }
}

/// Structure segments of a streamed model
pub type SegmentStream = BoxStream<'static, Result<Vec<u8>, EngineError>>;

fn queue_error(error: QueueError<LoadError>) -> LoadError {
    match error {
        QueueError::Task(e) => e,
        QueueError::Cancelled => LoadError::Cancelled,
        QueueError::BatchFailed => LoadError::BatchFailed,
    }
}

/// Future resolving once a scheduled attach settles
pub struct AttachTicket {
    handle: TaskHandle<AttachInfo, LoadError>,
    priority: Option<AttachPriority>,
}

impl AttachTicket {
    /// Priority the attach is scheduled with
    pub fn priority(&self) -> Option<&AttachPriority> {
        self.priority.as_ref()
    }
}

impl Future for AttachTicket {
    type Output = LoadResult<AttachInfo>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|r| r.map_err(queue_error))
    }
}

impl core::fmt::Debug for AttachTicket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AttachTicket")
            .field("priority", &self.priority)
            .finish()
    }
}

// ============================================================================
// Cutoff queue
// ============================================================================

/// Holding queue releasing attachments once they pass the streaming cutoff
///
/// Unbounded by itself; released items are forwarded into the bounded attach
/// queue.
#[derive(Clone)]
pub struct StreamCutoffAttachQueue {
    queue: TaskQueue<AttachInfo, LoadError, AttachPriority>,
    priorities: AttachPriorityManager,
}

impl StreamCutoffAttachQueue {
    /// Create a queue gated by `priorities`' cutoff
    pub fn new(priorities: AttachPriorityManager) -> Self {
        let gate = priorities.clone();
        let queue = TaskQueue::<(), (), AttachPriority>::builder()
            .name("StreamCutoffAttachQueue")
            .max_active(usize::MAX)
            .comparator(|a: &AttachPriority, b: &AttachPriority| a.compare(b))
            .eligibility(move |p: &AttachPriority| gate.passes_cutoff(p))
            .build();
        Self { queue, priorities }
    }

    /// Re-evaluate the cutoff for every held attachment
    pub fn pump(&self) {
        self.queue.pump();
    }

    /// Number of held attachments
    pub fn len(&self) -> usize {
        self.queue.queued_len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.queued_len() == 0
    }

    /// Number of held attachments currently below the cutoff
    pub fn below_cutoff(&self) -> usize {
        let mut count = 0;
        self.queue.for_each_queued(|p| {
            if !self.priorities.passes_cutoff(p) {
                count += 1;
            }
        });
        count
    }
}

// ============================================================================
// Attacher
// ============================================================================

struct AttacherInner {
    engine: Arc<dyn ScEngine>,
    priorities: AttachPriorityManager,
    attach_queue: TaskQueue<AttachInfo, LoadError, AttachPriority>,
    initial_queue: TaskQueue<AttachInfo, LoadError, ()>,
    cutoff_queue: StreamCutoffAttachQueue,
    allow_missing_model: bool,
    memory: Mutex<HashMap<InclusionKey, u64>>,
}

impl AttacherInner {
    fn pump(&self) {
        self.cutoff_queue.pump();
        self.attach_queue.pump();
    }

    async fn attach(self: Arc<Self>, request: AttachRequest, priority: AttachPriority) -> LoadResult<AttachInfo> {
        log::debug!("ScAttacher: attaching '{}'", request.label);
        let result = self.engine.attach_model(request.engine_request()).await;
        self.priorities.destroy_priority(&priority);

        match result {
            Ok(attachment) => {
                self.priorities.add_memory_usage(attachment.memory_bytes);
                self.memory
                    .lock()
                    .insert(attachment.inclusion_key, attachment.memory_bytes);
                Ok(AttachInfo::from_attachment(attachment, request.invisible))
            }
            Err(EngineError::UnknownModel(name)) if request.allow_missing_model => {
                log::warn!("ScAttacher: model '{}' not found, attaching nothing", name);
                Ok(AttachInfo::missing(request.invisible))
            }
            Err(e) => {
                log::error!("ScAttacher: attach of '{}' failed: {}", request.label, e);
                Err(e.into())
            }
        }
    }
}

/// Schedules engine attaches
#[derive(Clone)]
pub struct ScAttacher {
    inner: Arc<AttacherInner>,
}

impl ScAttacher {
    /// Create an attacher over an engine
    pub fn new(engine: Arc<dyn ScEngine>, config: &StreamingConfig) -> Self {
        let priorities = AttachPriorityManager::new(config);
        let max_active = config.max_concurrent_attachments.max(1);

        let attach_queue = TaskQueue::<(), (), AttachPriority>::builder()
            .name("AttachQueue")
            .max_active(max_active)
            .comparator(|a: &AttachPriority, b: &AttachPriority| a.compare(b))
            .build();
        let initial_queue = TaskQueue::<(), (), ()>::builder()
            .name("InitialAttachQueue")
            .max_active(max_active)
            .fail_all(true)
            .build();

        let inner = Arc::new(AttacherInner {
            engine,
            cutoff_queue: StreamCutoffAttachQueue::new(priorities.clone()),
            priorities,
            attach_queue,
            initial_queue,
            allow_missing_model: config.allow_missing_external_models,
            memory: Mutex::new(HashMap::new()),
        });

        let weak: Weak<AttacherInner> = Arc::downgrade(&inner);
        inner.priorities.on_reprioritized(move || {
            if let Some(inner) = weak.upgrade() {
                inner.pump();
            }
        });
        Self { inner }
    }

    pub fn engine(&self) -> &Arc<dyn ScEngine> {
        &self.inner.engine
    }

    pub fn priorities(&self) -> &AttachPriorityManager {
        &self.inner.priorities
    }

    pub fn cutoff_queue(&self) -> &StreamCutoffAttachQueue {
        &self.inner.cutoff_queue
    }

    /// Default for [`AttachRequest::allow_missing_model`]
    pub fn allow_missing_model(&self) -> bool {
        self.inner.allow_missing_model
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Queue an attach on the priority queue
    pub fn simple_attach(&self, request: AttachRequest) -> AttachTicket {
        let priority = self.priority_for(&request);
        self.push_attach(request, priority)
    }

    /// Queue several attaches, starting the highest priorities first
    ///
    /// Tickets come back in request order.
    pub fn attach_batch(&self, requests: Vec<AttachRequest>) -> Vec<AttachTicket> {
        let scheduled: Vec<(AttachRequest, AttachPriority)> = requests
            .into_iter()
            .map(|request| {
                let priority = self.priority_for(&request);
                (request, priority)
            })
            .collect();

        let mut order: Vec<usize> = (0..scheduled.len()).collect();
        order.sort_by(|a, b| scheduled[*b].1.compare(&scheduled[*a].1));

        let mut slots: Vec<Option<(AttachRequest, AttachPriority)>> =
            scheduled.into_iter().map(Some).collect();
        let mut tickets: Vec<Option<AttachTicket>> = (0..slots.len()).map(|_| None).collect();
        for index in order {
            if let Some((request, priority)) = slots[index].take() {
                tickets[index] = Some(self.push_attach(request, priority));
            }
        }
        tickets.into_iter().flatten().collect()
    }

    /// Attach raw SCS bytes under a name
    pub fn attach_by_named_scs_buffer(
        &self,
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        parent_inclusion: Option<InclusionKey>,
        matrix: Mat4,
        invisible: bool,
    ) -> AttachTicket {
        let request = AttachRequest::new(ModelSource::buffer(bytes), name)
            .with_parent_inclusion(parent_inclusion)
            .with_matrix(matrix)
            .with_invisible(invisible)
            .with_allow_missing_model(self.inner.allow_missing_model);
        self.simple_attach(request)
    }

    /// Attach one of the session's initial models
    ///
    /// Initial attaches share a failure-fails-all batch: once one fails,
    /// the queued rest reject with [`LoadError::BatchFailed`] until
    /// [`ScAttacher::clear_attach_queues`].
    pub fn attach_initial(&self, request: AttachRequest) -> AttachTicket {
        let priority = self.priority_for(&request);
        self.inner.priorities.mark_directly_requested(&priority);

        let attacher = self.clone();
        let forwarded = priority.clone();
        let handle = self
            .inner
            .initial_queue
            .push(move || attacher.push_attach(request, forwarded), ());
        AttachTicket {
            handle,
            priority: Some(priority),
        }
    }

    /// Hold an attach until it passes the streaming cutoff
    pub fn defer_attach(&self, request: AttachRequest) -> AttachTicket {
        let priority = self.priority_for(&request);

        let attacher = self.clone();
        let forwarded = priority.clone();
        let handle = self
            .inner
            .cutoff_queue
            .queue
            .push(move || attacher.push_attach(request, forwarded), priority.clone());
        AttachTicket {
            handle,
            priority: Some(priority),
        }
    }

    fn priority_for(&self, request: &AttachRequest) -> AttachPriority {
        let priority = self
            .inner
            .priorities
            .create_priority(request.bounds, request.anchor);
        if request.direct_request {
            self.inner.priorities.mark_directly_requested(&priority);
        }
        priority
    }

    /// Open a streamed model through the priority queue
    ///
    /// Resolves once the master attach completes; segments are read by the
    /// caller.
    pub async fn open_stream(&self, request: AttachRequest) -> LoadResult<(AttachInfo, SegmentStream)> {
        let priority = self.priority_for(&request);
        let slot: Arc<Mutex<Option<SegmentStream>>> = Arc::new(Mutex::new(None));

        let inner = self.inner.clone();
        let task_priority = priority.clone();
        let task_slot = slot.clone();
        let handle = self.inner.attach_queue.push(
            move || async move {
                log::debug!("ScAttacher: opening stream '{}'", request.label);
                let result = inner.engine.open_stream(&request.label).await;
                inner.priorities.destroy_priority(&task_priority);
                let stream = result.map_err(|e| {
                    log::error!("ScAttacher: stream '{}' failed: {}", request.label, e);
                    LoadError::from(e)
                })?;
                inner.priorities.add_memory_usage(stream.attachment.memory_bytes);
                inner
                    .memory
                    .lock()
                    .insert(stream.attachment.inclusion_key, stream.attachment.memory_bytes);
                *task_slot.lock() = Some(stream.segments);
                Ok(AttachInfo::from_attachment(stream.attachment, request.invisible))
            },
            priority.clone(),
        );

        let info = AttachTicket {
            handle,
            priority: Some(priority),
        }
        .await?;
        let segments = slot.lock().take().ok_or(LoadError::Cancelled)?;
        Ok((info, segments))
    }

    fn push_attach(&self, request: AttachRequest, priority: AttachPriority) -> AttachTicket {
        let inner = self.inner.clone();
        let task_priority = priority.clone();
        let handle = self
            .inner
            .attach_queue
            .push(move || inner.attach(request, task_priority), priority.clone());
        AttachTicket {
            handle,
            priority: Some(priority),
        }
    }

    /// Promote pending attachments anchored at any node of `chain`
    pub fn notify_direct_request(&self, chain: &[RuntimeNodeId]) -> usize {
        let promoted = self.inner.priorities.mark_anchors_directly_requested(chain);
        if promoted > 0 {
            log::debug!("ScAttacher: promoted {} pending attachment(s)", promoted);
            self.inner.pump();
        }
        promoted
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Discard queued attachments anchored at any of `nodes`
    pub fn kill_anchored(&self, nodes: &[RuntimeNodeId]) -> usize {
        let anchored = |p: &AttachPriority| p.anchor().is_some_and(|a| nodes.contains(&a));
        self.inner.cutoff_queue.queue.kill_matching(anchored) + self.inner.attach_queue.kill_matching(anchored)
    }

    /// Discard all queued attachments; running ones finish
    pub fn clear_attach_queues(&self) -> usize {
        let killed = self.inner.cutoff_queue.queue.kill_deferred()
            + self.inner.initial_queue.queued_len()
            + self.inner.attach_queue.kill_deferred();
        self.inner.initial_queue.clear();
        killed
    }

    /// Discard queued attachments and wait for running ones
    pub async fn reset(&self) {
        self.clear_attach_queues();
        let _ = self.inner.initial_queue.wait_for_idle().await;
        let _ = self.inner.attach_queue.wait_for_idle().await;
        self.inner.initial_queue.clear();
        log::debug!("ScAttacher: reset");
    }

    /// Wait until no attach is queued or running on the priority queue
    pub async fn wait_for_attachments(&self) -> LoadResult<()> {
        self.inner.attach_queue.wait_for_idle().await.map_err(queue_error)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Release the memory accounted to detached inclusions
    pub fn release_inclusions(&self, inclusions: &[InclusionKey]) {
        let freed: u64 = {
            let mut memory = self.inner.memory.lock();
            inclusions.iter().filter_map(|key| memory.remove(key)).sum()
        };
        if freed > 0 {
            self.inner.priorities.release_memory_usage(freed);
        }
    }

    /// Number of attaches running on the engine
    pub fn active_attachments(&self) -> usize {
        self.inner.attach_queue.active_len()
    }

    /// Number of attaches waiting in any queue
    pub fn pending_attachments(&self) -> usize {
        self.inner.cutoff_queue.len()
            + self.inner.initial_queue.queued_len()
            + self.inner.attach_queue.queued_len()
    }

    /// Check if nothing is queued or running
    pub fn is_idle(&self) -> bool {
        self.inner.cutoff_queue.is_empty()
            && self.inner.initial_queue.is_idle()
            && self.inner.attach_queue.is_idle()
    }
}

impl core::fmt::Debug for ScAttacher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScAttacher")
            .field("active", &self.active_attachments())
            .field("pending", &self.pending_attachments())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::CUTOFF_BASE;
    use cadstream_core::engine::{MemoryEngine, MemoryModel};

    fn model() -> MemoryModel {
        MemoryModel::default()
    }

    fn engine() -> Arc<MemoryEngine> {
        let engine = MemoryEngine::new().with_attach_yields(3).shared();
        for name in ["a", "b", "c", "d", "e"] {
            engine.register_model(name, model());
        }
        engine
    }

    fn config(max: usize) -> StreamingConfig {
        StreamingConfig {
            reprioritize_debounce_ms: 0,
            ..Default::default()
        }
        .with_max_concurrent_attachments(max)
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let engine = engine();
        let attacher = ScAttacher::new(engine.clone(), &config(2));

        let tickets: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| attacher.simple_attach(AttachRequest::new(ModelSource::named(name), name)))
            .collect();
        for ticket in tickets {
            assert!(!ticket.await.unwrap().is_empty());
        }
        assert_eq!(engine.peak_concurrent_attaches(), 2);
        assert!(attacher.is_idle());
    }

    #[tokio::test]
    async fn test_missing_model_allowed() {
        let engine = engine();
        let attacher = ScAttacher::new(engine.clone(), &config(1));

        let strict = attacher.simple_attach(AttachRequest::new(ModelSource::named("nope"), "nope"));
        assert!(strict.await.unwrap_err().is_missing_model());

        let lenient = attacher.simple_attach(
            AttachRequest::new(ModelSource::named("nope"), "nope").with_allow_missing_model(true),
        );
        assert!(lenient.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initial_batch_fails_together() {
        let engine = engine();
        engine.fail_model("b");
        let attacher = ScAttacher::new(engine.clone(), &config(1));

        let tickets: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| attacher.attach_initial(AttachRequest::new(ModelSource::named(name), name)))
            .collect();
        let results: Vec<_> = futures_util::future::join_all(tickets).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(LoadError::Engine(_))));
        assert_eq!(results[2], Err(LoadError::BatchFailed));

        attacher.clear_attach_queues();
        let retry = attacher.attach_initial(AttachRequest::new(ModelSource::named("c"), "c"));
        assert!(retry.await.is_ok());
    }

    #[tokio::test]
    async fn test_cleared_tickets_cancel() {
        let engine = engine();
        let attacher = ScAttacher::new(engine.clone(), &config(1));

        let first = attacher.simple_attach(AttachRequest::new(ModelSource::named("a"), "a"));
        let second = attacher.simple_attach(AttachRequest::new(ModelSource::named("b"), "b"));
        assert_eq!(attacher.clear_attach_queues(), 1);

        assert!(first.await.is_ok());
        assert_eq!(second.await, Err(LoadError::Cancelled));
        attacher.reset().await;
        assert!(attacher.is_idle());
    }

    #[tokio::test]
    async fn test_memory_accounting() {
        let engine = MemoryEngine::new().shared();
        engine.register_model(
            "big",
            MemoryModel {
                memory_bytes: 500,
                ..Default::default()
            },
        );
        let attacher = ScAttacher::new(engine.clone(), &config(1));

        let info = attacher
            .simple_attach(AttachRequest::new(ModelSource::named("big"), "big"))
            .await
            .unwrap();
        assert_eq!(attacher.priorities().memory_usage(), 500);

        attacher.release_inclusions(&[info.inclusion_key.unwrap()]);
        assert_eq!(attacher.priorities().memory_usage(), 0);
    }

    #[tokio::test]
    async fn test_released_memory_lowers_cutoff_for_held_attaches() {
        let engine = MemoryEngine::new().shared();
        engine.register_model(
            "big",
            MemoryModel {
                memory_bytes: 400,
                ..Default::default()
            },
        );
        engine.register_model("small", model());
        let config = StreamingConfig {
            memory_limit: Some(100),
            ..config(1)
        };
        let attacher = ScAttacher::new(engine.clone(), &config);
        attacher.priorities().set_camera(Mat4::IDENTITY);

        let big = attacher
            .simple_attach(AttachRequest::new(ModelSource::named("big"), "big"))
            .await
            .unwrap();
        assert_eq!(attacher.priorities().get_calculated_cutoff(), CUTOFF_BASE * 4.0);

        let bounds = BoundingBox::new(glam::Vec3::ZERO, glam::Vec3::new(0.03, 0.03, 1.0));
        let small = attacher
            .defer_attach(AttachRequest::new(ModelSource::named("small"), "small").with_bounds(Some(bounds)));
        tokio::task::yield_now().await;
        assert_eq!(attacher.cutoff_queue().len(), 1);
        assert_eq!(attacher.cutoff_queue().below_cutoff(), 1);

        attacher.release_inclusions(&[big.inclusion_key.unwrap()]);
        assert_eq!(attacher.priorities().get_calculated_cutoff(), CUTOFF_BASE);
        assert!(attacher.cutoff_queue().is_empty());
        assert!(!small.await.unwrap().is_empty());
    }
}
