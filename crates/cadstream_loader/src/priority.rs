//! Attach prioritization
//!
//! Every pending attachment carries an [`AttachPriority`]: the projected
//! screen fraction of its bounds under the current camera, plus a
//! directly-requested flag that outranks any size. Priorities are shared
//! handles, so recomputation is visible to queues at their next pump.
//!
//! The streaming cutoff is
//! `stream_cutoff_scale * CUTOFF_BASE * max(1, memory_used / memory_limit)`;
//! attachments projecting smaller than it wait in the cutoff queue.

use cadstream_core::config::StreamingConfig;
use cadstream_core::id::RuntimeNodeId;
use cadstream_core::math::BoundingBox;
use glam::Mat4;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Fraction of the viewport a model must cover at cutoff scale 1
pub const CUTOFF_BASE: f32 = 1e-4;

struct PriorityState {
    id: u64,
    bounds: Option<BoundingBox>,
    anchor: Option<RuntimeNodeId>,
    size: Mutex<f32>,
    direct: AtomicBool,
}

/// Shared priority of one pending attachment
#[derive(Clone)]
pub struct AttachPriority {
    state: Arc<PriorityState>,
}

impl AttachPriority {
    #[inline]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// World bounds the size is projected from
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.state.bounds
    }

    /// Node the attachment will hang under
    pub fn anchor(&self) -> Option<RuntimeNodeId> {
        self.state.anchor
    }

    /// Projected viewport fraction, 1 without a camera or bounds
    pub fn projected_size(&self) -> f32 {
        *self.state.size.lock()
    }

    pub fn is_directly_requested(&self) -> bool {
        self.state.direct.load(AtomicOrdering::Acquire)
    }

    /// Queue ordering: `Greater` when `self` should start first
    pub fn compare(&self, other: &AttachPriority) -> Ordering {
        self.is_directly_requested()
            .cmp(&other.is_directly_requested())
            .then_with(|| {
                self.projected_size()
                    .partial_cmp(&other.projected_size())
                    .unwrap_or(Ordering::Equal)
            })
    }
}

impl core::fmt::Debug for AttachPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AttachPriority")
            .field("id", &self.id())
            .field("anchor", &self.anchor())
            .field("size", &self.projected_size())
            .field("direct", &self.is_directly_requested())
            .finish()
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

struct ManagerState {
    camera: Option<Mat4>,
    priorities: HashMap<u64, Weak<PriorityState>>,
    memory_used: u64,
    cutoff: f32,
    debounce: Option<JoinHandle<()>>,
}

struct ManagerInner {
    cutoff_scale: f32,
    memory_limit: Option<u64>,
    debounce: Duration,
    next_id: AtomicU64,
    state: Mutex<ManagerState>,
    listeners: Mutex<Vec<Listener>>,
}

/// Computes attach priorities and the streaming cutoff
#[derive(Clone)]
pub struct AttachPriorityManager {
    inner: Arc<ManagerInner>,
}

impl AttachPriorityManager {
    /// Create a manager from the streaming knobs of a configuration
    pub fn new(config: &StreamingConfig) -> Self {
        let inner = ManagerInner {
            cutoff_scale: config.stream_cutoff_scale,
            memory_limit: config.memory_limit,
            debounce: Duration::from_millis(config.reprioritize_debounce_ms),
            next_id: AtomicU64::new(1),
            state: Mutex::new(ManagerState {
                camera: None,
                priorities: HashMap::new(),
                memory_used: 0,
                cutoff: 0.0,
                debounce: None,
            }),
            listeners: Mutex::new(Vec::new()),
        };
        {
            let mut state = inner.state.lock();
            state.cutoff = inner.compute_cutoff(state.memory_used);
        }
        Self { inner: Arc::new(inner) }
    }

    // ========================================================================
    // Priorities
    // ========================================================================

    /// Create a priority for an attachment with the given world bounds
    pub fn create_priority(&self, bounds: Option<BoundingBox>, anchor: Option<RuntimeNodeId>) -> AttachPriority {
        let mut state = self.inner.state.lock();
        let size = projected_size(bounds, state.camera);
        let priority = PriorityState {
            id: self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed),
            bounds,
            anchor,
            size: Mutex::new(size),
            direct: AtomicBool::new(false),
        };
        let priority = AttachPriority {
            state: Arc::new(priority),
        };
        state
            .priorities
            .insert(priority.id(), Arc::downgrade(&priority.state));
        priority
    }

    /// Stop tracking a priority
    pub fn destroy_priority(&self, priority: &AttachPriority) {
        self.inner.state.lock().priorities.remove(&priority.id());
    }

    /// Number of tracked priorities
    pub fn live_priority_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .priorities
            .values()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Queue ordering of two priorities
    pub fn compare(a: &AttachPriority, b: &AttachPriority) -> Ordering {
        a.compare(b)
    }

    /// Flag a priority as directly requested
    pub fn mark_directly_requested(&self, priority: &AttachPriority) {
        priority.state.direct.store(true, AtomicOrdering::Release);
    }

    /// Flag every tracked priority anchored at one of `chain`
    pub fn mark_anchors_directly_requested(&self, chain: &[RuntimeNodeId]) -> usize {
        let state = self.inner.state.lock();
        let mut marked = 0;
        for priority in state.priorities.values().filter_map(Weak::upgrade) {
            if priority.anchor.is_some_and(|anchor| chain.contains(&anchor))
                && !priority.direct.swap(true, AtomicOrdering::AcqRel)
            {
                marked += 1;
            }
        }
        marked
    }

    // ========================================================================
    // Camera
    // ========================================================================

    /// Update the camera and schedule a debounced reprioritization
    ///
    /// Without a zero delay or a tokio runtime the recomputation runs
    /// immediately.
    pub fn set_camera(&self, view_projection: Mat4) {
        let runtime = tokio::runtime::Handle::try_current().ok();
        {
            let mut state = self.inner.state.lock();
            state.camera = Some(view_projection);
            if let Some(pending) = state.debounce.take() {
                pending.abort();
            }
            if let Some(runtime) = runtime.filter(|_| !self.inner.debounce.is_zero()) {
                let manager = self.clone();
                let delay = self.inner.debounce;
                state.debounce = Some(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.inner.state.lock().debounce = None;
                    manager.reprioritize_now();
                }));
                return;
            }
        }
        self.reprioritize_now();
    }

    /// Current view-projection matrix
    pub fn camera(&self) -> Option<Mat4> {
        self.inner.state.lock().camera
    }

    /// Recompute every size and the cutoff, then notify listeners
    pub fn reprioritize_now(&self) {
        {
            let mut state = self.inner.state.lock();
            let camera = state.camera;
            state.priorities.retain(|_, weak| match weak.upgrade() {
                Some(priority) => {
                    *priority.size.lock() = projected_size(priority.bounds, camera);
                    true
                }
                None => false,
            });
            state.cutoff = self.inner.compute_cutoff(state.memory_used);
            log::trace!(
                "AttachPriorityManager: reprioritized {} attachment(s), cutoff {}",
                state.priorities.len(),
                state.cutoff
            );
        }

        self.notify_listeners();
    }

    fn notify_listeners(&self) {
        let listeners: Vec<Listener> = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener();
        }
    }

    /// Run `listener` after every reprioritization or cutoff move
    pub fn on_reprioritized<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    // ========================================================================
    // Cutoff
    // ========================================================================

    /// Current streaming cutoff as a viewport fraction
    pub fn get_calculated_cutoff(&self) -> f32 {
        self.inner.state.lock().cutoff
    }

    /// Check if an attachment may leave the cutoff queue
    pub fn passes_cutoff(&self, priority: &AttachPriority) -> bool {
        if priority.is_directly_requested() {
            return true;
        }
        let cutoff = self.get_calculated_cutoff();
        cutoff <= 0.0 || priority.projected_size() >= cutoff
    }

    /// Account engine memory taken by an attachment
    pub fn add_memory_usage(&self, bytes: u64) {
        self.update_memory_usage(|used| used.saturating_add(bytes));
    }

    /// Account engine memory given back by a detach
    pub fn release_memory_usage(&self, bytes: u64) {
        self.update_memory_usage(|used| used.saturating_sub(bytes));
    }

    /// Listeners run when the cutoff moves
    fn update_memory_usage(&self, update: impl FnOnce(u64) -> u64) {
        let changed = {
            let mut state = self.inner.state.lock();
            state.memory_used = update(state.memory_used);
            let cutoff = self.inner.compute_cutoff(state.memory_used);
            let changed = cutoff != state.cutoff;
            state.cutoff = cutoff;
            changed
        };
        if changed {
            log::trace!("AttachPriorityManager: cutoff moved with memory usage");
            self.notify_listeners();
        }
    }

    pub fn memory_usage(&self) -> u64 {
        self.inner.state.lock().memory_used
    }
}

impl ManagerInner {
    fn compute_cutoff(&self, memory_used: u64) -> f32 {
        if self.cutoff_scale <= 0.0 {
            return 0.0;
        }
        let pressure = match self.memory_limit {
            Some(limit) if limit > 0 => (memory_used as f64 / limit as f64).max(1.0) as f32,
            _ => 1.0,
        };
        self.cutoff_scale * CUTOFF_BASE * pressure
    }
}

impl core::fmt::Debug for AttachPriorityManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AttachPriorityManager")
            .field("cutoff", &self.get_calculated_cutoff())
            .field("priorities", &self.live_priority_count())
            .finish()
    }
}

fn projected_size(bounds: Option<BoundingBox>, camera: Option<Mat4>) -> f32 {
    match (bounds, camera) {
        (Some(bounds), Some(camera)) => bounds.projected_fraction(&camera),
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn camera() -> Mat4 {
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.1, 1000.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        projection * view
    }

    fn unit_box(at: Vec3) -> Option<BoundingBox> {
        Some(BoundingBox::new(at - Vec3::splat(0.5), at + Vec3::splat(0.5)))
    }

    fn immediate() -> StreamingConfig {
        StreamingConfig {
            reprioritize_debounce_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_camera_means_full_size() {
        let manager = AttachPriorityManager::new(&immediate());
        let priority = manager.create_priority(unit_box(Vec3::ZERO), None);
        assert_eq!(priority.projected_size(), 1.0);
        assert!(manager.passes_cutoff(&priority));
    }

    #[test]
    fn test_direct_request_outranks_size() {
        let manager = AttachPriorityManager::new(&immediate());
        manager.set_camera(camera());
        let near = manager.create_priority(unit_box(Vec3::ZERO), None);
        let far = manager.create_priority(unit_box(Vec3::new(0.0, 0.0, -500.0)), None);
        assert_eq!(near.compare(&far), Ordering::Greater);

        manager.mark_directly_requested(&far);
        assert_eq!(AttachPriorityManager::compare(&far, &near), Ordering::Greater);
    }

    #[test]
    fn test_cutoff_follows_scale_and_memory() {
        let config = StreamingConfig {
            memory_limit: Some(100),
            ..immediate()
        };
        let manager = AttachPriorityManager::new(&config);
        assert_eq!(manager.get_calculated_cutoff(), CUTOFF_BASE);

        manager.add_memory_usage(400);
        assert_eq!(manager.get_calculated_cutoff(), CUTOFF_BASE * 4.0);
        manager.release_memory_usage(400);
        assert_eq!(manager.get_calculated_cutoff(), CUTOFF_BASE);

        let disabled = AttachPriorityManager::new(&immediate().with_cutoff_scale(0.0));
        disabled.set_camera(camera());
        let behind = disabled.create_priority(unit_box(Vec3::new(0.0, 0.0, 50.0)), None);
        assert_eq!(behind.projected_size(), 0.0);
        assert!(disabled.passes_cutoff(&behind));
    }

    #[test]
    fn test_tiny_box_below_cutoff_until_requested() {
        let manager = AttachPriorityManager::new(&immediate());
        manager.set_camera(camera());
        let tiny = manager.create_priority(
            Some(BoundingBox::new(Vec3::new(300.0, 0.0, 0.0), Vec3::new(300.001, 0.001, 0.001))),
            Some(RuntimeNodeId::from_raw(4)),
        );
        assert!(!manager.passes_cutoff(&tiny));

        assert_eq!(manager.mark_anchors_directly_requested(&[RuntimeNodeId::from_raw(4)]), 1);
        assert!(manager.passes_cutoff(&tiny));
    }

    #[test]
    fn test_reprioritize_updates_live_priorities() {
        let manager = AttachPriorityManager::new(&immediate());
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        manager.on_reprioritized(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        let priority = manager.create_priority(unit_box(Vec3::new(0.0, 0.0, -500.0)), None);
        assert_eq!(priority.projected_size(), 1.0);
        manager.set_camera(camera());
        assert!(priority.projected_size() < 1.0);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        manager.destroy_priority(&priority);
        assert_eq!(manager.live_priority_count(), 0);
    }

    #[test]
    fn test_memory_pressure_notifies_listeners() {
        let config = StreamingConfig {
            memory_limit: Some(100),
            ..immediate()
        };
        let manager = AttachPriorityManager::new(&config);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        manager.on_reprioritized(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        manager.add_memory_usage(50);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        manager.add_memory_usage(350);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        manager.release_memory_usage(400);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_camera_changes_debounced() {
        let config = StreamingConfig {
            reprioritize_debounce_ms: 20,
            ..Default::default()
        };
        let manager = AttachPriorityManager::new(&config);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        manager.on_reprioritized(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        for _ in 0..5 {
            manager.set_camera(camera());
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }
}
