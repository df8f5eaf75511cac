//! Tree lifecycle callbacks
//!
//! The tree engine is the sole trigger point for [`TreeEvent`]s. Consumers
//! subscribe closures on a [`CallbackManager`]; delivery is immediate and in
//! subscriber priority order.

use crate::id::RuntimeNodeId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Identifier of one load call
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadId(pub u64);

/// Notification fired by the tree engine
#[derive(Clone, Debug, PartialEq)]
pub enum TreeEvent {
    /// A load call was registered
    ModelLoadBegin { load: LoadId },
    /// Structure parsing started for a load
    ModelStructureParseBegin { load: LoadId },
    /// The first structure of the session is available
    ModelStructureReady,
    /// A subtree finished populating
    SubtreeLoaded {
        roots: Vec<RuntimeNodeId>,
        models: Vec<String>,
    },
    /// Nodes became loaded (placeholders resolved or freshly reified)
    NodesLoaded { nodes: Vec<RuntimeNodeId> },
    /// A subtree was deleted
    SubtreeDeleted { roots: Vec<RuntimeNodeId> },
    /// The scene was reset or switched to another model
    ModelSwitched { clear_only: bool },
    /// An external model could not be resolved
    MissingModel { model_path: String },
    /// A load failed
    ModelLoadFailure { model_name: String, reason: String },
    /// A load was cancelled
    LoadCancelled { load: LoadId },
    /// Node visibility changed
    VisibilityChanged { nodes: Vec<RuntimeNodeId> },
}

impl TreeEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModelLoadBegin { .. } => "modelLoadBegin",
            Self::ModelStructureParseBegin { .. } => "modelStructureParseBegin",
            Self::ModelStructureReady => "modelStructureReady",
            Self::SubtreeLoaded { .. } => "subtreeLoaded",
            Self::NodesLoaded { .. } => "nodesLoaded",
            Self::SubtreeDeleted { .. } => "subtreeDeleted",
            Self::ModelSwitched { .. } => "modelSwitched",
            Self::MissingModel { .. } => "missingModel",
            Self::ModelLoadFailure { .. } => "modelLoadFailure",
            Self::LoadCancelled { .. } => "loadCancelled",
            Self::VisibilityChanged { .. } => "visibilityChanged",
        }
    }
}

/// Subscriber priority
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

/// Subscriber ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

type Handler = Arc<dyn Fn(&TreeEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriberId,
    priority: Priority,
    handler: Handler,
}

/// Central callback dispatcher
pub struct CallbackManager {
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscriber_id: RwLock<u64>,
}

impl CallbackManager {
    /// Create a new dispatcher
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: RwLock::new(1),
        }
    }

    /// Subscribe to every event
    pub fn subscribe<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&TreeEvent) + Send + Sync + 'static,
    {
        self.subscribe_with_priority(handler, Priority::Normal)
    }

    /// Subscribe with priority (higher priority is called first)
    pub fn subscribe_with_priority<F>(&self, handler: F, priority: Priority) -> SubscriberId
    where
        F: Fn(&TreeEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_subscriber_id.write();
            let id = SubscriberId(*next);
            *next += 1;
            id
        };

        let mut subscribers = self.subscribers.write();
        subscribers.push(Subscriber {
            id,
            priority,
            handler: Arc::new(handler),
        });
        // Stable sort keeps subscription order within one priority
        subscribers.sort_by(|a, b| b.priority.cmp(&a.priority));
        id
    }

    /// Unsubscribe
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver an event to every subscriber
    ///
    /// Handlers run without the subscriber lock held, so they may subscribe or
    /// trigger further events.
    pub fn trigger(&self, event: TreeEvent) {
        let handlers: Vec<Handler> = self
            .subscribers
            .read()
            .iter()
            .map(|s| s.handler.clone())
            .collect();

        log::trace!("CallbackManager: {} -> {} subscriber(s)", event.name(), handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Subscriber that records every event, for tests and diagnostics
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<RwLock<Vec<TreeEvent>>>,
}

impl EventRecorder {
    /// Create and subscribe a recorder
    pub fn attach(callbacks: &CallbackManager) -> Self {
        let recorder = Self::default();
        let events = recorder.events.clone();
        callbacks.subscribe(move |event| events.write().push(event.clone()));
        recorder
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<TreeEvent> {
        self.events.read().clone()
    }

    /// Count events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events.read().iter().filter(|e| e.name() == name).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_trigger_reaches_subscribers() {
        let callbacks = CallbackManager::new();
        let recorder = EventRecorder::attach(&callbacks);

        callbacks.trigger(TreeEvent::ModelStructureReady);
        callbacks.trigger(TreeEvent::MissingModel {
            model_path: "bolt.scs".into(),
        });

        assert_eq!(recorder.events().len(), 2);
        assert_eq!(recorder.count("missingModel"), 1);
    }

    #[test]
    fn test_priority_order() {
        let callbacks = CallbackManager::new();
        let order = Arc::new(RwLock::new(Vec::new()));

        let o = order.clone();
        callbacks.subscribe_with_priority(move |_| o.write().push("low"), Priority::Low);
        let o = order.clone();
        callbacks.subscribe_with_priority(move |_| o.write().push("high"), Priority::High);

        callbacks.trigger(TreeEvent::ModelStructureReady);
        assert_eq!(*order.read(), vec!["high", "low"]);
    }

    #[test]
    fn test_unsubscribe() {
        let callbacks = CallbackManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = callbacks.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        callbacks.trigger(TreeEvent::ModelStructureReady);
        assert!(callbacks.unsubscribe(id));
        assert!(!callbacks.unsubscribe(id));
        callbacks.trigger(TreeEvent::ModelStructureReady);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
