//! Tree loading
//!
//! A [`TreeLoader`] turns structure documents, SCS buffers and streamed
//! models into tree structure. Every load walks through the same phases:
//!
//! ```text
//! Idle -> Parsing -> Populating -> AttachingExternalModels -> Settling -> Idle
//! ```
//!
//! Loads are registered synchronously when requested, so
//! [`TreeLoader::cancel_pending_loads`] reaches a load before its future is
//! first polled. The tree lock is never held across an await; every step
//! re-checks the tree after suspending.

use crate::assembly::decode_assembly_data;
use crate::attacher::{AttachInfo, AttachRequest, AttachTicket, ScAttacher};
use crate::xml::parse_xml;
use async_trait::async_trait;
use cadstream_core::config::StreamingConfig;
use cadstream_core::engine::ModelSource;
use cadstream_core::error::{EngineError, LoadError, LoadResult, TreeError, TreeResult};
use cadstream_core::events::{CallbackManager, LoadId, TreeEvent};
use cadstream_core::id::{InclusionKey, InstanceHandle, RuntimeNodeId};
use cadstream_tasks::{CancelToken, LazyFuture};
use cadstream_tree::{
    AssemblyTree, ContextId, ExternalModelInfo, LoadStatus, LoadToken, Parent, ParsedAssembly,
    PendingExternalModel, ReifyReport, Reifier, ResolvedModel,
};
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::StreamExt;
use glam::Mat4;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Public types
// ============================================================================

/// Phase of one load
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadPhase {
    #[default]
    Idle,
    Parsing,
    Populating,
    AttachingExternalModels,
    Settling,
}

/// Maps external model names to attachable sources
#[async_trait]
pub trait ModelResolver: Send + Sync {
    /// Source of a model, `None` when it does not exist
    async fn resolve(&self, name: &str) -> LoadResult<Option<ModelSource>>;
}

/// Resolves every name to the engine model of the same name
#[derive(Clone, Copy, Debug, Default)]
pub struct NamedModelResolver;

#[async_trait]
impl ModelResolver for NamedModelResolver {
    async fn resolve(&self, name: &str) -> LoadResult<Option<ModelSource>> {
        Ok(Some(ModelSource::named(name)))
    }
}

/// Resolves names to SCS files below a directory
#[derive(Clone, Debug)]
pub struct DirectoryModelResolver {
    root: PathBuf,
    extension: Option<String>,
}

impl DirectoryModelResolver {
    /// Create a resolver reading `<root>/<name>`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: None,
        }
    }

    /// Append an extension to every name
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    fn path_of(&self, name: &str) -> PathBuf {
        let path = self.root.join(name);
        match &self.extension {
            Some(extension) if path.extension().is_none() => path.with_extension(extension),
            _ => path,
        }
    }
}

#[async_trait]
impl ModelResolver for DirectoryModelResolver {
    async fn resolve(&self, name: &str) -> LoadResult<Option<ModelSource>> {
        let path = self.path_of(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(ModelSource::buffer(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LoadError::Io(format!("{}: {}", path.display(), e))),
        }
    }
}

/// Deferred attachment of one external model
///
/// Runs in the background; awaiting it is optional.
pub struct PendingAttachment {
    /// Placeholder the model attaches under
    pub node: Option<RuntimeNodeId>,
    pub name: String,
    handle: JoinHandle<LoadResult<Vec<RuntimeNodeId>>>,
}

impl PendingAttachment {
    /// Wait for the attachment, yielding the attached root nodes
    pub async fn wait(self) -> LoadResult<Vec<RuntimeNodeId>> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                log::debug!("TreeLoader: attachment of '{}' aborted: {}", self.name, e);
                Err(LoadError::Cancelled)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl core::fmt::Debug for PendingAttachment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingAttachment")
            .field("node", &self.node)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Result of a completed load
#[derive(Debug)]
pub struct LoadOutcome {
    pub load: LoadId,
    /// Load context holding everything the load created
    pub context: ContextId,
    /// Nodes registered directly below the target
    pub roots: Vec<RuntimeNodeId>,
    /// Tree nodes registered, attached models included
    pub nodes: usize,
    /// Attachments still running after the load resolved
    pub pending: Vec<PendingAttachment>,
}

impl LoadOutcome {
    /// Wait for every pending attachment
    ///
    /// Returns the attached roots; the first failure wins once all settle.
    pub async fn wait_for_pending(self) -> LoadResult<Vec<RuntimeNodeId>> {
        let results = future::join_all(self.pending.into_iter().map(PendingAttachment::wait)).await;
        let mut roots = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(attached) => roots.extend(attached),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(roots),
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttachMode {
    /// The load awaits its attachments
    Await,
    /// Attachments wait on the streaming cutoff in the background
    Defer,
}

struct LoadRecord {
    context: ContextId,
    phase: LoadPhase,
    cancel: CancelToken,
    name: String,
}

struct LoaderInner {
    tree: Arc<Mutex<AssemblyTree>>,
    attacher: ScAttacher,
    callbacks: Arc<CallbackManager>,
    config: StreamingConfig,
    resolver: RwLock<Arc<dyn ModelResolver>>,
    loads: Mutex<BTreeMap<LoadId, LoadRecord>>,
    next_load: AtomicU64,
    active: watch::Sender<usize>,
    structure_ready: AtomicBool,
}

#[derive(Default)]
struct Integrated {
    roots: Vec<RuntimeNodeId>,
    nodes: usize,
    pending: Vec<PendingAttachment>,
}

impl Integrated {
    fn absorb(&mut self, other: Integrated) {
        self.roots.extend(other.roots);
        self.nodes += other.nodes;
        self.pending.extend(other.pending);
    }
}

/// One model attaching into the tree
struct AttachJob {
    placeholder: Option<RuntimeNodeId>,
    name: String,
    attach_ctx: ContextId,
}

fn inclusion_key_of(tree: &AssemblyTree, node: RuntimeNodeId) -> Option<InclusionKey> {
    tree.owning_inclusion(node)
        .and_then(|c| tree.inclusion_context(c))
        .and_then(|c| c.inclusion_key)
}

/// Record an attach on its context and open the inclusion it reifies into
fn open_inclusion(
    tree: &mut AssemblyTree,
    attach_ctx: ContextId,
    info: &AttachInfo,
    parsed: Option<&ParsedAssembly>,
) -> TreeResult<ContextId> {
    let span = parsed.map_or(1, |p| p.id_span.max(1));
    {
        let attach = tree.attach_context_mut(attach_ctx)?;
        attach.master_model_key = info.model_key;
        if let (Some(original), Some(effective)) = (parsed.and_then(|p| p.source_model_key), info.model_key) {
            attach.remapper.remap_model(original, effective)?;
        }
    }
    let inclusion = tree.create_inclusion_context(attach_ctx, span)?;
    let context = tree.inclusion_context_mut(inclusion)?;
    context.inclusion_key = info.inclusion_key;
    context.model_key = info.model_key;
    Ok(inclusion)
}

// ============================================================================
// Per-load scope
// ============================================================================

#[derive(Clone)]
struct LoadScope {
    inner: Arc<LoaderInner>,
    load: LoadId,
    context: ContextId,
    name: String,
    cancel: CancelToken,
    mode: AttachMode,
}

/// Keeps a load registered until its future settles or is dropped
struct LoadGuard {
    scope: LoadScope,
    token: LoadToken,
    keep_context: bool,
}

impl LoadGuard {
    fn settle(mut self, result: LoadResult<LoadOutcome>) -> LoadResult<LoadOutcome> {
        let scope = &self.scope;
        let result = match result {
            Err(e) if scope.cancel.is_cancelled() && !e.is_cancelled() => {
                log::debug!("TreeLoader: load {} failed after cancellation: {}", scope.load.0, e);
                Err(LoadError::Cancelled)
            }
            other => other,
        };

        match &result {
            Ok(outcome) => log::info!(
                "TreeLoader: load {} of '{}' finished: {} node(s), {} pending attachment(s)",
                scope.load.0,
                scope.name,
                outcome.nodes,
                outcome.pending.len()
            ),
            Err(e) if e.is_cancelled() => {
                log::debug!("TreeLoader: load {} of '{}' cancelled", scope.load.0, scope.name)
            }
            Err(e) => {
                log::error!("TreeLoader: load {} of '{}' failed: {}", scope.load.0, scope.name, e);
                scope.inner.callbacks.trigger(TreeEvent::ModelLoadFailure {
                    model_name: scope.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
        // Deferred attachments still resolve through the load context
        self.keep_context = matches!(&result, Ok(outcome) if !outcome.pending.is_empty());
        result
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let inner = &self.scope.inner;
        inner.loads.lock().remove(&self.scope.load);
        {
            let mut tree = inner.tree.lock();
            tree.on_load_end(self.token);
            if !self.keep_context && tree.is_context_empty(self.scope.context) {
                if let Err(e) = tree.discard_context(self.scope.context) {
                    log::warn!("TreeLoader: discarding empty load {} context failed: {}", self.scope.load.0, e);
                }
            }
        }
        inner.active.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl LoadScope {
    fn check(&self) -> LoadResult<()> {
        if self.cancel.is_cancelled() {
            Err(LoadError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: LoadPhase) {
        if let Some(record) = self.inner.loads.lock().get_mut(&self.load) {
            if record.phase != phase {
                log::debug!("TreeLoader: load {} {:?} -> {:?}", self.load.0, record.phase, phase);
                record.phase = phase;
            }
        }
    }

    fn begin_parse(&self) {
        self.set_phase(LoadPhase::Parsing);
        self.inner
            .callbacks
            .trigger(TreeEvent::ModelStructureParseBegin { load: self.load });
    }

    fn structure_ready(&self) {
        if !self.inner.structure_ready.swap(true, Ordering::SeqCst) {
            self.inner.callbacks.trigger(TreeEvent::ModelStructureReady);
        }
    }

    /// A vanished load context means the target was deleted under the load
    fn tree_error(&self, tree: &AssemblyTree, error: TreeError) -> LoadError {
        if self.cancel.is_cancelled() || !tree.contains_context(self.context) {
            LoadError::Cancelled
        } else {
            error.into()
        }
    }

    fn is_live(&self, context: ContextId) -> bool {
        self.inner.tree.lock().contains_context(context)
    }

    fn outcome(&self, roots: Vec<RuntimeNodeId>, nodes: usize, pending: Vec<PendingAttachment>) -> LoadOutcome {
        LoadOutcome {
            load: self.load,
            context: self.context,
            roots,
            nodes,
            pending,
        }
    }

    fn missing_model(&self, placeholder: Option<RuntimeNodeId>, name: &str) -> LoadResult<()> {
        if let Some(node) = placeholder {
            self.inner.tree.lock().set_load_status(node, LoadStatus::Missing);
        }
        if self.inner.config.allow_missing_external_models {
            log::warn!("TreeLoader: external model '{}' is missing", name);
            self.inner.callbacks.trigger(TreeEvent::MissingModel {
                model_path: name.to_string(),
            });
            Ok(())
        } else {
            log::warn!("TreeLoader: external model '{}' is missing, failing load {}", name, self.load.0);
            Err(LoadError::MissingModel(name.to_string()))
        }
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    fn resolution(&self, name: &str) -> LoadResult<ResolvedModel> {
        let resolver = self.inner.resolver.read().clone();
        let mut tree = self.inner.tree.lock();
        let context = tree
            .load_context_mut(self.context)
            .map_err(|_| LoadError::Cancelled)?;
        let owned = name.to_string();
        Ok(context.resolved_model(name, move || {
            Arc::new(LazyFuture::new(move || async move { resolver.resolve(&owned).await }))
        }))
    }

    async fn resolve(&self, name: &str) -> LoadResult<Option<ModelSource>> {
        let model = self.resolution(name)?;
        model.force().await
    }

    // ========================================================================
    // Population
    // ========================================================================

    async fn populate(&self, inclusion: ContextId, assembly: Arc<ParsedAssembly>) -> LoadResult<ReifyReport> {
        let budget = match self.inner.config.nodes_per_yield {
            0 => usize::MAX,
            n => n,
        };
        let mut reifier = {
            let tree = self.inner.tree.lock();
            Reifier::new(&tree, inclusion, assembly).map_err(|e| self.tree_error(&tree, e))?
        };

        loop {
            self.check()?;
            let finished = {
                let mut tree = self.inner.tree.lock();
                match reifier.step(&mut tree, budget) {
                    Ok(finished) => finished,
                    Err(e) => return Err(self.tree_error(&tree, e)),
                }
            };
            if finished {
                break;
            }
            tokio::task::yield_now().await;
        }

        let report = reifier.into_report();
        log::debug!(
            "TreeLoader: load {} reified {} node(s), {} skipped",
            self.load.0,
            report.nodes,
            report.skipped
        );
        Ok(report)
    }

    /// Push authored hidden state to freshly attached instances
    async fn hide_hidden_instances(&self, roots: &[RuntimeNodeId]) {
        let hidden: Vec<InstanceHandle> = {
            let tree = self.inner.tree.lock();
            roots
                .iter()
                .flat_map(|root| tree.effective_instance_visibility(*root))
                .filter(|(_, shown)| !shown)
                .map(|(instance, _)| instance)
                .collect()
        };
        if hidden.is_empty() {
            return;
        }
        if let Err(e) = self.inner.attacher.engine().set_visibility(&hidden, false).await {
            log::error!("TreeLoader: hiding {} instance(s) failed: {}", hidden.len(), e);
        }
    }

    // ========================================================================
    // Engine cleanup
    // ========================================================================

    async fn detach(&self, info: &AttachInfo) {
        let Some(key) = info.inclusion_key else {
            return;
        };
        self.inner.attacher.release_inclusions(&[key]);
        if let Err(e) = self.inner.attacher.engine().detach_inclusions(&[key]).await {
            log::debug!("TreeLoader: detaching inclusion {} failed: {}", key, e);
        }
    }

    /// Drop an attach from the tree and the engine
    async fn abandon(&self, attach_ctx: ContextId, info: &AttachInfo) {
        {
            let mut tree = self.inner.tree.lock();
            if tree.contains_context(attach_ctx) {
                if let Err(e) = tree.discard_context(attach_ctx) {
                    log::debug!("TreeLoader: discarding attach context failed: {}", e);
                }
            }
        }
        self.detach(info).await;
    }

    /// Bookkeeping for an attach that did not integrate
    fn fail_job(&self, job: &AttachJob, error: &LoadError) {
        let mut tree = self.inner.tree.lock();
        if let Some(node) = job.placeholder {
            let status = if error.is_cancelled() {
                LoadStatus::Unloaded
            } else if error.is_missing_model() {
                LoadStatus::Missing
            } else {
                LoadStatus::Failed
            };
            tree.set_load_status(node, status);
        }
        if tree.contains_context(job.attach_ctx) && tree.context_nodes(job.attach_ctx).is_empty() {
            if let Err(e) = tree.discard_context(job.attach_ctx) {
                log::warn!("TreeLoader: discarding attach context of '{}' failed: {}", job.name, e);
            }
        }
    }

    // ========================================================================
    // External models
    // ========================================================================

    fn placeholder_request(
        &self,
        tree: &AssemblyTree,
        external: &PendingExternalModel,
        source: ModelSource,
        direct: bool,
    ) -> AttachRequest {
        let matrix = tree.net_matrix(external.node).unwrap_or(Mat4::IDENTITY);
        let bounds = tree
            .world_bounds(external.node)
            .or_else(|| external.bounds.map(|b| b.transform(&matrix)));
        AttachRequest::new(source, external.name.clone())
            .with_parent_inclusion(inclusion_key_of(tree, external.node))
            .with_matrix(matrix)
            .with_invisible(!tree.is_effectively_shown(external.node))
            .with_bounds(bounds)
            .with_anchor(external.node)
            .with_allow_missing_model(self.inner.attacher.allow_missing_model())
            .with_direct_request(direct)
    }

    /// Resolve and attach the models behind placeholder nodes
    fn attach_externals(
        &self,
        externals: Vec<PendingExternalModel>,
        mode: AttachMode,
        direct: bool,
    ) -> BoxFuture<'static, LoadResult<Integrated>> {
        let scope = self.clone();
        async move {
            if externals.is_empty() {
                return Ok(Integrated::default());
            }
            scope.check()?;
            if mode == AttachMode::Await {
                scope.set_phase(LoadPhase::AttachingExternalModels);
            }
            log::debug!(
                "TreeLoader: load {} resolving {} external model(s)",
                scope.load.0,
                externals.len()
            );

            {
                let mut tree = scope.inner.tree.lock();
                for external in &externals {
                    tree.set_load_status(external.node, LoadStatus::Loading);
                }
            }
            let sources = future::join_all(externals.iter().map(|e| scope.resolve(&e.name))).await;
            if let Err(e) = scope.check() {
                let mut tree = scope.inner.tree.lock();
                for external in &externals {
                    tree.set_load_status(external.node, LoadStatus::Unloaded);
                }
                return Err(e);
            }

            let mut first_error: Option<LoadError> = None;
            let mut missing = Vec::new();
            let mut jobs = Vec::new();
            let mut requests = Vec::new();
            {
                let mut tree = scope.inner.tree.lock();
                for (external, source) in externals.into_iter().zip(sources) {
                    if !tree.contains_node(external.node) {
                        continue;
                    }
                    let source = match source {
                        Ok(Some(source)) => source,
                        Ok(None) => {
                            missing.push(external);
                            continue;
                        }
                        Err(e) => {
                            log::error!("TreeLoader: resolving '{}' failed: {}", external.name, e);
                            tree.set_load_status(external.node, LoadStatus::Failed);
                            first_error.get_or_insert(e);
                            continue;
                        }
                    };
                    let attach_ctx = match tree.create_attach_context(Parent::Node(external.node), &external.name) {
                        Ok(ctx) => ctx,
                        Err(e) => {
                            tree.set_load_status(external.node, LoadStatus::Failed);
                            first_error.get_or_insert(e.into());
                            continue;
                        }
                    };
                    requests.push(scope.placeholder_request(&tree, &external, source, direct));
                    jobs.push(AttachJob {
                        placeholder: Some(external.node),
                        name: external.name,
                        attach_ctx,
                    });
                }
            }
            for external in missing {
                if let Err(e) = scope.missing_model(Some(external.node), &external.name) {
                    first_error.get_or_insert(e);
                }
            }

            let mut integrated = Integrated::default();
            match mode {
                AttachMode::Await => {
                    let tickets = scope.inner.attacher.attach_batch(requests);
                    let results = future::join_all(
                        jobs.into_iter()
                            .zip(tickets)
                            .map(|(job, ticket)| scope.integrate(job, ticket)),
                    )
                    .await;
                    for result in results {
                        match result {
                            Ok(done) => integrated.absorb(done),
                            Err(e) => {
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                AttachMode::Defer => {
                    for (job, request) in jobs.into_iter().zip(requests) {
                        let ticket = scope.inner.attacher.defer_attach(request);
                        let node = job.placeholder;
                        let name = job.name.clone();
                        let work = scope.integrate(job, ticket);
                        integrated.pending.push(PendingAttachment {
                            node,
                            name,
                            handle: tokio::spawn(async move { work.await.map(|done| done.roots) }),
                        });
                    }
                }
            }

            if let Some(e) = first_error {
                return Err(e);
            }
            scope.check()?;
            Ok(integrated)
        }
        .boxed()
    }

    /// Reify an attached model under its attach context
    fn integrate(&self, job: AttachJob, ticket: AttachTicket) -> BoxFuture<'static, LoadResult<Integrated>> {
        let scope = self.clone();
        async move {
            let result = scope.integrate_attached(&job, ticket).await;
            if let Err(e) = &result {
                scope.fail_job(&job, e);
            }
            result
        }
        .boxed()
    }

    async fn integrate_attached(&self, job: &AttachJob, ticket: AttachTicket) -> LoadResult<Integrated> {
        let info = ticket.await.map_err(|e| match e {
            LoadError::Engine(EngineError::UnknownModel(_)) => LoadError::MissingModel(job.name.clone()),
            other => other,
        })?;
        if info.is_empty() {
            self.missing_model(job.placeholder, &job.name)?;
            return Ok(Integrated::default());
        }
        if let Err(e) = self.check() {
            log::debug!("TreeLoader: '{}' attached after cancellation, detaching", job.name);
            self.abandon(job.attach_ctx, &info).await;
            return Err(e);
        }

        let parsed = match info.assembly_data.as_deref().map(decode_assembly_data).transpose() {
            Ok(parsed) => parsed.map(Arc::new),
            Err(e) => {
                self.abandon(job.attach_ctx, &info).await;
                return Err(e.into());
            }
        };
        let opened = {
            let mut tree = self.inner.tree.lock();
            if tree.contains_context(job.attach_ctx) {
                Some(open_inclusion(&mut tree, job.attach_ctx, &info, parsed.as_deref()))
            } else {
                None
            }
        };
        let inclusion = match opened {
            Some(Ok(inclusion)) => inclusion,
            Some(Err(e)) => {
                self.abandon(job.attach_ctx, &info).await;
                return Err(e.into());
            }
            None => {
                log::debug!("TreeLoader: anchor of '{}' deleted during attach, detaching", job.name);
                self.detach(&info).await;
                return Ok(Integrated::default());
            }
        };

        let report = match parsed {
            Some(parsed) => match self.populate(inclusion, parsed).await {
                Ok(report) => report,
                Err(e) if e.is_cancelled() || !self.is_live(job.attach_ctx) => {
                    self.abandon(job.attach_ctx, &info).await;
                    return if self.cancel.is_cancelled() || !self.is_live(self.context) {
                        Err(LoadError::Cancelled)
                    } else {
                        Ok(Integrated::default())
                    };
                }
                Err(e) => return Err(e),
            },
            None => ReifyReport::default(),
        };

        if let Some(node) = job.placeholder {
            self.inner.tree.lock().set_load_status(node, LoadStatus::Loaded);
        }
        self.hide_hidden_instances(&report.roots).await;

        let mut loaded: Vec<RuntimeNodeId> = job.placeholder.into_iter().collect();
        loaded.extend(report.roots.iter().copied());
        self.inner.callbacks.trigger(TreeEvent::NodesLoaded { nodes: loaded });
        self.inner.callbacks.trigger(TreeEvent::SubtreeLoaded {
            roots: report.roots.clone(),
            models: vec![job.name.clone()],
        });
        log::debug!("TreeLoader: '{}' integrated, {} node(s)", job.name, report.nodes);

        let nested = self.attach_externals(report.external_models, self.mode, false).await?;
        Ok(Integrated {
            roots: report.roots,
            nodes: report.nodes + nested.nodes,
            pending: nested.pending,
        })
    }

    // ========================================================================
    // Load bodies
    // ========================================================================

    async fn run_xml(self, xml: String) -> LoadResult<LoadOutcome> {
        self.check()?;
        self.begin_parse();
        let parsed = Arc::new(parse_xml(&xml)?);
        self.check()?;

        self.set_phase(LoadPhase::Populating);
        let inclusion = {
            let mut tree = self.inner.tree.lock();
            tree.create_inclusion_context(self.context, parsed.id_span)
                .map_err(|e| self.tree_error(&tree, e))?
        };
        let ReifyReport {
            roots,
            nodes,
            external_models,
            ..
        } = self.populate(inclusion, parsed).await?;

        self.structure_ready();
        self.inner.callbacks.trigger(TreeEvent::SubtreeLoaded {
            roots: roots.clone(),
            models: vec![self.name.clone()],
        });

        let attached = self.attach_externals(external_models, self.mode, false).await?;
        self.set_phase(LoadPhase::Settling);
        Ok(self.outcome(roots, nodes + attached.nodes, attached.pending))
    }

    /// Attach context below the load and the request attaching into it
    fn prepare_attach(&self, source: ModelSource) -> LoadResult<(AttachJob, AttachRequest)> {
        let mut tree = self.inner.tree.lock();
        let anchor = tree.context_anchor(self.context).unwrap_or_else(|| tree.root_id());
        let attach_ctx = tree
            .create_attach_context(Parent::Context(self.context), &self.name)
            .map_err(|e| self.tree_error(&tree, e))?;
        let request = AttachRequest::new(source, self.name.clone())
            .with_parent_inclusion(inclusion_key_of(&tree, anchor))
            .with_matrix(tree.net_matrix(anchor).unwrap_or(Mat4::IDENTITY))
            .with_invisible(!tree.is_effectively_shown(anchor))
            .with_anchor(anchor)
            .with_allow_missing_model(self.inner.attacher.allow_missing_model())
            .with_direct_request(true);
        let job = AttachJob {
            placeholder: None,
            name: self.name.clone(),
            attach_ctx,
        };
        Ok((job, request))
    }

    async fn run_scs(self, source: ModelSource) -> LoadResult<LoadOutcome> {
        self.check()?;
        self.begin_parse();
        let (job, request) = self.prepare_attach(source)?;

        // The session's first models share a failure-fails-all batch
        let ticket = if self.inner.structure_ready.load(Ordering::SeqCst) {
            self.inner.attacher.simple_attach(request)
        } else {
            self.inner.attacher.attach_initial(request)
        };
        self.set_phase(LoadPhase::Populating);
        let integrated = self.integrate(job, ticket).await?;

        self.structure_ready();
        self.set_phase(LoadPhase::Settling);
        Ok(self.outcome(integrated.roots, integrated.nodes, integrated.pending))
    }

    async fn run_stream(self) -> LoadResult<LoadOutcome> {
        self.check()?;
        self.begin_parse();
        let (job, request) = self.prepare_attach(ModelSource::named(&self.name))?;
        let result = self.stream_into(&job, request).await;
        if let Err(e) = &result {
            self.fail_job(&job, e);
        }
        result
    }

    async fn stream_into(&self, job: &AttachJob, request: AttachRequest) -> LoadResult<LoadOutcome> {
        let matrix = request.matrix;
        let (info, mut segments) = match self.inner.attacher.open_stream(request).await {
            Ok(opened) => opened,
            Err(LoadError::Engine(EngineError::UnknownModel(_))) => {
                self.missing_model(None, &job.name)?;
                return Ok(self.outcome(Vec::new(), 0, Vec::new()));
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = self.check() {
            self.abandon(job.attach_ctx, &info).await;
            return Err(e);
        }
        self.set_phase(LoadPhase::Populating);

        let master = match info.assembly_data.as_deref().map(decode_assembly_data).transpose() {
            Ok(master) => master,
            Err(e) => {
                self.abandon(job.attach_ctx, &info).await;
                return Err(e.into());
            }
        };
        let opened = {
            let mut tree = self.inner.tree.lock();
            if tree.contains_context(job.attach_ctx) {
                Some(open_inclusion(&mut tree, job.attach_ctx, &info, master.as_ref()))
            } else {
                None
            }
        };
        let inclusion = match opened {
            Some(Ok(inclusion)) => inclusion,
            Some(Err(e)) => {
                self.abandon(job.attach_ctx, &info).await;
                return Err(e.into());
            }
            None => {
                self.detach(&info).await;
                return Err(LoadError::Cancelled);
            }
        };

        // Streams open at the origin; place them at the target
        if let Some(key) = info.inclusion_key.filter(|_| matrix != Mat4::IDENTITY) {
            if let Err(e) = self.inner.attacher.engine().set_inclusion_matrix(key, matrix).await {
                log::error!("TreeLoader: placing stream '{}' failed: {}", job.name, e);
            }
        }

        let mut roots = Vec::new();
        let mut nodes = 0;
        let mut externals = Vec::new();
        let mut next = master.map(Arc::new);
        loop {
            if let Some(assembly) = next.take() {
                let report = match self.populate(inclusion, assembly).await {
                    Ok(report) => report,
                    Err(e) => {
                        if e.is_cancelled() {
                            self.abandon(job.attach_ctx, &info).await;
                        }
                        return Err(e);
                    }
                };
                if !report.roots.is_empty() {
                    self.inner.callbacks.trigger(TreeEvent::NodesLoaded {
                        nodes: report.roots.clone(),
                    });
                }
                roots.extend(report.roots);
                nodes += report.nodes;
                externals.extend(report.external_models);
            }

            match segments.next().await {
                Some(Ok(bytes)) => next = Some(Arc::new(decode_assembly_data(&bytes)?)),
                Some(Err(e)) => {
                    log::error!("TreeLoader: stream '{}' broke off: {}", job.name, e);
                    return Err(e.into());
                }
                None => break,
            }
        }

        self.hide_hidden_instances(&roots).await;
        self.structure_ready();
        self.inner.callbacks.trigger(TreeEvent::SubtreeLoaded {
            roots: roots.clone(),
            models: vec![job.name.clone()],
        });

        let attached = self.attach_externals(externals, self.mode, false).await?;
        self.set_phase(LoadPhase::Settling);
        Ok(self.outcome(roots, nodes + attached.nodes, attached.pending))
    }
}

// ============================================================================
// TreeLoader
// ============================================================================

/// Loads structure into a shared [`AssemblyTree`]
#[derive(Clone)]
pub struct TreeLoader {
    inner: Arc<LoaderInner>,
}

impl TreeLoader {
    /// Create a loader over a shared tree
    pub fn new(
        tree: Arc<Mutex<AssemblyTree>>,
        attacher: ScAttacher,
        callbacks: Arc<CallbackManager>,
        config: StreamingConfig,
    ) -> Self {
        let (active, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(LoaderInner {
                tree,
                attacher,
                callbacks,
                config,
                resolver: RwLock::new(Arc::new(NamedModelResolver)),
                loads: Mutex::new(BTreeMap::new()),
                next_load: AtomicU64::new(1),
                active,
                structure_ready: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the resolver used for external models
    pub fn set_model_resolver(&self, resolver: Arc<dyn ModelResolver>) {
        *self.inner.resolver.write() = resolver;
    }

    pub fn tree(&self) -> &Arc<Mutex<AssemblyTree>> {
        &self.inner.tree
    }

    pub fn attacher(&self) -> &ScAttacher {
        &self.inner.attacher
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn register(&self, target: Option<RuntimeNodeId>, name: String) -> LoadResult<LoadGuard> {
        let inner = &self.inner;
        let (context, token) = {
            let mut tree = inner.tree.lock();
            let target = target.unwrap_or_else(|| tree.root_id());
            if tree.lookup_container_node(target).is_none() {
                return Err(LoadError::InvalidTarget(target));
            }
            let context = tree.create_load_context(Parent::Node(target))?;
            (context, tree.on_load_begin(context))
        };

        let load = LoadId(inner.next_load.fetch_add(1, Ordering::Relaxed));
        let cancel = CancelToken::new();
        inner.loads.lock().insert(
            load,
            LoadRecord {
                context,
                phase: LoadPhase::Idle,
                cancel: cancel.clone(),
                name: name.clone(),
            },
        );
        inner.active.send_modify(|count| *count += 1);
        log::debug!("TreeLoader: load {} of '{}' registered", load.0, name);
        inner.callbacks.trigger(TreeEvent::ModelLoadBegin { load });

        let mode = if inner.config.implicitly_load_xml_external_models {
            AttachMode::Await
        } else {
            AttachMode::Defer
        };
        Ok(LoadGuard {
            scope: LoadScope {
                inner: inner.clone(),
                load,
                context,
                name,
                cancel,
                mode,
            },
            token,
            keep_context: false,
        })
    }

    fn start<F, Fut>(&self, target: Option<RuntimeNodeId>, name: String, run: F) -> BoxFuture<'static, LoadResult<LoadOutcome>>
    where
        F: FnOnce(LoadScope) -> Fut + Send + 'static,
        Fut: Future<Output = LoadResult<LoadOutcome>> + Send + 'static,
    {
        let guard = match self.register(target, name) {
            Ok(guard) => guard,
            Err(e) => {
                log::error!("TreeLoader: load rejected: {}", e);
                return future::ready(Err(e)).boxed();
            }
        };
        async move {
            let result = run(guard.scope.clone()).await;
            guard.settle(result)
        }
        .boxed()
    }

    // ========================================================================
    // Loads
    // ========================================================================

    /// Load an XML structure document below `target` (the root when `None`)
    pub fn load_by_xml_doc(
        &self,
        xml: impl Into<String>,
        target: Option<RuntimeNodeId>,
    ) -> BoxFuture<'static, LoadResult<LoadOutcome>> {
        let xml = xml.into();
        self.start(target, "xml document".to_string(), move |scope| scope.run_xml(xml))
    }

    /// Load an XML structure file
    pub fn load_by_xml_file(
        &self,
        path: impl AsRef<Path>,
        target: Option<RuntimeNodeId>,
    ) -> BoxFuture<'static, LoadResult<LoadOutcome>> {
        let path = path.as_ref().to_path_buf();
        self.start(target, path.display().to_string(), move |scope| async move {
            scope.check()?;
            let xml = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| LoadError::Io(format!("{}: {}", path.display(), e)))?;
            scope.run_xml(xml).await
        })
    }

    /// Attach an in-memory SCS model below `target`
    pub fn load_by_scs_buffer(
        &self,
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        target: Option<RuntimeNodeId>,
    ) -> BoxFuture<'static, LoadResult<LoadOutcome>> {
        let source = ModelSource::buffer(bytes);
        self.start(target, name.into(), move |scope| scope.run_scs(source))
    }

    /// Attach an SCS file below `target`
    pub fn load_by_scs_file(
        &self,
        path: impl AsRef<Path>,
        target: Option<RuntimeNodeId>,
    ) -> BoxFuture<'static, LoadResult<LoadOutcome>> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.start(target, name, move |scope| async move {
            scope.check()?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| LoadError::Io(format!("{}: {}", path.display(), e)))?;
            scope.run_scs(ModelSource::buffer(bytes)).await
        })
    }

    /// Stream a named engine model below `target`
    pub fn load_by_stream(
        &self,
        model_name: impl Into<String>,
        target: Option<RuntimeNodeId>,
    ) -> BoxFuture<'static, LoadResult<LoadOutcome>> {
        self.start(target, model_name.into(), move |scope| scope.run_stream())
    }

    /// Attach the model behind a placeholder node ahead of everything else
    ///
    /// Placeholders already loading or loaded resolve without attaching.
    pub fn attach_by_external_model_info(
        &self,
        node: RuntimeNodeId,
        info: ExternalModelInfo,
    ) -> BoxFuture<'static, LoadResult<LoadOutcome>> {
        self.start(Some(node), info.name.clone(), move |scope| async move {
            scope.check()?;
            let status = scope.inner.tree.lock().load_status(node);
            if matches!(status, Some(LoadStatus::Loading) | Some(LoadStatus::Loaded)) {
                log::debug!("TreeLoader: '{}' already attaching under {}", info.name, node);
                return Ok(scope.outcome(Vec::new(), 0, Vec::new()));
            }

            let external = PendingExternalModel {
                node,
                name: info.name,
                bounds: info.bounds,
            };
            let attached = scope
                .attach_externals(vec![external], AttachMode::Await, true)
                .await?;
            scope.set_phase(LoadPhase::Settling);
            Ok(scope.outcome(attached.roots, attached.nodes, attached.pending))
        })
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel every active load and discard queued attachments
    ///
    /// Returns the number of loads cancelled.
    pub fn cancel_pending_loads(&self) -> usize {
        let cancelled: Vec<LoadId> = {
            let loads = self.inner.loads.lock();
            loads
                .iter()
                .filter(|(_, record)| record.cancel.cancel())
                .map(|(id, _)| *id)
                .collect()
        };
        let discarded = self.inner.attacher.clear_attach_queues();
        log::debug!(
            "TreeLoader: cancelled {} load(s), discarded {} queued attachment(s)",
            cancelled.len(),
            discarded
        );
        for load in &cancelled {
            self.inner.callbacks.trigger(TreeEvent::LoadCancelled { load: *load });
        }
        cancelled.len()
    }

    /// Cancel one load; its queued attachments settle as cancelled once reached
    pub fn cancel_load(&self, load: LoadId) -> bool {
        let cancelled = self
            .inner
            .loads
            .lock()
            .get(&load)
            .is_some_and(|record| record.cancel.cancel());
        if cancelled {
            log::debug!("TreeLoader: load {} cancelled", load.0);
            self.inner.callbacks.trigger(TreeEvent::LoadCancelled { load });
        }
        cancelled
    }

    /// Discard queued attachments without cancelling loads
    pub fn cancel_active_attachment_process(&self) -> usize {
        self.inner.attacher.clear_attach_queues()
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Check if no load is active and no attachment is queued or running
    pub fn is_idle(&self) -> bool {
        self.inner.loads.lock().is_empty() && self.inner.attacher.is_idle()
    }

    /// Wait until every active load has settled
    pub async fn wait_on_current_loads(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Phase of a load; settled loads are `Idle`
    pub fn phase(&self, load: LoadId) -> LoadPhase {
        self.inner
            .loads
            .lock()
            .get(&load)
            .map_or(LoadPhase::Idle, |record| record.phase)
    }

    /// Loads currently registered
    pub fn active_loads(&self) -> Vec<LoadId> {
        self.inner.loads.lock().keys().copied().collect()
    }

    /// Name and load context of an active load
    pub fn load_info(&self, load: LoadId) -> Option<(String, ContextId)> {
        self.inner
            .loads
            .lock()
            .get(&load)
            .map(|record| (record.name.clone(), record.context))
    }

    /// Check if the session's first structure is available
    pub fn is_structure_ready(&self) -> bool {
        self.inner.structure_ready.load(Ordering::SeqCst)
    }

    /// Forget the session's structure so the next load counts as initial
    pub fn on_session_reset(&self) {
        self.inner.structure_ready.store(false, Ordering::SeqCst);
    }
}

impl core::fmt::Debug for TreeLoader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TreeLoader")
            .field("active_loads", &self.inner.loads.lock().len())
            .field("structure_ready", &self.is_structure_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::encode_assembly_data;
    use cadstream_core::engine::{MemoryEngine, MemoryModel};
    use cadstream_core::events::EventRecorder;
    use cadstream_core::id::{AuthoredNodeId, NodeIdOffset};
    use cadstream_tree::{NodeInfo, NodeKind};
    use std::sync::atomic::AtomicUsize;

    fn config() -> StreamingConfig {
        StreamingConfig {
            reprioritize_debounce_ms: 0,
            ..Default::default()
        }
    }

    fn loader_with(engine: Arc<MemoryEngine>, config: StreamingConfig) -> (TreeLoader, Arc<CallbackManager>) {
        let tree = Arc::new(Mutex::new(AssemblyTree::new()));
        let callbacks = Arc::new(CallbackManager::new());
        let attacher = ScAttacher::new(engine, &config);
        (TreeLoader::new(tree, attacher, callbacks.clone(), config), callbacks)
    }

    fn part_model() -> MemoryModel {
        let mut body = NodeInfo::new(1, Some(0), NodeKind::Mesh, "body");
        body.instances = vec![0];
        let parsed = ParsedAssembly {
            nodes: vec![NodeInfo::new(0, None, NodeKind::ProductOccurrence, "part"), body],
            ..Default::default()
        };
        MemoryModel {
            assembly_data: encode_assembly_data(&parsed).unwrap(),
            ..Default::default()
        }
    }

    const ASSEMBLY: &str = r#"
        <ModelFile>
          <ProductOccurrence Id="0" Name="Assembly">
            <ProductOccurrence Id="1" Name="Left" ExternalModel="part"/>
            <ProductOccurrence Id="2" Name="Right" ExternalModel="part"/>
          </ProductOccurrence>
        </ModelFile>
    "#;

    struct CountingResolver(AtomicUsize);

    #[async_trait]
    impl ModelResolver for CountingResolver {
        async fn resolve(&self, name: &str) -> LoadResult<Option<ModelSource>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ModelSource::named(name)))
        }
    }

    #[tokio::test]
    async fn test_xml_load_attaches_externals() {
        let _ = env_logger::builder().is_test(true).try_init();
        let engine = MemoryEngine::new().shared();
        engine.register_model("part", part_model());
        let (loader, callbacks) = loader_with(engine.clone(), config());
        let events = EventRecorder::attach(&callbacks);

        let outcome = loader.load_by_xml_doc(ASSEMBLY, None).await.unwrap();
        assert_eq!(outcome.roots.len(), 1);
        assert!(outcome.pending.is_empty());
        assert_eq!(engine.inclusion_count(), 2);

        let tree = loader.tree().lock();
        let left = tree.children(outcome.roots[0])[0];
        assert_eq!(tree.load_status(left), Some(LoadStatus::Loaded));
        assert_eq!(tree.children(left).len(), 1);
        assert_eq!(tree.node_count(), 1 + 3 + 4);
        drop(tree);

        assert_eq!(events.count("modelLoadBegin"), 1);
        assert_eq!(events.count("modelStructureReady"), 1);
        assert_eq!(events.count("subtreeLoaded"), 3);
        assert!(loader.is_idle());
        assert_eq!(loader.phase(outcome.load), LoadPhase::Idle);
    }

    #[tokio::test]
    async fn test_duplicate_names_resolve_once() {
        let engine = MemoryEngine::new().shared();
        engine.register_model("part", part_model());
        let (loader, _) = loader_with(engine, config());
        let resolver = Arc::new(CountingResolver(AtomicUsize::new(0)));
        loader.set_model_resolver(resolver.clone());

        loader.load_by_xml_doc(ASSEMBLY, None).await.unwrap();
        assert_eq!(resolver.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let (loader, _) = loader_with(MemoryEngine::new().shared(), config());
        let missing = RuntimeNodeId::from_authored(AuthoredNodeId::new(12345), NodeIdOffset::new(0)).unwrap();
        let result = loader.load_by_xml_doc(ASSEMBLY, Some(missing)).await;
        assert_eq!(result.unwrap_err(), LoadError::InvalidTarget(missing));
        assert!(loader.active_loads().is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_reported() {
        let (loader, callbacks) = loader_with(MemoryEngine::new().shared(), config());
        let events = EventRecorder::attach(&callbacks);

        let result = loader.load_by_xml_doc("<ModelFile><Body></ModelFile>", None).await;
        assert!(matches!(result, Err(LoadError::Parse(_))));
        assert_eq!(events.count("modelLoadFailure"), 1);
        assert!(loader.is_idle());
    }

    #[tokio::test]
    async fn test_cancel_before_first_poll() {
        let engine = MemoryEngine::new().shared();
        engine.register_model("part", part_model());
        let (loader, callbacks) = loader_with(engine.clone(), config());
        let events = EventRecorder::attach(&callbacks);

        let load = loader.load_by_xml_doc(ASSEMBLY, None);
        assert_eq!(loader.active_loads().len(), 1);
        assert_eq!(loader.cancel_pending_loads(), 1);

        assert_eq!(load.await.unwrap_err(), LoadError::Cancelled);
        assert_eq!(loader.tree().lock().node_count(), 1);
        assert_eq!(engine.inclusion_count(), 0);
        assert_eq!(events.count("loadCancelled"), 1);
        assert_eq!(events.count("modelLoadFailure"), 0);
    }

    #[tokio::test]
    async fn test_deferred_externals_pend() {
        let engine = MemoryEngine::new().shared();
        engine.register_model("part", part_model());
        let config = config().with_implicit_xml_external_models(false);
        let (loader, _) = loader_with(engine.clone(), config);

        let outcome = loader.load_by_xml_doc(ASSEMBLY, None).await.unwrap();
        assert_eq!(outcome.pending.len(), 2);
        let attached = outcome.wait_for_pending().await.unwrap();
        assert_eq!(attached.len(), 2);
        assert_eq!(engine.inclusion_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_model_policy() {
        let engine = MemoryEngine::new().shared();
        let (strict, _) = loader_with(engine.clone(), config());
        let result = strict.load_by_xml_doc(ASSEMBLY, None).await;
        assert_eq!(result.unwrap_err(), LoadError::MissingModel("part".to_string()));

        let (lenient, callbacks) = loader_with(engine, config().with_allow_missing_external_models(true));
        let events = EventRecorder::attach(&callbacks);
        let outcome = lenient.load_by_xml_doc(ASSEMBLY, None).await.unwrap();
        assert_eq!(events.count("missingModel"), 2);

        let tree = lenient.tree().lock();
        for placeholder in tree.children(outcome.roots[0]) {
            assert_eq!(tree.load_status(placeholder), Some(LoadStatus::Missing));
        }
    }

    #[tokio::test]
    async fn test_scs_buffer_load() {
        let engine = MemoryEngine::new().shared();
        let (loader, callbacks) = loader_with(engine.clone(), config());
        let events = EventRecorder::attach(&callbacks);

        let bytes = part_model().assembly_data;
        let outcome = loader.load_by_scs_buffer("part.scs", bytes, None).await.unwrap();
        assert_eq!(outcome.roots.len(), 1);
        assert_eq!(outcome.nodes, 2);
        assert!(loader.is_structure_ready());
        assert_eq!(events.count("modelStructureReady"), 1);

        let tree = loader.tree().lock();
        let body = tree.children(outcome.roots[0])[0];
        assert_eq!(tree.lookup_body_node(body).unwrap().instances().len(), 1);
    }
}
