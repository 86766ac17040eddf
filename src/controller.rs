//! The parallel pipeline controller.
//!
//! Owns the canonical stage lane and runs episodes over a collection, either
//! sequentially on the canonical lane or across `parallelism` lanes fed by a
//! bounded `TaskDispatcher`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collection::{Collection, CollectionAccess, ElementLease};
use crate::condition::RunCondition;
use crate::config::{validate_execution, ExecutionConfig};
use crate::dispatcher::{panic_message, Task, TaskDispatcher, TaskSource, WorkerPool};
use crate::error::PipelineError;
use crate::lanes::{Lane, LanePool, StageSetDuplicator};
use crate::stage::{Stage, StageBinding, StageContext, StageSlot};
use crate::types::{EpisodeSummary, ExecutionMode, LaneOutcome};

// --- InterruptHandle ---

struct InterruptState {
    token: CancellationToken,
    dispatcher: Option<TaskDispatcher>,
}

/// Cloneable handle for interrupting a controller's running episode from
/// another task (e.g. a Ctrl-C listener).
///
/// An interrupt requested between episodes applies to the next episode.
/// Once an interrupted episode returns, the handle is re-armed.
#[derive(Clone)]
pub struct InterruptHandle {
    state: Arc<Mutex<InterruptState>>,
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(InterruptState {
                token: CancellationToken::new(),
                dispatcher: None,
            })),
        }
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl InterruptHandle {
    fn lock(&self) -> MutexGuard<'_, InterruptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the episode token and stop the live dispatcher from starting
    /// new tasks. Stages observe it through `StageContext::cancel`.
    pub fn interrupt(&self) {
        let state = self.lock();
        state.token.cancel();
        if let Some(dispatcher) = &state.dispatcher {
            dispatcher.interrupt();
        }
        info!("Interrupt requested");
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().token.is_cancelled()
    }

    fn begin(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    fn attach(&self, dispatcher: &TaskDispatcher) {
        let mut state = self.lock();
        if state.token.is_cancelled() {
            dispatcher.interrupt();
        }
        state.dispatcher = Some(dispatcher.clone());
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.dispatcher = None;
        if state.token.is_cancelled() {
            state.token = CancellationToken::new();
        }
    }
}

// --- ParallelController ---

/// Runs an ordered chain of stages over every element of a collection.
///
/// With `parallelism > 1` the stage chain is duplicated into
/// `parallelism - 1` extra lanes for the duration of one episode; each
/// element is processed by exactly one lane.
pub struct ParallelController<C: Collection> {
    config: ExecutionConfig,
    collection: Option<Arc<C>>,
    target: Option<usize>,
    canonical: Lane<C::Element>,
    worker_pool: Option<Arc<WorkerPool>>,
    interrupt: InterruptHandle,
}

impl<C: Collection> std::fmt::Debug for ParallelController<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelController")
            .field("config", &self.config)
            .field("has_collection", &self.collection.is_some())
            .field("target", &self.target)
            .field("canonical", &self.canonical)
            .finish()
    }
}

impl<C: Collection> ParallelController<C> {
    /// Tasks run on the caller's runtime unless a worker pool is set.
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            collection: None,
            target: None,
            canonical: Lane::new(),
            worker_pool: None,
            interrupt: InterruptHandle::default(),
        }
    }

    /// Validate `config` and start a dedicated worker pool when
    /// `worker_threads` is set.
    pub fn from_config(config: ExecutionConfig) -> Result<Self, PipelineError> {
        let errors = validate_execution(&config);
        if !errors.is_empty() {
            return Err(PipelineError::Config(errors.join("; ")));
        }
        let worker_pool = match config.worker_threads {
            Some(threads) => Some(Arc::new(WorkerPool::dedicated(threads)?)),
            None => None,
        };
        let mut controller = Self::new(config);
        controller.worker_pool = worker_pool;
        Ok(controller)
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn set_parallelism(&mut self, parallelism: usize) {
        self.config.parallelism = parallelism.max(1);
    }

    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.config.fail_fast = fail_fast;
    }

    pub fn set_worker_pool(&mut self, pool: Arc<WorkerPool>) {
        self.worker_pool = Some(pool);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    // --- Collection and target ---

    pub fn set_collection(&mut self, collection: Arc<C>) {
        self.collection = Some(collection);
        self.target = None;
    }

    pub fn collection(&self) -> Option<&Arc<C>> {
        self.collection.as_ref()
    }

    /// Restrict the next episodes to the element at `index`, run sequentially.
    pub fn set_target(&mut self, index: Option<usize>) {
        self.target = index;
    }

    /// Target an element by identity. Returns its index, or `None` (and
    /// clears the target) when it is not in the collection.
    pub fn set_target_element(&mut self, element: &C::Element) -> Option<usize> {
        self.target = self
            .collection
            .as_ref()
            .and_then(|collection| collection.index_of(element));
        self.target
    }

    pub fn target(&self) -> Option<usize> {
        self.target
    }

    /// Tell the controller the element at `index` left the collection.
    /// A target at `index` is cleared; a later target shifts down by one.
    pub fn on_element_removed(&mut self, index: usize) {
        self.target = match self.target {
            Some(target) if target == index => {
                debug!(index, "Target element removed from collection");
                None
            }
            Some(target) if target > index => Some(target - 1),
            other => other,
        };
    }

    // --- Stage management ---

    /// Append a stage. Returns the binding run conditions can read from.
    pub fn add_stage(
        &mut self,
        stage: Box<dyn Stage<C::Element>>,
    ) -> Result<StageBinding<C::Element>, PipelineError> {
        let position = self.canonical.len();
        self.insert_stage(position, stage)
    }

    /// Insert a stage at `position` (clamped to the end), initialising it first.
    pub fn insert_stage(
        &mut self,
        position: usize,
        stage: Box<dyn Stage<C::Element>>,
    ) -> Result<StageBinding<C::Element>, PipelineError> {
        let mut slot = StageSlot::new(stage);
        slot.init()?;
        let binding = slot.binding().clone();
        let position = position.min(self.canonical.len());
        debug!(position, stage = slot.name(), "Added stage");
        self.canonical.insert(position, slot);
        Ok(binding)
    }

    /// Remove the stage at `position` along with its run condition. The stage
    /// is handed back without `cleanup()`.
    pub fn remove_stage(&mut self, position: usize) -> Option<Box<dyn Stage<C::Element>>> {
        if position >= self.canonical.len() {
            return None;
        }
        let (slot, _) = self.canonical.remove(position);
        Some(slot.into_stage())
    }

    /// Attach a run condition to the stage at `position`.
    pub fn set_condition(
        &mut self,
        position: usize,
        condition: RunCondition<C::Element>,
    ) -> Result<(), PipelineError> {
        if self.canonical.set_condition(position, Some(condition)) {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "cannot set run condition for stage {}: pipeline has {} stages",
                position,
                self.canonical.len()
            )))
        }
    }

    pub fn clear_conditions(&mut self) {
        self.canonical.clear_conditions();
    }

    pub fn binding(&self, position: usize) -> Option<StageBinding<C::Element>> {
        self.canonical.binding(position).cloned()
    }

    pub fn condition(&self, position: usize) -> Option<&RunCondition<C::Element>> {
        self.canonical.condition(position)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.canonical
            .stages()
            .iter()
            .map(|slot| slot.name().to_string())
            .collect()
    }

    pub fn stage_count(&self) -> usize {
        self.canonical.len()
    }

    /// Clean up and drop every canonical stage.
    pub fn cleanup(&mut self) {
        let released = std::mem::take(&mut self.canonical).dispose();
        debug!(stages = released.len(), "Controller cleaned up");
    }

    // --- Episodes ---

    /// Run every stage over every element (or over the target element).
    ///
    /// Returns a summary, or the first failure when `fail_fast` is set, or
    /// `Interrupted` when the interrupt handle fired before all elements were
    /// processed.
    pub async fn run_episode(&mut self) -> Result<EpisodeSummary, PipelineError> {
        let collection = self
            .collection
            .clone()
            .ok_or(PipelineError::MissingCollection)?;
        let access = Arc::new(CollectionAccess::new(
            collection,
            self.config.synchronize_collection_access,
        ));
        let runtime = self.runtime()?;
        let cancel = self.interrupt.begin();

        let result = if self.config.parallelism <= 1 || self.target.is_some() {
            self.run_sequential(access, runtime, cancel).await
        } else {
            self.run_parallel(access, runtime, cancel).await
        };

        self.interrupt.finish();
        match &result {
            Ok(summary) => info!(
                processed = summary.elements_processed,
                failed = summary.elements_failed,
                skipped_stages = summary.stages_skipped,
                "Episode finished"
            ),
            Err(e) if e.is_interrupted() => info!("Episode interrupted"),
            Err(e) => error!("Episode failed: {}", e),
        }
        result
    }

    fn runtime(&self) -> Result<Handle, PipelineError> {
        match &self.worker_pool {
            Some(pool) => Ok(pool.handle().clone()),
            None => Handle::try_current()
                .map_err(|e| PipelineError::WorkerPool(std::io::Error::other(e))),
        }
    }

    async fn run_sequential(
        &mut self,
        access: Arc<CollectionAccess<C>>,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Result<EpisodeSummary, PipelineError> {
        let indices: Vec<usize> = match self.target {
            Some(target) => vec![target],
            None => (0..access.len()).collect(),
        };
        let mut summary = EpisodeSummary::new(ExecutionMode::Sequential, 1, indices.len());
        let fail_fast = self.config.fail_fast;
        info!(
            elements = indices.len(),
            stages = self.canonical.len(),
            "Starting sequential episode"
        );

        let mut lane = std::mem::take(&mut self.canonical);
        let joined = runtime
            .spawn_blocking(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    process_in_order(&mut lane, &access, &indices, fail_fast, &cancel, &mut summary)
                }));
                (lane, summary, outcome)
            })
            .await;

        match joined {
            Ok((lane, summary, outcome)) => {
                self.canonical = lane;
                match outcome {
                    Ok(Ok(())) => Ok(summary),
                    Ok(Err(e)) => Err(e),
                    Err(payload) => Err(PipelineError::TaskPanicked(panic_message(&payload))),
                }
            }
            Err(e) => {
                error!("Canonical lane lost: sequential worker did not return: {}", e);
                Err(PipelineError::TaskPanicked(e.to_string()))
            }
        }
    }

    async fn run_parallel(
        &mut self,
        access: Arc<CollectionAccess<C>>,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Result<EpisodeSummary, PipelineError> {
        let parallelism = self.config.parallelism;
        let duplicates = StageSetDuplicator::build(&self.canonical, parallelism)?;

        let canonical_id = self.canonical.id();
        let stages = self.canonical.len();
        let mut lanes = Vec::with_capacity(parallelism);
        lanes.push(std::mem::take(&mut self.canonical));
        lanes.extend(duplicates);
        let pool = Arc::new(LanePool::new(lanes));

        let total = access.len();
        let mut summary = EpisodeSummary::new(ExecutionMode::Parallel, parallelism, total);
        info!(
            elements = total,
            lanes = parallelism,
            stages,
            "Starting parallel episode"
        );

        // Fail-fast aborts through this child token so the controller's own
        // token only reflects real interrupts.
        let episode = cancel.child_token();
        let dispatcher = TaskDispatcher::with_handle(parallelism, runtime.clone());
        self.interrupt.attach(&dispatcher);

        let tally = Arc::new(Tally::default());
        let source = element_tasks(
            Arc::clone(&access),
            Arc::clone(&pool),
            episode.clone(),
            Arc::clone(&tally),
            self.config.ordered_loading,
        );
        // Producing the first tasks may load elements.
        let submitter = dispatcher.clone();
        let submitted = runtime
            .spawn_blocking(move || submitter.submit(source))
            .await
            .map_err(|e| PipelineError::TaskPanicked(e.to_string()));
        if let Err(e) = &submitted {
            error!("Failed to submit element tasks: {}", e);
            dispatcher.interrupt();
            episode.cancel();
        }

        let drained = drive(&dispatcher, &episode, self.config.fail_fast, &mut summary).await;
        let outcome = submitted.and(drained);

        match StageSetDuplicator::teardown(pool.drain(), canonical_id) {
            Some(lane) => self.canonical = lane,
            None => error!("Canonical lane {} was not returned to the pool", canonical_id),
        }

        outcome?;
        summary.elements_processed = tally.processed.load(Ordering::SeqCst);
        summary.stages_skipped = tally.stages_skipped.load(Ordering::SeqCst);
        if cancel.is_cancelled()
            && summary.elements_processed + summary.elements_failed < summary.elements_total
        {
            return Err(PipelineError::Interrupted);
        }
        Ok(summary)
    }
}

// --- Element processing ---

#[derive(Default)]
struct Tally {
    processed: AtomicUsize,
    stages_skipped: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: LaneOutcome) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.stages_skipped
            .fetch_add(outcome.stages_skipped, Ordering::SeqCst);
    }
}

/// One task per element index, in ascending order.
///
/// With `ordered_loading` the element is acquired while its task is produced.
/// The dispatcher produces tasks under its ledger lock, so loads happen in
/// index order.
fn element_tasks<C: Collection>(
    access: Arc<CollectionAccess<C>>,
    pool: Arc<LanePool<C::Element>>,
    episode: CancellationToken,
    tally: Arc<Tally>,
    ordered_loading: bool,
) -> TaskSource {
    let total = access.len();
    Box::new((0..total).map(move |index| -> Result<Task, PipelineError> {
        let preloaded: Option<ElementLease<C>> = if ordered_loading {
            Some(access.acquire(index)?)
        } else {
            None
        };
        let access = Arc::clone(&access);
        let pool = Arc::clone(&pool);
        let episode = episode.clone();
        let tally = Arc::clone(&tally);

        let task: Task = Box::new(move || {
            if episode.is_cancelled() {
                return Err(PipelineError::Interrupted);
            }
            let element = match preloaded {
                Some(lease) => lease,
                None => access.acquire(index)?,
            };
            let mut lane = pool.checkout(&episode)?;
            debug!(index, lane = %lane.id(), "Processing element");
            let outcome = process_element(&mut lane, element.element(), index, &episode);
            // Lane goes back before the element is unloaded.
            drop(lane);
            drop(element);
            tally.record(outcome?);
            Ok(())
        });
        Ok(task)
    }))
}

/// Walk every element in `indices` through the canonical lane.
fn process_in_order<C: Collection>(
    lane: &mut Lane<C::Element>,
    access: &Arc<CollectionAccess<C>>,
    indices: &[usize],
    fail_fast: bool,
    cancel: &CancellationToken,
    summary: &mut EpisodeSummary,
) -> Result<(), PipelineError> {
    for &index in indices {
        if cancel.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        let result = access
            .acquire(index)
            .and_then(|lease| process_element(lane, lease.element(), index, cancel));
        match result {
            Ok(outcome) => {
                summary.elements_processed += 1;
                summary.stages_skipped += outcome.stages_skipped;
            }
            Err(e) if e.is_interrupted() || fail_fast => return Err(e),
            Err(e) => record_failure(summary, e),
        }
    }
    Ok(())
}

/// Run one element through `lane`, front to back.
///
/// Every stage of the lane is bound to the element for the whole walk, so
/// run conditions can read it. A failing stage ends the walk for this element
/// only; the lane stays usable.
fn process_element<E>(
    lane: &mut Lane<E>,
    element: &Arc<E>,
    element_index: usize,
    cancel: &CancellationToken,
) -> Result<LaneOutcome, PipelineError> {
    lane.slots_mut().for_each(|(_, slot, _)| slot.bind(element));
    let result = walk_lane(lane, element, element_index, cancel);
    lane.slots_mut().for_each(|(_, slot, _)| slot.unbind());
    result
}

fn walk_lane<E>(
    lane: &mut Lane<E>,
    element: &Arc<E>,
    element_index: usize,
    cancel: &CancellationToken,
) -> Result<LaneOutcome, PipelineError> {
    let ctx = StageContext {
        element,
        element_index,
        cancel,
    };
    let mut outcome = LaneOutcome::default();
    for (stage_index, slot, condition) in lane.slots_mut() {
        if cancel.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        if condition.map_or(true, RunCondition::should_run) {
            run_stage(element_index, stage_index, slot, &ctx)?;
            outcome.stages_run += 1;
        } else {
            debug!(element_index, stage_index, stage = slot.name(), "Skipping stage");
            outcome.stages_skipped += 1;
        }
    }
    Ok(outcome)
}

/// Execute one stage. The only place a stage failure gets its element and
/// stage context attached.
pub(crate) fn run_stage<E>(
    element_index: usize,
    stage_index: usize,
    slot: &mut StageSlot<E>,
    ctx: &StageContext<'_, E>,
) -> Result<(), PipelineError> {
    slot.execute(ctx)
        .map_err(|source| PipelineError::StageExecution {
            element_index,
            stage_index,
            stage: slot.name().to_string(),
            source,
        })
}

fn record_failure(summary: &mut EpisodeSummary, e: PipelineError) {
    warn!("Warning: {}", e);
    summary.elements_failed += 1;
    summary.failures.push(e.to_string());
}

/// Wait for the dispatcher to drain, applying the error policy to every
/// failure it reports.
///
/// With `fail_fast` the first failure interrupts the dispatcher and cancels
/// the episode; later failures are only logged and the first one is returned
/// once every running task has finished.
async fn drive(
    dispatcher: &TaskDispatcher,
    episode: &CancellationToken,
    fail_fast: bool,
    summary: &mut EpisodeSummary,
) -> Result<(), PipelineError> {
    let mut first_failure: Option<PipelineError> = None;
    loop {
        match dispatcher.await_completed().await {
            Ok(()) => {
                if dispatcher.has_completed() {
                    break;
                }
            }
            Err(e) if e.is_interrupted() => debug!("Task stopped: {}", e),
            Err(e) if first_failure.is_some() => warn!("Further failure while draining: {}", e),
            Err(e) if fail_fast => {
                error!("Aborting episode: {}", e);
                dispatcher.interrupt();
                episode.cancel();
                first_failure = Some(e);
            }
            Err(e) => record_failure(summary, e),
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
