use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::types::StageId;

/// Everything a stage sees while it executes on one element.
pub struct StageContext<'a, E> {
    pub element: &'a Arc<E>,
    pub element_index: usize,
    /// Cancelled when the controller is interrupted or a fail-fast episode is
    /// aborting. Long-running stages should check it between units of work.
    pub cancel: &'a CancellationToken,
}

/// Trait for one unit of work in the pipeline. Enables duplication across lanes.
///
/// A stage is stateful: it is executed on one element at a time, and the
/// controller gives every lane its own instance produced by `duplicate()`.
pub trait Stage<E>: Send {
    /// Human-readable stage name for logging and error context.
    fn name(&self) -> &str;

    /// Called once after the stage is added to a controller or duplicated.
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process the current element.
    fn execute(&mut self, ctx: &StageContext<'_, E>) -> anyhow::Result<()>;

    /// Produce an independent copy that shares no mutable state with `self`.
    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<E>>>;

    /// Called before the element walks the lane this stage belongs to.
    fn bind(&mut self, _element: &Arc<E>) {}

    /// Called once the element has left the lane, whether it succeeded or not.
    fn unbind(&mut self) {}

    /// Release resources. Called when a duplicated lane is torn down or the
    /// controller is cleaned up.
    fn cleanup(&mut self) {}
}

// --- StageBinding ---

/// Read handle on the element currently bound to one stage instance.
///
/// Run conditions hold a binding rather than the stage itself, so a condition
/// can read the element of the lane it belongs to while the lane owns the stage.
pub struct StageBinding<E> {
    id: StageId,
    current: Arc<RwLock<Option<Arc<E>>>>,
}

impl<E> Clone for StageBinding<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            current: Arc::clone(&self.current),
        }
    }
}

impl<E> fmt::Debug for StageBinding<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageBinding")
            .field("id", &self.id)
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl<E> StageBinding<E> {
    fn new() -> Self {
        Self {
            id: StageId::next(),
            current: Arc::new(RwLock::new(None)),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    /// The element the stage is currently processing, if any.
    pub fn current(&self) -> Option<Arc<E>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_bound(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn set(&self, element: Option<Arc<E>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = element;
    }
}

// --- StageSlot ---

/// A stage instance together with its identity and element binding.
pub struct StageSlot<E> {
    stage: Box<dyn Stage<E>>,
    binding: StageBinding<E>,
}

impl<E> fmt::Debug for StageSlot<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSlot")
            .field("name", &self.stage.name())
            .field("id", &self.binding.id)
            .finish()
    }
}

impl<E> StageSlot<E> {
    pub fn new(stage: Box<dyn Stage<E>>) -> Self {
        Self {
            stage,
            binding: StageBinding::new(),
        }
    }

    pub fn id(&self) -> StageId {
        self.binding.id
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn binding(&self) -> &StageBinding<E> {
        &self.binding
    }

    pub(crate) fn init(&mut self) -> Result<(), PipelineError> {
        self.stage.init().map_err(|source| PipelineError::StageInit {
            stage: self.stage.name().to_string(),
            source,
        })
    }

    /// Duplicate the stage into a fresh slot with its own identity, and
    /// initialise the copy.
    pub(crate) fn duplicate(&self, stage_index: usize) -> Result<StageSlot<E>, PipelineError> {
        let stage = self
            .stage
            .duplicate()
            .map_err(|source| PipelineError::StageDuplication {
                stage_index,
                stage: self.stage.name().to_string(),
                source,
            })?;
        let mut slot = StageSlot::new(stage);
        slot.init()?;
        Ok(slot)
    }

    pub(crate) fn bind(&mut self, element: &Arc<E>) {
        self.binding.set(Some(Arc::clone(element)));
        self.stage.bind(element);
    }

    pub(crate) fn unbind(&mut self) {
        self.stage.unbind();
        self.binding.set(None);
    }

    pub(crate) fn execute(&mut self, ctx: &StageContext<'_, E>) -> anyhow::Result<()> {
        self.stage.execute(ctx)
    }

    pub(crate) fn cleanup(&mut self) {
        self.binding.set(None);
        self.stage.cleanup();
    }

    pub fn into_stage(self) -> Box<dyn Stage<E>> {
        self.stage
    }
}
