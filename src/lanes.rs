//! Lanes, their duplication, and the pool tasks check them out of.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::condition::RunCondition;
use crate::error::PipelineError;
use crate::stage::{Stage, StageBinding, StageSlot};
use crate::types::{LaneId, StageId};

// --- Lane ---

/// One full copy of the stage chain, with its row of the run-condition table.
///
/// `conditions[i]` governs `stages[i]`; `None` means the stage always runs.
pub struct Lane<E> {
    id: LaneId,
    stages: Vec<StageSlot<E>>,
    conditions: Vec<Option<RunCondition<E>>>,
}

impl<E> fmt::Debug for Lane<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lane")
            .field("id", &self.id)
            .field("stages", &self.stages)
            .field("conditions", &self.conditions)
            .finish()
    }
}

impl<E> Default for Lane<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Lane<E> {
    pub fn new() -> Self {
        Self {
            id: LaneId::next(),
            stages: Vec::new(),
            conditions: Vec::new(),
        }
    }

    pub fn id(&self) -> LaneId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[StageSlot<E>] {
        &self.stages
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(StageSlot::id).collect()
    }

    pub fn binding(&self, position: usize) -> Option<&StageBinding<E>> {
        self.stages.get(position).map(StageSlot::binding)
    }

    pub fn condition(&self, position: usize) -> Option<&RunCondition<E>> {
        self.conditions.get(position).and_then(Option::as_ref)
    }

    pub fn has_conditions(&self) -> bool {
        self.conditions.iter().any(Option::is_some)
    }

    pub fn push(&mut self, slot: StageSlot<E>) {
        self.insert(self.stages.len(), slot);
    }

    /// Insert a stage at `position` with no run condition.
    pub fn insert(&mut self, position: usize, slot: StageSlot<E>) {
        self.stages.insert(position, slot);
        self.conditions.insert(position, None);
    }

    /// # Panics
    ///
    /// Panics if `position` is out of bounds.
    pub fn remove(&mut self, position: usize) -> (StageSlot<E>, Option<RunCondition<E>>) {
        (self.stages.remove(position), self.conditions.remove(position))
    }

    /// Returns false, leaving the lane untouched, if there is no stage at `position`.
    pub fn set_condition(&mut self, position: usize, condition: Option<RunCondition<E>>) -> bool {
        match self.conditions.get_mut(position) {
            Some(slot) => {
                *slot = condition;
                true
            }
            None => false,
        }
    }

    pub fn clear_conditions(&mut self) {
        self.conditions.iter_mut().for_each(|c| *c = None);
    }

    pub(crate) fn slots_mut(
        &mut self,
    ) -> impl Iterator<Item = (usize, &mut StageSlot<E>, Option<&RunCondition<E>>)> {
        self.stages
            .iter_mut()
            .zip(self.conditions.iter())
            .enumerate()
            .map(|(position, (slot, condition))| (position, slot, condition.as_ref()))
    }

    /// Clean up every stage and hand them back in pipeline order.
    pub fn dispose(mut self) -> Vec<Box<dyn Stage<E>>> {
        self.stages.iter_mut().for_each(StageSlot::cleanup);
        self.stages.into_iter().map(StageSlot::into_stage).collect()
    }
}

// --- StageSetDuplicator ---

/// Builds duplicated lanes from a canonical lane and tears them down again.
pub struct StageSetDuplicator;

impl StageSetDuplicator {
    /// Produce the `parallelism - 1` duplicates of `canonical`.
    ///
    /// The canonical lane itself is lane 0 and is not touched. Every stage is
    /// duplicated and initialised; when the canonical lane carries run
    /// conditions, lane L's condition for position i is duplicated from the
    /// canonical condition for position i against lane L's stage at i.
    ///
    /// On failure, whatever was already duplicated is cleaned up.
    pub fn build<E>(canonical: &Lane<E>, parallelism: usize) -> Result<Vec<Lane<E>>, PipelineError> {
        let mut duplicates = Vec::with_capacity(parallelism.saturating_sub(1));
        for _ in 1..parallelism {
            match Self::duplicate_lane(canonical) {
                Ok(lane) => duplicates.push(lane),
                Err(e) => {
                    duplicates.into_iter().for_each(|lane: Lane<E>| {
                        lane.dispose();
                    });
                    return Err(e);
                }
            }
        }
        debug!(
            canonical = %canonical.id,
            duplicates = duplicates.len(),
            stages = canonical.len(),
            "Built duplicated lanes"
        );
        Ok(duplicates)
    }

    fn duplicate_lane<E>(canonical: &Lane<E>) -> Result<Lane<E>, PipelineError> {
        let mut lane = Lane::new();
        for (position, (slot, condition)) in canonical
            .stages
            .iter()
            .zip(canonical.conditions.iter())
            .enumerate()
        {
            let copy = match slot.duplicate(position) {
                Ok(copy) => copy,
                Err(e) => {
                    lane.dispose();
                    return Err(e);
                }
            };
            let copied_condition = match condition.as_ref().map(|c| c.duplicate(copy.binding())) {
                Some(Err(e)) => {
                    lane.stages.push(copy);
                    lane.conditions.push(None);
                    lane.dispose();
                    return Err(e);
                }
                Some(Ok(c)) => Some(c),
                None => None,
            };
            lane.stages.push(copy);
            lane.conditions.push(copied_condition);
        }
        Ok(lane)
    }

    /// Release every lane except the one whose identity is `canonical`, which
    /// is returned untouched. Works on any mix of canonical and duplicated lanes.
    pub fn teardown<E>(lanes: Vec<Lane<E>>, canonical: LaneId) -> Option<Lane<E>> {
        let mut kept = None;
        let mut released = 0;
        for lane in lanes {
            if lane.id == canonical {
                kept = Some(lane);
            } else {
                lane.dispose();
                released += 1;
            }
        }
        debug!(%canonical, released, "Tore down duplicated lanes");
        kept
    }
}

// --- LanePool ---

/// The set of all lanes of one episode, with exclusive checkout.
///
/// `checked_out + available == size` at every instant.
pub struct LanePool<E> {
    available: Mutex<VecDeque<Lane<E>>>,
    returned: Condvar,
    size: usize,
}

impl<E> LanePool<E> {
    pub fn new(lanes: Vec<Lane<E>>) -> Self {
        let size = lanes.len();
        Self {
            available: Mutex::new(lanes.into()),
            returned: Condvar::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    pub fn checked_out(&self) -> usize {
        self.size - self.available()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Lane<E>>> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out the next free lane, FIFO, waiting for a return if none is free.
    ///
    /// Fails with `Interrupted` if `cancel` fires while waiting, and with
    /// `LaneUnavailable` for a pool that has no lanes at all.
    pub fn checkout(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<LaneLease<E>, PipelineError> {
        if self.size == 0 {
            return Err(PipelineError::LaneUnavailable("lane pool is empty".to_string()));
        }
        let mut available = self.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Interrupted);
            }
            if let Some(lane) = available.pop_front() {
                return Ok(LaneLease {
                    pool: Arc::clone(self),
                    lane,
                });
            }
            // Bounded wait so cancellation is noticed without a notifier.
            let (guard, _) = self
                .returned
                .wait_timeout(available, std::time::Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            available = guard;
        }
    }

    fn give_back(&self, lane: Lane<E>) {
        self.lock().push_back(lane);
        self.returned.notify_one();
    }

    /// Take every lane out of the pool for teardown. Lanes still checked out
    /// are reported and lost to the caller.
    pub fn drain(&self) -> Vec<Lane<E>> {
        let lanes: Vec<Lane<E>> = self.lock().drain(..).collect();
        if lanes.len() != self.size {
            error!(
                "Lane pool drained with {} of {} lanes checked out",
                self.size - lanes.len(),
                self.size
            );
        }
        lanes
    }
}

/// A lane checked out of a pool. Returns the lane on drop.
#[must_use = "the lane is returned when LaneLease is dropped"]
pub struct LaneLease<E> {
    pool: Arc<LanePool<E>>,
    lane: Lane<E>,
}

impl<E> Deref for LaneLease<E> {
    type Target = Lane<E>;

    fn deref(&self) -> &Lane<E> {
        &self.lane
    }
}

impl<E> DerefMut for LaneLease<E> {
    fn deref_mut(&mut self) -> &mut Lane<E> {
        &mut self.lane
    }
}

impl<E> Drop for LaneLease<E> {
    fn drop(&mut self) {
        let lane = std::mem::take(&mut self.lane);
        self.pool.give_back(lane);
    }
}
