use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// --- Enums ---

/// How a run condition behaves independent of the current element.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Always,
    Never,
    Conditional,
}

impl RunMode {
    /// NOT applied to a run mode: ALWAYS and NEVER swap, everything else
    /// stays conditional.
    pub fn negate(self) -> RunMode {
        match self {
            RunMode::Always => RunMode::Never,
            RunMode::Never => RunMode::Always,
            RunMode::Conditional => RunMode::Conditional,
        }
    }
}

/// Whether an episode ran element by element or across duplicated lanes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Lifecycle of a task dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    /// Nothing submitted yet.
    Idle,
    /// Sources still have tasks to produce.
    Running,
    /// No more tasks will start, but some are still in flight.
    Draining,
    /// All submitted work finished.
    Completed,
    /// Interrupted and every in-flight task has returned.
    Interrupted,
}

// --- Identity keys ---

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LANE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one stage instance. Two duplicates of the same stage never share an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u64);

impl StageId {
    pub(crate) fn next() -> Self {
        StageId(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Identity of one lane (one full copy of the stage chain).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LaneId(u64);

impl LaneId {
    pub(crate) fn next() -> Self {
        LaneId(NEXT_LANE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane#{}", self.0)
    }
}

// --- Results ---

/// What happened to one element as it walked a lane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneOutcome {
    pub stages_run: usize,
    pub stages_skipped: usize,
}

/// Result of one episode, returned to the caller for summary display.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct EpisodeSummary {
    pub mode: ExecutionMode,
    pub parallelism: usize,
    pub elements_total: usize,
    pub elements_processed: usize,
    pub elements_failed: usize,
    pub stages_skipped: usize,
    /// Display messages of per-element failures that did not stop the episode.
    pub failures: Vec<String>,
}

impl EpisodeSummary {
    pub fn new(mode: ExecutionMode, parallelism: usize, elements_total: usize) -> Self {
        Self {
            mode,
            parallelism,
            elements_total,
            elements_processed: 0,
            elements_failed: 0,
            stages_skipped: 0,
            failures: Vec::new(),
        }
    }
}
