/// Error enum for every failure an episode can produce.
///
/// Categories:
/// - Fatal: the episode never starts or cannot continue (missing collection,
///   duplication failures, broken configuration, lost lanes)
/// - Per-element: a stage or the element lifecycle failed for one element;
///   the controller's `fail_fast` policy decides whether the episode stops
/// - Interrupted: cooperative cancellation was observed
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // Fatal
    #[error("No collection set: an episode needs a collection to process")]
    MissingCollection,

    #[error("Cannot duplicate run condition '{0}': no duplication rule for it")]
    UnsupportedCombinator(String),

    #[error("Failed to duplicate stage {stage_index} ({stage}): {source}")]
    StageDuplication {
        stage_index: usize,
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to initialise stage '{stage}': {source}")]
    StageInit {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("No lane available: {0}")]
    LaneUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(#[source] std::io::Error),

    // Per-element
    #[error("Stage {stage_index} ({stage}) failed on element {element_index}: {source}")]
    StageExecution {
        element_index: usize,
        stage_index: usize,
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to load element {index}: {source}")]
    ElementLoad {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to unload element {index}: {source}")]
    ElementUnload {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task source failed to produce its next task: {0}")]
    TaskSourceProduction(#[source] Box<PipelineError>),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    // Cancellation
    #[error("Interrupted before the episode completed")]
    Interrupted,
}

impl PipelineError {
    /// Returns true if the error prevents an episode from starting or continuing,
    /// regardless of the `fail_fast` policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingCollection
                | PipelineError::UnsupportedCombinator(_)
                | PipelineError::StageDuplication { .. }
                | PipelineError::StageInit { .. }
                | PipelineError::LaneUnavailable(_)
                | PipelineError::Config(_)
                | PipelineError::WorkerPool(_)
        )
    }

    /// Returns true if the error is cooperative cancellation rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        match self {
            PipelineError::Interrupted => true,
            PipelineError::TaskSourceProduction(inner) => inner.is_interrupted(),
            _ => false,
        }
    }

    /// The collection index of the element the error belongs to, if any.
    pub fn element_index(&self) -> Option<usize> {
        match self {
            PipelineError::StageExecution { element_index, .. } => Some(*element_index),
            PipelineError::ElementLoad { index, .. } | PipelineError::ElementUnload { index, .. } => {
                Some(*index)
            }
            PipelineError::TaskSourceProduction(inner) => inner.element_index(),
            _ => None,
        }
    }

    /// The pipeline position of the stage the error belongs to, if any.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            PipelineError::StageExecution { stage_index, .. }
            | PipelineError::StageDuplication { stage_index, .. } => Some(*stage_index),
            PipelineError::TaskSourceProduction(inner) => inner.stage_index(),
            _ => None,
        }
    }
}
