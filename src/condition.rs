//! Per-stage run conditions and their duplication across lanes.
//!
//! A condition is a closed tree: `Always`, `Never`, element-reading `Leaf`s,
//! and the `And`/`Or`/`Not` combinators. `Custom` lets callers plug in their own
//! predicate; such a condition can only be duplicated if it says how.

use std::fmt;
use std::sync::Arc;

use crate::collection::HasFeatures;
use crate::error::PipelineError;
use crate::stage::StageBinding;
use crate::types::{RunMode, StageId};

/// Caller-supplied condition outside the built-in algebra.
pub trait CustomCondition<E>: Send + Sync {
    fn name(&self) -> &str;

    fn should_run(&self) -> bool;

    fn run_mode(&self) -> RunMode {
        RunMode::Conditional
    }

    /// Rebind this condition to another stage instance. `None` means the
    /// condition cannot be duplicated, which fails the parallel episode.
    fn duplicate_for(&self, _stage: &StageBinding<E>) -> Option<RunCondition<E>> {
        None
    }
}

// --- Leaf ---

/// A predicate over the element currently bound to one stage.
pub struct LeafCondition<E> {
    label: String,
    binding: StageBinding<E>,
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> LeafCondition<E> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stage_id(&self) -> StageId {
        self.binding.id()
    }

    /// An unbound stage has no element to test, so the stage does not run.
    pub fn should_run(&self) -> bool {
        match self.binding.current() {
            Some(element) => (self.predicate)(&element),
            None => false,
        }
    }

    fn rebind(&self, stage: &StageBinding<E>) -> LeafCondition<E> {
        LeafCondition {
            label: self.label.clone(),
            binding: stage.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<E> Clone for LeafCondition<E> {
    fn clone(&self) -> Self {
        self.rebind(&self.binding)
    }
}

// --- RunCondition ---

/// Decides whether a stage executes for the element it is bound to.
pub enum RunCondition<E> {
    Always,
    Never,
    Leaf(LeafCondition<E>),
    And(Vec<RunCondition<E>>),
    Or(Vec<RunCondition<E>>),
    Not(Box<RunCondition<E>>),
    Custom(Arc<dyn CustomCondition<E>>),
}

impl<E> RunCondition<E> {
    pub fn and(conditions: Vec<RunCondition<E>>) -> Self {
        RunCondition::And(conditions)
    }

    pub fn or(conditions: Vec<RunCondition<E>>) -> Self {
        RunCondition::Or(conditions)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: RunCondition<E>) -> Self {
        RunCondition::Not(Box::new(condition))
    }

    /// A leaf that tests the element bound to `stage` with `predicate`.
    pub fn when(
        stage: &StageBinding<E>,
        label: impl Into<String>,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        RunCondition::Leaf(LeafCondition {
            label: label.into(),
            binding: stage.clone(),
            predicate: Arc::new(predicate),
        })
    }

    pub fn custom(condition: impl CustomCondition<E> + 'static) -> Self {
        RunCondition::Custom(Arc::new(condition))
    }

    pub fn should_run(&self) -> bool {
        match self {
            RunCondition::Always => true,
            RunCondition::Never => false,
            RunCondition::Leaf(leaf) => leaf.should_run(),
            RunCondition::And(children) => children.iter().all(RunCondition::should_run),
            RunCondition::Or(children) => children.iter().any(RunCondition::should_run),
            RunCondition::Not(child) => !child.should_run(),
            RunCondition::Custom(custom) => custom.should_run(),
        }
    }

    pub fn run_mode(&self) -> RunMode {
        match self {
            RunCondition::Always => RunMode::Always,
            RunCondition::Never => RunMode::Never,
            RunCondition::Leaf(_) | RunCondition::And(_) | RunCondition::Or(_) => {
                RunMode::Conditional
            }
            RunCondition::Not(child) => child.run_mode().negate(),
            RunCondition::Custom(custom) => custom.run_mode(),
        }
    }

    /// The stage instance this condition reads from: the leaf's stage, or the
    /// first bound child of a combinator.
    pub fn stage_id(&self) -> Option<StageId> {
        match self {
            RunCondition::Always | RunCondition::Never | RunCondition::Custom(_) => None,
            RunCondition::Leaf(leaf) => Some(leaf.stage_id()),
            RunCondition::And(children) | RunCondition::Or(children) => {
                children.iter().find_map(RunCondition::stage_id)
            }
            RunCondition::Not(child) => child.stage_id(),
        }
    }

    /// Produce an equivalent condition bound to `stage`.
    ///
    /// Combinators keep their type and duplicate every child; `Always`/`Never`
    /// carry their value; leaves read from `stage` afterwards.
    pub fn duplicate(&self, stage: &StageBinding<E>) -> Result<RunCondition<E>, PipelineError> {
        Ok(match self {
            RunCondition::Always => RunCondition::Always,
            RunCondition::Never => RunCondition::Never,
            RunCondition::Leaf(leaf) => RunCondition::Leaf(leaf.rebind(stage)),
            RunCondition::And(children) => RunCondition::And(duplicate_all(children, stage)?),
            RunCondition::Or(children) => RunCondition::Or(duplicate_all(children, stage)?),
            RunCondition::Not(child) => RunCondition::Not(Box::new(child.duplicate(stage)?)),
            RunCondition::Custom(custom) => custom
                .duplicate_for(stage)
                .ok_or_else(|| PipelineError::UnsupportedCombinator(custom.name().to_string()))?,
        })
    }
}

impl<E: HasFeatures> RunCondition<E> {
    /// Run the stage only when the bound element's feature `key` equals `value`.
    pub fn feature_equals(
        stage: &StageBinding<E>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let value = value.into();
        let label = format!("{}={}", key, value);
        RunCondition::when(stage, label, move |element: &E| {
            element.feature(&key).as_deref() == Some(value.as_str())
        })
    }
}

fn duplicate_all<E>(
    children: &[RunCondition<E>],
    stage: &StageBinding<E>,
) -> Result<Vec<RunCondition<E>>, PipelineError> {
    children.iter().map(|child| child.duplicate(stage)).collect()
}

impl<E> Clone for RunCondition<E> {
    fn clone(&self) -> Self {
        match self {
            RunCondition::Always => RunCondition::Always,
            RunCondition::Never => RunCondition::Never,
            RunCondition::Leaf(leaf) => RunCondition::Leaf(leaf.clone()),
            RunCondition::And(children) => RunCondition::And(children.clone()),
            RunCondition::Or(children) => RunCondition::Or(children.clone()),
            RunCondition::Not(child) => RunCondition::Not(child.clone()),
            RunCondition::Custom(custom) => RunCondition::Custom(Arc::clone(custom)),
        }
    }
}

impl<E> fmt::Display for RunCondition<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<E>(
            f: &mut fmt::Formatter<'_>,
            op: &str,
            children: &[RunCondition<E>],
        ) -> fmt::Result {
            write!(f, "{}(", op)?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", child)?;
            }
            write!(f, ")")
        }

        match self {
            RunCondition::Always => write!(f, "always"),
            RunCondition::Never => write!(f, "never"),
            RunCondition::Leaf(leaf) => write!(f, "{}", leaf.label),
            RunCondition::And(children) => join(f, "and", children),
            RunCondition::Or(children) => join(f, "or", children),
            RunCondition::Not(child) => write!(f, "not({})", child),
            RunCondition::Custom(custom) => write!(f, "{}", custom.name()),
        }
    }
}

impl<E> fmt::Debug for RunCondition<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunCondition({})", self)
    }
}
