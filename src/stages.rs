//! Built-in stages and their construction from config entries.

use anyhow::bail;
use tracing::debug;

use crate::collection::{Collection, HasFeatures};
use crate::condition::RunCondition;
use crate::config::{ConditionConfig, StageConfig, StageKind};
use crate::controller::ParallelController;
use crate::error::PipelineError;
use crate::stage::{Stage, StageBinding, StageContext};

pub const DEFAULT_ID_FEATURE: &str = "_id";

// --- FeatureSetValue ---

/// Sets a fixed feature on every element it runs on.
#[derive(Clone, Debug)]
pub struct FeatureSetValue {
    name: String,
    key: String,
    value: String,
}

impl FeatureSetValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: "feature_set_value".to_string(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<E: HasFeatures> Stage<E> for FeatureSetValue {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> anyhow::Result<()> {
        if self.key.is_empty() {
            bail!("feature key must not be empty");
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &StageContext<'_, E>) -> anyhow::Result<()> {
        ctx.element.set_feature(&self.key, &self.value);
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<E>>> {
        Ok(Box::new(self.clone()))
    }
}

// --- IdAsFeature ---

/// Stores the element's collection index as a feature, `_id` by default.
#[derive(Clone, Debug)]
pub struct IdAsFeature {
    name: String,
    key: String,
}

impl Default for IdAsFeature {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FEATURE)
    }
}

impl IdAsFeature {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            name: "id_as_feature".to_string(),
            key: key.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<E: HasFeatures> Stage<E> for IdAsFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, ctx: &StageContext<'_, E>) -> anyhow::Result<()> {
        ctx.element
            .set_feature(&self.key, &ctx.element_index.to_string());
        Ok(())
    }

    fn duplicate(&self) -> anyhow::Result<Box<dyn Stage<E>>> {
        Ok(Box::new(self.clone()))
    }
}

// --- Construction from config ---

pub fn build_stage<E: HasFeatures + 'static>(
    config: &StageConfig,
) -> Result<Box<dyn Stage<E>>, PipelineError> {
    let name = config.display_name();
    match config.kind {
        StageKind::FeatureSetValue => {
            let (Some(key), Some(value)) = (&config.key, &config.value) else {
                return Err(PipelineError::Config(format!(
                    "stage '{}': feature_set_value needs both key and value",
                    name
                )));
            };
            Ok(Box::new(FeatureSetValue::new(key, value).named(name)))
        }
        StageKind::IdAsFeature => {
            let key = config.key.as_deref().unwrap_or(DEFAULT_ID_FEATURE);
            Ok(Box::new(IdAsFeature::new(key).named(name)))
        }
    }
}

/// Build a run condition whose leaves read the element bound to `stage`.
pub fn build_condition<E: HasFeatures>(
    config: &ConditionConfig,
    stage: &StageBinding<E>,
) -> RunCondition<E> {
    match config {
        ConditionConfig::Always => RunCondition::Always,
        ConditionConfig::Never => RunCondition::Never,
        ConditionConfig::FeatureEquals { key, value } => {
            RunCondition::feature_equals(stage, key.clone(), value.clone())
        }
        ConditionConfig::And { conditions } => RunCondition::and(
            conditions
                .iter()
                .map(|c| build_condition(c, stage))
                .collect(),
        ),
        ConditionConfig::Or { conditions } => RunCondition::or(
            conditions
                .iter()
                .map(|c| build_condition(c, stage))
                .collect(),
        ),
        ConditionConfig::Not { condition } => RunCondition::not(build_condition(condition, stage)),
    }
}

/// Append every configured stage, with its run condition, to `controller`.
pub fn install_stages<C>(
    controller: &mut ParallelController<C>,
    stages: &[StageConfig],
) -> Result<(), PipelineError>
where
    C: Collection,
    C::Element: HasFeatures,
{
    for config in stages {
        let binding = controller.add_stage(build_stage(config)?)?;
        if let Some(condition) = &config.condition {
            let condition = build_condition(condition, &binding);
            debug!(stage = %config.display_name(), %condition, "Attached run condition");
            controller.set_condition(controller.stage_count() - 1, condition)?;
        }
    }
    Ok(())
}
