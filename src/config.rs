use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::log::parse_log_level;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineFileConfig {
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
    pub stages: Vec<StageConfig>,
}

/// How an episode is executed.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Number of lanes. 1 runs the canonical stages sequentially.
    pub parallelism: usize,
    /// Stop the episode at the first per-element failure.
    #[serde(alias = "fail_on_exception")]
    pub fail_fast: bool,
    /// Serialise every load, unload and lookup on the collection.
    pub synchronize_collection_access: bool,
    /// Load elements in ascending index order, ahead of handing them to a lane.
    pub ordered_loading: bool,
    /// Run tasks on a dedicated runtime with this many blocking workers
    /// instead of the caller's runtime.
    pub worker_threads: Option<usize>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// Built-in stage types that can be declared in a config file.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    FeatureSetValue,
    IdAsFeature,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct StageConfig {
    pub kind: StageKind,
    /// Display name; defaults to the kind.
    #[serde(default)]
    pub name: Option<String>,
    /// Feature key. Required for `feature_set_value`; `id_as_feature` falls
    /// back to `_id`.
    #[serde(default)]
    pub key: Option<String>,
    /// Feature value. Required for `feature_set_value`.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub condition: Option<ConditionConfig>,
}

impl StageConfig {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            name: None,
            key: None,
            value: None,
            condition: None,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => match self.kind {
                StageKind::FeatureSetValue => "feature_set_value".to_string(),
                StageKind::IdAsFeature => "id_as_feature".to_string(),
            },
        }
    }
}

/// Run condition as written in a config file. Leaves read the element
/// bound to the stage the condition is attached to.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    Always,
    Never,
    FeatureEquals { key: String, value: String },
    And { conditions: Vec<ConditionConfig> },
    Or { conditions: Vec<ConditionConfig> },
    Not { condition: Box<ConditionConfig> },
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            fail_fast: true,
            synchronize_collection_access: true,
            ordered_loading: true,
            worker_threads: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// --- Validation ---

pub fn validate(config: &PipelineFileConfig) -> Result<(), Vec<String>> {
    let mut errors = validate_execution(&config.execution);

    if let Err(e) = parse_log_level(&config.logging.level) {
        errors.push(format!("logging.level: {}", e));
    }

    let mut seen_names = HashSet::new();
    for (position, stage) in config.stages.iter().enumerate() {
        let name = stage.display_name();
        if stage.name.is_some() && !seen_names.insert(name.clone()) {
            errors.push(format!("stages[{}]: duplicate stage name '{}'", position, name));
        }

        match stage.kind {
            StageKind::FeatureSetValue => {
                if stage.key.as_deref().map_or(true, str::is_empty) {
                    errors.push(format!(
                        "stages[{}] ({}): feature_set_value requires a non-empty key",
                        position, name
                    ));
                }
                if stage.value.is_none() {
                    errors.push(format!(
                        "stages[{}] ({}): feature_set_value requires a value",
                        position, name
                    ));
                }
            }
            StageKind::IdAsFeature => {
                if stage.value.is_some() {
                    errors.push(format!(
                        "stages[{}] ({}): id_as_feature does not take a value",
                        position, name
                    ));
                }
                if stage.key.as_deref() == Some("") {
                    errors.push(format!(
                        "stages[{}] ({}): key must not be empty",
                        position, name
                    ));
                }
            }
        }

        if let Some(condition) = &stage.condition {
            validate_condition(condition, &format!("stages[{}].condition", position), &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Checks only the execution section; used by callers that build a
/// controller without a config file.
pub fn validate_execution(execution: &ExecutionConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if execution.parallelism < 1 {
        errors.push("execution.parallelism must be >= 1".to_string());
    }
    if execution.worker_threads == Some(0) {
        errors.push("execution.worker_threads must be >= 1 when set".to_string());
    }
    errors
}

fn validate_condition(condition: &ConditionConfig, path: &str, errors: &mut Vec<String>) {
    match condition {
        ConditionConfig::Always | ConditionConfig::Never => {}
        ConditionConfig::FeatureEquals { key, .. } => {
            if key.is_empty() {
                errors.push(format!("{}: feature_equals requires a non-empty key", path));
            }
        }
        ConditionConfig::And { conditions } | ConditionConfig::Or { conditions } => {
            for (i, child) in conditions.iter().enumerate() {
                validate_condition(child, &format!("{}.conditions[{}]", path, i), errors);
            }
        }
        ConditionConfig::Not { condition } => {
            validate_condition(condition, &format!("{}.condition", path), errors);
        }
    }
}

// --- Loading ---

/// Load a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<PipelineFileConfig, PipelineError> {
    if !path.exists() {
        return Ok(PipelineFileConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    let config: PipelineFileConfig = toml::from_str(&contents)
        .map_err(|e| PipelineError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    validate(&config).map_err(|errors| {
        PipelineError::Config(format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sequential_and_fail_fast() {
        let config = PipelineFileConfig::default();
        assert_eq!(config.execution.parallelism, 1);
        assert!(config.execution.fail_fast);
        assert!(config.execution.synchronize_collection_access);
        assert!(config.execution.ordered_loading);
        assert_eq!(config.logging.level, "info");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn fail_on_exception_is_accepted_as_alias() {
        let config: PipelineFileConfig = toml::from_str(
            r#"
            [execution]
            parallelism = 3
            fail_on_exception = false
            "#,
        )
        .unwrap();
        assert_eq!(config.execution.parallelism, 3);
        assert!(!config.execution.fail_fast);
    }

    #[test]
    fn nested_conditions_parse() {
        let config: PipelineFileConfig = toml::from_str(
            r#"
            [[stages]]
            kind = "feature_set_value"
            key = "seen"
            value = "yes"
            condition = { type = "and", conditions = [
                { type = "always" },
                { type = "not", condition = { type = "feature_equals", key = "lang", value = "de" } },
            ] }
            "#,
        )
        .unwrap();

        let condition = config.stages[0].condition.as_ref().unwrap();
        match condition {
            ConditionConfig::And { conditions } => {
                assert_eq!(conditions.len(), 2);
                assert_eq!(conditions[0], ConditionConfig::Always);
                assert!(matches!(conditions[1], ConditionConfig::Not { .. }));
            }
            other => panic!("expected and, got {:?}", other),
        }
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut config = PipelineFileConfig::default();
        config.execution.parallelism = 0;
        config.execution.worker_threads = Some(0);
        config.logging.level = "loud".to_string();
        config.stages.push(StageConfig::new(StageKind::FeatureSetValue));

        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 5, "{:?}", errors);
    }
}
