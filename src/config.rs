//! Stage → model configuration.
//!
//! Resolves SPEC_FULL.md's Open Question: the forgiving loader wins. A
//! missing or malformed `CFX_STAGE_CONFIG` override file is logged and
//! ignored, never fatal — the compiled-in table always covers `plan`,
//! `code` and `review`.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    stages: HashMap<String, StageConfig>,
}

const DEFAULT_STAGE: &str = "plan";

/// `direct` is a reserved stage name: it exists in the glossary as "pass the
/// client's model straight through", and is deliberately never resolvable —
/// allowing it would let a caller bypass stage→model rewriting entirely.
const RESERVED_DISABLED_STAGE: &str = "direct";

fn fallback_table() -> HashMap<String, StageConfig> {
    let mut stages = HashMap::new();
    stages.insert(
        "plan".to_string(),
        StageConfig { model: "claude-3-5-sonnet-20241022".to_string(), max_tokens: None, temperature: None },
    );
    stages.insert(
        "code".to_string(),
        StageConfig { model: "deepseek-chat".to_string(), max_tokens: None, temperature: None },
    );
    stages.insert(
        "review".to_string(),
        StageConfig { model: "gpt-4o-mini".to_string(), max_tokens: None, temperature: None },
    );
    stages
}

impl Config {
    /// Load the stage table. Reads `CFX_STAGE_CONFIG` as a path to a JSON
    /// object of `{stage: StageConfig}` if set; on any I/O or parse error
    /// (including the env var being unset) it falls back to the compiled-in
    /// table and logs the degradation rather than failing startup.
    pub fn load() -> Self {
        match std::env::var("CFX_STAGE_CONFIG") {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<HashMap<String, StageConfig>>(&contents) {
                    Ok(stages) if !stages.is_empty() => Self { stages },
                    Ok(_) => {
                        tracing::warn!(path = %path, "stage config file is empty, using built-in fallback");
                        Self { stages: fallback_table() }
                    }
                    Err(err) => {
                        tracing::warn!(path = %path, error = %err, "stage config file is malformed, using built-in fallback");
                        Self { stages: fallback_table() }
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "stage config file unreadable, using built-in fallback");
                    Self { stages: fallback_table() }
                }
            },
            Err(_) => Self { stages: fallback_table() },
        }
    }

    pub fn default_stage() -> &'static str {
        DEFAULT_STAGE
    }

    pub fn is_stage_valid(&self, stage: &str) -> bool {
        stage != RESERVED_DISABLED_STAGE && self.stages.contains_key(stage)
    }

    pub fn get_stage_config(&self, stage: &str) -> Option<&StageConfig> {
        if stage == RESERVED_DISABLED_STAGE {
            return None;
        }
        self.stages.get(stage)
    }

    pub fn get_model_for_stage(&self, stage: &str) -> Option<&str> {
        self.get_stage_config(stage).map(|c| c.model.as_str())
    }

    pub fn list_stages(&self) -> Vec<&str> {
        self.stages.keys().map(|s| s.as_str()).collect()
    }
}
