//! Конфигурация критерия.

use std::path::Path;

use serde::{Deserialize, Serialize};

use asr_core::{AsrError, AsrResult};

/// Default number of updates between two printed training samples.
pub const DEFAULT_PRINT_INTERVAL: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriterionConfig {
    /// Normalize the loss by sentences instead of tokens.
    pub sentence_avg: bool,

    /// Print a training sample (reference + prediction) every this many updates.
    pub print_training_sample_interval: u64,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self {
            sentence_avg: false,
            print_training_sample_interval: DEFAULT_PRINT_INTERVAL,
        }
    }
}

impl CriterionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AsrResult<()> {
        if self.print_training_sample_interval == 0 {
            return Err(AsrError::config(
                "print_training_sample_interval must be positive",
            ));
        }
        Ok(())
    }
}
