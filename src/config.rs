//! Engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::recovery::RecoveryPolicy;

/// Defaults applied by the combinator builders through `configure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Iteration cap for loops
    pub max_iterations: usize,
    /// Worker pool size for parallel nodes, `None` runs every child at once
    pub parallelism: Option<usize>,
    /// Step cap for supervisors
    pub supervisor_max_steps: usize,
    /// Pause between retry attempts
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            parallelism: None,
            supervisor_max_steps: 10,
            retry_backoff_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| WorkflowError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| WorkflowError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(WorkflowError::ConfigError("max_iterations must be positive".into()));
        }
        if self.parallelism == Some(0) {
            return Err(WorkflowError::ConfigError("parallelism must be positive".into()));
        }
        if self.supervisor_max_steps == 0 {
            return Err(WorkflowError::ConfigError(
                "supervisor_max_steps must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Retry descriptor using the configured backoff
    pub fn retry(&self, attempts: u32) -> RecoveryPolicy {
        RecoveryPolicy::Retry {
            attempts,
            backoff: self.retry_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "max_iterations": 3 }"#).unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.supervisor_max_steps, 10);
        assert!(config.parallelism.is_none());
    }

    #[test]
    fn test_rejects_zero_caps() {
        let err = EngineConfig::from_json(r#"{ "max_iterations": 0 }"#).unwrap_err();
        assert!(matches!(err, WorkflowError::ConfigError(_)));
        assert!(EngineConfig::from_json(r#"{ "parallelism": 0 }"#).is_err());
        assert!(EngineConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "parallelism": 3, "retry_backoff_ms": 25 }}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.parallelism, Some(3));
        assert!(matches!(
            config.retry(2),
            RecoveryPolicy::Retry { attempts: 2, backoff } if backoff == Duration::from_millis(25)
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, WorkflowError::ConfigError(_)));
    }
}
