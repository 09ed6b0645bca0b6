mod defaults;
mod env;
pub mod types;
mod validation;

use std::path::Path;

pub use env::{interpolate_env, interpolate_with};
pub use types::*;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Missing environment variables: {0:?}")]
    MissingEnvVars(Vec<String>),

    #[error("Timeout '{0}' must be non-zero")]
    ZeroTimeout(String),

    #[error("Invalid debris folder name '{0}'")]
    InvalidDebrisFolder(String),

    #[error("Tag seed {0} overlaps the engine's internal tag range")]
    TagSeedTooLow(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HarnessConfig {
    /// Parse a harness configuration from a YAML string.
    /// Environment variables in the format `${VAR_NAME}` or
    /// `${VAR_NAME:-fallback}` will be interpolated.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let interpolated = env::interpolate_env(yaml)?;
        let config: HarnessConfig = serde_yaml::from_str(&interpolated)?;
        Ok(config)
    }

    /// Load a harness configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_minimal_config() {
        let config = HarnessConfig::from_yaml("remote_base_folder: suite_base\n").unwrap();
        assert_eq!(config.remote_base_folder, "suite_base");
        assert_eq!(config.debris_folder, ".debris");
        assert_eq!(config.tag_seed, DEFAULT_TAG_SEED);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
base_dir: /tmp/twoway
account:
  user: alice@example.test
  password: secret
debris_folder: Rubbish
tag_seed: 2147483648
timeouts:
  command: 30s
  quiescence_poll: 50ms
  quiescence_ceiling: 1m
engine:
  scan_interval: 20ms
  actions_per_exec: 8
"#;
        let config = HarnessConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.account.user, "alice@example.test");
        assert_eq!(config.debris_folder, "Rubbish");
        assert_eq!(config.tag_seed, 1 << 31);
        assert_eq!(config.timeouts.command.as_duration(), Duration::from_secs(30));
        assert_eq!(
            config.timeouts.quiescence_poll.as_duration(),
            Duration::from_millis(50)
        );
        assert_eq!(config.engine.actions_per_exec, 8);
        // idle_wait falls back to its default
        assert_eq!(
            config.engine.idle_wait.as_duration(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_parse_with_env_vars() {
        std::env::set_var("TWOWAY_CFG_TEST_USER", "bob@example.test");
        std::env::set_var("TWOWAY_CFG_TEST_PASSWORD", "hunter2");

        let yaml = r#"
account:
  user: ${TWOWAY_CFG_TEST_USER}
  password: ${TWOWAY_CFG_TEST_PASSWORD}
"#;
        let config = HarnessConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.account.user, "bob@example.test");
        assert_eq!(config.account.password, "hunter2");
    }

    #[test]
    fn test_parse_missing_env_var() {
        let yaml = "account:\n  user: ${TWOWAY_CFG_SURELY_UNSET_12345}\n";
        match HarnessConfig::from_yaml(yaml) {
            Err(ConfigError::MissingEnvVars(vars)) => {
                assert_eq!(vars, vec!["TWOWAY_CFG_SURELY_UNSET_12345".to_string()]);
            }
            other => panic!("Expected MissingEnvVars, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bad_duration() {
        let yaml = "timeouts:\n  command: soon\n";
        assert!(matches!(
            HarnessConfig::from_yaml(yaml),
            Err(ConfigError::YamlError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twoway.yaml");
        std::fs::write(&path, "debris_folder: .trash\n").unwrap();
        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.debris_folder, ".trash");

        let missing = HarnessConfig::from_file(&dir.path().join("absent.yaml"));
        assert!(matches!(missing, Err(ConfigError::IoError(_))));
    }
}
