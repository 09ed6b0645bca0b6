use crate::types::{HarnessConfig, DEFAULT_TAG_SEED};
use crate::ConfigError;

impl HarnessConfig {
    /// Validate the configuration and return a list of errors.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let timeouts = [
            ("command", self.timeouts.command),
            ("quiescence_poll", self.timeouts.quiescence_poll),
            ("quiescence_ceiling", self.timeouts.quiescence_ceiling),
            ("engine.scan_interval", self.engine.scan_interval),
        ];
        for (name, value) in timeouts {
            if value.as_duration().is_zero() {
                errors.push(ConfigError::ZeroTimeout(name.to_string()));
            }
        }

        if self.timeouts.quiescence_poll.as_duration()
            > self.timeouts.quiescence_ceiling.as_duration()
        {
            errors.push(ConfigError::InvalidConfig(format!(
                "quiescence_poll ({}) exceeds quiescence_ceiling ({})",
                self.timeouts.quiescence_poll, self.timeouts.quiescence_ceiling
            )));
        }

        let debris = self.debris_folder.trim_matches('/');
        if debris.is_empty() || debris.contains('/') || debris == "." || debris == ".." {
            errors.push(ConfigError::InvalidDebrisFolder(self.debris_folder.clone()));
        }

        if self.remote_base_folder.is_empty() || self.remote_base_folder.contains('/') {
            errors.push(ConfigError::InvalidConfig(format!(
                "remote_base_folder '{}' must be a single non-empty name",
                self.remote_base_folder
            )));
        }

        if self.tag_seed < DEFAULT_TAG_SEED {
            errors.push(ConfigError::TagSeedTooLow(self.tag_seed));
        }

        errors
    }

    /// Validate and return Ok(()) if valid, or Err with the first error.
    pub fn validate_or_err(&self) -> Result<(), ConfigError> {
        match self.validate().into_iter().next() {
            None => Ok(()),
            Some(first) => Err(first),
        }
    }
}
