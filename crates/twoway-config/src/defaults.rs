use std::path::PathBuf;

use crate::types::HarnessConfig;

impl HarnessConfig {
    /// Apply default inference rules to the configuration.
    /// This mutates the config in place.
    pub fn apply_defaults(&mut self) {
        // 1. Agents live under the system temp dir unless told otherwise
        if self.base_dir.is_none() {
            self.base_dir = Some(default_base_dir());
        }

        // 2. Trailing separators would create a nested debris path
        let trimmed = self.debris_folder.trim_matches('/').to_string();
        self.debris_folder = trimmed;

        // 3. The worker never sleeps longer than one quiescence poll
        let poll = self.timeouts.quiescence_poll;
        if self.engine.idle_wait.as_duration() > poll.as_duration() {
            self.engine.idle_wait = poll;
        }

        if self.engine.actions_per_exec == 0 {
            self.engine.actions_per_exec = 1;
        }
    }

    /// Returns a new config with all defaults applied.
    pub fn effective(&self) -> HarnessConfig {
        let mut config = self.clone();
        config.apply_defaults();
        config
    }
}

fn default_base_dir() -> PathBuf {
    std::env::temp_dir().join("twoway_tests")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HumanDuration;

    #[test]
    fn test_effective_fills_base_dir() {
        let effective = HarnessConfig::default().effective();
        assert_eq!(effective.base_dir, Some(default_base_dir()));
    }

    #[test]
    fn test_effective_keeps_explicit_base_dir() {
        let config = HarnessConfig {
            base_dir: Some(PathBuf::from("/srv/twoway")),
            ..Default::default()
        };
        assert_eq!(
            config.effective().base_dir,
            Some(PathBuf::from("/srv/twoway"))
        );
    }

    #[test]
    fn test_effective_clamps_idle_wait() {
        let mut config = HarnessConfig::default();
        config.timeouts.quiescence_poll = HumanDuration::from_millis(20);
        config.engine.idle_wait = HumanDuration::from_millis(500);
        config.engine.actions_per_exec = 0;

        let effective = config.effective();
        assert_eq!(effective.engine.idle_wait, HumanDuration::from_millis(20));
        assert_eq!(effective.engine.actions_per_exec, 1);
    }

    #[test]
    fn test_effective_trims_debris_name() {
        let config = HarnessConfig {
            debris_folder: "/.debris/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.effective().debris_folder, ".debris");
    }
}
