//! Process-wide harness state shared by every agent of a test.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;
use twoway_config::HarnessConfig;
use twoway_core::{EngineObserver, RequestTag, SyncEngine};
use twoway_engine::{EngineSettings, MemoryCloud, ReferenceEngine};

use crate::error::HarnessError;

const DEFAULT_USER: &str = "twoway@example.test";
const DEFAULT_PASSWORD: &str = "twoway-password";

/// Strictly increasing request tags, shared so that no two agents ever
/// issue the same tag.
#[derive(Debug)]
pub struct TagCounter(AtomicU64);

impl TagCounter {
    pub fn new(seed: RequestTag) -> Self {
        TagCounter(AtomicU64::new(seed))
    }

    pub fn next(&self) -> RequestTag {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Builds one engine per agent. Called on the agent's worker thread, which
/// then owns the engine for its whole life.
pub trait EngineFactory: Send + Sync {
    fn create(&self, cache_dir: &Path, observer: Box<dyn EngineObserver>) -> Box<dyn SyncEngine>;
}

/// Factory for [`ReferenceEngine`]s that all talk to the same [`MemoryCloud`].
pub struct ReferenceEngineFactory {
    cloud: Arc<MemoryCloud>,
    settings: EngineSettings,
}

impl ReferenceEngineFactory {
    pub fn new(cloud: Arc<MemoryCloud>, settings: EngineSettings) -> Self {
        ReferenceEngineFactory { cloud, settings }
    }

    pub fn cloud(&self) -> &Arc<MemoryCloud> {
        &self.cloud
    }
}

impl EngineFactory for ReferenceEngineFactory {
    fn create(&self, cache_dir: &Path, observer: Box<dyn EngineObserver>) -> Box<dyn SyncEngine> {
        Box::new(ReferenceEngine::new(
            self.cloud.clone(),
            cache_dir,
            self.settings.clone(),
            observer,
        ))
    }
}

/// Configuration, tag counter and engine factory for one test.
pub struct HarnessContext {
    config: HarnessConfig,
    tags: TagCounter,
    factory: Arc<dyn EngineFactory>,
}

impl HarnessContext {
    /// Validate `config` (with defaults applied) and build a context around
    /// an arbitrary engine factory.
    pub fn new(
        config: HarnessConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Arc<Self>, HarnessError> {
        let config = config.effective();
        config.validate_or_err()?;
        Ok(Arc::new(HarnessContext {
            tags: TagCounter::new(config.tag_seed),
            config,
            factory,
        }))
    }

    /// A context whose agents run [`ReferenceEngine`]s against a fresh
    /// in-memory cloud with the configured account registered.
    pub fn in_memory(mut config: HarnessConfig) -> Result<Arc<Self>, HarnessError> {
        if config.account.user.is_empty() {
            config.account.user = DEFAULT_USER.to_string();
            config.account.password = DEFAULT_PASSWORD.to_string();
        }
        let cloud = MemoryCloud::new();
        cloud.register_account(&config.account.user, &config.account.password);
        let settings = EngineSettings::from_config(&config);
        info!(
            "Harness context for {} (scan every {:?})",
            config.account.user, settings.scan_interval
        );
        Self::new(config, Arc::new(ReferenceEngineFactory::new(cloud, settings)))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn next_tag(&self) -> RequestTag {
        self.tags.next()
    }

    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        self.factory.clone()
    }

    pub fn base_dir(&self) -> PathBuf {
        self.config
            .base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("twoway_tests"))
    }

    pub fn user(&self) -> &str {
        &self.config.account.user
    }

    pub fn password(&self) -> &str {
        &self.config.account.password
    }
}
