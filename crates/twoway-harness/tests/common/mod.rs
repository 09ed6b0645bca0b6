#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use twoway_config::{HarnessConfig, HumanDuration};
use twoway_harness::{wait_on_syncs, HarnessContext, TestAgent};

/// Stability window for the in-process engine.
pub const WINDOW: Duration = Duration::from_millis(600);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(root: &TempDir) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.base_dir = Some(root.path().to_path_buf());
    config.timeouts.command = HumanDuration::from_secs(20);
    config.timeouts.quiescence_poll = HumanDuration::from_millis(40);
    config.timeouts.quiescence_ceiling = HumanDuration::from_secs(60);
    config.engine.scan_interval = HumanDuration::from_millis(25);
    config.engine.idle_wait = HumanDuration::from_millis(20);
    config
}

/// A temp root and a context running reference engines inside it. The
/// `TempDir` must outlive every agent.
pub fn setup() -> (TempDir, Arc<HarnessContext>) {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let context = HarnessContext::in_memory(test_config(&root)).unwrap();
    (root, context)
}

pub fn agent(context: &Arc<HarnessContext>, name: &str) -> TestAgent {
    let agent = TestAgent::new(context.clone(), name).unwrap();
    agent.set_log_callbacks(true);
    agent
}

pub fn login(agent: &TestAgent) {
    let context = agent.context();
    agent
        .login_fetch_nodes(context.user(), context.password())
        .unwrap();
}

pub fn settle(agents: &[&TestAgent]) {
    assert!(wait_on_syncs(WINDOW, agents), "agents did not settle");
}
