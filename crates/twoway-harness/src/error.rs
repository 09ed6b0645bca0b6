use twoway_config::ConfigError;
use twoway_core::EngineError;

/// Errors surfaced to test code by the harness.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HarnessError {
    /// A cross-thread command did not resolve within its bound.
    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    /// The agent's worker thread has exited; its pending commands can never resolve.
    #[error("Agent worker has stopped")]
    AgentStopped,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Fixture or session setup could not complete.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// A slash path did not resolve to a remote node.
    #[error("Path not found: {0}")]
    PathNotFound(String),
}

impl HarnessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }

    /// Returns true if the agent can no longer accept commands.
    pub fn is_agent_gone(&self) -> bool {
        matches!(self, HarnessError::AgentStopped | HarnessError::Timeout { .. })
    }
}
