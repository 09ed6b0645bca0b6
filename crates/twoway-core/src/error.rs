/// Result code of an engine request.
///
/// Carried by every completion callback; `Ok(())` is success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The addressed node, account, or sync does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad credentials or session.
    #[error("Access denied")]
    AccessDenied,

    /// A conflicting item already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The request requires a logged-in session.
    #[error("Not logged in")]
    NotLoggedIn,

    /// The request was malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request was accepted but could not finish, e.g. interrupted by logout.
    #[error("Incomplete: {0}")]
    Incomplete(String),

    /// Local filesystem failure inside the engine.
    #[error("IO error: {0}")]
    Io(String),

    /// Other engine-specific failure.
    #[error("Engine error: {0}")]
    Other(String),
}

impl EngineError {
    /// Returns true if the request may succeed when issued again.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Incomplete(_) | EngineError::Io(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => EngineError::AlreadyExists(e.to_string()),
            std::io::ErrorKind::PermissionDenied => EngineError::AccessDenied,
            _ => EngineError::Io(e.to_string()),
        }
    }
}
