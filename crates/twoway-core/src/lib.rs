mod error;
mod fingerprint;
mod traits;
mod types;

pub use error::EngineError;
pub use fingerprint::{content_hash, Fingerprint};
pub use traits::{EngineObserver, SyncCompletion, SyncEngine};
pub use types::{
    Category, Credentials, NewNode, NodeHandle, NodeKind, RequestTag, SyncConfig, SyncId,
    SyncRunState, TransferDirection, TransferInfo, TreeSnapshot,
};
