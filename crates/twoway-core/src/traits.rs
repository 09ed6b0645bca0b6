use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;
use crate::types::{
    Credentials, NewNode, NodeHandle, NodeKind, RequestTag, SyncConfig, SyncId, SyncRunState,
    TransferInfo, TreeSnapshot,
};

/// Completion of an add-sync request.
pub type SyncCompletion = Box<dyn FnOnce(Result<SyncId, EngineError>) + Send>;

/// Callbacks an engine delivers, always on the thread that drives it.
///
/// Request completions carry the tag that was active when the request was
/// issued. Every method defaults to a no-op.
pub trait EngineObserver: Send {
    fn prelogin_result(&mut self, _tag: RequestTag, _result: Result<(), EngineError>) {}
    fn login_result(&mut self, _tag: RequestTag, _result: Result<(), EngineError>) {}
    fn fetchnodes_result(&mut self, _tag: RequestTag, _result: Result<(), EngineError>) {}
    /// `created` lists the new handles in batch order.
    fn putnodes_result(
        &mut self,
        _tag: RequestTag,
        _result: Result<(), EngineError>,
        _created: &[NodeHandle],
    ) {
    }
    fn unlink_result(
        &mut self,
        _tag: RequestTag,
        _handle: NodeHandle,
        _result: Result<(), EngineError>,
    ) {
    }
    fn rename_result(
        &mut self,
        _tag: RequestTag,
        _handle: NodeHandle,
        _result: Result<(), EngineError>,
    ) {
    }
    fn catchup_result(&mut self, _tag: RequestTag) {}

    fn transfer_added(&mut self, _transfer: &TransferInfo) {}
    fn transfer_removed(&mut self, _transfer: &TransferInfo) {}
    fn transfer_prepared(&mut self, _transfer: &TransferInfo) {}
    fn transfer_failed(&mut self, _transfer: &TransferInfo, _error: &EngineError) {}
    fn transfer_updated(&mut self, _transfer: &TransferInfo, _done: u64) {}
    fn transfer_complete(&mut self, _transfer: &TransferInfo) {}

    fn sync_added(&mut self, _sync: SyncId, _config: &SyncConfig) {}
    fn sync_removed(&mut self, _sync: SyncId) {}
    fn sync_state_changed(&mut self, _sync: SyncId, _state: &SyncRunState) {}

    fn local_node_added(&mut self, _sync: SyncId, _path: &Path, _kind: NodeKind) {}
    fn local_node_deleted(&mut self, _sync: SyncId, _path: &Path, _kind: NodeKind) {}
    fn local_node_moved(&mut self, _sync: SyncId, _from: &Path, _to: &Path) {}
    fn remote_node_added(&mut self, _sync: SyncId, _handle: NodeHandle, _path: &Path) {}
    fn remote_node_deleted(&mut self, _sync: SyncId, _handle: NodeHandle, _path: &Path) {}
    fn remote_node_moved(&mut self, _sync: SyncId, _handle: NodeHandle, _from: &Path, _to: &Path) {}

    /// Anything happened at all; used to reset idle timers.
    fn activity(&mut self) {}
}

/// Commands a harness issues to a sync engine.
///
/// An engine is single-threaded: every method, including the read-only
/// accessors, must be called from the thread that runs its event loop.
/// Requests complete asynchronously through the registered
/// [`EngineObserver`], tagged with the value set by [`set_request_tag`].
///
/// [`set_request_tag`]: SyncEngine::set_request_tag
pub trait SyncEngine {
    /// Make `tag` the active request tag and return the previous one.
    fn set_request_tag(&mut self, tag: RequestTag) -> RequestTag;

    fn prelogin(&mut self, user: &str);
    fn login(&mut self, credentials: &Credentials);
    fn fetch_nodes(&mut self, use_cache: bool);
    fn create_nodes(&mut self, parent: NodeHandle, nodes: Vec<NewNode>);
    /// Move a node and its subtree to the rubbish bin.
    fn unlink(&mut self, node: NodeHandle);
    /// Move `node` under `new_parent`, renaming it when `new_name` is given.
    fn rename(&mut self, node: NodeHandle, new_parent: NodeHandle, new_name: Option<&str>);
    fn add_sync(&mut self, config: SyncConfig, completion: SyncCompletion);
    /// Remove every sync the predicate selects. Returns how many were removed.
    fn remove_syncs(&mut self, predicate: &mut dyn FnMut(SyncId, &SyncConfig) -> bool) -> usize;
    /// Barrier: completes once every remote change issued earlier is visible.
    fn catchup(&mut self);
    /// Drop the in-memory session but keep the on-disk cache for a later resume.
    fn local_logout(&mut self);
    /// Full logout; the cache is discarded.
    fn logout(&mut self);
    fn dump_session(&self) -> Option<String>;

    fn root_handle(&self) -> Option<NodeHandle>;
    fn rubbish_handle(&self) -> Option<NodeHandle>;
    /// Children of `parent` named `name`, in creation order.
    fn children_named(&self, parent: NodeHandle, name: &str) -> Vec<NodeHandle>;
    fn node_kind(&self, node: NodeHandle) -> Option<NodeKind>;
    fn remote_tree(&self, node: NodeHandle) -> Option<TreeSnapshot>;
    fn syncs(&self) -> Vec<(SyncId, SyncConfig)>;
    /// The engine's record of the local side of a sync, debris excluded.
    fn replica_tree(&self, sync: SyncId) -> Option<TreeSnapshot>;

    /// True while any request, transfer, or pending sync action is queued.
    fn is_busy(&self) -> bool;

    /// Force one more downward pass over every sync.
    fn request_sync_down(&mut self) {}

    /// How long the event loop may sleep before the engine needs attention.
    /// `None` means no deadline.
    fn prepare_wait(&mut self) -> Option<Duration>;
    /// Poll for external events. Returns true if any arrived.
    fn check_events(&mut self) -> bool;
    /// Perform pending work and deliver callbacks.
    fn exec(&mut self);
}
