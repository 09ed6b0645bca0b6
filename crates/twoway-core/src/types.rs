use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Identifier correlating a request with its completion callback.
///
/// Zero and small values belong to the engine's own housekeeping requests.
pub type RequestTag = u64;

/// Handle of a node in the remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(pub u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

/// Identifier of a configured sync, stable across session resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncId(pub u64);

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Folder,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => write!(f, "file"),
            NodeKind::Folder => write!(f, "folder"),
        }
    }
}

/// Request category. Completions are correlated per category, in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Prelogin,
    Login,
    FetchNodes,
    PutNodes,
    Unlink,
    Rename,
    Catchup,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Prelogin,
        Category::Login,
        Category::FetchNodes,
        Category::PutNodes,
        Category::Unlink,
        Category::Rename,
        Category::Catchup,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Prelogin => "prelogin",
            Category::Login => "login",
            Category::FetchNodes => "fetchnodes",
            Category::PutNodes => "putnodes",
            Category::Unlink => "unlink",
            Category::Rename => "rename",
            Category::Catchup => "catchup",
        };
        f.write_str(name)
    }
}

/// How to authenticate a login request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { user: String, password: String },
    Session(String),
}

/// One node of a create-nodes batch.
///
/// `parent` refers to the `local_id` of another node in the same batch;
/// `None` places the node directly under the request's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub local_id: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub kind: NodeKind,
    pub content: Vec<u8>,
    pub mtime: i64,
}

impl NewNode {
    pub fn folder(local_id: u32, parent: Option<u32>, name: impl Into<String>) -> Self {
        NewNode {
            local_id,
            parent,
            name: name.into(),
            kind: NodeKind::Folder,
            content: Vec::new(),
            mtime: 0,
        }
    }

    pub fn file(
        local_id: u32,
        parent: Option<u32>,
        name: impl Into<String>,
        content: Vec<u8>,
        mtime: i64,
    ) -> Self {
        NewNode {
            local_id,
            parent,
            name: name.into(),
            kind: NodeKind::File,
            content,
            mtime,
        }
    }
}

/// Point-in-time copy of an engine-owned tree (remote or replica).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
    pub name: String,
    pub kind: NodeKind,
    /// Remote handle the node corresponds to, if known.
    pub handle: Option<NodeHandle>,
    /// Present for files.
    pub fingerprint: Option<Fingerprint>,
    pub children: Vec<TreeSnapshot>,
}

impl TreeSnapshot {
    pub fn child(&self, name: &str) -> Option<&TreeSnapshot> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Number of nodes in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TreeSnapshot::count).sum::<usize>()
    }
}

/// Configuration of one two-way sync between a local folder and a remote folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_root: NodeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRunState {
    Active,
    Paused,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// A file transfer reported through the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub sync: SyncId,
    pub direction: TransferDirection,
    pub path: PathBuf,
    pub size: u64,
}
