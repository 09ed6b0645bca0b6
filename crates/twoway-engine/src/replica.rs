//! The engine's record of what each sync last agreed on, plus its on-disk cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use twoway_core::{Fingerprint, NodeHandle, NodeKind, SyncConfig, SyncId, TreeSnapshot};

/// Errors reading or writing the engine cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Join a sync-relative path with a child name. The sync root is `""`.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split a sync-relative path into parent and leaf name.
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// True if `path` equals `ancestor` or lies beneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// One node of the replica tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub handle: Option<NodeHandle>,
    #[serde(default)]
    pub inode: Option<u64>,
    #[serde(default)]
    pub children: BTreeMap<String, ReplicaNode>,
}

impl ReplicaNode {
    pub fn folder(name: &str, handle: Option<NodeHandle>, inode: Option<u64>) -> Self {
        ReplicaNode {
            name: name.to_string(),
            kind: NodeKind::Folder,
            fingerprint: None,
            handle,
            inode,
            children: BTreeMap::new(),
        }
    }

    pub fn file(
        name: &str,
        fingerprint: Fingerprint,
        handle: Option<NodeHandle>,
        inode: Option<u64>,
    ) -> Self {
        ReplicaNode {
            name: name.to_string(),
            kind: NodeKind::File,
            fingerprint: Some(fingerprint),
            handle,
            inode,
            children: BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&ReplicaNode> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in path.split('/') {
            node = node.children.get(part)?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ReplicaNode> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in path.split('/') {
            node = node.children.get_mut(part)?;
        }
        Some(node)
    }

    /// Insert or replace the node at `path`, keeping the children of a
    /// replaced folder. Returns false if the parent is missing.
    pub fn upsert(&mut self, path: &str, mut node: ReplicaNode) -> bool {
        let (parent, name) = split(path);
        let Some(parent) = self.get_mut(parent) else {
            return false;
        };
        node.name = name.to_string();
        if let Some(existing) = parent.children.remove(name) {
            if existing.kind == NodeKind::Folder && node.kind == NodeKind::Folder {
                node.children = existing.children;
            }
        }
        parent.children.insert(name.to_string(), node);
        true
    }

    pub fn remove(&mut self, path: &str) -> Option<ReplicaNode> {
        if path.is_empty() {
            return None;
        }
        let (parent, name) = split(path);
        self.get_mut(parent)?.children.remove(name)
    }

    /// Re-key a subtree. Returns false if the source or target parent is missing.
    pub fn relocate(&mut self, from: &str, to: &str) -> bool {
        let (to_parent, to_name) = split(to);
        if self.get(to_parent).is_none() || is_within(to, from) {
            return false;
        }
        let Some(mut node) = self.remove(from) else {
            return false;
        };
        node.name = to_name.to_string();
        match self.get_mut(to_parent) {
            Some(parent) => {
                parent.children.insert(to_name.to_string(), node);
                true
            }
            None => false,
        }
    }

    /// Every descendant keyed by its sync-relative path, parents first.
    pub fn flatten(&self) -> BTreeMap<String, &ReplicaNode> {
        let mut out = BTreeMap::new();
        let mut stack: Vec<(String, &ReplicaNode)> = vec![(String::new(), self)];
        while let Some((path, node)) = stack.pop() {
            for (name, child) in &node.children {
                let child_path = join(&path, name);
                out.insert(child_path.clone(), child);
                stack.push((child_path, child));
            }
        }
        out
    }

    pub fn to_snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            handle: self.handle,
            fingerprint: self.fingerprint.clone(),
            children: self.children.values().map(ReplicaNode::to_snapshot).collect(),
        }
    }
}

/// A sync as written to the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSync {
    pub id: SyncId,
    pub config: SyncConfig,
    pub base: ReplicaNode,
}

/// Everything an engine needs to resume a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineCache {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub next_sync_id: u64,
    #[serde(default)]
    pub syncs: Vec<PersistedSync>,
}

impl EngineCache {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join("state.json")
    }

    pub fn load(dir: &Path) -> Result<Option<EngineCache>, CacheError> {
        let path = Self::path_in(dir);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write atomically through a temp file in the same directory.
    pub fn store(&self, dir: &Path) -> Result<(), CacheError> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join("state.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(tmp, Self::path_in(dir))?;
        Ok(())
    }

    pub fn clear(dir: &Path) -> Result<(), CacheError> {
        let path = Self::path_in(dir);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
