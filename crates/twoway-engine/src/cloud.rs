//! Shared in-memory cloud: accounts, sessions and one node tree per account.
//!
//! Every engine instance talks to the same `MemoryCloud`, so two agents logged
//! into the same account observe each other's changes once they refresh.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use twoway_core::{EngineError, Fingerprint, NewNode, NodeHandle, NodeKind};

/// A node as stored by the cloud.
#[derive(Debug, Clone)]
pub struct CloudNode {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub name: String,
    pub kind: NodeKind,
    pub content: Arc<[u8]>,
    pub fingerprint: Option<Fingerprint>,
    pub children: Vec<NodeHandle>,
}

#[derive(Debug)]
struct Account {
    password: String,
    salt: String,
    root: NodeHandle,
    rubbish: NodeHandle,
}

#[derive(Debug, Default)]
struct CloudState {
    next_handle: u64,
    next_session: u64,
    version: u64,
    nodes: HashMap<NodeHandle, (String, CloudNode)>,
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, String>,
}

/// Copy of one account's nodes, as fetched by an engine.
#[derive(Debug, Clone)]
pub struct AccountTree {
    pub version: u64,
    pub root: NodeHandle,
    pub rubbish: NodeHandle,
    pub nodes: HashMap<NodeHandle, CloudNode>,
}

impl AccountTree {
    pub fn get(&self, handle: NodeHandle) -> Option<&CloudNode> {
        self.nodes.get(&handle)
    }

    /// True if `handle` lies under the account's root (not in the rubbish bin).
    pub fn is_live(&self, handle: NodeHandle) -> bool {
        let mut cursor = Some(handle);
        while let Some(h) = cursor {
            if h == self.root {
                return true;
            }
            cursor = self.nodes.get(&h).and_then(|n| n.parent);
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
}

impl MemoryCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryCloud::default())
    }

    /// Create an account with an empty root folder and rubbish bin.
    pub fn register_account(&self, user: &str, password: &str) {
        let mut state = self.state.lock();
        if state.accounts.contains_key(user) {
            return;
        }
        let root = state.alloc_handle();
        let rubbish = state.alloc_handle();
        for (handle, name) in [(root, ""), (rubbish, "Rubbish Bin")] {
            let node = CloudNode {
                handle,
                parent: None,
                name: name.to_string(),
                kind: NodeKind::Folder,
                content: Arc::from(Vec::new()),
                fingerprint: None,
                children: Vec::new(),
            };
            state.nodes.insert(handle, (user.to_string(), node));
        }
        let salt = twoway_core::content_hash(user.as_bytes())[..16].to_string();
        state.accounts.insert(
            user.to_string(),
            Account {
                password: password.to_string(),
                salt,
                root,
                rubbish,
            },
        );
        state.version += 1;
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Returns the account's login salt.
    pub fn prelogin(&self, user: &str) -> Result<String, EngineError> {
        let state = self.state.lock();
        state
            .accounts
            .get(user)
            .map(|a| a.salt.clone())
            .ok_or_else(|| EngineError::NotFound(format!("account {}", user)))
    }

    /// Returns a new session token.
    pub fn login(&self, user: &str, password: &str) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        match state.accounts.get(user) {
            Some(account) if account.password == password => {}
            Some(_) => return Err(EngineError::AccessDenied),
            None => return Err(EngineError::NotFound(format!("account {}", user))),
        }
        state.next_session += 1;
        let token = format!(
            "sid-{}-{}",
            state.next_session,
            &twoway_core::content_hash(format!("{}:{}", user, state.next_session).as_bytes())[..12]
        );
        state.sessions.insert(token.clone(), user.to_string());
        Ok(token)
    }

    /// Returns the user a session belongs to.
    pub fn resume_session(&self, token: &str) -> Result<String, EngineError> {
        self.state
            .lock()
            .sessions
            .get(token)
            .cloned()
            .ok_or(EngineError::AccessDenied)
    }

    pub fn end_session(&self, token: &str) {
        self.state.lock().sessions.remove(token);
    }

    pub fn fetch(&self, user: &str) -> Result<AccountTree, EngineError> {
        let state = self.state.lock();
        let account = state
            .accounts
            .get(user)
            .ok_or_else(|| EngineError::NotFound(format!("account {}", user)))?;
        let nodes = state
            .nodes
            .values()
            .filter(|(owner, _)| owner == user)
            .map(|(_, node)| (node.handle, node.clone()))
            .collect();
        Ok(AccountTree {
            version: state.version,
            root: account.root,
            rubbish: account.rubbish,
            nodes,
        })
    }

    /// Create a batch of nodes under `parent`. Returns the new handles in batch order.
    pub fn create_nodes(
        &self,
        user: &str,
        parent: NodeHandle,
        batch: Vec<NewNode>,
    ) -> Result<Vec<NodeHandle>, EngineError> {
        let mut state = self.state.lock();
        state.expect_folder(user, parent)?;

        // Validate local-id references before touching anything
        let mut seen: HashMap<u32, NodeKind> = HashMap::new();
        for spec in &batch {
            if spec.name.is_empty() || spec.name.contains('/') {
                return Err(EngineError::InvalidArgument(format!(
                    "bad node name '{}'",
                    spec.name
                )));
            }
            if let Some(p) = spec.parent {
                match seen.get(&p) {
                    Some(NodeKind::Folder) => {}
                    _ => {
                        return Err(EngineError::InvalidArgument(format!(
                            "node '{}' refers to unknown parent {}",
                            spec.name, p
                        )))
                    }
                }
            }
            seen.insert(spec.local_id, spec.kind);
        }

        let mut by_local: HashMap<u32, NodeHandle> = HashMap::new();
        let mut created = Vec::with_capacity(batch.len());
        for spec in batch {
            let target = match spec.parent {
                Some(p) => by_local.get(&p).copied().unwrap_or(parent),
                None => parent,
            };
            let handle = state.alloc_handle();
            let fingerprint = match spec.kind {
                NodeKind::File => Some(Fingerprint::of(&spec.content, spec.mtime)),
                NodeKind::Folder => None,
            };
            let node = CloudNode {
                handle,
                parent: Some(target),
                name: spec.name,
                kind: spec.kind,
                content: Arc::from(spec.content),
                fingerprint,
                children: Vec::new(),
            };
            state.nodes.insert(handle, (user.to_string(), node));
            if let Some((_, p)) = state.nodes.get_mut(&target) {
                p.children.push(handle);
            }
            by_local.insert(spec.local_id, handle);
            created.push(handle);
        }
        state.version += 1;
        debug!("cloud: created {} node(s) under {}", created.len(), parent);
        Ok(created)
    }

    /// Move a node to the rubbish bin, or purge it if it is already there.
    pub fn unlink(&self, user: &str, handle: NodeHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let (root, rubbish) = state.roots(user)?;
        if handle == root || handle == rubbish {
            return Err(EngineError::InvalidArgument(
                "cannot unlink a root node".to_string(),
            ));
        }
        state.expect_owned(user, handle)?;

        if state.is_under(handle, rubbish) {
            state.purge(handle);
        } else {
            state.reparent(handle, rubbish, None);
        }
        state.version += 1;
        Ok(())
    }

    /// Move `handle` under `new_parent`, optionally renaming it.
    pub fn move_node(
        &self,
        user: &str,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let (root, rubbish) = state.roots(user)?;
        if handle == root || handle == rubbish {
            return Err(EngineError::InvalidArgument(
                "cannot move a root node".to_string(),
            ));
        }
        state.expect_owned(user, handle)?;
        state.expect_folder(user, new_parent)?;
        if state.is_under(new_parent, handle) {
            return Err(EngineError::InvalidArgument(
                "cannot move a folder into itself".to_string(),
            ));
        }
        if let Some(name) = new_name {
            if name.is_empty() || name.contains('/') {
                return Err(EngineError::InvalidArgument(format!("bad node name '{}'", name)));
            }
        }
        state.reparent(handle, new_parent, new_name);
        state.version += 1;
        Ok(())
    }
}

impl CloudState {
    fn alloc_handle(&mut self) -> NodeHandle {
        self.next_handle += 1;
        NodeHandle(0x1000 + self.next_handle)
    }

    fn roots(&self, user: &str) -> Result<(NodeHandle, NodeHandle), EngineError> {
        self.accounts
            .get(user)
            .map(|a| (a.root, a.rubbish))
            .ok_or_else(|| EngineError::NotFound(format!("account {}", user)))
    }

    fn expect_owned(&self, user: &str, handle: NodeHandle) -> Result<&CloudNode, EngineError> {
        match self.nodes.get(&handle) {
            Some((owner, node)) if owner == user => Ok(node),
            Some(_) => Err(EngineError::AccessDenied),
            None => Err(EngineError::NotFound(format!("node {}", handle))),
        }
    }

    fn expect_folder(&self, user: &str, handle: NodeHandle) -> Result<(), EngineError> {
        let node = self.expect_owned(user, handle)?;
        if node.kind != NodeKind::Folder {
            return Err(EngineError::InvalidArgument(format!(
                "node {} is not a folder",
                handle
            )));
        }
        Ok(())
    }

    fn is_under(&self, handle: NodeHandle, ancestor: NodeHandle) -> bool {
        let mut cursor = Some(handle);
        while let Some(h) = cursor {
            if h == ancestor {
                return true;
            }
            cursor = self.nodes.get(&h).and_then(|(_, n)| n.parent);
        }
        false
    }

    fn detach(&mut self, handle: NodeHandle) {
        let parent = self.nodes.get(&handle).and_then(|(_, n)| n.parent);
        if let Some(p) = parent {
            if let Some((_, pn)) = self.nodes.get_mut(&p) {
                pn.children.retain(|c| *c != handle);
            }
        }
    }

    fn reparent(&mut self, handle: NodeHandle, new_parent: NodeHandle, new_name: Option<&str>) {
        self.detach(handle);
        if let Some((_, node)) = self.nodes.get_mut(&handle) {
            node.parent = Some(new_parent);
            if let Some(name) = new_name {
                node.name = name.to_string();
            }
        }
        if let Some((_, p)) = self.nodes.get_mut(&new_parent) {
            p.children.push(handle);
        }
    }

    fn purge(&mut self, handle: NodeHandle) {
        self.detach(handle);
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            if let Some((_, node)) = self.nodes.remove(&h) {
                stack.extend(node.children);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "alice@example.test";

    fn cloud() -> Arc<MemoryCloud> {
        let cloud = MemoryCloud::new();
        cloud.register_account(USER, "pw");
        cloud
    }

    #[test]
    fn test_login_and_sessions() {
        let cloud = cloud();
        assert!(cloud.prelogin(USER).is_ok());
        assert!(matches!(cloud.prelogin("bob"), Err(EngineError::NotFound(_))));
        assert_eq!(cloud.login(USER, "wrong"), Err(EngineError::AccessDenied));

        let token = cloud.login(USER, "pw").unwrap();
        assert_eq!(cloud.resume_session(&token).unwrap(), USER);
        cloud.end_session(&token);
        assert_eq!(cloud.resume_session(&token), Err(EngineError::AccessDenied));
    }

    #[test]
    fn test_create_nodes_batch_with_local_parents() {
        let cloud = cloud();
        let root = cloud.fetch(USER).unwrap().root;
        let created = cloud
            .create_nodes(
                USER,
                root,
                vec![
                    NewNode::folder(1, None, "f"),
                    NewNode::folder(2, Some(1), "f_0"),
                    NewNode::file(3, Some(2), "a", b"hello".to_vec(), 100),
                ],
            )
            .unwrap();
        assert_eq!(created.len(), 3);

        let tree = cloud.fetch(USER).unwrap();
        let file = tree.get(created[2]).unwrap();
        assert_eq!(file.parent, Some(created[1]));
        assert_eq!(&*file.content, b"hello");
        assert_eq!(file.fingerprint.as_ref().unwrap().mtime, 100);
        assert!(tree.is_live(created[2]));
    }

    #[test]
    fn test_create_nodes_rejects_unknown_parent() {
        let cloud = cloud();
        let root = cloud.fetch(USER).unwrap().root;
        let before = cloud.version();
        let result = cloud.create_nodes(USER, root, vec![NewNode::folder(2, Some(9), "x")]);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        assert_eq!(cloud.version(), before);
    }

    #[test]
    fn test_unlink_moves_to_rubbish_then_purges() {
        let cloud = cloud();
        let root = cloud.fetch(USER).unwrap().root;
        let h = cloud
            .create_nodes(USER, root, vec![NewNode::folder(1, None, "gone")])
            .unwrap()[0];

        cloud.unlink(USER, h).unwrap();
        let tree = cloud.fetch(USER).unwrap();
        assert_eq!(tree.get(h).unwrap().parent, Some(tree.rubbish));
        assert!(!tree.is_live(h));

        cloud.unlink(USER, h).unwrap();
        assert!(cloud.fetch(USER).unwrap().get(h).is_none());
    }

    #[test]
    fn test_move_node_renames_and_rejects_cycles() {
        let cloud = cloud();
        let root = cloud.fetch(USER).unwrap().root;
        let hs = cloud
            .create_nodes(
                USER,
                root,
                vec![NewNode::folder(1, None, "a"), NewNode::folder(2, Some(1), "b")],
            )
            .unwrap();

        assert!(cloud.move_node(USER, hs[0], hs[1], None).is_err());

        cloud.move_node(USER, hs[1], root, Some("b2")).unwrap();
        let tree = cloud.fetch(USER).unwrap();
        let moved = tree.get(hs[1]).unwrap();
        assert_eq!(moved.name, "b2");
        assert_eq!(moved.parent, Some(root));
        assert!(tree.get(hs[0]).unwrap().children.is_empty());
    }

    #[test]
    fn test_accounts_are_isolated() {
        let cloud = cloud();
        cloud.register_account("bob@example.test", "pw");
        let alice_root = cloud.fetch(USER).unwrap().root;
        assert_eq!(
            cloud.create_nodes("bob@example.test", alice_root, vec![NewNode::folder(1, None, "x")]),
            Err(EngineError::AccessDenied)
        );
    }
}
