use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use twoway_config::HarnessConfig;
use twoway_core::{
    Credentials, EngineError, EngineObserver, Fingerprint, NewNode, NodeHandle, NodeKind,
    RequestTag, SyncCompletion, SyncConfig, SyncEngine, SyncId, SyncRunState, TransferDirection,
    TransferInfo, TreeSnapshot,
};

use crate::cloud::{AccountTree, MemoryCloud};
use crate::planner::{self, SyncAction};
use crate::replica::{split, EngineCache, PersistedSync, ReplicaNode};
use crate::scan;

/// First tag of the engine's own housekeeping requests.
const INTERNAL_TAG_BASE: RequestTag = 1;
/// Internal tags wrap before reaching this value.
const INTERNAL_TAG_LIMIT: RequestTag = 1 << 20;

/// Tuning for a [`ReferenceEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Name of the per-sync folder that receives moved-aside items.
    pub debris_folder: String,
    /// How often every sync is rescanned.
    pub scan_interval: Duration,
    /// Sync actions applied per `exec()` call.
    pub actions_per_exec: usize,
}

impl EngineSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        let config = config.effective();
        EngineSettings {
            debris_folder: config.debris_folder,
            scan_interval: config.engine.scan_interval.as_duration(),
            actions_per_exec: config.engine.actions_per_exec,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from_config(&HarnessConfig::default())
    }
}

enum Request {
    Prelogin(String),
    Login(Credentials),
    FetchNodes,
    CreateNodes {
        parent: NodeHandle,
        nodes: Vec<NewNode>,
    },
    Unlink(NodeHandle),
    Rename {
        node: NodeHandle,
        parent: NodeHandle,
        name: Option<String>,
    },
    AddSync {
        config: SyncConfig,
        completion: SyncCompletion,
    },
    Catchup,
}

struct Session {
    user: String,
    token: String,
}

struct ActiveSync {
    config: SyncConfig,
    base: ReplicaNode,
    state: SyncRunState,
}

/// Single-threaded two-way sync engine backed by a shared [`MemoryCloud`].
///
/// Requests are queued and answered from [`exec`](SyncEngine::exec) with the
/// tag that was active when they were issued. Every `scan_interval`, or when a
/// pass is forced, each sync is compared against its replica base and the
/// resulting actions are applied a bounded number per `exec()`.
pub struct ReferenceEngine {
    cloud: Arc<MemoryCloud>,
    /// Holds `state.json` across local logouts.
    cache_dir: PathBuf,
    settings: EngineSettings,
    observer: Box<dyn EngineObserver>,
    /// Tag stamped on requests issued now.
    tag: RequestTag,
    next_internal_tag: RequestTag,
    requests: VecDeque<(RequestTag, Request)>,
    session: Option<Session>,
    /// Local copy of the account's node tree.
    mirror: Option<AccountTree>,
    /// Syncs read from the cache, waiting for fetch-nodes.
    restoring: Vec<PersistedSync>,
    syncs: BTreeMap<SyncId, ActiveSync>,
    next_sync_id: u64,
    actions: VecDeque<(SyncId, SyncAction)>,
    sync_down: bool,
    last_pass: Option<Instant>,
    /// Replica state changed since the cache was last written.
    dirty: bool,
}

impl ReferenceEngine {
    pub fn new(
        cloud: Arc<MemoryCloud>,
        cache_dir: impl Into<PathBuf>,
        settings: EngineSettings,
        observer: Box<dyn EngineObserver>,
    ) -> Self {
        ReferenceEngine {
            cloud,
            cache_dir: cache_dir.into(),
            settings,
            observer,
            tag: 0,
            next_internal_tag: INTERNAL_TAG_BASE,
            requests: VecDeque::new(),
            session: None,
            mirror: None,
            restoring: Vec::new(),
            syncs: BTreeMap::new(),
            next_sync_id: 0,
            actions: VecDeque::new(),
            sync_down: false,
            last_pass: None,
            dirty: false,
        }
    }

    fn internal_tag(&mut self) -> RequestTag {
        let tag = self.next_internal_tag;
        self.next_internal_tag += 1;
        if self.next_internal_tag >= INTERNAL_TAG_LIMIT {
            self.next_internal_tag = INTERNAL_TAG_BASE;
        }
        tag
    }

    fn current_user(&self) -> Result<String, EngineError> {
        self.session
            .as_ref()
            .map(|s| s.user.clone())
            .ok_or(EngineError::NotLoggedIn)
    }

    fn refresh_mirror(&mut self) {
        let Some(version) = self.mirror.as_ref().map(|m| m.version) else {
            return;
        };
        if version == self.cloud.version() {
            return;
        }
        let Ok(user) = self.current_user() else {
            return;
        };
        match self.cloud.fetch(&user) {
            Ok(tree) => self.mirror = Some(tree),
            Err(e) => warn!("engine: mirror refresh failed: {}", e),
        }
    }

    fn pass_due(&self) -> bool {
        match self.last_pass {
            Some(at) => at.elapsed() >= self.settings.scan_interval,
            None => true,
        }
    }

    fn persist(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let syncs = self
            .syncs
            .iter()
            .map(|(id, s)| PersistedSync {
                id: *id,
                config: s.config.clone(),
                base: s.base.clone(),
            })
            .chain(self.restoring.iter().cloned())
            .collect();
        let cache = EngineCache {
            user: Some(session.user.clone()),
            session: Some(session.token.clone()),
            next_sync_id: self.next_sync_id,
            syncs,
        };
        match cache.store(&self.cache_dir) {
            Ok(()) => self.dirty = false,
            Err(e) => warn!("engine: failed to write cache: {}", e),
        }
    }

    fn clear_memory(&mut self) {
        self.mirror = None;
        self.restoring.clear();
        self.syncs.clear();
        self.actions.clear();
        self.sync_down = false;
        self.last_pass = None;
        self.dirty = false;
    }

    fn fail_requests(&mut self, error: EngineError) {
        while let Some((tag, request)) = self.requests.pop_front() {
            self.fail(tag, request, error.clone());
        }
    }

    fn fail(&mut self, tag: RequestTag, request: Request, error: EngineError) {
        match request {
            Request::Prelogin(_) => self.observer.prelogin_result(tag, Err(error)),
            Request::Login(_) => self.observer.login_result(tag, Err(error)),
            Request::FetchNodes => self.observer.fetchnodes_result(tag, Err(error)),
            Request::CreateNodes { .. } => self.observer.putnodes_result(tag, Err(error), &[]),
            Request::Unlink(node) => self.observer.unlink_result(tag, node, Err(error)),
            Request::Rename { node, .. } => self.observer.rename_result(tag, node, Err(error)),
            Request::AddSync { completion, .. } => completion(Err(error)),
            Request::Catchup => self.observer.catchup_result(tag),
        }
    }

    fn answer(&mut self, tag: RequestTag, request: Request) {
        match request {
            Request::Prelogin(user) => {
                let result = self.cloud.prelogin(&user).map(|_salt| ());
                self.observer.prelogin_result(tag, result);
            }
            Request::Login(credentials) => {
                let result = self.login_now(&credentials);
                self.observer.login_result(tag, result);
            }
            Request::FetchNodes => {
                let result = self.fetch_nodes_now();
                self.observer.fetchnodes_result(tag, result);
            }
            Request::CreateNodes { parent, nodes } => {
                let result = self
                    .current_user()
                    .and_then(|user| self.cloud.create_nodes(&user, parent, nodes));
                self.refresh_mirror();
                match result {
                    Ok(created) => self.observer.putnodes_result(tag, Ok(()), &created),
                    Err(e) => self.observer.putnodes_result(tag, Err(e), &[]),
                }
            }
            Request::Unlink(node) => {
                let result = self
                    .current_user()
                    .and_then(|user| self.cloud.unlink(&user, node));
                self.refresh_mirror();
                self.observer.unlink_result(tag, node, result);
            }
            Request::Rename { node, parent, name } => {
                let result = self.current_user().and_then(|user| {
                    self.cloud.move_node(&user, node, parent, name.as_deref())
                });
                self.refresh_mirror();
                self.observer.rename_result(tag, node, result);
            }
            Request::AddSync { config, completion } => {
                let result = self.add_sync_now(config);
                completion(result);
            }
            Request::Catchup => {
                self.refresh_mirror();
                self.observer.catchup_result(tag);
            }
        }
        self.observer.activity();
    }

    fn login_now(&mut self, credentials: &Credentials) -> Result<(), EngineError> {
        match credentials {
            Credentials::Password { user, password } => {
                let token = self.cloud.login(user, password)?;
                self.clear_memory();
                info!("engine: logged in as {}", user);
                self.session = Some(Session {
                    user: user.clone(),
                    token,
                });
            }
            Credentials::Session(token) => {
                let user = self.cloud.resume_session(token)?;
                self.clear_memory();
                let cache = EngineCache::load(&self.cache_dir)
                    .map_err(|e| EngineError::Io(e.to_string()))?;
                if let Some(cache) = cache.filter(|c| c.session.as_deref() == Some(token.as_str()))
                {
                    self.next_sync_id = self.next_sync_id.max(cache.next_sync_id);
                    self.restoring = cache.syncs;
                }
                info!(
                    "engine: resumed session for {} ({} cached sync(s))",
                    user,
                    self.restoring.len()
                );
                self.session = Some(Session {
                    user,
                    token: token.clone(),
                });
            }
        }
        Ok(())
    }

    fn fetch_nodes_now(&mut self) -> Result<(), EngineError> {
        let user = self.current_user()?;
        let tree = self.cloud.fetch(&user)?;

        for persisted in std::mem::take(&mut self.restoring) {
            let live = tree
                .get(persisted.config.remote_root)
                .map(|n| n.kind == NodeKind::Folder && tree.is_live(n.handle))
                .unwrap_or(false);
            if !live {
                warn!(
                    "engine: dropping cached {}: remote root {} is gone",
                    persisted.id, persisted.config.remote_root
                );
                continue;
            }
            info!(
                "engine: restored {} at {}",
                persisted.id,
                persisted.config.local_path.display()
            );
            self.observer.sync_added(persisted.id, &persisted.config);
            self.observer
                .sync_state_changed(persisted.id, &SyncRunState::Active);
            self.syncs.insert(
                persisted.id,
                ActiveSync {
                    config: persisted.config,
                    base: persisted.base,
                    state: SyncRunState::Active,
                },
            );
        }

        self.mirror = Some(tree);
        self.sync_down = true;
        self.persist();
        Ok(())
    }

    fn add_sync_now(&mut self, config: SyncConfig) -> Result<SyncId, EngineError> {
        self.current_user()?;
        let mirror = self.mirror.as_ref().ok_or(EngineError::NotLoggedIn)?;
        match mirror.get(config.remote_root) {
            Some(node) if node.kind == NodeKind::Folder && mirror.is_live(node.handle) => {}
            _ => {
                return Err(EngineError::NotFound(format!(
                    "remote folder {}",
                    config.remote_root
                )))
            }
        }
        if self
            .syncs
            .values()
            .any(|s| s.config.local_path == config.local_path)
        {
            return Err(EngineError::AlreadyExists(
                config.local_path.display().to_string(),
            ));
        }
        let meta = fs::metadata(&config.local_path)?;
        if !meta.is_dir() {
            return Err(EngineError::InvalidArgument(format!(
                "{} is not a directory",
                config.local_path.display()
            )));
        }

        self.next_sync_id += 1;
        let id = SyncId(self.next_sync_id);
        let base = ReplicaNode::folder(&config.name, Some(config.remote_root), scan::inode_of(&meta));
        info!(
            "engine: added {} {} <-> {}",
            id,
            config.local_path.display(),
            config.remote_root
        );
        self.observer.sync_added(id, &config);
        self.observer.sync_state_changed(id, &SyncRunState::Active);
        self.syncs.insert(
            id,
            ActiveSync {
                config,
                base,
                state: SyncRunState::Active,
            },
        );
        self.sync_down = true;
        self.persist();
        Ok(id)
    }

    fn plan_pass(&mut self) {
        let Some(mirror) = self.mirror.as_ref() else {
            return;
        };
        let debris = self.settings.debris_folder.as_str();
        let mut failed = Vec::new();

        for (id, sync) in &self.syncs {
            if sync.state != SyncRunState::Active {
                continue;
            }
            if !mirror.is_live(sync.config.remote_root) {
                failed.push((*id, "remote root is gone".to_string()));
                continue;
            }
            let local = match scan::scan(&sync.config.local_path, debris) {
                Ok(local) => local,
                Err(e) => {
                    failed.push((*id, format!("local scan failed: {}", e)));
                    continue;
                }
            };
            let remote = planner::remote_entries(mirror, sync.config.remote_root, debris, &sync.base);
            let planned = planner::plan(&local, &remote, &sync.base);
            if !planned.is_empty() {
                debug!("engine: {} planned {} action(s)", id, planned.len());
            }
            self.actions.extend(planned.into_iter().map(|a| (*id, a)));
        }

        for (id, reason) in failed {
            warn!("engine: {} failed: {}", id, reason);
            let state = SyncRunState::Failed(reason);
            self.observer.sync_state_changed(id, &state);
            if let Some(sync) = self.syncs.get_mut(&id) {
                sync.state = state;
            }
        }
    }

    fn apply(&mut self, id: SyncId, action: SyncAction) {
        match self.try_apply(id, &action) {
            Ok(()) => {
                self.dirty = true;
                self.observer.activity();
            }
            // Left for the next pass to replan
            Err(e) if e.is_transient() || matches!(e, EngineError::NotFound(_)) => {
                debug!("engine: {} deferred {}: {}", id, action.path(), e)
            }
            Err(e) => warn!("engine: {} {} failed: {:?}: {}", id, action.path(), action, e),
        }
    }

    fn try_apply(&mut self, id: SyncId, action: &SyncAction) -> Result<(), EngineError> {
        let user = self.current_user()?;
        let tag = self.internal_tag();
        let debris = self.settings.debris_folder.as_str();
        let Some(sync) = self.syncs.get_mut(&id) else {
            return Ok(());
        };
        let root = sync.config.local_path.as_path();

        match action {
            SyncAction::Upload { path, replaces } => {
                let (parent, name) = split(path);
                let parent_handle = remote_parent(&sync.base, parent, path)?;
                let local_path = root.join(path);
                let meta = fs::metadata(&local_path)?;
                let content = fs::read(&local_path)?;
                let mtime = scan::mtime_secs(&meta);
                let fingerprint = Fingerprint::of(&content, mtime);
                let transfer = TransferInfo {
                    sync: id,
                    direction: TransferDirection::Upload,
                    path: PathBuf::from(path),
                    size: fingerprint.size,
                };
                self.observer.transfer_added(&transfer);
                self.observer.transfer_prepared(&transfer);
                let created = match self.cloud.create_nodes(
                    &user,
                    parent_handle,
                    vec![NewNode::file(0, None, name, content, mtime)],
                ) {
                    Ok(created) => created,
                    Err(e) => {
                        self.observer.transfer_failed(&transfer, &e);
                        self.observer.transfer_removed(&transfer);
                        return Err(e);
                    }
                };
                let handle = created
                    .first()
                    .copied()
                    .ok_or_else(|| EngineError::Other("empty putnodes result".to_string()))?;
                self.observer.transfer_updated(&transfer, transfer.size);
                self.observer.transfer_complete(&transfer);
                self.observer.transfer_removed(&transfer);
                self.observer.putnodes_result(tag, Ok(()), &created);

                if let Some(old) = replaces {
                    let result = self.cloud.unlink(&user, *old);
                    self.observer.unlink_result(tag, *old, result);
                }
                sync.base.upsert(
                    path,
                    ReplicaNode::file(name, fingerprint, Some(handle), scan::inode_of(&meta)),
                );
                self.observer.remote_node_added(id, handle, Path::new(path));
            }

            SyncAction::CreateRemoteFolder { path } => {
                let (parent, name) = split(path);
                let parent_handle = remote_parent(&sync.base, parent, path)?;
                let meta = fs::symlink_metadata(root.join(path))?;
                let created = self.cloud.create_nodes(
                    &user,
                    parent_handle,
                    vec![NewNode::folder(0, None, name)],
                )?;
                self.observer.putnodes_result(tag, Ok(()), &created);
                let handle = created
                    .first()
                    .copied()
                    .ok_or_else(|| EngineError::Other("empty putnodes result".to_string()))?;
                sync.base.upsert(
                    path,
                    ReplicaNode::folder(name, Some(handle), scan::inode_of(&meta)),
                );
                self.observer.remote_node_added(id, handle, Path::new(path));
            }

            SyncAction::Download { path, handle } => {
                let mirror = self.mirror.as_ref().ok_or(EngineError::NotLoggedIn)?;
                let node = mirror
                    .get(*handle)
                    .ok_or_else(|| EngineError::NotFound(format!("node {}", handle)))?;
                let (parent, name) = split(path);
                if !root.join(parent).is_dir() {
                    return Err(EngineError::NotFound(format!("local parent of {}", path)));
                }

                let tmp = root.join(debris).join("tmp");
                fs::create_dir_all(&tmp)?;
                let lock = tmp.join("lock");
                if !lock.exists() {
                    fs::write(&lock, b"")?;
                }

                let transfer = TransferInfo {
                    sync: id,
                    direction: TransferDirection::Download,
                    path: PathBuf::from(path),
                    size: node.content.len() as u64,
                };
                self.observer.transfer_added(&transfer);
                self.observer.transfer_prepared(&transfer);
                let mtime = node.fingerprint.as_ref().map(|f| f.mtime).unwrap_or(0);
                let part = tmp.join(format!("{}.part", name));
                if let Err(e) = write_part(&part, &node.content, mtime)
                    .and_then(|()| fs::rename(&part, root.join(path)))
                {
                    let _ = fs::remove_file(&part);
                    let error = EngineError::from(e);
                    self.observer.transfer_failed(&transfer, &error);
                    self.observer.transfer_removed(&transfer);
                    return Err(error);
                }
                self.observer.transfer_updated(&transfer, transfer.size);
                self.observer.transfer_complete(&transfer);
                self.observer.transfer_removed(&transfer);

                let found = scan::describe(&root.join(path))?
                    .ok_or_else(|| EngineError::Incomplete(format!("{} vanished", path)))?;
                let fingerprint = found
                    .fingerprint
                    .unwrap_or_else(|| Fingerprint::of(&node.content, mtime));
                sync.base.upsert(
                    path,
                    ReplicaNode::file(name, fingerprint, Some(*handle), found.inode),
                );
                self.observer
                    .local_node_added(id, Path::new(path), NodeKind::File);
            }

            SyncAction::CreateLocalFolder { path, handle } => {
                let target = root.join(path);
                match fs::create_dir(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists && target.is_dir() => {}
                    Err(e) => return Err(e.into()),
                }
                let meta = fs::symlink_metadata(&target)?;
                let name = split(path).1;
                if !sync.base.upsert(
                    path,
                    ReplicaNode::folder(name, Some(*handle), scan::inode_of(&meta)),
                ) {
                    return Err(EngineError::NotFound(format!("base parent of {}", path)));
                }
                self.observer
                    .local_node_added(id, Path::new(path), NodeKind::Folder);
            }

            SyncAction::Adopt {
                path,
                handle,
                entry,
            } => {
                let node = ReplicaNode {
                    name: split(path).1.to_string(),
                    kind: entry.kind,
                    fingerprint: entry.fingerprint.clone(),
                    handle: Some(*handle),
                    inode: entry.inode,
                    children: BTreeMap::new(),
                };
                if !sync.base.upsert(path, node) {
                    return Err(EngineError::NotFound(format!("base parent of {}", path)));
                }
            }

            SyncAction::MoveLocalToDebris { path } => {
                let source = root.join(path);
                let kind = scan::describe(&source)?
                    .map(|e| e.kind)
                    .ok_or_else(|| EngineError::NotFound(path.clone()))?;
                let day = chrono::Local::now().format("%Y-%m-%d").to_string();
                let day_dir = root.join(debris).join(day);
                fs::create_dir_all(&day_dir)?;
                let dest = free_name(&day_dir, split(path).1);
                fs::rename(&source, &dest)?;
                debug!("engine: {} moved {} to {}", id, path, dest.display());
                sync.base.remove(path);
                self.observer.local_node_deleted(id, Path::new(path), kind);
            }

            SyncAction::UnlinkRemote { path, handle } => {
                let result = self.cloud.unlink(&user, *handle);
                self.observer.unlink_result(tag, *handle, result.clone());
                result?;
                sync.base.remove(path);
                self.observer
                    .remote_node_deleted(id, *handle, Path::new(path));
            }

            SyncAction::ForgetBase { path } => {
                sync.base.remove(path);
            }

            SyncAction::MoveRemote { from, to, handle } => {
                let (to_parent, to_name) = split(to);
                let parent_handle = remote_parent(&sync.base, to_parent, to)?;
                let new_name = (split(from).1 != to_name).then_some(to_name);
                let result = self.cloud.move_node(&user, *handle, parent_handle, new_name);
                self.observer.rename_result(tag, *handle, result.clone());
                result?;
                if !sync.base.relocate(from, to) {
                    return Err(EngineError::Other(format!(
                        "replica could not follow {} -> {}",
                        from, to
                    )));
                }
                self.observer
                    .local_node_moved(id, Path::new(from), Path::new(to));
            }

            SyncAction::MoveLocal { from, to } => {
                fs::rename(root.join(from), root.join(to))?;
                if !sync.base.relocate(from, to) {
                    return Err(EngineError::Other(format!(
                        "replica could not follow {} -> {}",
                        from, to
                    )));
                }
                let handle = sync.base.get(to).and_then(|n| n.handle);
                if let Some(handle) = handle {
                    self.observer
                        .remote_node_moved(id, handle, Path::new(from), Path::new(to));
                }
            }
        }

        Ok(())
    }
}

fn remote_parent(base: &ReplicaNode, parent: &str, path: &str) -> Result<NodeHandle, EngineError> {
    base.get(parent)
        .and_then(|p| p.handle)
        .ok_or_else(|| EngineError::NotFound(format!("remote parent of {}", path)))
}

fn write_part(part: &Path, content: &[u8], mtime: i64) -> io::Result<()> {
    fs::write(part, content)?;
    let file = fs::OpenOptions::new().write(true).open(part)?;
    file.set_modified(scan::system_time(mtime))
}

/// `dir/name`, or `dir/name (n)` for the first `n` not already taken.
fn free_name(dir: &Path, name: &str) -> PathBuf {
    let mut candidate = dir.join(name);
    let mut n = 1;
    while fs::symlink_metadata(&candidate).is_ok() {
        candidate = dir.join(format!("{} ({})", name, n));
        n += 1;
    }
    candidate
}

fn snapshot(tree: &AccountTree, handle: NodeHandle) -> Option<TreeSnapshot> {
    let node = tree.get(handle)?;
    Some(TreeSnapshot {
        name: node.name.clone(),
        kind: node.kind,
        handle: Some(handle),
        fingerprint: node.fingerprint.clone(),
        children: node
            .children
            .iter()
            .filter_map(|h| snapshot(tree, *h))
            .collect(),
    })
}

impl SyncEngine for ReferenceEngine {
    fn set_request_tag(&mut self, tag: RequestTag) -> RequestTag {
        std::mem::replace(&mut self.tag, tag)
    }

    fn prelogin(&mut self, user: &str) {
        self.requests
            .push_back((self.tag, Request::Prelogin(user.to_string())));
    }

    fn login(&mut self, credentials: &Credentials) {
        self.requests
            .push_back((self.tag, Request::Login(credentials.clone())));
    }

    fn fetch_nodes(&mut self, _use_cache: bool) {
        self.requests.push_back((self.tag, Request::FetchNodes));
    }

    fn create_nodes(&mut self, parent: NodeHandle, nodes: Vec<NewNode>) {
        self.requests
            .push_back((self.tag, Request::CreateNodes { parent, nodes }));
    }

    fn unlink(&mut self, node: NodeHandle) {
        self.requests.push_back((self.tag, Request::Unlink(node)));
    }

    fn rename(&mut self, node: NodeHandle, new_parent: NodeHandle, new_name: Option<&str>) {
        self.requests.push_back((
            self.tag,
            Request::Rename {
                node,
                parent: new_parent,
                name: new_name.map(str::to_string),
            },
        ));
    }

    fn add_sync(&mut self, config: SyncConfig, completion: SyncCompletion) {
        self.requests
            .push_back((self.tag, Request::AddSync { config, completion }));
    }

    fn remove_syncs(&mut self, predicate: &mut dyn FnMut(SyncId, &SyncConfig) -> bool) -> usize {
        let doomed: Vec<SyncId> = self
            .syncs
            .iter()
            .filter(|(id, s)| predicate(**id, &s.config))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.syncs.remove(id);
            self.observer.sync_removed(*id);
            info!("engine: removed {}", id);
        }
        self.actions.retain(|(id, _)| !doomed.contains(id));
        if !doomed.is_empty() {
            self.persist();
        }
        doomed.len()
    }

    fn catchup(&mut self) {
        self.requests.push_back((self.tag, Request::Catchup));
    }

    fn local_logout(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.persist();
        self.fail_requests(EngineError::Incomplete("local logout".to_string()));
        self.session = None;
        self.clear_memory();
        info!("engine: local logout, cache kept in {}", self.cache_dir.display());
    }

    fn logout(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.cloud.end_session(&session.token);
        self.fail_requests(EngineError::NotLoggedIn);
        self.clear_memory();
        if let Err(e) = EngineCache::clear(&self.cache_dir) {
            warn!("engine: failed to clear cache: {}", e);
        }
        info!("engine: logged out {}", session.user);
    }

    fn dump_session(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.token.clone())
    }

    fn root_handle(&self) -> Option<NodeHandle> {
        self.mirror.as_ref().map(|m| m.root)
    }

    fn rubbish_handle(&self) -> Option<NodeHandle> {
        self.mirror.as_ref().map(|m| m.rubbish)
    }

    fn children_named(&self, parent: NodeHandle, name: &str) -> Vec<NodeHandle> {
        let Some(mirror) = &self.mirror else {
            return Vec::new();
        };
        mirror
            .get(parent)
            .map(|p| {
                p.children
                    .iter()
                    .filter(|h| mirror.get(**h).map(|c| c.name == name).unwrap_or(false))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn node_kind(&self, node: NodeHandle) -> Option<NodeKind> {
        self.mirror.as_ref()?.get(node).map(|n| n.kind)
    }

    fn remote_tree(&self, node: NodeHandle) -> Option<TreeSnapshot> {
        snapshot(self.mirror.as_ref()?, node)
    }

    fn syncs(&self) -> Vec<(SyncId, SyncConfig)> {
        self.syncs
            .iter()
            .map(|(id, s)| (*id, s.config.clone()))
            .collect()
    }

    fn replica_tree(&self, sync: SyncId) -> Option<TreeSnapshot> {
        self.syncs.get(&sync).map(|s| s.base.to_snapshot())
    }

    fn is_busy(&self) -> bool {
        !self.requests.is_empty() || !self.actions.is_empty() || self.sync_down
    }

    fn request_sync_down(&mut self) {
        if self.mirror.is_some() {
            self.sync_down = true;
        }
    }

    fn prepare_wait(&mut self) -> Option<Duration> {
        if self.is_busy() {
            return Some(Duration::ZERO);
        }
        if self.syncs.is_empty() {
            return None;
        }
        let since = self.last_pass.map(|at| at.elapsed()).unwrap_or_default();
        Some(self.settings.scan_interval.saturating_sub(since))
    }

    fn check_events(&mut self) -> bool {
        let before = self.mirror.as_ref().map(|m| m.version);
        self.refresh_mirror();
        let after = self.mirror.as_ref().map(|m| m.version);
        before != after || (!self.syncs.is_empty() && self.pass_due())
    }

    fn exec(&mut self) {
        while let Some((tag, request)) = self.requests.pop_front() {
            self.answer(tag, request);
        }
        if self.session.is_none() || self.mirror.is_none() {
            return;
        }

        self.refresh_mirror();
        if self.actions.is_empty() && (self.sync_down || self.pass_due()) {
            self.sync_down = false;
            self.last_pass = Some(Instant::now());
            self.plan_pass();
        }

        for _ in 0..self.settings.actions_per_exec.max(1) {
            let Some((id, action)) = self.actions.pop_front() else {
                break;
            };
            self.apply(id, action);
        }

        if self.actions.is_empty() && self.dirty {
            self.persist();
        }
    }
}
