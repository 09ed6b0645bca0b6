//! One simulated device: an engine instance owned by a dedicated worker
//! thread, driven from test code through the mailbox and tag-correlated
//! continuations.

use std::collections::HashSet;
use std::fs;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use twoway_core::{
    Category, Credentials, EngineError, EngineObserver, NewNode, NodeHandle, NodeKind, RequestTag,
    SyncConfig, SyncEngine, SyncId, SyncRunState, TransferInfo, TreeSnapshot,
};

use crate::bridge::{self, CommandFuture, Job, Mailbox, Promise};
use crate::context::HarnessContext;
use crate::dispatch::{Continuation, Dispatcher};
use crate::error::HarnessError;
use crate::model::ModelNode;
use crate::reconcile::{match_tree, FsNode, MatchPolicy, MatchReport, Mismatch, Source};

/// Which views of a sync [`TestAgent::confirm_model`] checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirm(u8);

impl Confirm {
    pub const LOCAL_FS: Confirm = Confirm(1);
    pub const LOCAL_NODE: Confirm = Confirm(1 << 1);
    pub const LOCAL: Confirm = Confirm(1 | 1 << 1);
    pub const REMOTE: Confirm = Confirm(1 << 2);
    pub const ALL: Confirm = Confirm(1 | 1 << 1 | 1 << 2);

    pub fn contains(self, other: Confirm) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Confirm {
    type Output = Confirm;

    fn bitor(self, rhs: Confirm) -> Confirm {
        Confirm(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounts {
    pub added: u64,
    pub completed: u64,
    pub failed: u64,
}

/// State touched by both the worker thread and test code.
struct AgentShared {
    name: String,
    dispatcher: Mutex<Dispatcher>,
    last_callback: Mutex<Instant>,
    log_callbacks: AtomicBool,
    transfers_added: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_failed: AtomicU64,
    /// Absolute local paths whose content is not compared.
    may_differ: Mutex<HashSet<PathBuf>>,
}

/// Registered with the engine; routes results into the dispatcher.
struct AgentObserver {
    shared: Arc<AgentShared>,
}

impl AgentObserver {
    fn seen(&self, event: impl FnOnce() -> String) {
        *self.shared.last_callback.lock() = Instant::now();
        if self.shared.log_callbacks.load(Ordering::Relaxed) {
            debug!("{}: {}", self.shared.name, event());
        }
    }

    fn deliver(
        &self,
        category: Category,
        tag: RequestTag,
        result: Result<(), EngineError>,
        handles: &[NodeHandle],
    ) {
        self.seen(|| format!("{} result for tag {}: {:?}", category, tag, result));
        self.shared
            .dispatcher
            .lock()
            .deliver(category, tag, &result, handles);
    }
}

impl EngineObserver for AgentObserver {
    fn prelogin_result(&mut self, tag: RequestTag, result: Result<(), EngineError>) {
        self.deliver(Category::Prelogin, tag, result, &[]);
    }

    fn login_result(&mut self, tag: RequestTag, result: Result<(), EngineError>) {
        self.deliver(Category::Login, tag, result, &[]);
    }

    fn fetchnodes_result(&mut self, tag: RequestTag, result: Result<(), EngineError>) {
        self.deliver(Category::FetchNodes, tag, result, &[]);
    }

    fn putnodes_result(
        &mut self,
        tag: RequestTag,
        result: Result<(), EngineError>,
        created: &[NodeHandle],
    ) {
        self.deliver(Category::PutNodes, tag, result, created);
    }

    fn unlink_result(&mut self, tag: RequestTag, handle: NodeHandle, result: Result<(), EngineError>) {
        self.deliver(Category::Unlink, tag, result, &[handle]);
    }

    fn rename_result(&mut self, tag: RequestTag, handle: NodeHandle, result: Result<(), EngineError>) {
        self.deliver(Category::Rename, tag, result, &[handle]);
    }

    fn catchup_result(&mut self, tag: RequestTag) {
        self.deliver(Category::Catchup, tag, Ok(()), &[]);
    }

    fn transfer_added(&mut self, transfer: &TransferInfo) {
        self.shared.transfers_added.fetch_add(1, Ordering::Relaxed);
        self.seen(|| format!("transfer added {}", transfer.path.display()));
    }

    fn transfer_removed(&mut self, transfer: &TransferInfo) {
        self.seen(|| format!("transfer removed {}", transfer.path.display()));
    }

    fn transfer_prepared(&mut self, transfer: &TransferInfo) {
        self.seen(|| format!("transfer prepared {}", transfer.path.display()));
    }

    fn transfer_failed(&mut self, transfer: &TransferInfo, err: &EngineError) {
        self.shared.transfers_failed.fetch_add(1, Ordering::Relaxed);
        self.seen(|| format!("transfer failed {}: {}", transfer.path.display(), err));
    }

    fn transfer_updated(&mut self, transfer: &TransferInfo, done: u64) {
        self.seen(|| format!("transfer {} at {}/{}", transfer.path.display(), done, transfer.size));
    }

    fn transfer_complete(&mut self, transfer: &TransferInfo) {
        self.shared.transfers_completed.fetch_add(1, Ordering::Relaxed);
        self.seen(|| format!("transfer complete {}", transfer.path.display()));
    }

    fn sync_added(&mut self, sync: SyncId, config: &SyncConfig) {
        self.seen(|| format!("{} added at {}", sync, config.local_path.display()));
    }

    fn sync_removed(&mut self, sync: SyncId) {
        self.seen(|| format!("{} removed", sync));
    }

    fn sync_state_changed(&mut self, sync: SyncId, state: &SyncRunState) {
        self.seen(|| format!("{} is now {:?}", sync, state));
    }

    fn local_node_added(&mut self, sync: SyncId, path: &Path, kind: NodeKind) {
        self.seen(|| format!("{} local {} added {}", sync, kind, path.display()));
    }

    fn local_node_deleted(&mut self, sync: SyncId, path: &Path, kind: NodeKind) {
        self.seen(|| format!("{} local {} deleted {}", sync, kind, path.display()));
    }

    fn local_node_moved(&mut self, sync: SyncId, from: &Path, to: &Path) {
        self.seen(|| format!("{} local moved {} -> {}", sync, from.display(), to.display()));
    }

    fn remote_node_added(&mut self, sync: SyncId, handle: NodeHandle, path: &Path) {
        self.seen(|| format!("{} remote {} added {}", sync, handle, path.display()));
    }

    fn remote_node_deleted(&mut self, sync: SyncId, handle: NodeHandle, path: &Path) {
        self.seen(|| format!("{} remote {} deleted {}", sync, handle, path.display()));
    }

    fn remote_node_moved(&mut self, sync: SyncId, handle: NodeHandle, from: &Path, to: &Path) {
        self.seen(|| {
            format!(
                "{} remote {} moved {} -> {}",
                sync,
                handle,
                from.display(),
                to.display()
            )
        });
    }

    fn activity(&mut self) {
        *self.shared.last_callback.lock() = Instant::now();
    }
}

/// Everything the worker thread owns. Jobs posted with
/// [`TestAgent::thread_do`] run against it between engine iterations.
pub struct AgentCore {
    pub engine: Box<dyn SyncEngine>,
    shared: Arc<AgentShared>,
    context: Arc<HarnessContext>,
}

impl AgentCore {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    /// Issue one engine request under a fresh tag and queue `continuation`
    /// for its result. The continuation is queued before the request runs,
    /// so a synchronous answer still finds it.
    pub fn submit(
        &mut self,
        category: Category,
        target: Option<NodeHandle>,
        request: impl FnOnce(&mut dyn SyncEngine),
        continuation: Continuation,
    ) -> RequestTag {
        let tag = self.context.next_tag();
        self.shared
            .dispatcher
            .lock()
            .enqueue(category, tag, target, continuation);
        let previous = self.engine.set_request_tag(tag);
        request(self.engine.as_mut());
        self.engine.set_request_tag(previous);
        tag
    }

    /// The test base folder directly under the account root.
    pub fn base_folder(&self) -> Option<NodeHandle> {
        let root = self.engine.root_handle()?;
        let name = &self.context.config().remote_base_folder;
        self.engine.children_named(root, name).first().copied()
    }

    /// Resolve a slash path below the base folder; the empty path is the
    /// base folder itself.
    pub fn resolve(&self, path: &str) -> Option<NodeHandle> {
        let mut node = self.base_folder()?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = self.engine.children_named(node, part).first().copied()?;
        }
        Some(node)
    }

    fn resolve_or_err(&self, path: &str) -> Result<NodeHandle, HarnessError> {
        self.resolve(path)
            .ok_or_else(|| HarnessError::PathNotFound(path.to_string()))
    }
}

/// Resolve `promise` with the first delivery.
fn settle(promise: Promise<Result<(), HarnessError>>) -> Continuation {
    let mut promise = Some(promise);
    Box::new(move |result, _| {
        if let Some(p) = promise.take() {
            p.set(result.clone().map_err(HarnessError::from));
        }
        true
    })
}

/// Resolve `promise` once `parts` deliveries have arrived, with the first
/// error seen if any.
fn settle_after(parts: usize, promise: Promise<Result<(), HarnessError>>) -> Continuation {
    let mut promise = Some(promise);
    let mut remaining = parts;
    let mut first_error = None;
    Box::new(move |result, _| {
        if let Err(e) = result {
            if first_error.is_none() {
                first_error = Some(e.clone());
            }
        }
        remaining = remaining.saturating_sub(1);
        if remaining > 0 {
            return false;
        }
        if let Some(p) = promise.take() {
            p.set(match first_error.take() {
                Some(e) => Err(e.into()),
                None => Ok(()),
            });
        }
        true
    })
}

fn settle_created(promise: Promise<Result<Vec<NodeHandle>, HarnessError>>) -> Continuation {
    let mut promise = Some(promise);
    Box::new(move |result, handles| {
        if let Some(p) = promise.take() {
            p.set(
                result
                    .clone()
                    .map(|()| handles.to_vec())
                    .map_err(HarnessError::from),
            );
        }
        true
    })
}

/// Flatten a model subtree into a create-nodes batch.
fn model_batch(node: &ModelNode) -> Vec<NewNode> {
    let mtime = chrono::Utc::now().timestamp();
    let mut out = Vec::new();
    let mut pending: Vec<(&ModelNode, Option<u32>)> = vec![(node, None)];
    while let Some((node, parent)) = pending.pop() {
        let id = out.len() as u32;
        match node.kind {
            NodeKind::Folder => {
                out.push(NewNode::folder(id, parent, node.name.clone()));
                pending.extend(node.kids.iter().map(|k| (k, Some(id))));
            }
            NodeKind::File => {
                out.push(NewNode::file(id, parent, node.name.clone(), node.content.clone(), mtime));
            }
        }
    }
    out
}

/// Read a local folder into a create-nodes batch, keeping file mtimes.
fn local_batch(root: &Path) -> Result<Vec<NewNode>, HarnessError> {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| HarnessError::Setup(format!("{} has no folder name", root.display())))?;
    let mut out = vec![NewNode::folder(0, None, name)];
    let mut pending = vec![(root.to_path_buf(), 0u32)];
    while let Some((dir, parent)) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = out.len() as u32;
            if kind.is_dir() {
                out.push(NewNode::folder(id, Some(parent), name));
                pending.push((entry.path(), id));
            } else if kind.is_file() {
                let content = fs::read(entry.path())?;
                let mtime = entry
                    .metadata()?
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                out.push(NewNode::file(id, Some(parent), name, content, mtime));
            }
        }
    }
    Ok(out)
}

fn split_parent(path: &str) -> (&str, &str) {
    let path = path.trim_matches('/');
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One engine iteration. Returns false when the agent has been dropped.
fn run_once(core: &mut AgentCore, jobs: &Receiver<Job<AgentCore>>, idle: Duration) -> bool {
    let wait = core
        .engine
        .prepare_wait()
        .map_or(idle, |deadline| deadline.min(idle));
    let job = match jobs.recv_timeout(wait) {
        Ok(job) => Some(job),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => return false,
    };
    core.engine.check_events();
    if let Some(job) = job {
        job(core);
    }
    core.engine.exec();
    true
}

fn worker(
    context: Arc<HarnessContext>,
    shared: Arc<AgentShared>,
    cache_dir: PathBuf,
    jobs: Receiver<Job<AgentCore>>,
) {
    let observer = Box::new(AgentObserver {
        shared: shared.clone(),
    });
    let engine = context.factory().create(&cache_dir, observer);
    let idle = context.config().engine.idle_wait.as_duration();
    let mut core = AgentCore {
        engine,
        shared: shared.clone(),
        context,
    };
    info!("{}: worker started", shared.name);

    loop {
        match panic::catch_unwind(AssertUnwindSafe(|| run_once(&mut core, &jobs, idle))) {
            Ok(true) => {}
            Ok(false) => break,
            Err(cause) => {
                error!(
                    "{}: worker panicked, agent is unusable: {}",
                    shared.name,
                    panic_message(cause.as_ref())
                );
                break;
            }
        }
    }

    let dropped = shared.dispatcher.lock().clear();
    if dropped > 0 {
        warn!("{}: {} pending operation(s) abandoned", shared.name, dropped);
    }
    info!("{}: worker stopped", shared.name);
}

/// A simulated user device. Dropping it logs the engine out on its own
/// thread and joins the worker.
pub struct TestAgent {
    name: String,
    context: Arc<HarnessContext>,
    shared: Arc<AgentShared>,
    fs_base_path: PathBuf,
    mailbox: Option<Mailbox<AgentCore>>,
    worker: Option<JoinHandle<()>>,
}

impl TestAgent {
    /// Start an agent whose local folders live in `<base_dir>/<name>`.
    /// An agent recreated under the same name finds its engine cache intact.
    pub fn new(context: Arc<HarnessContext>, name: &str) -> Result<Self, HarnessError> {
        let base_dir = context.base_dir();
        let fs_base_path = base_dir.join(name);
        let cache_dir = base_dir.join(".cache").join(name);
        fs::create_dir_all(&fs_base_path)?;
        fs::create_dir_all(&cache_dir)?;

        let shared = Arc::new(AgentShared {
            name: name.to_string(),
            dispatcher: Mutex::new(Dispatcher::new()),
            last_callback: Mutex::new(Instant::now()),
            log_callbacks: AtomicBool::new(false),
            transfers_added: AtomicU64::new(0),
            transfers_completed: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            may_differ: Mutex::new(HashSet::new()),
        });

        let (mailbox, jobs) = bridge::mailbox();
        let handle = {
            let context = context.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("twoway-agent-{}", name))
                .spawn(move || worker(context, shared, cache_dir, jobs))?
        };

        Ok(TestAgent {
            name: name.to_string(),
            context,
            shared,
            fs_base_path,
            mailbox: Some(mailbox),
            worker: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs_base_path(&self) -> &Path {
        &self.fs_base_path
    }

    pub fn context(&self) -> &Arc<HarnessContext> {
        &self.context
    }

    /// Run `f` on the worker thread. The future fails with
    /// [`HarnessError::AgentStopped`] if `f` drops its promise unset, and
    /// with a timeout after the configured command bound.
    pub fn thread_do<T, F>(&self, operation: &str, f: F) -> CommandFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut AgentCore, Promise<T>) + Send + 'static,
    {
        let timeout = self.context.config().timeouts.command.as_duration();
        let (promise, future) = bridge::promise(operation, timeout);
        let job: Job<AgentCore> = Box::new(move |core| f(core, promise));
        let posted = match &self.mailbox {
            Some(mailbox) => mailbox.post(job, timeout),
            None => false,
        };
        if !posted {
            warn!("{}: could not hand {} to the worker", self.name, operation);
        }
        future
    }

    fn command<T, F>(&self, operation: &str, f: F) -> Result<T, HarnessError>
    where
        T: Send + 'static,
        F: FnOnce(&mut AgentCore, Promise<Result<T, HarnessError>>) + Send + 'static,
    {
        self.thread_do(operation, f).resolve()
    }

    /// Submit one tag-correlated request resolving on its single result.
    fn request<F>(&self, operation: &str, category: Category, issue: F) -> Result<(), HarnessError>
    where
        F: FnOnce(&mut dyn SyncEngine) + Send + 'static,
    {
        self.command(operation, move |core, promise| {
            core.submit(category, None, issue, settle(promise));
        })
    }

    // Session

    pub fn prelogin(&self, user: &str) -> Result<(), HarnessError> {
        let user = user.to_string();
        self.request("prelogin", Category::Prelogin, move |e| e.prelogin(&user))
    }

    pub fn login(&self, user: &str, password: &str) -> Result<(), HarnessError> {
        let credentials = Credentials::Password {
            user: user.to_string(),
            password: password.to_string(),
        };
        self.request("login", Category::Login, move |e| e.login(&credentials))
    }

    pub fn login_session(&self, session: &str) -> Result<(), HarnessError> {
        let credentials = Credentials::Session(session.to_string());
        self.request("login", Category::Login, move |e| e.login(&credentials))
    }

    pub fn fetch_nodes(&self) -> Result<(), HarnessError> {
        self.request("fetchnodes", Category::FetchNodes, |e| e.fetch_nodes(false))
    }

    pub fn login_fetch_nodes(&self, user: &str, password: &str) -> Result<(), HarnessError> {
        self.prelogin(user)?;
        self.login(user, password)?;
        self.fetch_nodes()?;
        info!("{}: logged in as {}", self.name, user);
        Ok(())
    }

    /// Resume a saved session. Syncs persisted in the engine cache come
    /// back once the nodes are fetched.
    pub fn login_fetch_nodes_session(&self, session: &str) -> Result<(), HarnessError> {
        self.login_session(session)?;
        self.fetch_nodes()?;
        info!("{}: resumed session", self.name);
        Ok(())
    }

    /// Log in and replace any test base folder with a fresh, empty one.
    pub fn login_reset(&self, user: &str, password: &str) -> Result<(), HarnessError> {
        self.login_fetch_nodes(user, password)?;

        self.command("delete base folders", |core, promise| {
            let Some(root) = core.engine.root_handle() else {
                return promise.set(Err(EngineError::NotLoggedIn.into()));
            };
            let name = core.context.config().remote_base_folder.clone();
            let existing = core.engine.children_named(root, &name);
            if existing.is_empty() {
                return promise.set(Ok(()));
            }
            let parts = existing.len();
            core.submit(
                Category::Unlink,
                None,
                move |e| {
                    for node in existing {
                        e.unlink(node);
                    }
                },
                settle_after(parts, promise),
            );
        })?;

        let created = self.command("create base folder", |core, promise| {
            let Some(root) = core.engine.root_handle() else {
                return promise.set(Err(EngineError::NotLoggedIn.into()));
            };
            let name = core.context.config().remote_base_folder.clone();
            let batch = vec![NewNode::folder(0, None, name)];
            core.submit(
                Category::PutNodes,
                Some(root),
                move |e| e.create_nodes(root, batch),
                settle_created(promise),
            );
        })?;
        info!("{}: reset base folder {:?}", self.name, created.first());
        Ok(())
    }

    /// [`login_reset`](Self::login_reset) with the configured account, then
    /// build `subdir_tree(prefix, n, depth, 0)` under the base folder.
    pub fn login_reset_make_remote_nodes(
        &self,
        prefix: &str,
        n: usize,
        depth: usize,
    ) -> Result<(), HarnessError> {
        let user = self.context.user().to_string();
        let password = self.context.password().to_string();
        self.login_reset(&user, &password)?;
        self.make_cloud_subdirs(prefix, n, depth, "")?;
        Ok(())
    }

    pub fn dump_session(&self) -> Result<Option<String>, HarnessError> {
        self.thread_do("dump session", |core, promise| {
            promise.set(core.engine.dump_session())
        })
        .wait()
    }

    /// End the session in memory only; the engine cache stays on disk.
    pub fn local_logout(&self) -> Result<(), HarnessError> {
        self.thread_do("local logout", |core, promise| {
            core.engine.local_logout();
            promise.set(())
        })
        .wait()
    }

    pub fn logout(&self) -> Result<(), HarnessError> {
        self.thread_do("logout", |core, promise| {
            core.engine.logout();
            promise.set(())
        })
        .wait()
    }

    // Remote tree

    pub fn base_folder_handle(&self) -> Result<NodeHandle, HarnessError> {
        self.command("base folder", |core, promise| {
            promise.set(core.resolve_or_err(""))
        })
    }

    /// Create `subdir_tree(prefix, n, depth, 0)` under the remote folder `under`.
    pub fn make_cloud_subdirs(
        &self,
        prefix: &str,
        n: usize,
        depth: usize,
        under: &str,
    ) -> Result<Vec<NodeHandle>, HarnessError> {
        self.upload_model_tree(&ModelNode::subdir_tree(prefix, n, depth, 0), under)
    }

    /// Create a model subtree, files included, under the remote folder `under`.
    pub fn upload_model_tree(
        &self,
        node: &ModelNode,
        under: &str,
    ) -> Result<Vec<NodeHandle>, HarnessError> {
        let batch = model_batch(node);
        self.create_batch(batch, under)
    }

    /// Upload the local folder `local_path` (itself included) under the
    /// remote folder `remote_parent_path`.
    pub fn upload_folder_tree(
        &self,
        local_path: &Path,
        remote_parent_path: &str,
    ) -> Result<Vec<NodeHandle>, HarnessError> {
        let batch = local_batch(local_path)?;
        debug!(
            "{}: uploading {} node(s) from {}",
            self.name,
            batch.len(),
            local_path.display()
        );
        self.create_batch(batch, remote_parent_path)
    }

    fn create_batch(&self, batch: Vec<NewNode>, under: &str) -> Result<Vec<NodeHandle>, HarnessError> {
        let under = under.to_string();
        self.command("putnodes", move |core, promise| {
            let parent = match core.resolve_or_err(&under) {
                Ok(parent) => parent,
                Err(e) => return promise.set(Err(e)),
            };
            core.submit(
                Category::PutNodes,
                Some(parent),
                move |e| e.create_nodes(parent, batch),
                settle_created(promise),
            );
        })
    }

    pub fn delete_remote(&self, path: &str) -> Result<(), HarnessError> {
        self.delete_remote_nodes(&[path])
    }

    /// Unlink several nodes under one tag; resolves after the last result.
    pub fn delete_remote_nodes(&self, paths: &[&str]) -> Result<(), HarnessError> {
        let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        self.command("unlink", move |core, promise| {
            let mut nodes = Vec::with_capacity(paths.len());
            for path in &paths {
                match core.resolve_or_err(path) {
                    Ok(node) => nodes.push(node),
                    Err(e) => return promise.set(Err(e)),
                }
            }
            if nodes.is_empty() {
                return promise.set(Ok(()));
            }
            let parts = nodes.len();
            let target = nodes.first().copied();
            core.submit(
                Category::Unlink,
                target,
                move |e| {
                    for node in nodes {
                        e.unlink(node);
                    }
                },
                settle_after(parts, promise),
            );
        })
    }

    fn rename_request(
        &self,
        operation: &str,
        path: &str,
        new_parent: Option<String>,
        new_name: Option<String>,
    ) -> Result<(), HarnessError> {
        let path = path.to_string();
        self.command(operation, move |core, promise| {
            let node = match core.resolve_or_err(&path) {
                Ok(node) => node,
                Err(e) => return promise.set(Err(e)),
            };
            let parent = match new_parent {
                Some(parent_path) => core.resolve_or_err(&parent_path),
                None => core.resolve_or_err(split_parent(&path).0),
            };
            let parent = match parent {
                Ok(parent) => parent,
                Err(e) => return promise.set(Err(e)),
            };
            core.submit(
                Category::Rename,
                Some(node),
                move |e| e.rename(node, parent, new_name.as_deref()),
                settle(promise),
            );
        })
    }

    pub fn move_node(&self, path: &str, new_parent_path: &str) -> Result<(), HarnessError> {
        self.rename_request("move", path, Some(new_parent_path.to_string()), None)
    }

    pub fn rename_remote(&self, path: &str, new_name: &str) -> Result<(), HarnessError> {
        self.rename_request("rename", path, None, Some(new_name.to_string()))
    }

    /// Move a remote node into the account's rubbish bin.
    pub fn move_node_to_trash(&self, path: &str) -> Result<(), HarnessError> {
        let path = path.to_string();
        self.command("move to rubbish", move |core, promise| {
            let node = match core.resolve_or_err(&path) {
                Ok(node) => node,
                Err(e) => return promise.set(Err(e)),
            };
            let Some(rubbish) = core.engine.rubbish_handle() else {
                return promise.set(Err(EngineError::NotLoggedIn.into()));
            };
            core.submit(
                Category::Rename,
                Some(node),
                move |e| e.rename(node, rubbish, None),
                settle(promise),
            );
        })
    }

    /// A barrier: resolves once every earlier remote change is visible.
    pub fn catchup_future(&self) -> CommandFuture<Result<(), HarnessError>> {
        self.thread_do("catchup", |core, promise| {
            core.submit(Category::Catchup, None, |e| e.catchup(), settle(promise));
        })
    }

    pub fn catchup(&self) -> Result<(), HarnessError> {
        self.catchup_future().resolve()
    }

    // Syncs

    /// Sync `<fs_base_path>/<local_folder>` with the remote folder at
    /// `remote_path`. The local folder is created if needed.
    pub fn setup_sync(&self, local_folder: &str, remote_path: &str) -> Result<SyncId, HarnessError> {
        let local_path = self.fs_base_path.join(local_folder);
        fs::create_dir_all(&local_path)?;
        let remote = remote_path.to_string();
        let name = local_folder.to_string();
        let id = self.command("add sync", move |core, promise| {
            let remote_root = match core.resolve_or_err(&remote) {
                Ok(node) => node,
                Err(e) => return promise.set(Err(e)),
            };
            let config = SyncConfig {
                name,
                local_path,
                remote_root,
            };
            core.engine.add_sync(
                config,
                Box::new(move |result| promise.set(result.map_err(HarnessError::from))),
            );
        })?;
        info!("{}: {} syncing {} with {}", self.name, id, local_folder, remote_path);
        Ok(id)
    }

    pub fn remove_sync(&self, sync: SyncId) -> Result<bool, HarnessError> {
        self.thread_do("remove sync", move |core, promise| {
            promise.set(core.engine.remove_syncs(&mut |id, _| id == sync) > 0)
        })
        .wait()
    }

    pub fn remove_all_syncs(&self) -> Result<usize, HarnessError> {
        self.thread_do("remove syncs", |core, promise| {
            promise.set(core.engine.remove_syncs(&mut |_, _| true))
        })
        .wait()
    }

    pub fn sync_info(&self, sync: SyncId) -> Result<Option<SyncConfig>, HarnessError> {
        self.thread_do("sync info", move |core, promise| {
            let config = core
                .engine
                .syncs()
                .into_iter()
                .find(|(id, _)| *id == sync)
                .map(|(_, config)| config);
            promise.set(config)
        })
        .wait()
    }

    pub fn sync_root(&self, sync: SyncId) -> Result<Option<PathBuf>, HarnessError> {
        Ok(self.sync_info(sync)?.map(|c| c.local_path))
    }

    // Status

    pub fn is_busy(&self) -> CommandFuture<bool> {
        self.thread_do("busy check", |core, promise| {
            promise.set(core.engine.is_busy())
        })
    }

    pub fn request_sync_down(&self) -> CommandFuture<()> {
        self.thread_do("sync down", |core, promise| {
            core.engine.request_sync_down();
            promise.set(())
        })
    }

    pub fn last_callback(&self) -> Instant {
        *self.shared.last_callback.lock()
    }

    pub fn set_log_callbacks(&self, on: bool) {
        self.shared.log_callbacks.store(on, Ordering::Relaxed);
    }

    pub fn transfer_counts(&self) -> TransferCounts {
        TransferCounts {
            added: self.shared.transfers_added.load(Ordering::Relaxed),
            completed: self.shared.transfers_completed.load(Ordering::Relaxed),
            failed: self.shared.transfers_failed.load(Ordering::Relaxed),
        }
    }

    /// Exempt a local file from content comparison.
    pub fn mark_may_differ(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!("{}: content may differ for {}", self.name, path.display());
        self.shared.may_differ.lock().insert(path);
    }

    // Checks

    pub fn confirm_model(
        &self,
        sync: SyncId,
        expected: &ModelNode,
        confirm: Confirm,
        ignore_debris: bool,
    ) -> bool {
        match self.confirm_model_report(sync, expected, confirm, ignore_debris) {
            Ok(()) => true,
            Err(reports) => {
                for report in &reports {
                    warn!("{}: {}: {}", self.name, sync, report);
                }
                false
            }
        }
    }

    /// Compare `expected` with the requested views of `sync`, returning one
    /// report per view that did not match.
    pub fn confirm_model_report(
        &self,
        sync: SyncId,
        expected: &ModelNode,
        confirm: Confirm,
        ignore_debris: bool,
    ) -> Result<(), Vec<MatchReport>> {
        let mut sources = Vec::new();
        if confirm.contains(Confirm::LOCAL_FS) {
            sources.push(Source::Filesystem);
        }
        if confirm.contains(Confirm::LOCAL_NODE) {
            sources.push(Source::Replica);
        }
        if confirm.contains(Confirm::REMOTE) {
            sources.push(Source::Remote);
        }

        let fail_all = |reason: String| -> Vec<MatchReport> {
            sources
                .iter()
                .map(|source| MatchReport {
                    source: *source,
                    mismatches: vec![Mismatch {
                        path: String::new(),
                        reason: reason.clone(),
                        unmatched_expected: Vec::new(),
                        unmatched_observed: Vec::new(),
                    }],
                })
                .collect()
        };

        let snapshot = self
            .thread_do("snapshot", move |core, promise| {
                let config = core
                    .engine
                    .syncs()
                    .into_iter()
                    .find(|(id, _)| *id == sync)
                    .map(|(_, config)| config);
                let replica = core.engine.replica_tree(sync);
                let remote = config
                    .as_ref()
                    .and_then(|c| core.engine.remote_tree(c.remote_root));
                promise.set((config, replica, remote))
            })
            .wait();
        let (config, replica, remote) = match snapshot {
            Ok(found) => found,
            Err(e) => return Err(fail_all(e.to_string())),
        };
        let Some(config) = config else {
            return Err(fail_all(format!("{} is not configured", sync)));
        };

        let debris = self.context.config().debris_folder.clone();
        let may_differ: Vec<String> = self
            .shared
            .may_differ
            .lock()
            .iter()
            .filter_map(|p| p.strip_prefix(&config.local_path).ok())
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .collect();

        let mut reports = Vec::new();
        for source in sources {
            let result = match source {
                Source::Filesystem => {
                    let policy = MatchPolicy::new(debris.as_str(), ignore_debris)
                        .with_may_differ(may_differ.iter().cloned());
                    match FsNode::at(&config.local_path) {
                        Ok(root) => match_tree(expected, root, &policy),
                        Err(e) => Err(vec![missing(format!("local root: {}", e))]),
                    }
                }
                Source::Replica => {
                    compare_snapshot(expected, replica.as_ref(), &debris, "replica tree")
                }
                Source::Remote => {
                    compare_snapshot(expected, remote.as_ref(), &debris, "remote root")
                }
            };
            if let Err(mismatches) = result {
                reports.push(MatchReport { source, mismatches });
            }
        }
        if reports.is_empty() {
            Ok(())
        } else {
            Err(reports)
        }
    }
}

fn missing(reason: String) -> Mismatch {
    Mismatch {
        path: String::new(),
        reason,
        unmatched_expected: Vec::new(),
        unmatched_observed: Vec::new(),
    }
}

fn compare_snapshot(
    expected: &ModelNode,
    observed: Option<&TreeSnapshot>,
    debris: &str,
    what: &str,
) -> Result<(), Vec<Mismatch>> {
    match observed {
        Some(tree) => match_tree(expected, tree, &MatchPolicy::new(debris, true)),
        None => Err(vec![missing(format!("no {}", what))]),
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        if !handle.is_finished() {
            if let Err(e) = self.logout() {
                warn!("{}: logout on teardown failed: {}", self.name, e);
            }
        }
        // Closing the mailbox ends the worker loop
        self.mailbox.take();
        if handle.join().is_err() {
            error!("{}: worker thread panicked outside the event loop", self.name);
        }
    }
}
