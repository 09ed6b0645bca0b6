//! Two-way sync symmetry cases: one rename, move or delete applied on
//! either side of a sync, by the syncing agent or another one, optionally
//! while the syncing agent is logged out.
//!
//! All cases run as one batch. Every phase (fixtures, baseline check,
//! mutation, resume, final check) is applied to every case before the next
//! phase starts, so the quiescence waits are shared.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};
use twoway_core::{NodeKind, SyncId};

use crate::agent::{Confirm, TestAgent};
use crate::error::HarnessError;
use crate::fixtures;
use crate::model::{Model, ModelNode};
use crate::quiesce::{catchup_agents, wait_on_syncs};

/// Folder, both locally and under the remote base folder, holding one
/// subfolder per case.
pub const SYMMETRY_ROOT: &str = "twoway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymmetryAction {
    Rename,
    MoveWithinSync,
    MoveOutOfSync,
    MoveIntoSync,
    Delete,
}

impl SymmetryAction {
    pub const ALL: [SymmetryAction; 5] = [
        SymmetryAction::Rename,
        SymmetryAction::MoveWithinSync,
        SymmetryAction::MoveOutOfSync,
        SymmetryAction::MoveIntoSync,
        SymmetryAction::Delete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SymmetryAction::Rename => "rename",
            SymmetryAction::MoveWithinSync => "move",
            SymmetryAction::MoveOutOfSync => "moveOut",
            SymmetryAction::MoveIntoSync => "moveIn",
            SymmetryAction::Delete => "delete",
        }
    }
}

/// Which side of the sync the change is made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local change, synced up.
    Up,
    /// Remote change, synced down.
    Down,
}

/// Who makes a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    SelfChange,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaseParams {
    pub action: SymmetryAction,
    pub direction: Direction,
    pub actor: Actor,
    pub kind: NodeKind,
    /// The syncing agent is logged out while the change is made.
    pub pause: bool,
}

impl CaseParams {
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}_{}{}",
            self.action.name(),
            match self.direction {
                Direction::Up => "up",
                Direction::Down => "down",
            },
            match self.actor {
                Actor::SelfChange => "self",
                Actor::Other => "other",
            },
            self.kind,
            if self.pause { "_resumed" } else { "" }
        )
    }

    /// Every combination except a paused agent changing things itself.
    pub fn enumerate() -> Vec<CaseParams> {
        let mut cases = Vec::new();
        for actor in [Actor::SelfChange, Actor::Other] {
            for direction in [Direction::Down, Direction::Up] {
                for action in SymmetryAction::ALL {
                    for kind in [NodeKind::File, NodeKind::Folder] {
                        for pause in [false, true] {
                            if pause && actor == Actor::SelfChange {
                                continue;
                            }
                            cases.push(CaseParams {
                                action,
                                direction,
                                actor,
                                kind,
                                pause,
                            });
                        }
                    }
                }
            }
        }
        cases
    }
}

/// The mutation applied on the source side, paths relative to the case folder.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceOp {
    Rename { path: &'static str, new_name: &'static str },
    Move { path: &'static str, to: &'static str },
    Delete { path: &'static str },
}

fn plan(params: &CaseParams) -> SourceOp {
    let file = params.kind == NodeKind::File;
    match params.action {
        SymmetryAction::Rename if file => SourceOp::Rename {
            path: "f/f_0/file0_f_0",
            new_name: "file0_f_0_renamed",
        },
        SymmetryAction::Rename => SourceOp::Rename {
            path: "f/f_0",
            new_name: "f_0_renamed",
        },
        SymmetryAction::MoveWithinSync => SourceOp::Move {
            path: if file { "f/f_1/file0_f_1" } else { "f/f_1" },
            to: "f/f_0",
        },
        SymmetryAction::MoveOutOfSync => SourceOp::Move {
            path: if file { "f/f_0/file0_f_0" } else { "f/f_0" },
            to: "outside",
        },
        SymmetryAction::MoveIntoSync => SourceOp::Move {
            path: if file { "outside/file0_outside" } else { "outside" },
            to: "f/f_0",
        },
        SymmetryAction::Delete => SourceOp::Delete {
            path: if file { "f/f_0/file0_f_0" } else { "f/f_0" },
        },
    }
}

fn emulate_source(op: &SourceOp, model: &mut Model) -> bool {
    match op {
        SourceOp::Rename { path, new_name } => model.emulate_rename(path, new_name),
        SourceOp::Move { path, to } => model.emulate_move(path, to),
        SourceOp::Delete { path } => model.emulate_delete(path),
    }
}

/// What the other side of the sync should end up with.
fn emulate_destination(params: &CaseParams, op: &SourceOp, model: &mut Model) {
    match (params.action, op) {
        (SymmetryAction::MoveOutOfSync, SourceOp::Move { path, .. }) => {
            model.emulate_delete(path);
        }
        (SymmetryAction::MoveIntoSync, SourceOp::Move { path, to }) => {
            if params.kind == NodeKind::Folder {
                model.emulate_delete("f/f_0/outside");
            }
            model.emulate_copy(path, to);
        }
        _ => {
            emulate_source(op, model);
        }
    }
}

/// Initial tree of every case, shared by both sides.
pub fn initial_model() -> Model {
    let mut model = Model::new();
    model.add_subtree("", ModelNode::subdir_tree("f", 2, 2, 2));
    model.add_subtree("", ModelNode::subdir_tree("outside", 2, 1, 1));
    for name in MTIME_FILES.iter().map(|(name, _)| name) {
        model.add_file(&format!("f/{}", name), name.as_bytes().to_vec());
    }
    model
}

/// Files whose mtime is moved an hour either way before they enter `f`.
const MTIME_FILES: [(&str, i64); 4] = [
    ("file_older_1", -3600),
    ("file_newer_1", 3600),
    ("file_older_2", -3600),
    ("file_newer_2", 3600),
];

fn build_local_fixture(dir: &Path) -> Result<(), HarnessError> {
    fs::create_dir_all(dir)?;
    fixtures::build_local_folders(dir, "f", 2, 2, 2)?;
    fixtures::build_local_folders(dir, "outside", 2, 1, 1)?;
    for (name, delta) in MTIME_FILES {
        let path = fixtures::create_name_file(dir, name)?;
        let base = fs::metadata(&path)?.modified()?;
        let shift = Duration::from_secs(delta.unsigned_abs());
        let mtime = if delta < 0 {
            base.checked_sub(shift).unwrap_or(base)
        } else {
            base + shift
        };
        fixtures::set_mtime(&path, mtime)?;
        // Moved in only after the mtime is final
        fs::rename(&path, dir.join("f").join(name))?;
    }
    Ok(())
}

/// The three agents taking part. `steady` and `resume` sync; `other` only
/// makes remote changes.
#[derive(Clone, Copy)]
pub struct SymmetryAgents<'a> {
    pub steady: &'a TestAgent,
    pub resume: &'a TestAgent,
    pub other: &'a TestAgent,
}

impl<'a> SymmetryAgents<'a> {
    fn syncing(&self, params: &CaseParams) -> &'a TestAgent {
        if params.pause {
            self.resume
        } else {
            self.steady
        }
    }

    fn changing(&self, params: &CaseParams) -> &'a TestAgent {
        match params.actor {
            Actor::SelfChange => self.syncing(params),
            Actor::Other => self.other,
        }
    }

    fn all(&self) -> [&'a TestAgent; 3] {
        [self.steady, self.resume, self.other]
    }
}

struct Case {
    params: CaseParams,
    name: String,
    /// Case folder on the syncing agent.
    dir: PathBuf,
    local: Model,
    remote: Model,
    sync: Option<SyncId>,
    failure: Option<String>,
}

impl Case {
    fn new(params: CaseParams, agents: &SymmetryAgents<'_>) -> Self {
        let name = params.name();
        let dir = agents
            .syncing(&params)
            .fs_base_path()
            .join(SYMMETRY_ROOT)
            .join(&name);
        Case {
            params,
            name,
            dir,
            local: initial_model(),
            remote: initial_model(),
            sync: None,
            failure: None,
        }
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}/{}/{}", SYMMETRY_ROOT, self.name, path)
    }

    fn fail(&mut self, stage: &str, reason: impl fmt::Display) {
        warn!("{}: {} failed: {}", self.name, stage, reason);
        if self.failure.is_none() {
            self.failure = Some(format!("{}: {}", stage, reason));
        }
    }

    fn apply(&mut self, agents: &SymmetryAgents<'_>) -> Result<(), HarnessError> {
        let op = plan(&self.params);
        info!("{}: applying {:?}", self.name, op);
        match self.params.direction {
            Direction::Up => {
                apply_local(&self.dir, &op)?;
                emulate_source(&op, &mut self.local);
                emulate_destination(&self.params, &op, &mut self.remote);
            }
            Direction::Down => {
                let agent = agents.changing(&self.params);
                match &op {
                    SourceOp::Rename { path, new_name } => {
                        agent.rename_remote(&self.remote_path(path), new_name)?
                    }
                    SourceOp::Move { path, to } => {
                        agent.move_node(&self.remote_path(path), &self.remote_path(to))?
                    }
                    SourceOp::Delete { path } => agent.delete_remote(&self.remote_path(path))?,
                }
                emulate_source(&op, &mut self.remote);
                emulate_destination(&self.params, &op, &mut self.local);
            }
        }
        Ok(())
    }

    /// Local views against the local model, remote view against the remote model.
    fn check(&self, agent: &TestAgent) -> Result<(), String> {
        let sync = self.sync.ok_or_else(|| "no sync".to_string())?;
        let (Some(local), Some(remote)) = (self.local.find("f"), self.remote.find("f")) else {
            return Err("model has no f".to_string());
        };
        let local_ok = agent.confirm_model(sync, local, Confirm::LOCAL, true);
        let remote_ok = agent.confirm_model(sync, remote, Confirm::REMOTE, true);
        if local_ok && remote_ok {
            Ok(())
        } else {
            Err(format!("local matches: {}, remote matches: {}", local_ok, remote_ok))
        }
    }
}

fn apply_local(dir: &Path, op: &SourceOp) -> Result<(), HarnessError> {
    match op {
        SourceOp::Rename { path, new_name } => {
            let from = dir.join(path);
            let to = from
                .parent()
                .map(|p| p.join(new_name))
                .ok_or_else(|| HarnessError::Setup(format!("{} has no parent", path)))?;
            fs::rename(&from, &to)?;
        }
        SourceOp::Move { path, to } => {
            let from = dir.join(path);
            let leaf = from
                .file_name()
                .ok_or_else(|| HarnessError::Setup(format!("{} has no name", path)))?;
            let target = dir.join(to).join(leaf);
            fs::rename(&from, &target)?;
        }
        SourceOp::Delete { path } => {
            let target = dir.join(path);
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else {
                fs::remove_file(&target)?;
            }
        }
    }
    Ok(())
}

/// Outcome of a batch of symmetry cases.
#[derive(Debug, Default, Clone)]
pub struct SymmetrySummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl SymmetrySummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn all_passed(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for SymmetrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Succeeded: {} Failed: {}", self.succeeded.len(), self.failed.len())?;
        for name in &self.failed {
            write!(f, "\n  failed: {}", name)?;
        }
        Ok(())
    }
}

/// Run `cases` against `agents`. All three agents must be logged in to the
/// same account with the folder [`SYMMETRY_ROOT`] present under the base
/// folder. `window` is the quiescence window used between phases.
///
/// Setup problems abort the batch with an error; a case that fails its
/// mutation or either check is recorded in the summary and the batch goes on.
pub fn run_symmetry_cases(
    agents: SymmetryAgents<'_>,
    cases: &[CaseParams],
    window: Duration,
) -> Result<SymmetrySummary, HarnessError> {
    let mut cases: Vec<Case> = cases.iter().map(|p| Case::new(*p, &agents)).collect();
    let everyone = agents.all();
    let syncing = [agents.steady, agents.resume];

    info!("Creating fixtures for {} symmetry case(s)", cases.len());
    for case in &cases {
        build_local_fixture(&case.dir)?;
        agents
            .changing(&case.params)
            .upload_folder_tree(&case.dir, SYMMETRY_ROOT)?;
    }
    if !catchup_agents(&everyone) {
        return Err(HarnessError::Setup("catchup after upload failed".to_string()));
    }

    for case in &mut cases {
        let path = format!("{}/{}/f", SYMMETRY_ROOT, case.name);
        case.sync = Some(agents.syncing(&case.params).setup_sync(&path, &path)?);
    }
    wait_on_syncs(window, &syncing);
    catchup_agents(&everyone);

    info!("Checking initial state");
    for case in &mut cases {
        if let Err(reason) = case.check(agents.syncing(&case.params)) {
            case.fail("initial check", reason);
        }
    }

    let session = agents
        .resume
        .dump_session()?
        .ok_or_else(|| HarnessError::Setup(format!("{} has no session", agents.resume.name())))?;
    agents.resume.local_logout()?;

    info!("Performing actions");
    for case in &mut cases {
        if let Err(e) = case.apply(&agents) {
            case.fail("action", e);
        }
    }
    let running = [agents.steady, agents.other];
    wait_on_syncs(window, &running);
    catchup_agents(&running);

    agents.resume.login_fetch_nodes_session(&session)?;
    wait_on_syncs(window, &everyone);
    catchup_agents(&everyone);

    info!("Checking results");
    let mut summary = SymmetrySummary::default();
    for mut case in cases {
        if let Err(reason) = case.check(agents.syncing(&case.params)) {
            case.fail("final check", reason);
        }
        match case.failure {
            None => summary.succeeded.push(case.name),
            Some(_) => summary.failed.push(case.name),
        }
    }
    info!("{}", summary);
    Ok(summary)
}
