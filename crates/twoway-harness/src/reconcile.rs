//! Matching the expected model against an observed tree.
//!
//! The same matcher runs against three sources: the local filesystem, the
//! engine's replica tree and the engine's remote tree. Children are grouped
//! by name; for each expected child every same-named candidate is tried in
//! turn and the first full match is consumed. An expected child with no
//! matching candidate fails its folder. A folder matches only when every
//! observed child was consumed.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use twoway_core::{content_hash, NodeKind, TreeSnapshot};

use crate::model::ModelNode;

/// Files with this name are matched by name and kind alone.
pub const LOCK_FILE: &str = "lock";

/// Read access to one side of a comparison.
pub trait Observed: Clone {
    fn name(&self) -> &str;
    fn kind(&self) -> NodeKind;
    fn content_matches(&self, expected: &[u8]) -> bool;
    fn children(&self) -> Vec<Self>;
}

/// A file or folder on the local filesystem. Symlinks and special files
/// are invisible to the matcher.
#[derive(Debug, Clone)]
pub struct FsNode {
    path: PathBuf,
    name: String,
    kind: NodeKind,
}

impl FsNode {
    pub fn at(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = fs::symlink_metadata(&path)?;
        let kind = if meta.is_dir() {
            NodeKind::Folder
        } else if meta.is_file() {
            NodeKind::File
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is neither a file nor a folder", path.display()),
            ));
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(FsNode { path, name, kind })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Observed for FsNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn content_matches(&self, expected: &[u8]) -> bool {
        fs::read(&self.path).is_ok_and(|data| data == expected)
    }

    fn children(&self) -> Vec<Self> {
        let Ok(entries) = fs::read_dir(&self.path) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| FsNode::at(entry.path()).ok())
            .collect()
    }
}

impl<'a> Observed for &'a TreeSnapshot {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn content_matches(&self, expected: &[u8]) -> bool {
        self.fingerprint
            .as_ref()
            .is_some_and(|fp| fp.size == expected.len() as u64 && fp.hash == content_hash(expected))
    }

    fn children(&self) -> Vec<Self> {
        let node: &'a TreeSnapshot = *self;
        node.children.iter().collect()
    }
}

impl<'a> Observed for &'a ModelNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn content_matches(&self, expected: &[u8]) -> bool {
        self.content == expected
    }

    fn children(&self) -> Vec<Self> {
        let node: &'a ModelNode = *self;
        node.kids.iter().collect()
    }
}

/// Knobs for one comparison.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    pub debris: String,
    /// Skip the debris folder directly under the compared root, on both sides.
    pub exclude_debris: bool,
    /// Paths relative to the compared root whose file content is not checked.
    pub may_differ: HashSet<String>,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy {
            debris: ".debris".to_string(),
            exclude_debris: false,
            may_differ: HashSet::new(),
        }
    }
}

impl MatchPolicy {
    pub fn new(debris: impl Into<String>, exclude_debris: bool) -> Self {
        MatchPolicy {
            debris: debris.into(),
            exclude_debris,
            may_differ: HashSet::new(),
        }
    }

    pub fn with_may_differ(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.may_differ.extend(paths);
        self
    }
}

/// One folder (or leaf) that failed to match, with everything left over on
/// both sides at the point of failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Path relative to the compared root; empty for the root itself.
    pub path: String,
    pub reason: String,
    pub unmatched_expected: Vec<String>,
    pub unmatched_observed: Vec<String>,
}

impl Mismatch {
    fn leaf(path: &str, reason: impl Into<String>) -> Self {
        Mismatch {
            path: path.to_string(),
            reason: reason.into(),
            unmatched_expected: Vec::new(),
            unmatched_observed: Vec::new(),
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "<root>" } else { &self.path };
        write!(f, "{}: {}", path, self.reason)?;
        if !self.unmatched_expected.is_empty() {
            write!(f, "; expected only: [{}]", self.unmatched_expected.join(", "))?;
        }
        if !self.unmatched_observed.is_empty() {
            write!(f, "; observed only: [{}]", self.unmatched_observed.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Filesystem,
    Replica,
    Remote,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Filesystem => f.write_str("filesystem"),
            Source::Replica => f.write_str("replica tree"),
            Source::Remote => f.write_str("remote tree"),
        }
    }
}

/// Failed comparison against one source.
#[derive(Debug, Clone)]
pub struct MatchReport {
    pub source: Source,
    pub mismatches: Vec<Mismatch>,
}

impl fmt::Display for MatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} does not match the model:", self.source)?;
        for m in &self.mismatches {
            writeln!(f, "  {}", m)?;
        }
        Ok(())
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

type Outcome = Result<(), Vec<Mismatch>>;

/// The expected child currently being matched and its candidates.
struct Attempt<'a, O> {
    kid: &'a ModelNode,
    untried: VecDeque<O>,
    rejected: Vec<O>,
    /// Folder candidate whose subtree is on the stack above this frame.
    trying: Option<O>,
    failures: Vec<Mismatch>,
}

struct Frame<'a, O> {
    path: String,
    depth: usize,
    /// Expected children, sorted descending so `pop` yields name order.
    pending: Vec<&'a ModelNode>,
    observed: BTreeMap<String, Vec<O>>,
    attempt: Option<Attempt<'a, O>>,
}

enum Step<'a, O> {
    Descend(Frame<'a, O>),
    Finished(Outcome),
}

impl<'a, O: Observed> Frame<'a, O> {
    fn new(
        expected: &'a ModelNode,
        observed: &O,
        path: String,
        depth: usize,
        policy: &MatchPolicy,
    ) -> Self {
        let skip = |name: &str| depth == 0 && policy.exclude_debris && name == policy.debris;
        let mut pending: Vec<&ModelNode> = expected
            .kids
            .iter()
            .filter(|k| !skip(k.name.as_str()))
            .collect();
        pending.sort_by(|a, b| b.name.cmp(&a.name));

        let mut by_name: BTreeMap<String, Vec<O>> = BTreeMap::new();
        for child in observed.children() {
            if skip(child.name()) {
                continue;
            }
            by_name.entry(child.name().to_string()).or_default().push(child);
        }
        Frame {
            path,
            depth,
            pending,
            observed: by_name,
            attempt: None,
        }
    }

    fn step(&mut self, outcome: Option<Outcome>, policy: &MatchPolicy) -> Step<'a, O> {
        if let (Some(outcome), Some(attempt)) = (outcome, self.attempt.as_mut()) {
            let tried = attempt.trying.take();
            match outcome {
                Ok(()) => self.settle(),
                Err(failures) => {
                    attempt.failures.extend(failures);
                    attempt.rejected.extend(tried);
                }
            }
        }

        loop {
            let Some(attempt) = self.attempt.as_mut() else {
                let Some(kid) = self.pending.pop() else {
                    return Step::Finished(self.finish());
                };
                let untried = self.observed.remove(&kid.name).unwrap_or_default();
                self.attempt = Some(Attempt {
                    kid,
                    untried: untried.into(),
                    rejected: Vec::new(),
                    trying: None,
                    failures: Vec::new(),
                });
                continue;
            };
            let Some(candidate) = attempt.untried.pop_front() else {
                return Step::Finished(Err(self.fail()));
            };
            let kid = attempt.kid;
            let path = child_path(&self.path, &kid.name);

            if candidate.kind() != kid.kind {
                attempt.failures.push(Mismatch::leaf(
                    &path,
                    format!("expected a {} but found a {}", kid.kind, candidate.kind()),
                ));
                attempt.rejected.push(candidate);
                continue;
            }
            match kid.kind {
                NodeKind::File => {
                    if kid.name == LOCK_FILE
                        || policy.may_differ.contains(&path)
                        || candidate.content_matches(&kid.content)
                    {
                        self.settle();
                    } else {
                        attempt.failures.push(Mismatch::leaf(&path, "content differs"));
                        attempt.rejected.push(candidate);
                    }
                }
                NodeKind::Folder => {
                    let frame = Frame::new(kid, &candidate, path, self.depth + 1, policy);
                    attempt.trying = Some(candidate);
                    return Step::Descend(frame);
                }
            }
        }
    }

    /// The current attempt succeeded; unused candidates go back to the pool.
    fn settle(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            let rest: Vec<O> = attempt.rejected.into_iter().chain(attempt.untried).collect();
            if !rest.is_empty() {
                self.observed
                    .entry(attempt.kid.name.clone())
                    .or_default()
                    .extend(rest);
            }
        }
    }

    fn observed_names(&self) -> Vec<String> {
        self.observed
            .iter()
            .flat_map(|(name, found)| std::iter::repeat(name.clone()).take(found.len()))
            .collect()
    }

    fn finish(&mut self) -> Outcome {
        if self.observed.values().all(Vec::is_empty) {
            return Ok(());
        }
        Err(vec![Mismatch {
            path: self.path.clone(),
            reason: "unexpected entries".to_string(),
            unmatched_expected: Vec::new(),
            unmatched_observed: self.observed_names(),
        }])
    }

    fn fail(&mut self) -> Vec<Mismatch> {
        let mut unmatched_observed = self.observed_names();
        let mut unmatched_expected = Vec::new();
        let mut failures = Vec::new();
        if let Some(attempt) = self.attempt.take() {
            unmatched_expected.push(attempt.kid.name.clone());
            unmatched_observed.extend(attempt.rejected.iter().map(|o| o.name().to_string()));
            failures = attempt.failures;
        }
        unmatched_expected.extend(self.pending.iter().rev().map(|k| k.name.clone()));
        unmatched_observed.sort();

        let reason = match unmatched_expected.first() {
            Some(name) => format!("no match for {}", name),
            None => "no match".to_string(),
        };
        failures.push(Mismatch {
            path: self.path.clone(),
            reason,
            unmatched_expected,
            unmatched_observed,
        });
        failures
    }
}

/// Compare `expected` with `observed`. The root names are not compared.
pub fn match_tree<O: Observed>(
    expected: &ModelNode,
    observed: O,
    policy: &MatchPolicy,
) -> Result<(), Vec<Mismatch>> {
    if expected.kind != observed.kind() {
        return Err(vec![Mismatch::leaf(
            "",
            format!("expected a {} but found a {}", expected.kind, observed.kind()),
        )]);
    }
    if expected.kind == NodeKind::File {
        return if observed.content_matches(&expected.content) {
            Ok(())
        } else {
            Err(vec![Mismatch::leaf("", "content differs")])
        };
    }

    let mut stack = vec![Frame::new(expected, &observed, String::new(), 0, policy)];
    let mut outcome = None;
    while let Some(frame) = stack.last_mut() {
        match frame.step(outcome.take(), policy) {
            Step::Descend(child) => stack.push(child),
            Step::Finished(result) => {
                stack.pop();
                outcome = Some(result);
            }
        }
    }
    outcome.unwrap_or(Ok(()))
}
