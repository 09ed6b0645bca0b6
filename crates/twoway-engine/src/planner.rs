//! Three-way comparison of local scan, remote mirror and replica base.
//!
//! Planning is pure: it reads the three views and produces an ordered list of
//! [`SyncAction`]s. Paths are sync-relative and sorted, so a parent is always
//! planned before its children.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use twoway_core::{Fingerprint, NodeHandle, NodeKind};

use crate::cloud::AccountTree;
use crate::replica::{is_within, join, split, ReplicaNode};
use crate::scan::LocalEntry;

/// A node of the remote mirror beneath a sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub kind: NodeKind,
    pub fingerprint: Option<Fingerprint>,
    pub handle: NodeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Send a local file up. `replaces` is unlinked once the new node exists.
    Upload {
        path: String,
        replaces: Option<NodeHandle>,
    },
    CreateRemoteFolder {
        path: String,
    },
    Download {
        path: String,
        handle: NodeHandle,
    },
    CreateLocalFolder {
        path: String,
        handle: NodeHandle,
    },
    /// Both sides already agree; record them in the base.
    Adopt {
        path: String,
        handle: NodeHandle,
        entry: LocalEntry,
    },
    MoveLocalToDebris {
        path: String,
    },
    UnlinkRemote {
        path: String,
        handle: NodeHandle,
    },
    ForgetBase {
        path: String,
    },
    MoveRemote {
        from: String,
        to: String,
        handle: NodeHandle,
    },
    MoveLocal {
        from: String,
        to: String,
    },
}

impl SyncAction {
    pub fn path(&self) -> &str {
        match self {
            SyncAction::Upload { path, .. }
            | SyncAction::CreateRemoteFolder { path }
            | SyncAction::Download { path, .. }
            | SyncAction::CreateLocalFolder { path, .. }
            | SyncAction::Adopt { path, .. }
            | SyncAction::MoveLocalToDebris { path }
            | SyncAction::UnlinkRemote { path, .. }
            | SyncAction::ForgetBase { path } => path,
            SyncAction::MoveRemote { to, .. } | SyncAction::MoveLocal { to, .. } => to,
        }
    }
}

/// Collect the live remote subtree under `root`, keyed by sync-relative path.
///
/// When two siblings share a name, the one the base already knows wins;
/// otherwise the most recently created one does.
pub fn remote_entries(
    tree: &AccountTree,
    root: NodeHandle,
    debris: &str,
    base: &ReplicaNode,
) -> BTreeMap<String, RemoteEntry> {
    let mut out: BTreeMap<String, RemoteEntry> = BTreeMap::new();
    let mut pending = vec![(String::new(), root)];

    while let Some((path, handle)) = pending.pop() {
        // A shadowed sibling's subtree is skipped
        if !path.is_empty() && out.get(&path).map(|e| e.handle) != Some(handle) {
            continue;
        }
        let Some(node) = tree.get(handle) else {
            continue;
        };
        for child in node.children.iter().filter_map(|h| tree.get(*h)) {
            if path.is_empty() && child.name == debris {
                continue;
            }
            let child_path = join(&path, &child.name);
            let known = base.get(&child_path).and_then(|b| b.handle);
            if let Some(existing) = out.get(&child_path) {
                if Some(existing.handle) == known {
                    continue;
                }
            }
            out.insert(
                child_path.clone(),
                RemoteEntry {
                    kind: child.kind,
                    fingerprint: child.fingerprint.clone(),
                    handle: child.handle,
                },
            );
            if child.kind == NodeKind::Folder {
                pending.push((child_path, child.handle));
            }
        }
    }

    out
}

fn same_file(a: Option<&Fingerprint>, b: Option<&Fingerprint>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_content(b),
        (None, None) => true,
        _ => false,
    }
}

fn fetch(path: &str, kind: NodeKind, handle: NodeHandle) -> SyncAction {
    match kind {
        NodeKind::File => SyncAction::Download {
            path: path.to_string(),
            handle,
        },
        NodeKind::Folder => SyncAction::CreateLocalFolder {
            path: path.to_string(),
            handle,
        },
    }
}

fn send(path: &str, kind: NodeKind, replaces: Option<NodeHandle>) -> SyncAction {
    match kind {
        NodeKind::File => SyncAction::Upload {
            path: path.to_string(),
            replaces,
        },
        NodeKind::Folder => SyncAction::CreateRemoteFolder {
            path: path.to_string(),
        },
    }
}

struct Excluded(Vec<String>);

impl Excluded {
    fn covers(&self, path: &str) -> bool {
        self.0.iter().any(|p| is_within(path, p))
    }

    fn add(&mut self, path: &str) {
        self.0.push(path.to_string());
    }
}

/// Detect whole-item moves on either side.
///
/// A remote move is recognised by handle, a local move by inode. Moves whose
/// destination parent does not exist yet are held back for a later pass, but
/// their paths are still kept out of the per-name comparison.
fn plan_moves(
    local: &BTreeMap<String, LocalEntry>,
    remote: &BTreeMap<String, RemoteEntry>,
    base: &ReplicaNode,
    excluded: &mut Excluded,
) -> Vec<SyncAction> {
    let flat = base.flatten();
    let by_handle: HashMap<NodeHandle, &str> = remote
        .iter()
        .map(|(p, e)| (e.handle, p.as_str()))
        .collect();
    let by_inode: HashMap<u64, &str> = local
        .iter()
        .filter_map(|(p, e)| e.inode.map(|i| (i, p.as_str())))
        .collect();

    let mut actions = Vec::new();
    let mut sources: Vec<String> = Vec::new();

    for (from, node) in &flat {
        if sources.iter().any(|s| is_within(from, s)) {
            continue;
        }

        // Moved remotely, still in place locally
        if let Some(&to) = node.handle.as_ref().and_then(|h| by_handle.get(h)) {
            let local_here = local.get(from.as_str());
            if to != from.as_str()
                && local_here.map(|e| e.kind) == Some(node.kind)
                && !local.contains_key(to)
                && base.get(to).is_none()
                && !is_within(to, from)
            {
                sources.push(from.clone());
                excluded.add(from);
                excluded.add(to);
                if local.contains_key(split(to).0) || split(to).0.is_empty() {
                    actions.push(SyncAction::MoveLocal {
                        from: from.clone(),
                        to: to.to_string(),
                    });
                }
                continue;
            }
        }

        // Moved locally, still in place remotely
        let Some(inode) = node.inode else {
            continue;
        };
        let Some(&to) = by_inode.get(&inode) else {
            continue;
        };
        let Some(handle) = node.handle else {
            continue;
        };
        let moved = &local[to];
        let remote_here = remote.get(from.as_str());
        if to != from.as_str()
            && !local.contains_key(from.as_str())
            && moved.kind == node.kind
            && (node.kind == NodeKind::Folder
                || same_file(moved.fingerprint.as_ref(), node.fingerprint.as_ref()))
            && remote_here.map(|r| r.handle) == Some(handle)
            && base.get(to).is_none()
            && !remote.contains_key(to)
            && !is_within(to, from)
        {
            sources.push(from.clone());
            excluded.add(from);
            excluded.add(to);
            let parent_known = base
                .get(split(to).0)
                .map(|p| p.handle.is_some())
                .unwrap_or(false);
            if parent_known {
                actions.push(SyncAction::MoveRemote {
                    from: from.clone(),
                    to: to.to_string(),
                    handle,
                });
            }
        }
    }

    actions
}

/// Compare the three views of one sync and return the actions that bring
/// them back into agreement.
pub fn plan(
    local: &BTreeMap<String, LocalEntry>,
    remote: &BTreeMap<String, RemoteEntry>,
    base: &ReplicaNode,
) -> Vec<SyncAction> {
    let mut excluded = Excluded(Vec::new());
    let mut actions = plan_moves(local, remote, base, &mut excluded);

    let flat = base.flatten();
    let paths: BTreeSet<&str> = local
        .keys()
        .chain(remote.keys())
        .chain(flat.keys())
        .map(String::as_str)
        .collect();

    for path in paths {
        if excluded.covers(path) {
            continue;
        }
        let l = local.get(path);
        let r = remote.get(path);
        let b = flat.get(path).copied();

        match (l, r, b) {
            (Some(l), None, None) => actions.push(send(path, l.kind, None)),

            (None, Some(r), None) => actions.push(fetch(path, r.kind, r.handle)),

            (Some(l), Some(r), None) => {
                if l.kind == r.kind
                    && (l.kind == NodeKind::Folder
                        || same_file(l.fingerprint.as_ref(), r.fingerprint.as_ref()))
                {
                    actions.push(SyncAction::Adopt {
                        path: path.to_string(),
                        handle: r.handle,
                        entry: l.clone(),
                    });
                } else {
                    actions.push(SyncAction::MoveLocalToDebris {
                        path: path.to_string(),
                    });
                    actions.push(fetch(path, r.kind, r.handle));
                    if l.kind == NodeKind::Folder {
                        excluded.add(path);
                    }
                }
            }

            (Some(l), None, Some(b)) => {
                let edited = l.kind == NodeKind::File
                    && b.kind == NodeKind::File
                    && !same_file(l.fingerprint.as_ref(), b.fingerprint.as_ref());
                if edited {
                    actions.push(send(path, l.kind, None));
                } else {
                    actions.push(SyncAction::MoveLocalToDebris {
                        path: path.to_string(),
                    });
                    excluded.add(path);
                }
            }

            (None, Some(r), Some(b)) => {
                let untouched = Some(r.handle) == b.handle
                    && r.kind == b.kind
                    && (r.kind == NodeKind::Folder
                        || same_file(r.fingerprint.as_ref(), b.fingerprint.as_ref()));
                if untouched {
                    actions.push(SyncAction::UnlinkRemote {
                        path: path.to_string(),
                        handle: r.handle,
                    });
                    excluded.add(path);
                } else {
                    actions.push(fetch(path, r.kind, r.handle));
                }
            }

            (Some(l), Some(r), Some(b)) => {
                if l.kind != r.kind {
                    actions.push(SyncAction::MoveLocalToDebris {
                        path: path.to_string(),
                    });
                    actions.push(fetch(path, r.kind, r.handle));
                    if l.kind == NodeKind::Folder {
                        excluded.add(path);
                    }
                    continue;
                }
                if l.kind == NodeKind::Folder {
                    if Some(r.handle) != b.handle || l.inode != b.inode {
                        actions.push(SyncAction::Adopt {
                            path: path.to_string(),
                            handle: r.handle,
                            entry: l.clone(),
                        });
                    }
                    continue;
                }

                let local_edit = !same_file(l.fingerprint.as_ref(), b.fingerprint.as_ref());
                let remote_edit = Some(r.handle) != b.handle
                    || !same_file(r.fingerprint.as_ref(), b.fingerprint.as_ref());
                let agree = same_file(l.fingerprint.as_ref(), r.fingerprint.as_ref());

                match (local_edit, remote_edit) {
                    (false, false) => {
                        if l.inode != b.inode {
                            actions.push(SyncAction::Adopt {
                                path: path.to_string(),
                                handle: r.handle,
                                entry: l.clone(),
                            });
                        }
                    }
                    (true, false) => actions.push(send(path, l.kind, Some(r.handle))),
                    (false, true) => actions.push(fetch(path, r.kind, r.handle)),
                    (true, true) if agree => actions.push(SyncAction::Adopt {
                        path: path.to_string(),
                        handle: r.handle,
                        entry: l.clone(),
                    }),
                    (true, true) => {
                        actions.push(SyncAction::MoveLocalToDebris {
                            path: path.to_string(),
                        });
                        actions.push(fetch(path, r.kind, r.handle));
                    }
                }
            }

            (None, None, Some(_)) => {
                actions.push(SyncAction::ForgetBase {
                    path: path.to_string(),
                });
                excluded.add(path);
            }

            (None, None, None) => {}
        }
    }

    actions
}
