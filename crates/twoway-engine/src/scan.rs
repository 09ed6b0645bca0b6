//! Local filesystem scanning.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;
use twoway_core::{Fingerprint, NodeKind};

use crate::replica::join;

/// One local item found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub kind: NodeKind,
    pub fingerprint: Option<Fingerprint>,
    pub inode: Option<u64>,
}

pub fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn system_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64)
}

#[cfg(unix)]
pub fn inode_of(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
pub fn inode_of(_meta: &fs::Metadata) -> Option<u64> {
    None
}

/// Describe a single path, or `None` if it is absent or not a plain file/folder.
pub fn describe(path: &Path) -> io::Result<Option<LocalEntry>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        Ok(Some(LocalEntry {
            kind: NodeKind::Folder,
            fingerprint: None,
            inode: inode_of(&meta),
        }))
    } else if meta.is_file() {
        let content = fs::read(path)?;
        Ok(Some(LocalEntry {
            kind: NodeKind::File,
            fingerprint: Some(Fingerprint::of(&content, mtime_secs(&meta))),
            inode: inode_of(&meta),
        }))
    } else {
        Ok(None)
    }
}

/// Walk a sync root and describe every file and folder beneath it, keyed by
/// sync-relative path. The top-level debris folder and symlinks are skipped.
pub fn scan(root: &Path, debris: &str) -> io::Result<BTreeMap<String, LocalEntry>> {
    let mut out = BTreeMap::new();
    let mut pending = vec![String::new()];

    while let Some(rel) = pending.pop() {
        let dir = if rel.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&rel)
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Vanished between listing and descent
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!("scan: skipping non-UTF-8 name in {}", dir.display());
                continue;
            };
            if rel.is_empty() && name == debris {
                continue;
            }
            let child_rel = join(&rel, &name);
            match describe(&entry.path())? {
                Some(found) => {
                    if found.kind == NodeKind::Folder {
                        pending.push(child_rel.clone());
                    }
                    out.insert(child_rel, found);
                }
                None => continue,
            }
        }
    }

    Ok(out)
}
