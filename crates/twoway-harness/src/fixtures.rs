//! Local filesystem helpers for building fixtures and applying local mutations.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Write `data` to `path`, replacing any existing file. Succeeds only once
/// every byte has been written and flushed.
pub fn create_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

pub fn create_file_with_timestamp(path: &Path, data: &[u8], mtime: SystemTime) -> io::Result<()> {
    create_file(path, data)?;
    set_mtime(path, mtime)
}

/// A file in `dir` whose content is its own name.
pub fn create_name_file(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    create_file(&path, name.as_bytes())?;
    Ok(path)
}

pub fn set_mtime(path: &Path, mtime: SystemTime) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(mtime)
}

/// On-disk twin of `ModelNode::subdir_tree`: folder `prefix` under `target`
/// with `files_per_dir` name files and, while `depth > 0`, `n` subfolders.
pub fn build_local_folders(
    target: &Path,
    prefix: &str,
    n: usize,
    depth: usize,
    files_per_dir: usize,
) -> io::Result<()> {
    let mut pending = vec![(target.join(prefix), prefix.to_string(), depth)];
    while let Some((dir, prefix, depth)) = pending.pop() {
        fs::create_dir_all(&dir)?;
        for i in 0..files_per_dir {
            create_name_file(&dir, &format!("file{}_{}", i, prefix))?;
        }
        if depth > 0 {
            for i in 0..n {
                let sub = format!("{}_{}", prefix, i);
                pending.push((dir.join(&sub), sub, depth - 1));
            }
        }
    }
    debug!("Built local folder tree {} under {}", prefix, target.display());
    Ok(())
}

/// Append `suffix` to the name of every direct subfolder of `dir`.
pub fn rename_local_folders(dir: &Path, suffix: &str) -> io::Result<usize> {
    let mut renamed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let mut name = entry.file_name();
        name.push(suffix);
        fs::rename(entry.path(), dir.join(name))?;
        renamed += 1;
    }
    Ok(renamed)
}

#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(unix)]
pub fn remove_symlink(link: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(link)?;
    if !meta.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a symlink", link.display()),
        ));
    }
    fs::remove_file(link)
}

/// Every path below `root`, relative to it, in sorted order. Symlinks are
/// listed but not followed.
pub fn list_recursive(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path.clone());
            }
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Deterministic pseudo-random payload.
pub fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}
