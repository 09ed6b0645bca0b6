//! Expected-state tree used as the oracle for reconciliation.
//!
//! Nodes own their children; paths are slash-delimited and relative to the
//! model root. Mutations always go through the owning parent, so there is
//! no parent link to keep in step.

use std::fmt;
use std::io;
use std::path::Path;

use twoway_core::NodeKind;

use crate::fixtures;

/// Name of today's folder inside a sync's debris folder.
pub fn debris_day() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

fn parts(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

fn split_leaf(path: &str) -> (Vec<&str>, Option<&str>) {
    let mut parts = parts(path);
    let leaf = parts.pop();
    (parts, leaf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelNode {
    pub kind: NodeKind,
    pub name: String,
    /// File payload; always empty for folders.
    pub content: Vec<u8>,
    /// Content still has to be written by [`Model::generate`].
    pub changed: bool,
    pub kids: Vec<ModelNode>,
}

impl ModelNode {
    pub fn folder(name: impl Into<String>) -> Self {
        ModelNode {
            kind: NodeKind::Folder,
            name: name.into(),
            content: Vec::new(),
            changed: false,
            kids: Vec::new(),
        }
    }

    /// A file node holding exactly `content`.
    pub fn file(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        ModelNode {
            kind: NodeKind::File,
            name: name.into(),
            content: content.into(),
            changed: true,
            kids: Vec::new(),
        }
    }

    /// A file whose content is its own name, as `fixtures::create_name_file` writes it.
    pub fn name_file(name: impl Into<String>) -> Self {
        let name = name.into();
        let content = name.as_bytes().to_vec();
        ModelNode::file(name, content)
    }

    /// Folder `prefix` holding `files_per_dir` files `file{i}_{prefix}` and,
    /// while `depth > 0`, `n` subfolders `{prefix}_{i}` built the same way.
    pub fn subdir_tree(prefix: &str, n: usize, depth: usize, files_per_dir: usize) -> Self {
        let mut folder = ModelNode::folder(prefix);
        for i in 0..files_per_dir {
            folder.add_kid(ModelNode::name_file(format!("file{}_{}", i, prefix)));
        }
        if depth > 0 {
            for i in 0..n {
                let sub = format!("{}_{}", prefix, i);
                folder.add_kid(ModelNode::subdir_tree(&sub, n, depth - 1, files_per_dir));
            }
        }
        folder
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    pub fn kid(&self, name: &str) -> Option<&ModelNode> {
        self.kids.iter().find(|k| k.name == name)
    }

    pub fn kid_mut(&mut self, name: &str) -> Option<&mut ModelNode> {
        self.kids.iter_mut().find(|k| k.name == name)
    }

    /// Attach `node`, replacing any sibling of the same name.
    pub fn add_kid(&mut self, node: ModelNode) -> &mut ModelNode {
        self.kids.retain(|k| k.name != node.name);
        self.kids.push(node);
        let last = self.kids.len() - 1;
        &mut self.kids[last]
    }

    pub fn remove_kid(&mut self, name: &str) -> Option<ModelNode> {
        let idx = self.kids.iter().position(|k| k.name == name)?;
        Some(self.kids.remove(idx))
    }

    pub fn set_content(&mut self, content: impl Into<Vec<u8>>) {
        self.content = content.into();
        self.changed = true;
    }

    /// Nodes in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self.kids.iter().map(ModelNode::count).sum::<usize>()
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, prefix: &str) -> fmt::Result {
        let path = format!("{}/{}", prefix, self.name);
        match self.kind {
            NodeKind::File => writeln!(f, "{} ({} bytes)", path, self.content.len()),
            NodeKind::Folder => {
                writeln!(f, "{}", path)?;
                let mut kids: Vec<&ModelNode> = self.kids.iter().collect();
                kids.sort_by(|a, b| a.name.cmp(&b.name));
                for kid in kids {
                    kid.fmt_tree(f, &path)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ModelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_tree(f, "")
    }
}

/// Walk `parts` below `node`, creating missing folders. Fails on a file.
fn folder_path_mut<'a>(mut node: &'a mut ModelNode, parts: &[&str]) -> Option<&'a mut ModelNode> {
    for part in parts {
        if !node.is_folder() {
            return None;
        }
        let idx = match node.kids.iter().position(|k| k.name == *part) {
            Some(idx) => idx,
            None => {
                node.kids.push(ModelNode::folder(*part));
                node.kids.len() - 1
            }
        };
        node = &mut node.kids[idx];
    }
    node.is_folder().then_some(node)
}

/// The oracle: a synthetic root plus the debris folder name the engine uses.
#[derive(Debug, Clone)]
pub struct Model {
    pub root: ModelNode,
    debris: String,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self::with_debris(".debris")
    }

    pub fn with_debris(debris: impl Into<String>) -> Self {
        Model {
            root: ModelNode::folder(""),
            debris: debris.into(),
        }
    }

    pub fn debris(&self) -> &str {
        &self.debris
    }

    pub fn find(&self, path: &str) -> Option<&ModelNode> {
        let mut node = &self.root;
        for part in parts(path) {
            node = node.kid(part)?;
        }
        Some(node)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut ModelNode> {
        let mut node = &mut self.root;
        for part in parts(path) {
            node = node.kid_mut(part)?;
        }
        Some(node)
    }

    fn existing_folder_mut(&mut self, path: &str) -> Option<&mut ModelNode> {
        self.find_mut(path).filter(|n| n.is_folder())
    }

    /// Add (or fetch) a folder, creating intermediate folders.
    pub fn add_folder(&mut self, path: &str) -> Option<&mut ModelNode> {
        folder_path_mut(&mut self.root, &parts(path))
    }

    /// Add a file, creating intermediate folders. An existing file at the
    /// same path gets the new content.
    pub fn add_file(&mut self, path: &str, content: impl Into<Vec<u8>>) -> Option<&mut ModelNode> {
        let (dirs, leaf) = split_leaf(path);
        let leaf = leaf?;
        let parent = folder_path_mut(&mut self.root, &dirs)?;
        if parent.kid(leaf).is_some_and(|k| k.is_folder()) {
            return None;
        }
        Some(parent.add_kid(ModelNode::file(leaf, content)))
    }

    /// A file whose content is its own path.
    pub fn touch_file(&mut self, path: &str) -> Option<&mut ModelNode> {
        let content = path.as_bytes().to_vec();
        self.add_file(path, content)
    }

    /// Attach a prebuilt subtree under `parent_path` (empty for the root).
    pub fn add_subtree(&mut self, parent_path: &str, node: ModelNode) -> bool {
        match folder_path_mut(&mut self.root, &parts(parent_path)) {
            Some(parent) => {
                parent.add_kid(node);
                true
            }
            None => false,
        }
    }

    /// Copy `src` under the existing folder `dst`.
    pub fn copy(&mut self, src: &str, dst: &str) -> bool {
        let Some(node) = self.find(src).cloned() else {
            return false;
        };
        match self.existing_folder_mut(dst) {
            Some(parent) if parent.kid(&node.name).is_none() => {
                parent.add_kid(node);
                true
            }
            _ => false,
        }
    }

    /// Detach the subtree at `path` and hand it to the caller.
    pub fn remove(&mut self, path: &str) -> Option<ModelNode> {
        let (dirs, leaf) = split_leaf(path);
        let leaf = leaf?;
        let mut parent = &mut self.root;
        for part in dirs {
            parent = parent.kid_mut(part)?;
        }
        parent.remove_kid(leaf)
    }

    /// Move `src` under the existing folder `dst`. Fails if `dst` already
    /// holds an item of the same name or lies inside `src`.
    pub fn move_node(&mut self, src: &str, dst: &str) -> bool {
        let src_parts = parts(src);
        let dst_parts = parts(dst);
        if src_parts.is_empty() || dst_parts.starts_with(&src_parts) {
            return false;
        }
        let Some(name) = self.find(src).map(|n| n.name.clone()) else {
            return false;
        };
        match self.find(dst) {
            Some(d) if d.is_folder() && d.kid(&name).is_none() => {}
            _ => return false,
        }
        match self.remove(src) {
            Some(node) => self.add_subtree(dst, node),
            None => false,
        }
    }

    /// Relocate `path` into `<syncroot>/<debris>/<today>`, creating the
    /// folders on first use. A name already taken there gets a ` (n)` suffix.
    /// The sync root itself, or anything holding it, cannot be trashed.
    pub fn move_to_trash(&mut self, path: &str, syncroot: &str) -> bool {
        if self.find(path).is_none() {
            return false;
        }
        let day = format!("{}/{}/{}", syncroot, self.debris, debris_day());
        if parts(&day).starts_with(&parts(path)) {
            return false;
        }
        if self.add_folder(&day).is_none() {
            return false;
        }
        let Some(mut node) = self.remove(path) else {
            return false;
        };
        let Some(folder) = self.find_mut(&day) else {
            return false;
        };
        let base = node.name.clone();
        let mut n = 1;
        while folder.kid(&node.name).is_some() {
            node.name = format!("{} ({})", base, n);
            n += 1;
        }
        folder.add_kid(node);
        true
    }

    /// With an empty `subpath`, drop the whole debris folder of `syncroot`;
    /// otherwise drop `subpath` from today's debris folder.
    pub fn remove_sync_trash(&mut self, syncroot: &str, subpath: &str) -> bool {
        let target = if subpath.is_empty() {
            format!("{}/{}", syncroot, self.debris)
        } else {
            format!("{}/{}/{}/{}", syncroot, self.debris, debris_day(), subpath)
        };
        self.remove(&target).is_some()
    }

    /// Mirror the lock file the engine leaves after its first download.
    pub fn ensure_local_debris_tmp_lock(&mut self, syncroot: &str) -> bool {
        let path = format!("{}/{}/tmp/lock", syncroot, self.debris);
        self.add_file(&path, Vec::new()).is_some()
    }

    pub fn emulate_rename(&mut self, path: &str, new_name: &str) -> bool {
        let (dirs, Some(leaf)) = split_leaf(path) else {
            return false;
        };
        let parent_path = dirs.join("/");
        let Some(parent) = self.existing_folder_mut(&parent_path) else {
            return false;
        };
        let Some(mut node) = parent.remove_kid(leaf) else {
            return false;
        };
        node.name = new_name.to_string();
        parent.add_kid(node);
        true
    }

    /// Move `path` under `new_parent`, replacing any same-named item there.
    pub fn emulate_move(&mut self, path: &str, new_parent: &str) -> bool {
        let Some(name) = self.find(path).map(|n| n.name.clone()) else {
            return false;
        };
        let (dirs, _) = split_leaf(path);
        if dirs == parts(new_parent) {
            return true;
        }
        if parts(new_parent).starts_with(&parts(path)) {
            return false;
        }
        if let Some(parent) = self.existing_folder_mut(new_parent) {
            parent.remove_kid(&name);
        } else {
            return false;
        }
        self.move_node(path, new_parent)
    }

    /// Copy `path` under `new_parent`, replacing any same-named item there.
    pub fn emulate_copy(&mut self, path: &str, new_parent: &str) -> bool {
        let Some(node) = self.find(path).cloned() else {
            return false;
        };
        match self.existing_folder_mut(new_parent) {
            Some(parent) => {
                parent.add_kid(node);
                true
            }
            None => false,
        }
    }

    pub fn emulate_rename_copy(&mut self, path: &str, new_parent: &str, new_name: &str) -> bool {
        let Some(mut node) = self.find(path).cloned() else {
            return false;
        };
        node.name = new_name.to_string();
        match self.existing_folder_mut(new_parent) {
            Some(parent) => {
                parent.add_kid(node);
                true
            }
            None => false,
        }
    }

    pub fn emulate_delete(&mut self, path: &str) -> bool {
        self.remove(path).is_some()
    }

    /// Materialize every node under `dest`. Only files flagged as changed
    /// are (re)written; the flag is cleared once the write completes.
    pub fn generate(&mut self, dest: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dest)?;
        for kid in &mut self.root.kids {
            generate_node(kid, dest)?;
        }
        Ok(())
    }
}

fn generate_node(node: &mut ModelNode, parent: &Path) -> io::Result<()> {
    let path = parent.join(&node.name);
    match node.kind {
        NodeKind::Folder => {
            std::fs::create_dir_all(&path)?;
            for kid in &mut node.kids {
                generate_node(kid, &path)?;
            }
        }
        NodeKind::File => {
            if node.changed {
                fixtures::create_file(&path, &node.content)?;
                node.changed = false;
            }
        }
    }
    Ok(())
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kid in &self.root.kids {
            kid.fmt_tree(f, "")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(node: &ModelNode) -> Vec<&str> {
        let mut names: Vec<&str> = node.kids.iter().map(|k| k.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    #[test]
    fn test_subdir_tree_shape() {
        let tree = ModelNode::subdir_tree("f", 2, 2, 1);
        assert_eq!(names(&tree), vec!["f_0", "f_1", "file0_f"]);
        let f_1 = tree.kid("f_1").unwrap();
        assert_eq!(names(f_1), vec!["f_1_0", "f_1_1", "file0_f_1"]);
        let leaf = f_1.kid("f_1_0").unwrap();
        assert_eq!(names(leaf), vec!["file0_f_1_0"]);
        assert_eq!(leaf.kid("file0_f_1_0").unwrap().content, b"file0_f_1_0");
        // 1 + 1 file + 2 * (1 + 1 + 2 * 2)
        assert_eq!(tree.count(), 14);
    }

    #[test]
    fn test_add_file_creates_intermediate_folders() {
        let mut m = Model::new();
        assert!(m.add_file("a/b/c", b"x".to_vec()).is_some());
        assert!(m.find("a/b").unwrap().is_folder());
        assert_eq!(m.find("a/b/c").unwrap().content, b"x");
        // A file cannot be used as a folder
        assert!(m.add_file("a/b/c/d", b"y".to_vec()).is_none());
        assert!(m.add_file("a/b", b"y".to_vec()).is_none());
        m.touch_file("a/t");
        assert_eq!(m.find("a/t").unwrap().content, b"a/t");
    }

    #[test]
    fn test_move_requires_existing_folder() {
        let mut m = Model::new();
        m.add_subtree("", ModelNode::subdir_tree("f", 3, 2, 0));
        assert!(!m.move_node("f/f_0", "f/missing"));
        assert!(!m.move_node("f", "f/f_0"));
        assert!(m.move_node("f/f_2/f_2_1", "f"));
        assert!(m.find("f/f_2_1").unwrap().is_folder());
        assert!(m.find("f/f_2/f_2_1").is_none());
        assert!(m.find("f/f_2/f_2_0").is_some());
        // Taken name at the destination
        m.add_folder("f/f_1/f_2_1");
        assert!(!m.move_node("f/f_1/f_2_1", "f"));
        assert!(m.find("f/f_1/f_2_1").is_some());
    }

    #[test]
    fn test_move_to_trash_reuses_date_folder() {
        let mut m = Model::new();
        m.add_subtree("", ModelNode::subdir_tree("f", 2, 2, 0));
        assert!(m.move_to_trash("f/f_0", "f"));
        assert!(m.move_to_trash("f/f_1/f_1_0", "f"));
        assert!(!m.move_to_trash("f/nothing", "f"));
        // Same name again gets a suffix in the same day folder
        m.add_folder("f/f_0");
        assert!(m.move_to_trash("f/f_0", "f"));

        let debris = m.find("f/.debris").unwrap();
        assert_eq!(debris.kids.len(), 1);
        let day = m.find(&format!("f/.debris/{}", debris_day())).unwrap();
        assert_eq!(names(day), vec!["f_0", "f_0 (1)", "f_1_0"]);
    }

    #[test]
    fn test_move_to_trash_rejects_sync_root() {
        let mut m = Model::new();
        m.add_subtree("", ModelNode::subdir_tree("f", 2, 1, 1));
        let before = m.clone();

        assert!(!m.move_to_trash("f", "f"));
        assert!(!m.move_to_trash("", "f"));
        assert_eq!(m.root, before.root);

        // A sync root nested in the trashed folder is rejected too
        assert!(!m.move_to_trash("f", "f/f_0"));
        assert_eq!(m.root, before.root);
        assert!(m.find("f/f_0/.debris").is_none());
    }

    #[test]
    fn test_file_content_is_stored_as_given() {
        let mut m = Model::new();
        assert!(m.add_file("d/empty", Vec::new()).is_some());
        assert!(m.find("d/empty").unwrap().content.is_empty());
        assert_eq!(ModelNode::file("n", Vec::new()).content, b"");
        assert_eq!(ModelNode::name_file("n").content, b"n");

        let dir = tempfile::tempdir().unwrap();
        m.generate(dir.path()).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("d/empty")).unwrap().len(), 0);
    }

    #[test]
    fn test_remove_sync_trash() {
        let mut m = Model::new();
        m.add_subtree("", ModelNode::subdir_tree("f", 2, 3, 0));
        m.move_to_trash("f/f_1", "f");
        assert!(m.remove_sync_trash("f", "f_1/f_1_0/f_1_0_1"));
        assert!(m
            .find(&format!("f/.debris/{}/f_1/f_1_0/f_1_0_0", debris_day()))
            .is_some());
        assert!(m.remove_sync_trash("f", ""));
        assert!(m.find("f/.debris").is_none());
        assert!(!m.remove_sync_trash("f", ""));
    }

    #[test]
    fn test_emulations() {
        let mut m = Model::new();
        m.add_subtree("", ModelNode::subdir_tree("f", 2, 2, 1));

        assert!(m.emulate_rename("f/f_0", "f_0_renamed"));
        assert!(m.find("f/f_0_renamed/file0_f_0").is_some());

        // Move replaces a same-named target
        m.add_file("f/f_0_renamed/file0_f_1", b"old".to_vec());
        assert!(m.emulate_move("f/f_1/file0_f_1", "f/f_0_renamed"));
        assert_eq!(m.find("f/f_0_renamed/file0_f_1").unwrap().content, b"file0_f_1");
        assert!(m.find("f/f_1/file0_f_1").is_none());

        assert!(m.emulate_copy("f/f_1", "f/f_0_renamed"));
        assert!(m.find("f/f_1/f_1_0").is_some());
        assert!(m.find("f/f_0_renamed/f_1/f_1_0").is_some());

        assert!(m.emulate_rename_copy("f/file0_f", "f/f_1", "copied"));
        assert!(m.find("f/f_1/copied").is_some());
        assert!(m.find("f/file0_f").is_some());

        assert!(m.emulate_delete("f/f_1"));
        assert!(!m.emulate_delete("f/f_1"));
    }

    #[test]
    fn test_debris_tmp_lock() {
        let mut m = Model::with_debris("trash");
        m.add_folder("d");
        assert!(m.ensure_local_debris_tmp_lock("d"));
        assert!(m.find("d/trash/tmp/lock").is_some());
    }

    #[test]
    fn test_generate_writes_changed_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = Model::new();
        m.add_subtree("", ModelNode::subdir_tree("g", 1, 1, 1));
        m.generate(dir.path()).unwrap();
        let file = dir.path().join("g/g_0/file0_g_0");
        assert_eq!(std::fs::read(&file).unwrap(), b"file0_g_0");
        assert!(!m.find("g/g_0/file0_g_0").unwrap().changed);

        // Unchanged nodes are left alone on disk
        std::fs::write(&file, b"edited").unwrap();
        m.generate(dir.path()).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"edited");

        m.find_mut("g/g_0/file0_g_0").unwrap().set_content(b"again".to_vec());
        m.generate(dir.path()).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"again");
    }

    #[test]
    fn test_display_lists_paths() {
        let mut m = Model::new();
        m.add_file("x/f", b"abc".to_vec());
        assert_eq!(m.to_string(), "/x\n/x/f (3 bytes)\n");
    }
}
