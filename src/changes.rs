use core::fmt;
use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

use stacked_errors::{bail, Result, StackableErr};

// The differ is deliberately synchronous: it is compute over `lstat` results
// and is driven from the commit path, not the session loop.

const S_IFDIR: u32 = 0o040000;
const WHITEOUT_PREFIX: &str = ".wh.";
// AUFS bookkeeping entries, never part of the logical tree
const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
}

/// One entry of a computed change set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ChangeKind::Modify => "C",
            ChangeKind::Add => "A",
            ChangeKind::Delete => "D",
        };
        write!(f, "{kind} {}", self.path)
    }
}

/// The minimal stat record the differ compares. Inode, ctime, and block
/// counts are deliberately absent: they change when copying a file into a
/// container and would produce false positives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

#[cfg(unix)]
impl From<&fs::Metadata> for Stat {
    fn from(md: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev(),
            size: md.size(),
            mtime_sec: md.mtime(),
            mtime_nsec: md.mtime_nsec(),
        }
    }
}

impl Stat {
    fn is_dir(&self) -> bool {
        (self.mode & S_IFDIR) == S_IFDIR
    }

    fn differs_from(&self, other: &Stat) -> bool {
        // timevals like the original interface reported, not raw nanoseconds
        let usec = self.mtime_nsec / 1000;
        let other_usec = other.mtime_nsec / 1000;
        (self.mode != other.mode)
            || (self.uid != other.uid)
            || (self.gid != other.gid)
            || (self.rdev != other.rdev)
            // don't look at size for dirs, it's not a good measure of change
            || ((self.size != other.size) && !other.is_dir())
            || (self.mtime_sec != other.mtime_sec)
            || (usec != other_usec)
    }
}

#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    name: String,
    stat: Stat,
    children: BTreeMap<String, usize>,
}

/// A rooted in-memory snapshot of a directory tree, arena-backed so nodes can
/// refer to their parents without reference cycles. Ephemeral per diff.
#[derive(Debug)]
pub struct FileTree {
    nodes: Vec<Node>,
}

const ROOT: usize = 0;

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTree {
    /// An empty tree holding only the root
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                name: "/".to_owned(),
                stat: Stat::default(),
                children: BTreeMap::new(),
            }],
        }
    }

    fn add_child(&mut self, parent: usize, name: &str, stat: Stat) -> usize {
        let ix = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            name: name.to_owned(),
            stat,
            children: BTreeMap::new(),
        });
        // a replaced entry becomes unreachable, which is all removal means here
        self.nodes[parent].children.insert(name.to_owned(), ix);
        ix
    }

    fn look_up(&self, path: &str) -> Option<usize> {
        let mut ix = ROOT;
        for elem in path.split('/').filter(|e| !e.is_empty()) {
            ix = *self.nodes[ix].children.get(elem)?;
        }
        Some(ix)
    }

    fn path_of(&self, ix: usize) -> String {
        let mut parts = vec![];
        let mut at = ix;
        while let Some(parent) = self.nodes[at].parent {
            parts.push(self.nodes[at].name.as_str());
            at = parent;
        }
        if parts.is_empty() {
            return "/".to_owned();
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        path
    }

    /// Unlinks the subtree at `path`; returns whether anything was removed
    pub fn remove(&mut self, path: &str) -> bool {
        if let Some(ix) = self.look_up(path) {
            if let Some(parent) = self.nodes[ix].parent {
                let name = self.nodes[ix].name.clone();
                self.nodes[parent].children.remove(&name);
                return true;
            }
        }
        false
    }

    fn is_dir(&self, ix: usize) -> bool {
        self.nodes[ix].parent.is_none() || self.nodes[ix].stat.is_dir()
    }

    /// The change set that turns `old` into `self`
    pub fn changes_from(&self, old: &FileTree) -> Vec<Change> {
        let mut changes = vec![];
        self.add_changes(ROOT, old, Some(ROOT), &mut changes);
        changes
    }

    fn add_changes(
        &self,
        new_ix: usize,
        old: &FileTree,
        old_ix: Option<usize>,
        changes: &mut Vec<Change>,
    ) {
        if old_ix.is_none() {
            changes.push(Change {
                path: self.path_of(new_ix),
                kind: ChangeKind::Add,
            });
        }

        // we make a copy so we can drain it to detect deletions. Also, we only
        // recurse on the old dir if the new node is a directory, otherwise any
        // previous delete/change is considered recursive
        let mut old_children: BTreeMap<&str, usize> = BTreeMap::new();
        if let Some(old_ix) = old_ix {
            if self.is_dir(new_ix) {
                for (name, ix) in &old.nodes[old_ix].children {
                    old_children.insert(name, *ix);
                }
            }
        }

        for (name, new_child) in &self.nodes[new_ix].children {
            let old_child = old_children.remove(name.as_str());
            if let Some(old_child) = old_child {
                let old_stat = &old.nodes[old_child].stat;
                let new_stat = &self.nodes[*new_child].stat;
                if new_stat.differs_from(old_stat) {
                    changes.push(Change {
                        path: self.path_of(*new_child),
                        kind: ChangeKind::Modify,
                    });
                }
            }
            self.add_changes(*new_child, old, old_child, changes);
        }
        for old_child in old_children.into_values() {
            changes.push(Change {
                path: old.path_of(old_child),
                kind: ChangeKind::Delete,
            });
        }
    }
}

/// Snapshots the tree below `source_dir`. Symlinks are recorded, not
/// followed.
pub fn collect_file_info(source_dir: impl AsRef<Path>) -> Result<FileTree> {
    let source_dir = source_dir.as_ref();
    let mut tree = FileTree::new();
    collect_into(&mut tree, ROOT, source_dir)
        .stack_err_with(|| format!("collect_file_info({source_dir:?})"))?;
    Ok(tree)
}

fn sorted_entries(dir: &Path) -> Result<Vec<(String, fs::Metadata)>> {
    let mut out = vec![];
    for entry in fs::read_dir(dir).stack_err_with(|| format!("can't read {dir:?}"))? {
        let entry = entry.stack()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let md = fs::symlink_metadata(entry.path()).stack()?;
        out.push((name, md));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn collect_into(tree: &mut FileTree, parent: usize, dir: &Path) -> Result<()> {
    for (name, md) in sorted_entries(dir)? {
        let ix = tree.add_child(parent, &name, Stat::from(&md));
        if md.file_type().is_dir() {
            collect_into(tree, ix, &dir.join(&name))?;
        }
    }
    Ok(())
}

/// Overlays one layer directory onto `tree`. Whiteout files (`.wh.<name>`)
/// remove the named sibling subtree; they are applied after the layer's own
/// additions so that a whiteout wins over a same-layer add no matter the walk
/// order. AUFS metadata (`.wh..wh.*`) is skipped entirely.
pub fn apply_layer(tree: &mut FileTree, layer: impl AsRef<Path>) -> Result<()> {
    let layer = layer.as_ref();
    let mut whiteouts = vec![];
    apply_layer_dir(tree, layer, "", &mut whiteouts)
        .stack_err_with(|| format!("apply_layer({layer:?})"))?;
    for target in whiteouts {
        // a whiteout of something the stack never had is fine
        let _ = tree.remove(&target);
    }
    Ok(())
}

fn apply_layer_dir(
    tree: &mut FileTree,
    dir: &Path,
    rel: &str,
    whiteouts: &mut Vec<String>,
) -> Result<()> {
    for (name, md) in sorted_entries(dir)? {
        let rel_path = format!("{rel}/{name}");
        if rel.is_empty() && name.starts_with(WHITEOUT_META_PREFIX) {
            // prune metadata directories, skip metadata files
            continue;
        }
        if let Some(original) = name.strip_prefix(WHITEOUT_PREFIX) {
            whiteouts.push(format!("{rel}/{original}"));
            continue;
        }
        let stat = Stat::from(&md);
        match tree.look_up(&rel_path) {
            Some(existing) => {
                tree.nodes[existing].stat = stat;
                if !tree.is_dir(existing) {
                    // changed from dir to non-dir, drop all previous files
                    tree.nodes[existing].children.clear();
                }
            }
            None => {
                let parent = match tree.look_up(rel) {
                    Some(parent) => parent,
                    None => bail!("apply_layer: unexpectedly no parent for {rel_path}"),
                };
                tree.add_child(parent, &name, stat);
            }
        }
        if md.file_type().is_dir() {
            apply_layer_dir(tree, &dir.join(&name), &rel_path, whiteouts)?;
        }
    }
    Ok(())
}

/// Compares `new_dir` against the stack of layer directories it was built
/// from and returns the change set.
///
/// The layers are applied from the *last* index to the first: the tail of the
/// slice is the base layer and earlier entries stack on top of it. This
/// matches the historical call sites and is part of the function's contract.
pub fn changes_layers(
    new_dir: impl AsRef<Path>,
    layers: &[impl AsRef<Path>],
) -> Result<Vec<Change>> {
    let new_tree = collect_file_info(new_dir)?;
    let mut old_tree = FileTree::new();
    for layer in layers.iter().rev() {
        apply_layer(&mut old_tree, layer)?;
    }
    Ok(new_tree.changes_from(&old_tree))
}

/// Compares two directories and returns the change set. The engine's own
/// `/.docker-id` marker is ignored on both sides.
pub fn changes_dirs(new_dir: impl AsRef<Path>, old_dir: impl AsRef<Path>) -> Result<Vec<Change>> {
    let mut old_tree = collect_file_info(old_dir)?;
    let mut new_tree = collect_file_info(new_dir)?;
    let _ = new_tree.remove("/.docker-id");
    let _ = old_tree.remove("/.docker-id");
    Ok(new_tree.changes_from(&old_tree))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn file_stat(size: u64, mtime_sec: i64) -> Stat {
        Stat {
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size,
            mtime_sec,
            mtime_nsec: 0,
        }
    }

    fn dir_stat() -> Stat {
        Stat {
            mode: 0o040755,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 4096,
            mtime_sec: 1,
            mtime_nsec: 0,
        }
    }

    fn kinds(changes: &[Change], kind: ChangeKind) -> BTreeSet<String> {
        changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.path.clone())
            .collect()
    }

    #[test]
    fn tree_paths_and_removal() {
        let mut t = FileTree::new();
        let a = t.add_child(ROOT, "a", dir_stat());
        let b = t.add_child(a, "b", file_stat(1, 1));
        assert_eq!(t.path_of(ROOT), "/");
        assert_eq!(t.path_of(b), "/a/b");
        assert_eq!(t.look_up("/a/b"), Some(b));
        assert_eq!(t.look_up("/"), Some(ROOT));
        assert!(t.remove("/a/b"));
        assert_eq!(t.look_up("/a/b"), None);
        assert!(!t.remove("/a/b"));
    }

    #[test]
    fn modify_detection_samples_both_sides() {
        let mut old = FileTree::new();
        let oa = old.add_child(ROOT, "a", dir_stat());
        old.add_child(oa, "same", file_stat(5, 10));
        old.add_child(oa, "touched", file_stat(5, 10));
        old.add_child(oa, "grown", file_stat(5, 10));

        let mut new = FileTree::new();
        let na = new.add_child(ROOT, "a", dir_stat());
        new.add_child(na, "same", file_stat(5, 10));
        new.add_child(na, "touched", file_stat(5, 99));
        new.add_child(na, "grown", file_stat(6, 10));

        let changes = new.changes_from(&old);
        assert_eq!(
            kinds(&changes, ChangeKind::Modify),
            BTreeSet::from(["/a/grown".to_owned(), "/a/touched".to_owned()])
        );
        assert!(kinds(&changes, ChangeKind::Add).is_empty());
        assert!(kinds(&changes, ChangeKind::Delete).is_empty());
    }

    #[test]
    fn dir_size_is_ignored() {
        let mut old = FileTree::new();
        old.add_child(ROOT, "d", dir_stat());
        let mut new = FileTree::new();
        let mut bigger = dir_stat();
        bigger.size = 8192;
        new.add_child(ROOT, "d", bigger);
        assert!(new.changes_from(&old).is_empty());
    }

    #[test]
    fn adds_recurse_and_deletes_surface() {
        let old = FileTree::new();
        let mut new = FileTree::new();
        let d = new.add_child(ROOT, "d", dir_stat());
        new.add_child(d, "inner", file_stat(1, 1));
        // an added directory reports itself and every descendant
        let changes = new.changes_from(&old);
        assert_eq!(
            kinds(&changes, ChangeKind::Add),
            BTreeSet::from(["/d".to_owned(), "/d/inner".to_owned()])
        );
        // and the reverse diff deletes them
        let changes = old.changes_from(&new);
        assert_eq!(
            kinds(&changes, ChangeKind::Delete),
            BTreeSet::from(["/d".to_owned()])
        );
    }

    #[test]
    fn each_path_lands_in_one_category() {
        let mut old = FileTree::new();
        let oa = old.add_child(ROOT, "a", dir_stat());
        old.add_child(oa, "gone", file_stat(1, 1));
        old.add_child(oa, "kept", file_stat(1, 1));
        let mut new = FileTree::new();
        let na = new.add_child(ROOT, "a", dir_stat());
        new.add_child(na, "kept", file_stat(2, 2));
        new.add_child(na, "fresh", file_stat(1, 1));
        let changes = new.changes_from(&old);
        let mut seen = BTreeSet::new();
        for c in &changes {
            assert!(seen.insert(c.path.clone()), "{} reported twice", c.path);
        }
        assert_eq!(kinds(&changes, ChangeKind::Add), BTreeSet::from(["/a/fresh".to_owned()]));
        assert_eq!(kinds(&changes, ChangeKind::Modify), BTreeSet::from(["/a/kept".to_owned()]));
        assert_eq!(kinds(&changes, ChangeKind::Delete), BTreeSet::from(["/a/gone".to_owned()]));
    }

    fn touch(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn dirs_comparison_ignores_docker_id() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old");
        let new = tmp.path().join("new");
        touch(&old.join("a/b"), "b");
        touch(&old.join(".docker-id"), "one");
        touch(&new.join("a/b"), "b");
        touch(&new.join(".docker-id"), "two");
        touch(&new.join("a/c"), "c");
        let changes = changes_dirs(&new, &old).unwrap();
        assert_eq!(kinds(&changes, ChangeKind::Add), BTreeSet::from(["/a/c".to_owned()]));
        assert!(kinds(&changes, ChangeKind::Delete).is_empty());
        assert!(!changes.iter().any(|c| c.path.contains(".docker-id")));
    }

    #[test]
    fn layers_stack_from_the_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        let top = tmp.path().join("top");
        let new = tmp.path().join("new");
        touch(&base.join("a/b"), "b");
        touch(&base.join("a/c"), "c");
        // the top layer whites out a/c and introduces d
        touch(&top.join("a/.wh.c"), "");
        touch(&top.join("d"), "d");
        // the materialized result of the full stack
        touch(&new.join("a/b"), "b");
        touch(&new.join("d"), "d");

        // against the base alone, the result shows the top layer's work
        let changes = changes_layers(&new, &[&base]).unwrap();
        assert_eq!(kinds(&changes, ChangeKind::Add), BTreeSet::from(["/d".to_owned()]));
        assert_eq!(kinds(&changes, ChangeKind::Delete), BTreeSet::from(["/a/c".to_owned()]));
        // a/b survives the stack untouched
        assert!(!kinds(&changes, ChangeKind::Add).contains("/a/b"));
        assert!(!kinds(&changes, ChangeKind::Delete).contains("/a/b"));

        // against the full stack (tail is the base), adds and deletes cancel
        let changes = changes_layers(&new, &[&top, &base]).unwrap();
        assert!(kinds(&changes, ChangeKind::Add).is_empty());
        assert!(kinds(&changes, ChangeKind::Delete).is_empty());
    }

    #[test]
    fn whiteout_wins_within_a_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = tmp.path().join("layer");
        touch(&layer.join("foo"), "foo");
        touch(&layer.join(".wh.foo"), "");
        // "zz" sorts after "foo", exercising the non-walk-order application
        touch(&layer.join(".wh.zz"), "");
        touch(&layer.join("zz"), "zz");
        let mut tree = FileTree::new();
        apply_layer(&mut tree, &layer).unwrap();
        assert_eq!(tree.look_up("/foo"), None);
        assert_eq!(tree.look_up("/zz"), None);
    }

    #[test]
    fn aufs_metadata_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = tmp.path().join("layer");
        touch(&layer.join(".wh..wh.aufs"), "");
        touch(&layer.join(".wh..wh.orph/junk"), "");
        touch(&layer.join("real"), "");
        let mut tree = FileTree::new();
        apply_layer(&mut tree, &layer).unwrap();
        assert!(tree.look_up("/real").is_some());
        assert!(tree.look_up("/.wh..wh.aufs").is_none());
        assert!(tree.look_up("/.wh..wh.orph").is_none());
    }
}
