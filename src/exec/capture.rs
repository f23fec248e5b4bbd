//! Filesystem change detection between a pre-operation snapshot and the tree
//! an operation left behind.

use crate::{
    error::Result,
    layer::{ChangeContent, ChangeKind, FileChange},
    Digest,
};
use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

/// Recorded state of one path at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub mtime: i64,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Present only when the snapshot was taken with content hashing enabled
    pub hash: Option<Digest>,
}

/// Snapshot of a tree keyed by path relative to its root.
pub type Snapshot = BTreeMap<PathBuf, FileMeta>;

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// Hash file contents to adjudicate same-size entries whose mtime moved
    pub content_hash: bool,
    /// Ownership assigned to captured entries (the host identity)
    pub uid: u64,
    pub gid: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            content_hash: false,
            uid: 0,
            gid: 0,
        }
    }
}

fn meta_of(path: &Path, opts: &CaptureOptions) -> Result<FileMeta> {
    let metadata = fs::symlink_metadata(path)?;
    let is_symlink = metadata.file_type().is_symlink();
    let hash = if opts.content_hash && metadata.is_file() && !is_symlink {
        Some(Digest::from_buf_sha256(&fs::read(path)?))
    } else {
        None
    };
    Ok(FileMeta {
        mtime: metadata.mtime(),
        size: metadata.len(),
        mode: metadata.permissions().mode() & 0o7777,
        is_dir: metadata.is_dir(),
        is_symlink,
        hash,
    })
}

/// Record the state of every entry under `root`.
pub fn snapshot(root: &Path, opts: &CaptureOptions) -> Result<Snapshot> {
    let mut snap = Snapshot::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root")
            .to_path_buf();
        snap.insert(rel, meta_of(entry.path(), opts)?);
    }
    Ok(snap)
}

/// Compare `root` against a prior snapshot of the same tree.
///
/// Returns changes sorted by path: additions and modifications carrying their
/// content source, deletions for snapshot entries that disappeared. Captured
/// ownership is re-mapped to `opts.uid`/`opts.gid` so the engine can read the
/// results back under its own identity.
pub fn diff(before: &Snapshot, root: &Path, opts: &CaptureOptions) -> Result<Vec<FileChange>> {
    let after = snapshot(root, opts)?;
    let mut changes = Vec::new();
    for (rel, meta) in &after {
        let kind = match before.get(rel) {
            None => ChangeKind::Add,
            Some(old) if unchanged(old, meta) => continue,
            Some(_) => ChangeKind::Modify,
        };
        let abs = root.join(rel);
        let content = if meta.is_symlink {
            ChangeContent::Symlink(fs::read_link(&abs)?)
        } else if meta.is_dir {
            ChangeContent::Directory
        } else {
            ChangeContent::File(abs)
        };
        changes.push(FileChange {
            path: Path::new("/").join(rel),
            kind,
            mode: meta.mode,
            size: if meta.is_dir { 0 } else { meta.size },
            mtime: meta.mtime,
            uid: opts.uid,
            gid: opts.gid,
            content: Some(content),
        });
    }
    for rel in before.keys() {
        if !after.contains_key(rel) {
            changes.push(FileChange::delete(Path::new("/").join(rel)));
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

fn unchanged(old: &FileMeta, new: &FileMeta) -> bool {
    if old.is_dir != new.is_dir || old.is_symlink != new.is_symlink || old.mode != new.mode {
        return false;
    }
    if old.size != new.size {
        return false;
    }
    if old.mtime == new.mtime {
        return true;
    }
    // Same size but a moved mtime: trust the content hash when we have one,
    // otherwise treat as modified.
    match (&old.hash, &new.hash) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Recursive copy preserving file modes and symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, fs::metadata(entry.path())?.permissions())?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
