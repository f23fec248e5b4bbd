//! Turn filesystem deltas into content-addressed layer blobs.

use crate::{
    error::{Error, Result},
    policy, Digest, DigestWriter,
};
use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder};
use oci_spec::image::{Descriptor, DescriptorBuilder, MediaType};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
};

/// Filename prefix marking the deletion of the corresponding name in a lower
/// layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// What backs a non-deletion change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeContent {
    /// Regular file whose bytes live at this host path
    File(PathBuf),
    Directory,
    /// Symlink with the given target
    Symlink(PathBuf),
}

/// One unit of filesystem change consumed by the layer builder.
///
/// `path` is the absolute, slash-normalized location inside the image.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub uid: u64,
    pub gid: u64,
    /// None for deletions
    pub content: Option<ChangeContent>,
}

impl FileChange {
    pub fn delete(path: impl Into<PathBuf>) -> Self {
        FileChange {
            path: path.into(),
            kind: ChangeKind::Delete,
            mode: 0,
            size: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            content: None,
        }
    }
}

/// Whiteout for a deleted path: a `.wh.<basename>` file in the parent.
pub fn whiteout_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.parent()
        .unwrap_or_else(|| Path::new("/"))
        .join(format!("{WHITEOUT_PREFIX}{name}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    Gzip,
    None,
}

/// A produced layer. `diff_id`, `digest`, and `size` are computed from the
/// actual bytes exactly once.
#[derive(Debug, Clone)]
pub struct Layer {
    pub diff_id: Digest,
    pub digest: Digest,
    pub size: i64,
    pub media_type: MediaType,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub annotations: BTreeMap<String, String>,
    pub blob: Vec<u8>,
}

impl Layer {
    pub fn descriptor(&self) -> Result<Descriptor> {
        let mut builder = DescriptorBuilder::default()
            .media_type(self.media_type.clone())
            .digest(self.digest.to_string())
            .size(self.size);
        if !self.annotations.is_empty() {
            builder = builder.annotations(
                self.annotations
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<std::collections::HashMap<_, _>>(),
            );
        }
        Ok(builder.build()?)
    }
}

/// Streams an ordered sequence of [FileChange] into a compressed tar blob,
/// computing `diff_id` (uncompressed) and `digest` (compressed) in a single
/// pass through two chained [DigestWriter] tees.
pub struct LayerBuilder {
    compression: LayerCompression,
    skip_empty: bool,
    numeric_ids: bool,
    created: Option<DateTime<Utc>>,
    created_by: String,
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerBuilder {
    pub fn new() -> Self {
        LayerBuilder {
            compression: LayerCompression::Gzip,
            skip_empty: true,
            numeric_ids: true,
            created: None,
            created_by: String::new(),
        }
    }

    pub fn compression(mut self, compression: LayerCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn skip_empty(mut self, skip_empty: bool) -> Self {
        self.skip_empty = skip_empty;
        self
    }

    pub fn numeric_ids(mut self, numeric_ids: bool) -> Self {
        self.numeric_ids = numeric_ids;
        self
    }

    /// Provenance timestamp; defaults to the build time of the layer.
    pub fn created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn created_by(mut self, created_by: &str) -> Self {
        self.created_by = created_by.to_string();
        self
    }

    /// Build a layer from `changes`, which the caller must supply in a stable
    /// order (lexicographic walk order). Returns `None` when `skip_empty` is
    /// set and there are no changes.
    pub fn build(self, changes: &[FileChange]) -> Result<Option<Layer>> {
        if changes.is_empty() && self.skip_empty {
            return Ok(None);
        }
        let (blob, diff_id, digest, media_type) = match self.compression {
            LayerCompression::Gzip => {
                let compressed_tee = DigestWriter::new(Vec::new());
                let encoder = GzEncoder::new(compressed_tee, flate2::Compression::default());
                let tar_tee = DigestWriter::new(encoder);
                let mut builder = tar::Builder::new(tar_tee);
                for change in changes {
                    append_change(&mut builder, change, self.numeric_ids)?;
                }
                let tar_tee = builder.into_inner()?;
                let (encoder, diff_id) = tar_tee.finish();
                let compressed_tee = encoder.finish()?;
                let (blob, digest) = compressed_tee.finish();
                (blob, diff_id, digest, MediaType::ImageLayerGzip)
            }
            LayerCompression::None => {
                let tar_tee = DigestWriter::new(Vec::new());
                let mut builder = tar::Builder::new(tar_tee);
                for change in changes {
                    append_change(&mut builder, change, self.numeric_ids)?;
                }
                let (blob, diff_id) = builder.into_inner()?.finish();
                let digest = diff_id.clone();
                (blob, diff_id, digest, MediaType::ImageLayer)
            }
        };
        let recomputed = Digest::from_buf_sha256(&blob);
        if recomputed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                computed: recomputed.to_string(),
            });
        }
        Ok(Some(Layer {
            diff_id,
            digest,
            size: blob.len() as i64,
            media_type,
            created: self.created.unwrap_or_else(Utc::now),
            created_by: self.created_by,
            annotations: BTreeMap::new(),
            blob,
        }))
    }
}

fn append_change<W: Write>(
    builder: &mut tar::Builder<W>,
    change: &FileChange,
    numeric_ids: bool,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(change.mtime.max(0) as u64);
    header.set_uid(change.uid);
    header.set_gid(change.gid);
    if !numeric_ids {
        let _ = header.set_username("");
        let _ = header.set_groupname("");
    }
    match (&change.kind, &change.content) {
        (ChangeKind::Delete, _) => {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o600);
            header.set_size(0);
            builder.append_data(
                &mut header,
                tar_entry_path(&whiteout_path(&change.path)),
                std::io::empty(),
            )?;
        }
        (_, Some(ChangeContent::Directory)) => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(policy::normalize_mode(change.mode) | 0o100);
            header.set_size(0);
            builder.append_data(&mut header, tar_entry_path(&change.path), std::io::empty())?;
        }
        (_, Some(ChangeContent::Symlink(target))) => {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, tar_entry_path(&change.path), target)?;
        }
        (_, Some(ChangeContent::File(source))) => {
            if !source.is_file() {
                return Err(Error::NotAFile(source.clone()));
            }
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(policy::normalize_mode(change.mode));
            header.set_size(change.size);
            let file = fs::File::open(source)?;
            builder.append_data(&mut header, tar_entry_path(&change.path), file)?;
        }
        (_, None) => {
            return Err(Error::NotAFile(change.path.clone()));
        }
    }
    Ok(())
}

/// Tar entries are archive-relative: strip the leading slash.
fn tar_entry_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir))
        .collect()
}

/// Unpack a layer blob onto `root`, honoring whiteout entries.
pub fn apply_to_tree(blob: &[u8], compressed: bool, root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;
    if compressed {
        unpack_entries(tar::Archive::new(GzDecoder::new(blob)), root)
    } else {
        unpack_entries(tar::Archive::new(blob), root)
    }
}

fn unpack_entries<R: std::io::Read>(mut archive: tar::Archive<R>, root: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = root
                .join(path.parent().unwrap_or_else(|| Path::new("")))
                .join(target);
            if victim.is_dir() {
                fs::remove_dir_all(&victim)?;
            } else if victim.exists() {
                fs::remove_file(&victim)?;
            }
            continue;
        }
        entry.unpack_in(root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest as _, Sha256};
    use std::io::Read;

    fn change_for(path: &Path, image_path: &str, mode: u32) -> FileChange {
        let size = fs::metadata(path).unwrap().len();
        FileChange {
            path: PathBuf::from(image_path),
            kind: ChangeKind::Add,
            mode,
            size,
            mtime: 1_700_000_000,
            uid: 0,
            gid: 0,
            content: Some(ChangeContent::File(path.to_path_buf())),
        }
    }

    #[test]
    fn whiteout_naming() {
        assert_eq!(
            whiteout_path(Path::new("/usr/share/doc")),
            PathBuf::from("/usr/share/.wh.doc")
        );
        assert_eq!(whiteout_path(Path::new("/top")), PathBuf::from("/.wh.top"));
    }

    #[test]
    fn digests_match_blob_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("hello.txt");
        fs::write(&file, "hi\n")?;

        let layer = LayerBuilder::new()
            .created_by("COPY hello.txt /hello.txt")
            .build(&[change_for(&file, "/hello.txt", 0o644)])?
            .expect("one change produces a layer");

        // digest over compressed bytes
        assert_eq!(layer.digest, Digest::from_buf_sha256(&layer.blob));
        assert_eq!(layer.size, layer.blob.len() as i64);
        assert_eq!(layer.media_type, MediaType::ImageLayerGzip);

        // diff_id over uncompressed bytes
        let mut decoder = GzDecoder::new(layer.blob.as_slice());
        let mut uncompressed = Vec::new();
        decoder.read_to_end(&mut uncompressed)?;
        let hash = Sha256::digest(&uncompressed);
        assert_eq!(layer.diff_id.encoded, base16ct::lower::encode_string(&hash));
        Ok(())
    }

    #[test]
    fn uncompressed_layer_digest_equals_diff_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a");
        fs::write(&file, "1")?;
        let layer = LayerBuilder::new()
            .compression(LayerCompression::None)
            .build(&[change_for(&file, "/a", 0o644)])?
            .unwrap();
        assert_eq!(layer.diff_id, layer.digest);
        assert_eq!(layer.media_type, MediaType::ImageLayer);
        Ok(())
    }

    #[test]
    fn skip_empty() -> Result<()> {
        assert!(LayerBuilder::new().build(&[])?.is_none());
        let layer = LayerBuilder::new().skip_empty(false).build(&[])?;
        assert!(layer.is_some());
        Ok(())
    }

    #[test]
    fn setuid_is_stripped_in_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("tool");
        fs::write(&file, "#!/bin/sh\n")?;
        let layer = LayerBuilder::new()
            .build(&[change_for(&file, "/usr/bin/tool", 0o4755)])?
            .unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(layer.blob.as_slice()));
        let entry = archive.entries()?.next().unwrap()?;
        let mode = entry.header().mode()?;
        assert_eq!(mode & 0o6000, 0);
        assert!(mode & 0o600 == 0o600);
        assert_eq!(mode & 0o022, 0);
        Ok(())
    }

    #[test]
    fn capture_round_trip_through_tree() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("data.txt");
        fs::write(&file, "payload")?;

        let changes = vec![
            FileChange {
                path: PathBuf::from("/srv"),
                kind: ChangeKind::Add,
                mode: 0o755,
                size: 0,
                mtime: 1_700_000_000,
                uid: 0,
                gid: 0,
                content: Some(ChangeContent::Directory),
            },
            change_for(&file, "/srv/data.txt", 0o644),
        ];
        let layer = LayerBuilder::new().build(&changes)?.unwrap();

        let out = tempfile::tempdir()?;
        apply_to_tree(&layer.blob, true, out.path())?;
        assert_eq!(fs::read_to_string(out.path().join("srv/data.txt"))?, "payload");
        Ok(())
    }

    #[test]
    fn whiteout_removes_on_apply() -> Result<()> {
        let root = tempfile::tempdir()?;
        fs::create_dir_all(root.path().join("etc"))?;
        fs::write(root.path().join("etc/old.conf"), "x")?;

        let layer = LayerBuilder::new()
            .build(&[FileChange::delete("/etc/old.conf")])?
            .unwrap();
        apply_to_tree(&layer.blob, true, root.path())?;
        assert!(!root.path().join("etc/old.conf").exists());
        Ok(())
    }
}
