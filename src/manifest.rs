//! OCI JSON emission: image configuration, manifest, index, and the on-disk
//! image layout directory.

use crate::{
    error::{Error, Result},
    graph::Operation,
    layer::Layer,
    Digest, ImageName, Platform,
};
use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, HistoryBuilder, ImageConfiguration, ImageConfigurationBuilder,
    ImageIndex, ImageIndexBuilder, ImageManifest, ImageManifestBuilder, MediaType, RootFsBuilder,
    SCHEMA_VERSION,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};

pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
pub const CREATED_ANNOTATION: &str = "org.opencontainers.image.created";

const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Container-runtime configuration accumulated from Meta operations while a
/// platform build walks its graph.
#[derive(Debug, Clone, Default)]
pub struct RuntimeMeta {
    pub user: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
}

impl RuntimeMeta {
    /// Fold one Meta operation into the accumulated state.
    pub fn apply(&mut self, op: &Operation) {
        for (key, value) in &op.env {
            self.env.insert(key.clone(), value.clone());
        }
        for (key, value) in &op.metadata {
            match key.as_str() {
                "workdir" => self.workdir = value.clone(),
                "user" => self.user = value.clone(),
                "entrypoint" => self.entrypoint = Some(parse_string_list(value)),
                "cmd" => self.cmd = Some(parse_string_list(value)),
                "expose" => {
                    for port in value.split(',').filter(|p| !p.is_empty()) {
                        self.exposed_ports.insert(normalize_port(port));
                    }
                }
                "volume" => {
                    for volume in parse_string_list(value) {
                        self.volumes.insert(volume);
                    }
                }
                _ => {
                    if let Some(label) = key.strip_prefix("label.") {
                        self.labels.insert(label.to_string(), value.clone());
                    }
                }
            }
        }
        if !op.user.is_empty() {
            self.user = op.user.clone();
        }
    }
}

/// `["a", "b"]` stays a JSON array; anything else splits on whitespace.
pub fn parse_string_list(value: &str) -> Vec<String> {
    serde_json::from_str(value)
        .unwrap_or_else(|_| value.split_whitespace().map(str::to_string).collect())
}

fn normalize_port(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{port}/tcp")
    }
}

fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Assemble the OCI image configuration for one platform.
///
/// Timestamps derive from the layers themselves, so a fully cached rebuild
/// reproduces the config and manifest byte for byte.
pub fn generate_config(
    platform: &Platform,
    meta: &RuntimeMeta,
    layers: &[Layer],
) -> Result<ImageConfiguration> {
    let created = layers
        .iter()
        .map(|l| l.created)
        .max()
        .unwrap_or_else(Utc::now);

    let mut env: BTreeMap<String, String> = BTreeMap::from([
        ("PATH".to_string(), DEFAULT_PATH_ENV.to_string()),
        ("HOME".to_string(), "/root".to_string()),
        ("USER".to_string(), "root".to_string()),
    ]);
    env.extend(meta.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut config = oci_spec::image::ConfigBuilder::default()
        .env(env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>());
    if !meta.user.is_empty() {
        config = config.user(meta.user.clone());
    }
    if !meta.workdir.is_empty() {
        config = config.working_dir(meta.workdir.clone());
    }
    if let Some(entrypoint) = &meta.entrypoint {
        config = config.entrypoint(entrypoint.clone());
    }
    if let Some(cmd) = &meta.cmd {
        config = config.cmd(cmd.clone());
    }
    if !meta.exposed_ports.is_empty() {
        config = config.exposed_ports(meta.exposed_ports.iter().cloned().collect::<Vec<_>>());
    }
    if !meta.volumes.is_empty() {
        config = config.volumes(meta.volumes.iter().cloned().collect::<Vec<_>>());
    }
    if !meta.labels.is_empty() {
        config = config.labels(
            meta.labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        );
    }

    let rootfs = RootFsBuilder::default()
        .typ("layers".to_string())
        .diff_ids(
            layers
                .iter()
                .map(|l| l.diff_id.to_string())
                .collect::<Vec<_>>(),
        )
        .build()?;

    let history = layers
        .iter()
        .map(|l| {
            Ok(HistoryBuilder::default()
                .created(rfc3339(&l.created))
                .created_by(l.created_by.clone())
                .empty_layer(false)
                .build()?)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut builder = ImageConfigurationBuilder::default()
        .created(rfc3339(&created))
        .architecture(platform.oci_arch())
        .os(platform.oci_os())
        .config(config.build()?)
        .rootfs(rootfs)
        .history(history);
    if let Some(variant) = &platform.variant {
        builder = builder.variant(variant.clone());
    }
    Ok(builder.build()?)
}

/// Assemble the image manifest from the config descriptor and layer
/// descriptors, annotated with the primary image reference when present.
pub fn generate_manifest(
    config: Descriptor,
    layers: Vec<Descriptor>,
    ref_name: Option<&ImageName>,
) -> Result<ImageManifest> {
    let mut builder = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers);
    if let Some(name) = ref_name {
        builder = builder.annotations(HashMap::from([(
            REF_NAME_ANNOTATION.to_string(),
            name.to_string(),
        )]));
    }
    Ok(builder.build()?)
}

/// Assemble the image index over per-platform manifest descriptors. The
/// descriptors keep their input order.
pub fn generate_index(
    manifests: Vec<(Platform, Descriptor)>,
    ref_name: Option<&ImageName>,
) -> Result<ImageIndex> {
    let manifests = manifests
        .into_iter()
        .map(|(platform, descriptor)| {
            let mut descriptor = descriptor;
            descriptor.set_platform(Some(platform.to_oci()?));
            Ok(descriptor)
        })
        .collect::<Result<Vec<_>>>()?;
    let mut annotations = HashMap::from([(
        CREATED_ANNOTATION.to_string(),
        rfc3339(&Utc::now()),
    )]);
    if let Some(name) = ref_name {
        annotations.insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
    }
    Ok(ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(manifests)
        .annotations(annotations)
        .build()?)
}

/// Writer for an [OCI Image Layout](https://github.com/opencontainers/image-spec/blob/v1.1.0/image-layout.md)
/// directory. An unfinished layout is removed on drop.
pub struct OciLayoutDir {
    root: PathBuf,
    is_finished: bool,
}

impl Drop for OciLayoutDir {
    fn drop(&mut self) {
        if !self.is_finished {
            fs::remove_dir_all(&self.root).unwrap_or_else(|e| {
                log::error!(
                    "failed to remove unfinished layout {}: {}",
                    self.root.display(),
                    e
                )
            });
        }
    }
}

impl OciLayoutDir {
    pub fn new(root: PathBuf) -> Result<Self> {
        if root.exists() {
            return Err(Error::OutputAlreadyExists(root));
        }
        fs::create_dir_all(root.join("blobs/sha256"))?;
        Ok(OciLayoutDir {
            root,
            is_finished: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a blob by content digest. Safe for concurrent use: blobs land
    /// under a temporary name and are renamed into place.
    pub fn add_blob(&self, data: &[u8]) -> Result<(Digest, i64)> {
        let digest = Digest::from_buf_sha256(data);
        let out = self.root.join(digest.as_path());
        if !out.exists() {
            let staging = out.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
            fs::write(&staging, data)?;
            fs::rename(&staging, &out)?;
        }
        Ok((digest, data.len() as i64))
    }

    /// Serialize a JSON document as a blob and return its descriptor.
    pub fn add_json_blob<T: Serialize>(
        &self,
        media_type: MediaType,
        value: &T,
    ) -> Result<Descriptor> {
        let bytes = serde_json::to_vec(value)?;
        let (digest, size) = self.add_blob(&bytes)?;
        Ok(DescriptorBuilder::default()
            .media_type(media_type)
            .digest(digest.to_string())
            .size(size)
            .build()?)
    }

    /// Write `oci-layout` and `index.json`, completing the layout.
    pub fn finish(mut self, index: &ImageIndex) -> Result<PathBuf> {
        fs::write(
            self.root.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        fs::write(self.root.join("index.json"), serde_json::to_vec(index)?)?;
        self.is_finished = true;
        Ok(self.root.clone())
    }
}

/// Check that every digest referenced from `index.json` resolves to a blob
/// file, transitively through manifests and configs.
pub fn verify_layout(root: &Path) -> Result<usize> {
    let index: ImageIndex = serde_json::from_slice(&fs::read(root.join("index.json"))?)?;
    let mut checked = 0;
    for descriptor in index.manifests() {
        let digest = Digest::from_descriptor(descriptor)?;
        let manifest_path = root.join(digest.as_path());
        let bytes = read_verified(&manifest_path, &digest, descriptor.size())?;
        checked += 1;
        let manifest: ImageManifest = serde_json::from_slice(&bytes)?;
        for layer in manifest.layers() {
            let digest = Digest::from_descriptor(layer)?;
            read_verified(&root.join(digest.as_path()), &digest, layer.size())?;
            checked += 1;
        }
        let config = Digest::from_descriptor(manifest.config())?;
        read_verified(
            &root.join(config.as_path()),
            &config,
            manifest.config().size(),
        )?;
        checked += 1;
    }
    Ok(checked)
}

fn read_verified(path: &Path, digest: &Digest, size: i64) -> Result<Vec<u8>> {
    let bytes = fs::read(path).map_err(|_| Error::InvalidDigest(digest.to_string()))?;
    if bytes.len() as i64 != size {
        return Err(Error::SizeMismatch {
            digest: digest.to_string(),
            expected: size,
            found: bytes.len() as i64,
        });
    }
    let computed = Digest::from_buf_sha256(&bytes);
    if &computed != digest {
        return Err(Error::DigestMismatch {
            expected: digest.to_string(),
            computed: computed.to_string(),
        });
    }
    Ok(bytes)
}

/// Pack a finished layout directory into a single `oci-archive` tar, the
/// format `podman load` accepts.
pub fn pack_archive(layout_root: &Path, output: &Path) -> Result<()> {
    let file = fs::File::create(output)?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all("", layout_root)?;
    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperationKind;
    use crate::layer::{ChangeContent, ChangeKind, FileChange, LayerBuilder};

    fn meta_op(metadata: &[(&str, &str)]) -> Operation {
        Operation {
            kind: OperationKind::Meta,
            command: vec![],
            inputs: vec![],
            outputs: vec![],
            env: BTreeMap::new(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            workdir: "/".to_string(),
            user: String::new(),
            platform: Platform::new("linux", "amd64"),
        }
    }

    fn sample_layer() -> Result<Layer> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a");
        fs::write(&file, "1")?;
        let layer = LayerBuilder::new()
            .created_by("COPY a /a")
            .build(&[FileChange {
                path: PathBuf::from("/a"),
                kind: ChangeKind::Add,
                mode: 0o644,
                size: 1,
                mtime: 1_700_000_000,
                uid: 0,
                gid: 0,
                content: Some(ChangeContent::File(file)),
            }])?
            .unwrap();
        Ok(layer)
    }

    #[test]
    fn runtime_meta_accumulates() {
        let mut meta = RuntimeMeta::default();
        meta.apply(&meta_op(&[("expose", "80,443/udp")]));
        meta.apply(&meta_op(&[("entrypoint", r#"["/bin/app"]"#)]));
        meta.apply(&meta_op(&[("cmd", "--serve all")]));
        meta.apply(&meta_op(&[("label.version", "1.0")]));
        meta.apply(&meta_op(&[("workdir", "/srv")]));

        assert!(meta.exposed_ports.contains("80/tcp"));
        assert!(meta.exposed_ports.contains("443/udp"));
        assert_eq!(meta.entrypoint.as_deref(), Some(&["/bin/app".to_string()][..]));
        assert_eq!(
            meta.cmd.as_deref(),
            Some(&["--serve".to_string(), "all".to_string()][..])
        );
        assert_eq!(meta.labels.get("version").map(String::as_str), Some("1.0"));
        assert_eq!(meta.workdir, "/srv");
    }

    #[test]
    fn config_carries_diff_ids_and_platform() -> Result<()> {
        let layer = sample_layer()?;
        let mut meta = RuntimeMeta::default();
        meta.workdir = "/srv".to_string();
        let platform = Platform::with_variant("linux", "arm", "v7");
        let config = generate_config(&platform, &meta, std::slice::from_ref(&layer))?;

        assert_eq!(config.rootfs().diff_ids(), &[layer.diff_id.to_string()]);
        assert_eq!(config.variant().as_deref(), Some("v7"));
        assert_eq!(config.history().len(), 1);
        let inner = config.config().as_ref().unwrap();
        assert_eq!(inner.working_dir().as_deref(), Some("/srv"));
        assert!(inner
            .env()
            .as_ref()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("PATH=")));
        Ok(())
    }

    #[test]
    fn layout_round_trip_verifies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("image");
        let layout = OciLayoutDir::new(root.clone())?;

        let layer = sample_layer()?;
        layout.add_blob(&layer.blob)?;
        let meta = RuntimeMeta::default();
        let platform = Platform::new("linux", "amd64");
        let config = generate_config(&platform, &meta, std::slice::from_ref(&layer))?;
        let config_desc = layout.add_json_blob(MediaType::ImageConfig, &config)?;
        let manifest = generate_manifest(config_desc, vec![layer.descriptor()?], None)?;
        let manifest_desc = layout.add_json_blob(MediaType::ImageManifest, &manifest)?;
        let index = generate_index(vec![(platform, manifest_desc)], None)?;
        let root = layout.finish(&index)?;

        assert!(root.join("oci-layout").is_file());
        assert_eq!(verify_layout(&root)?, 3);
        Ok(())
    }

    #[test]
    fn unfinished_layout_is_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("image");
        {
            let layout = OciLayoutDir::new(root.clone())?;
            layout.add_blob(b"data")?;
        }
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn existing_output_dir_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            OciLayoutDir::new(dir.path().to_path_buf()),
            Err(Error::OutputAlreadyExists(_))
        ));
        Ok(())
    }
}
