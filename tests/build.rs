//! End-to-end builds against scratch bases with the rootless backend; no
//! container runtime or network is involved.

use flate2::read::GzDecoder;
use ocibuild::{
    error::Result,
    graph::{BuildGraph, Operation, OperationKind},
    instruction::{BackendKind, Instruction},
    layer, manifest, BuildConfig, BuildEngine, Platform,
};
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

fn recipe(lines: &[(&str, &str)]) -> Vec<Instruction> {
    lines
        .iter()
        .enumerate()
        .map(|(i, (cmd, value))| Instruction::new(cmd, value, i + 1))
        .collect()
}

fn engine(context: &Path, output: PathBuf, cache: &Path) -> Result<BuildEngine> {
    let mut config = BuildConfig::new(context, output);
    config.platforms = vec![Platform::new("linux", "amd64")];
    config.cache_dir = Some(cache.to_path_buf());
    config.backend = BackendKind::Rootless;
    BuildEngine::new(config)
}

fn read_index(layout: &Path) -> Result<ImageIndex> {
    Ok(serde_json::from_slice(&fs::read(layout.join("index.json"))?)?)
}

fn read_manifest(layout: &Path, index: &ImageIndex, entry: usize) -> Result<ImageManifest> {
    let digest = index.manifests()[entry].digest();
    let path = layout.join("blobs/sha256").join(digest.split(':').nth(1).unwrap());
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn read_config(layout: &Path, manifest: &ImageManifest) -> Result<ImageConfiguration> {
    let digest = manifest.config().digest();
    let path = layout.join("blobs/sha256").join(digest.split(':').nth(1).unwrap());
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn read_blob(layout: &Path, digest: &str) -> Result<Vec<u8>> {
    Ok(fs::read(
        layout.join("blobs/sha256").join(digest.split(':').nth(1).unwrap()),
    )?)
}

#[test]
fn scratch_plus_single_file() -> Result<()> {
    let context = tempfile::tempdir()?;
    let hello = context.path().join("hello.txt");
    fs::write(&hello, "hi\n")?;
    fs::set_permissions(&hello, fs::Permissions::from_mode(0o644))?;
    let out = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;

    let engine = engine(context.path(), out.path().join("image"), cache.path())?;
    let result = engine.build(&recipe(&[
        ("FROM", "scratch"),
        ("COPY", "hello.txt /hello.txt"),
    ]))?;
    assert!(result.success, "{:?}", result.platforms);

    // Every referenced digest resolves to a blob
    manifest::verify_layout(&result.layout)?;

    let index = read_index(&result.layout)?;
    assert_eq!(index.manifests().len(), 1);
    let image_manifest = read_manifest(&result.layout, &index, 0)?;
    assert_eq!(image_manifest.layers().len(), 1);

    // The config references exactly the one layer by diff_id
    let config = read_config(&result.layout, &image_manifest)?;
    assert_eq!(config.rootfs().diff_ids().len(), 1);

    // The uncompressed tar holds exactly one entry with the expected
    // attributes, and its digest matches rootfs.diff_ids[0]
    let blob = read_blob(&result.layout, image_manifest.layers()[0].digest())?;
    let mut uncompressed = Vec::new();
    GzDecoder::new(blob.as_slice()).read_to_end(&mut uncompressed)?;
    let diff_id = ocibuild::Digest::from_buf_sha256(&uncompressed);
    assert_eq!(&diff_id.to_string(), &config.rootfs().diff_ids()[0]);

    let mut archive = tar::Archive::new(uncompressed.as_slice());
    let entries: Vec<_> = archive
        .entries()?
        .map(|e| e.unwrap())
        .map(|e| {
            (
                e.path().unwrap().to_string_lossy().into_owned(),
                e.header().mode().unwrap(),
                e.header().size().unwrap(),
            )
        })
        .collect();
    assert_eq!(entries, vec![("hello.txt".to_string(), 0o644, 3)]);
    Ok(())
}

#[test]
fn cache_hit_on_rerun_reproduces_manifest() -> Result<()> {
    let context = tempfile::tempdir()?;
    fs::write(context.path().join("hello.txt"), "hi\n")?;
    let cache = tempfile::tempdir()?;
    let instructions = recipe(&[("FROM", "scratch"), ("COPY", "hello.txt /hello.txt")]);

    let out1 = tempfile::tempdir()?;
    let first = engine(context.path(), out1.path().join("image"), cache.path())?
        .build(&instructions)?;
    assert!(first.success);
    assert_eq!(first.cache_hits, 0);

    let out2 = tempfile::tempdir()?;
    let second = engine(context.path(), out2.path().join("image"), cache.path())?
        .build(&instructions)?;
    assert!(second.success);
    assert_eq!(second.cache_hits, 1);

    // Byte-identical manifest JSON across the two runs
    let manifest_bytes = |result: &ocibuild::BuildResult| -> Result<Vec<u8>> {
        let index = read_index(&result.layout)?;
        read_blob(&result.layout, index.manifests()[0].digest())
    };
    assert_eq!(manifest_bytes(&first)?, manifest_bytes(&second)?);
    Ok(())
}

#[test]
fn multi_platform_index() -> Result<()> {
    let context = tempfile::tempdir()?;
    fs::write(context.path().join("a"), "payload")?;
    let out = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;

    let mut config = BuildConfig::new(context.path(), out.path().join("image"));
    config.platforms = vec![
        Platform::new("linux", "amd64"),
        Platform::new("linux", "arm64"),
    ];
    config.cache_dir = Some(cache.path().to_path_buf());
    config.backend = BackendKind::Rootless;
    let engine = BuildEngine::new(config)?;

    let result = engine.build(&recipe(&[("FROM", "scratch"), ("COPY", "a /a")]))?;
    assert!(result.success, "{:?}", result.platforms);

    let index = read_index(&result.layout)?;
    assert_eq!(index.manifests().len(), 2);
    let platforms: Vec<String> = index
        .manifests()
        .iter()
        .map(|d| {
            let p = d.platform().as_ref().expect("index entries carry platforms");
            format!("{:?}/{:?}", p.os(), p.architecture())
        })
        .collect();
    assert_eq!(platforms.len(), 2);
    assert_ne!(platforms[0], platforms[1]);

    // Content is architecture-independent: identical layer digests
    let first = read_manifest(&result.layout, &index, 0)?;
    let second = read_manifest(&result.layout, &index, 1)?;
    assert_eq!(
        first.layers()[0].digest(),
        second.layers()[0].digest()
    );

    // Configs differ only in architecture
    let strip = |m: &ImageManifest| -> Result<serde_json::Value> {
        let mut v: serde_json::Value =
            serde_json::from_slice(&read_blob(&result.layout, m.config().digest())?)?;
        v.as_object_mut().unwrap().remove("architecture");
        Ok(v)
    };
    assert_eq!(strip(&first)?, strip(&second)?);
    Ok(())
}

#[test]
fn cycle_is_rejected_before_execution() -> Result<()> {
    let mut graph = BuildGraph::new();
    let op = |kind| Operation {
        kind,
        command: vec!["true".to_string()],
        inputs: vec![],
        outputs: vec![],
        env: BTreeMap::new(),
        metadata: BTreeMap::new(),
        workdir: "/".to_string(),
        user: String::new(),
        platform: Platform::new("linux", "amd64"),
    };
    graph.add_node("a", op(OperationKind::Exec))?;
    graph.add_node("b", op(OperationKind::Exec))?;
    graph.add_dependency("a", "b")?;
    graph.add_dependency("b", "a")?;

    assert!(graph.has_cycles());
    assert!(graph.topological_sort().is_err());
    Ok(())
}

#[test]
fn privileged_command_is_rejected() -> Result<()> {
    let context = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;

    let engine = engine(context.path(), out.path().join("image"), cache.path())?;
    let result = engine.build(&recipe(&[("FROM", "scratch"), ("RUN", "sudo true")]))?;

    assert!(!result.success);
    let outcome = &result.platforms[0];
    assert!(!outcome.success);
    let error = outcome.error.as_deref().unwrap();
    assert!(error.contains("line 2"), "unexpected error: {error}");
    assert!(error.contains("sudo"), "unexpected error: {error}");
    Ok(())
}

#[test]
fn multi_stage_copy_from() -> Result<()> {
    let context = tempfile::tempdir()?;
    fs::write(context.path().join("x"), "1")?;
    let out = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;

    let engine = engine(context.path(), out.path().join("image"), cache.path())?;
    let result = engine.build(&recipe(&[
        ("FROM", "scratch AS a"),
        ("COPY", "x /x"),
        ("FROM", "scratch"),
        ("COPY", "--from=a /x /y"),
    ]))?;
    assert!(result.success, "{:?}", result.platforms);

    let index = read_index(&result.layout)?;
    let image_manifest = read_manifest(&result.layout, &index, 0)?;
    // Stage a is materialized for the copy but its layer does not survive
    // into the final image
    assert_eq!(image_manifest.layers().len(), 1);

    let tree = tempfile::tempdir()?;
    let blob = read_blob(&result.layout, image_manifest.layers()[0].digest())?;
    layer::apply_to_tree(&blob, true, tree.path())?;
    assert_eq!(fs::read_to_string(tree.path().join("y"))?, "1");
    assert!(!tree.path().join("x").exists());
    Ok(())
}

#[test]
fn metadata_only_build_has_no_layers() -> Result<()> {
    let context = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;

    let engine = engine(context.path(), out.path().join("image"), cache.path())?;
    let result = engine.build(&recipe(&[
        ("FROM", "scratch"),
        ("LABEL", "maintainer=ops@example.com"),
        ("EXPOSE", "8080"),
        ("ENTRYPOINT", r#"["/app"]"#),
    ]))?;
    assert!(result.success, "{:?}", result.platforms);

    let index = read_index(&result.layout)?;
    let image_manifest = read_manifest(&result.layout, &index, 0)?;
    assert!(image_manifest.layers().is_empty());

    let config = read_config(&result.layout, &image_manifest)?;
    assert!(config.rootfs().diff_ids().is_empty());
    let inner = config.config().as_ref().unwrap();
    assert_eq!(
        inner.entrypoint().as_deref(),
        Some(&["/app".to_string()][..])
    );
    assert!(inner
        .exposed_ports()
        .as_ref()
        .unwrap()
        .contains(&"8080/tcp".to_string()));
    assert_eq!(
        inner.labels().as_ref().unwrap().get("maintainer").unwrap(),
        "ops@example.com"
    );
    Ok(())
}

#[test]
fn cancellation_fails_the_build() -> Result<()> {
    let context = tempfile::tempdir()?;
    fs::write(context.path().join("a"), "1")?;
    let out = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;

    let engine = engine(context.path(), out.path().join("image"), cache.path())?;
    engine.cancel_token().cancel();
    let result = engine.build(&recipe(&[("FROM", "scratch"), ("COPY", "a /a")]))?;
    assert!(!result.success);
    assert!(result.platforms[0]
        .error
        .as_deref()
        .unwrap()
        .to_lowercase()
        .contains("cancel"));
    Ok(())
}
