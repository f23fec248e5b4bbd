//! End-to-end build orchestration: instructions to operation graphs, graph
//! walks through the executor and cache, layers into an OCI layout.

use crate::{
    cache::{CacheEntry, CacheStore, CachedLayer},
    error::{Error, Result},
    exec::{CancelToken, Executor, ExecutorConfig, ExecutorRegistry, Workspace},
    graph::{BuildGraph, Operation, OperationKind},
    instruction::{expand_args, BuildConfig, Instruction},
    layer::{Layer, LayerBuilder},
    manifest::{self, OciLayoutDir, RuntimeMeta},
    Digest, ImageName, Platform,
};
use chrono::{DateTime, Utc};
use oci_spec::image::{Descriptor, ImageConfiguration, MediaType};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::Instant,
};

/// Receives the finished layout and the references to publish. Registry
/// URLs, authentication, and the upload protocol are its business alone.
pub trait PushCallback: Send + Sync {
    fn push(&self, layout: &Path, refs: &[ImageName]) -> Result<()>;
}

impl<F> PushCallback for F
where
    F: Fn(&Path, &[ImageName]) -> Result<()> + Send + Sync,
{
    fn push(&self, layout: &Path, refs: &[ImageName]) -> Result<()> {
        self(layout, refs)
    }
}

/// Per-platform outcome inside a [BuildResult].
#[derive(Debug, Clone)]
pub struct PlatformOutcome {
    pub platform: Platform,
    pub success: bool,
    pub error: Option<String>,
    pub manifest_digest: Option<Digest>,
    pub operations: usize,
    pub cache_hits: usize,
}

#[derive(Debug)]
pub struct BuildResult {
    /// Conjunction of the per-platform outcomes
    pub success: bool,
    pub platforms: Vec<PlatformOutcome>,
    pub operations: usize,
    pub cache_hits: usize,
    pub duration: std::time::Duration,
    /// Digest of the top-level image index
    pub image_digest: Option<Digest>,
    pub layout: PathBuf,
}

/// Layers and config a successful platform walk produced, waiting to be
/// written into the shared layout.
struct PlatformImage {
    layers: Vec<Layer>,
    config: ImageConfiguration,
}

#[derive(Debug)]
struct CompiledGraph {
    graph: BuildGraph,
    order: Vec<String>,
    /// op id -> recipe line, for error reporting
    lines: HashMap<String, usize>,
}

pub struct BuildEngine {
    config: BuildConfig,
    cache: std::sync::Arc<CacheStore>,
    registry: ExecutorRegistry,
    push: Option<Box<dyn PushCallback>>,
    cancel: CancelToken,
}

impl BuildEngine {
    pub fn new(config: BuildConfig) -> Result<Self> {
        crate::policy::validate_security_context(&config.security_context)?;
        crate::policy::validate_resource_limits(&config.resource_limits)?;
        let cache_dir = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir()?,
        };
        let cache = std::sync::Arc::new(CacheStore::open(cache_dir)?);
        Ok(BuildEngine {
            config,
            cache,
            registry: ExecutorRegistry::with_defaults(),
            push: None,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_push_callback(mut self, callback: Box<dyn PushCallback>) -> Self {
        self.push = Some(callback);
        self
    }

    /// Clone of the build's cancellation signal, for driving cancellation
    /// from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Run the full build for every configured platform.
    pub fn build(&self, instructions: &[Instruction]) -> Result<BuildResult> {
        let started = Instant::now();
        let stamp = Utc::now();
        let deadline = started + self.config.timeout;

        let compiled: Vec<(Platform, CompiledGraph)> = self
            .config
            .platforms
            .iter()
            .map(|platform| {
                Ok((
                    platform.clone(),
                    self.compile_graph(instructions, platform)?,
                ))
            })
            .collect::<Result<_>>()?;

        let mut results: Vec<(PlatformOutcome, Option<PlatformImage>)> =
            if compiled.len() == 1 {
                let (platform, graph) = &compiled[0];
                vec![self.build_platform(platform, graph, deadline, stamp)]
            } else {
                std::thread::scope(|scope| {
                    let handles: Vec<_> = compiled
                        .iter()
                        .map(|(platform, graph)| {
                            scope.spawn(move || {
                                self.build_platform(platform, graph, deadline, stamp)
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().expect("platform build thread panicked"))
                        .collect()
                })
            };

        let layout = OciLayoutDir::new(self.config.output_dir.clone())?;
        let primary_ref = self.config.tags.first();
        let mut manifests: Vec<(Platform, Descriptor)> = Vec::new();
        for (outcome, image) in &mut results {
            let Some(image) = image else { continue };
            for layer in &image.layers {
                layout.add_blob(&layer.blob)?;
            }
            let config_desc = layout.add_json_blob(MediaType::ImageConfig, &image.config)?;
            let layer_descs = image
                .layers
                .iter()
                .map(|l| l.descriptor())
                .collect::<Result<Vec<_>>>()?;
            let manifest = manifest::generate_manifest(config_desc, layer_descs, primary_ref)?;
            let descriptor = layout.add_json_blob(MediaType::ImageManifest, &manifest)?;
            outcome.manifest_digest = Some(Digest::new(descriptor.digest())?);
            manifests.push((outcome.platform.clone(), descriptor));
        }
        let index = manifest::generate_index(manifests, primary_ref)?;
        let image_digest = Some(Digest::from_buf_sha256(&serde_json::to_vec(&index)?));
        let layout_path = layout.finish(&index)?;

        let outcomes: Vec<PlatformOutcome> =
            results.into_iter().map(|(outcome, _)| outcome).collect();
        let success = !outcomes.is_empty() && outcomes.iter().all(|o| o.success);

        if self.config.push && success {
            if let Some(push) = &self.push {
                log::info!("pushing {} reference(s)", self.config.tags.len());
                push.push(&layout_path, &self.config.tags)?;
            }
        }

        Ok(BuildResult {
            success,
            operations: outcomes.iter().map(|o| o.operations).sum(),
            cache_hits: outcomes.iter().map(|o| o.cache_hits).sum(),
            platforms: outcomes,
            duration: started.elapsed(),
            image_digest,
            layout: layout_path,
        })
    }

    fn build_platform(
        &self,
        platform: &Platform,
        compiled: &CompiledGraph,
        deadline: Instant,
        stamp: DateTime<Utc>,
    ) -> (PlatformOutcome, Option<PlatformImage>) {
        let mut outcome = PlatformOutcome {
            platform: platform.clone(),
            success: false,
            error: None,
            manifest_digest: None,
            operations: 0,
            cache_hits: 0,
        };
        match self.walk_platform(platform, compiled, deadline, stamp, &mut outcome) {
            Ok(image) => {
                outcome.success = true;
                (outcome, Some(image))
            }
            Err(e) => {
                log::warn!("platform {platform} failed: {e}");
                outcome.error = Some(e.to_string());
                (outcome, None)
            }
        }
    }

    fn walk_platform(
        &self,
        platform: &Platform,
        compiled: &CompiledGraph,
        deadline: Instant,
        stamp: DateTime<Utc>,
        outcome: &mut PlatformOutcome,
    ) -> Result<PlatformImage> {
        let scratch = tempfile::Builder::new().prefix("ocibuild-").tempdir()?;
        let workspaces = scratch.path().join("workspaces");
        let executor_config = ExecutorConfig {
            platform: platform.clone(),
            context: self.config.context.clone(),
            state_root: scratch.path().join("state"),
            security_context: self.config.security_context.clone(),
            resource_limits: self.config.resource_limits.clone(),
            cancel: self.cancel.clone(),
        };
        let mut executor = self
            .registry
            .create(self.config.backend, &executor_config)?;

        let mut meta = RuntimeMeta::default();
        let mut layers: Vec<Layer> = Vec::new();
        for id in &compiled.order {
            if Instant::now() >= deadline {
                log::warn!("build deadline exceeded; cancelling");
                self.cancel.cancel();
            }
            self.cancel.check()?;

            let op = compiled
                .graph
                .get(id)
                .ok_or_else(|| Error::MissingNode(id.clone()))?;
            let line = compiled.lines.get(id).copied().unwrap_or(0);
            outcome.operations += 1;

            if op.kind == OperationKind::Source {
                // A new stage: whatever the previous stage accumulated stays
                // on disk for --from references but leaves the image.
                meta = RuntimeMeta::default();
                layers.clear();
            }

            let cacheable = matches!(op.kind, OperationKind::Exec | OperationKind::File);
            let key = if cacheable { Some(op.cache_key()?) } else { None };

            if let (Some(key), false) = (&key, self.config.no_cache) {
                if let Some(entry) = self.cache.lookup(key)? {
                    log::debug!("cache hit for {id} ({key})");
                    outcome.cache_hits += 1;
                    for cached in &entry.layers {
                        let blob = self.cache.read_blob(&cached.digest)?;
                        let compressed = cached.media_type.contains("gzip");
                        executor.apply_layer(&blob, compressed)?;
                        layers.push(rehydrate_layer(cached, blob));
                    }
                    continue;
                }
            }

            let lease = match &key {
                Some(key) => Some(self.cache.reserve(key)?),
                None => None,
            };
            let result = if op.kind == OperationKind::Meta {
                executor.execute(op, &workspaces)?
            } else {
                let workspace = Workspace::create(&workspaces)?;
                executor.execute(op, workspace.path())?
            };
            if !result.success {
                let message = result
                    .error
                    .unwrap_or_else(|| "operation failed".to_string());
                return Err(Error::OperationFailed { line, message });
            }
            if op.kind == OperationKind::Meta {
                meta.apply(op);
            }

            let layer = LayerBuilder::new()
                .created(stamp)
                .created_by(&op.created_by())
                .build(&result.changes)?;
            let mut entry_layers = Vec::new();
            if let Some(layer) = layer {
                self.cache.write_blob(&layer.digest, &layer.blob)?;
                entry_layers.push(CachedLayer {
                    digest: layer.digest.clone(),
                    diff_id: layer.diff_id.clone(),
                    size: layer.size,
                    media_type: layer.media_type.to_string(),
                    created: layer.created,
                    created_by: layer.created_by.clone(),
                });
                layers.push(layer);
            }
            if let (Some(lease), Some(key)) = (lease, &key) {
                self.cache.store(
                    lease,
                    &CacheEntry {
                        key: key.to_string(),
                        outputs: op.outputs.clone(),
                        env: result.environment.clone(),
                        layers: entry_layers,
                        created: stamp,
                    },
                )?;
            }
        }
        executor.cleanup()?;

        let config = manifest::generate_config(platform, &meta, &layers)?;
        Ok(PlatformImage { layers, config })
    }

    /// Translate the instruction list into one per-platform operation graph.
    fn compile_graph(
        &self,
        instructions: &[Instruction],
        platform: &Platform,
    ) -> Result<CompiledGraph> {
        let mut compiler = GraphCompiler::new(&self.config, platform.clone());
        for instruction in instructions {
            compiler.push(instruction)?;
        }
        compiler.finish()
    }
}

fn rehydrate_layer(cached: &CachedLayer, blob: Vec<u8>) -> Layer {
    Layer {
        diff_id: cached.diff_id.clone(),
        digest: cached.digest.clone(),
        size: cached.size,
        media_type: if cached.media_type.contains("gzip") {
            MediaType::ImageLayerGzip
        } else {
            MediaType::ImageLayer
        },
        created: cached.created,
        created_by: cached.created_by.clone(),
        annotations: BTreeMap::new(),
        blob,
    }
}

fn default_cache_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "ocibuild", "ocibuild")
        .ok_or(Error::NoValidHomeDirectory)?;
    Ok(dirs.cache_dir().to_owned())
}

/// Accumulates one instruction at a time into a [BuildGraph].
struct GraphCompiler<'a> {
    config: &'a BuildConfig,
    platform: Platform,
    args: HashMap<String, String>,
    graph: BuildGraph,
    lines: HashMap<String, usize>,
    /// Completed (and in-progress) stages by alias and by index string
    stages: HashMap<String, String>,
    stage_index: Option<usize>,
    current_alias: Option<String>,
    layer_count: usize,
    meta_count: usize,
    prev: Option<String>,
    env: BTreeMap<String, String>,
    workdir: String,
    user: String,
}

impl<'a> GraphCompiler<'a> {
    fn new(config: &'a BuildConfig, platform: Platform) -> Self {
        GraphCompiler {
            config,
            platform,
            args: config.build_args.clone(),
            graph: BuildGraph::new(),
            lines: HashMap::new(),
            stages: HashMap::new(),
            stage_index: None,
            current_alias: None,
            layer_count: 0,
            meta_count: 0,
            prev: None,
            env: BTreeMap::new(),
            workdir: "/".to_string(),
            user: String::new(),
        }
    }

    fn push(&mut self, instruction: &Instruction) -> Result<()> {
        let value = expand_args(instruction.value.trim(), &self.args);
        let line = instruction.line;
        match instruction.command.as_str() {
            "FROM" => self.from(&value, line),
            "ARG" => {
                if let Some((name, default)) = value.split_once('=') {
                    self.args
                        .entry(name.trim().to_string())
                        .or_insert_with(|| default.trim().to_string());
                }
                Ok(())
            }
            "RUN" => self.run(&value, line),
            "COPY" | "ADD" => self.file(&instruction.command.to_lowercase(), &value, line),
            "WORKDIR" => {
                let workdir = if value.starts_with('/') {
                    value.clone()
                } else {
                    format!("{}/{}", self.workdir.trim_end_matches('/'), value)
                };
                self.workdir = workdir.clone();
                self.meta(line, BTreeMap::new(), BTreeMap::from([("workdir".to_string(), workdir)]), vec!["WORKDIR".to_string(), value])
            }
            "ENV" => {
                let pairs = parse_pairs(&value);
                self.env.extend(pairs.clone());
                let joined = pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");
                self.meta(
                    line,
                    pairs,
                    BTreeMap::from([("env".to_string(), joined)]),
                    vec!["ENV".to_string(), value],
                )
            }
            "EXPOSE" => {
                let ports = value.split_whitespace().collect::<Vec<_>>().join(",");
                self.meta(
                    line,
                    BTreeMap::new(),
                    BTreeMap::from([("expose".to_string(), ports)]),
                    vec!["EXPOSE".to_string(), value],
                )
            }
            "CMD" | "ENTRYPOINT" | "VOLUME" => {
                let key = instruction.command.to_lowercase();
                let list = manifest::parse_string_list(&value);
                self.meta(
                    line,
                    BTreeMap::new(),
                    BTreeMap::from([(key, serde_json::to_string(&list)?)]),
                    vec![instruction.command.clone(), value],
                )
            }
            "USER" => {
                self.user = value.clone();
                self.meta(
                    line,
                    BTreeMap::new(),
                    BTreeMap::from([("user".to_string(), value.clone())]),
                    vec!["USER".to_string(), value],
                )
            }
            "LABEL" => {
                let metadata = parse_pairs(&value)
                    .into_iter()
                    .map(|(k, v)| (format!("label.{k}"), v))
                    .collect();
                self.meta(line, BTreeMap::new(), metadata, vec!["LABEL".to_string(), value])
            }
            other => Err(Error::UnknownInstruction {
                command: other.to_string(),
                line,
            }),
        }
    }

    fn from(&mut self, value: &str, line: usize) -> Result<()> {
        self.seal_stage();
        let words: Vec<&str> = value.split_whitespace().collect();
        let (image, alias) = match words.as_slice() {
            [image] => (*image, None),
            [image, kw, alias] if kw.eq_ignore_ascii_case("as") => (*image, Some(*alias)),
            _ => {
                return Err(Error::InvalidInstruction {
                    command: "FROM".to_string(),
                    line,
                    reason: format!("unparsable value: {value}"),
                });
            }
        };

        let index = self.stage_index.map(|i| i + 1).unwrap_or(0);
        self.stage_index = Some(index);
        self.current_alias = alias.map(str::to_string);
        self.layer_count = 0;
        self.meta_count = 0;
        self.env.clear();
        self.workdir = "/".to_string();
        self.user = String::new();

        let id = format!("stage{index}-base");
        let mut metadata = BTreeMap::from([("image".to_string(), image.to_string())]);
        if let Some(alias) = &self.current_alias {
            metadata.insert("stage".to_string(), alias.clone());
        }
        let stage_dep = self.stages.get(image).cloned();
        let mut inputs = Vec::new();
        if stage_dep.is_some() {
            metadata.insert("stage_ref".to_string(), image.to_string());
            inputs.push(image.to_string());
        }
        let op = Operation {
            kind: OperationKind::Source,
            command: vec!["from".to_string(), image.to_string()],
            inputs,
            outputs: vec![id.clone()],
            env: BTreeMap::new(),
            metadata,
            workdir: self.workdir.clone(),
            user: String::new(),
            platform: self.platform.clone(),
        };
        self.graph.add_node(&id, op)?;
        if let Some(dep) = stage_dep {
            self.graph.add_dependency(&id, &dep)?;
        }
        self.lines.insert(id.clone(), line);
        self.prev = Some(id);
        Ok(())
    }

    fn run(&mut self, value: &str, line: usize) -> Result<()> {
        let index = self.require_stage(line)?;
        let command = match serde_json::from_str::<Vec<String>>(value) {
            Ok(argv) => argv,
            Err(_) => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                value.to_string(),
            ],
        };
        let id = format!("stage{index}-layer{}", self.layer_count);
        self.layer_count += 1;
        let op = Operation {
            kind: OperationKind::Exec,
            command,
            inputs: vec![self.prev.clone().expect("stage always has a base op")],
            outputs: vec![id.clone()],
            env: self.env.clone(),
            metadata: BTreeMap::new(),
            workdir: self.workdir.clone(),
            user: self.user.clone(),
            platform: self.platform.clone(),
        };
        self.chain(&id, op, line)
    }

    fn file(&mut self, verb: &str, value: &str, line: usize) -> Result<()> {
        let index = self.require_stage(line)?;
        let mut from_stage = None;
        let mut words: Vec<&str> = Vec::new();
        for token in value.split_whitespace() {
            if let Some(stage) = token.strip_prefix("--from=") {
                from_stage = Some(stage.to_string());
            } else {
                words.push(token);
            }
        }
        if words.len() < 2 {
            return Err(Error::InvalidInstruction {
                command: verb.to_uppercase(),
                line,
                reason: "expected at least one source and a destination".to_string(),
            });
        }
        let dest = words.pop().expect("length checked above").to_string();

        let mut metadata = BTreeMap::from([("dest".to_string(), dest.clone())]);
        let mut stage_dep = None;
        if let Some(stage) = &from_stage {
            let Some(dep) = self.stages.get(stage) else {
                return Err(Error::UnknownStage {
                    stage: stage.clone(),
                    line,
                });
            };
            stage_dep = Some(dep.clone());
            metadata.insert("from_stage".to_string(), stage.clone());
        }

        let mut inputs = vec![self.prev.clone().expect("stage always has a base op")];
        let mut command = vec![verb.to_string()];
        for source in &words {
            let host_path = match from_stage {
                Some(_) => format!("/{}", source.trim_start_matches('/')),
                None => self
                    .config
                    .context
                    .join(source)
                    .to_string_lossy()
                    .into_owned(),
            };
            inputs.push(host_path);
            command.push(source.to_string());
        }
        command.push(dest);

        let id = format!("stage{index}-layer{}", self.layer_count);
        self.layer_count += 1;
        let op = Operation {
            kind: OperationKind::File,
            command,
            inputs,
            outputs: vec![id.clone()],
            env: self.env.clone(),
            metadata,
            workdir: self.workdir.clone(),
            user: self.user.clone(),
            platform: self.platform.clone(),
        };
        self.graph.add_node(&id, op)?;
        self.graph
            .add_dependency(&id, &self.prev.clone().expect("stage always has a base op"))?;
        if let Some(dep) = stage_dep {
            self.graph.add_dependency(&id, &dep)?;
        }
        self.lines.insert(id.clone(), line);
        self.prev = Some(id);
        Ok(())
    }

    fn meta(
        &mut self,
        line: usize,
        env: BTreeMap<String, String>,
        metadata: BTreeMap<String, String>,
        command: Vec<String>,
    ) -> Result<()> {
        let index = self.require_stage(line)?;
        let id = format!("stage{index}-meta{}", self.meta_count);
        self.meta_count += 1;
        let op = Operation {
            kind: OperationKind::Meta,
            command,
            inputs: vec![self.prev.clone().expect("stage always has a base op")],
            outputs: vec![id.clone()],
            env,
            metadata,
            workdir: self.workdir.clone(),
            user: self.user.clone(),
            platform: self.platform.clone(),
        };
        self.chain(&id, op, line)
    }

    fn chain(&mut self, id: &str, op: Operation, line: usize) -> Result<()> {
        self.graph.add_node(id, op)?;
        let prev = self.prev.clone().expect("stage always has a base op");
        self.graph.add_dependency(id, &prev)?;
        self.lines.insert(id.to_string(), line);
        self.prev = Some(id.to_string());
        Ok(())
    }

    fn require_stage(&self, line: usize) -> Result<usize> {
        self.stage_index.ok_or(Error::InstructionBeforeFrom(line))
    }

    /// Record the finished stage's last operation under its alias and index.
    fn seal_stage(&mut self) {
        if let (Some(index), Some(last)) = (self.stage_index, self.prev.clone()) {
            self.stages.insert(index.to_string(), last.clone());
            if let Some(alias) = self.current_alias.take() {
                self.stages.insert(alias, last);
            }
        }
    }

    fn finish(mut self) -> Result<CompiledGraph> {
        self.seal_stage();
        self.graph.optimize();
        let order = self.graph.topological_sort()?;
        Ok(CompiledGraph {
            graph: self.graph,
            order,
            lines: self.lines,
        })
    }
}

/// Parse `K=V K2=V2` style pairs; a bare `K V` form yields one pair.
fn parse_pairs(value: &str) -> BTreeMap<String, String> {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() >= 2 && !tokens[0].contains('=') {
        return BTreeMap::from([(tokens[0].to_string(), tokens[1..].join(" "))]);
    }
    tokens
        .iter()
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.trim_matches('"').to_string(), v.trim_matches('"').to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::BackendKind;

    fn engine_for(context: &Path, out: &Path, cache: &Path) -> Result<BuildEngine> {
        let mut config = BuildConfig::new(context, out.join("image"));
        config.platforms = vec![Platform::new("linux", "amd64")];
        config.cache_dir = Some(cache.to_path_buf());
        config.backend = BackendKind::Rootless;
        BuildEngine::new(config)
    }

    fn recipe(lines: &[(&str, &str)]) -> Vec<Instruction> {
        lines
            .iter()
            .enumerate()
            .map(|(i, (cmd, value))| Instruction::new(cmd, value, i + 1))
            .collect()
    }

    #[test]
    fn compile_simple_graph() -> Result<()> {
        let context = tempfile::tempdir()?;
        let out = tempfile::tempdir()?;
        let cache = tempfile::tempdir()?;
        let engine = engine_for(context.path(), out.path(), cache.path())?;

        let instructions = recipe(&[
            ("FROM", "scratch"),
            ("COPY", "hello.txt /hello.txt"),
            ("ENV", "MODE=fast"),
            ("RUN", "echo done"),
        ]);
        let compiled = engine.compile_graph(&instructions, &Platform::new("linux", "amd64"))?;
        assert_eq!(
            compiled.order,
            vec!["stage0-base", "stage0-layer0", "stage0-meta0", "stage0-layer1"]
        );
        let run = compiled.graph.get("stage0-layer1").unwrap();
        assert_eq!(run.command[..2], ["/bin/sh".to_string(), "-c".to_string()]);
        assert_eq!(run.env.get("MODE").map(String::as_str), Some("fast"));
        Ok(())
    }

    #[test]
    fn compile_multi_stage_references() -> Result<()> {
        let context = tempfile::tempdir()?;
        let out = tempfile::tempdir()?;
        let cache = tempfile::tempdir()?;
        let engine = engine_for(context.path(), out.path(), cache.path())?;

        let instructions = recipe(&[
            ("FROM", "scratch AS builder"),
            ("COPY", "x /x"),
            ("FROM", "scratch"),
            ("COPY", "--from=builder /x /y"),
        ]);
        let compiled = engine.compile_graph(&instructions, &Platform::new("linux", "amd64"))?;
        let copy = compiled.graph.get("stage1-layer0").unwrap();
        assert_eq!(
            copy.metadata.get("from_stage").map(String::as_str),
            Some("builder")
        );
        // The cross-stage copy is ordered after the referenced stage's tail.
        let order = &compiled.order;
        let tail = order.iter().position(|i| i == "stage0-layer0").unwrap();
        let copy_pos = order.iter().position(|i| i == "stage1-layer0").unwrap();
        assert!(tail < copy_pos);
        Ok(())
    }

    #[test]
    fn unknown_stage_is_a_recipe_error() -> Result<()> {
        let context = tempfile::tempdir()?;
        let out = tempfile::tempdir()?;
        let cache = tempfile::tempdir()?;
        let engine = engine_for(context.path(), out.path(), cache.path())?;

        let instructions = recipe(&[("FROM", "scratch"), ("COPY", "--from=ghost /x /y")]);
        let err = engine
            .compile_graph(&instructions, &Platform::new("linux", "amd64"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStage { .. }));
        Ok(())
    }

    #[test]
    fn instruction_before_from_is_rejected() -> Result<()> {
        let context = tempfile::tempdir()?;
        let out = tempfile::tempdir()?;
        let cache = tempfile::tempdir()?;
        let engine = engine_for(context.path(), out.path(), cache.path())?;

        let instructions = recipe(&[("RUN", "echo hi")]);
        assert!(matches!(
            engine.compile_graph(&instructions, &Platform::new("linux", "amd64")),
            Err(Error::InstructionBeforeFrom(1))
        ));
        Ok(())
    }

    #[test]
    fn build_args_expand_before_emission() -> Result<()> {
        let context = tempfile::tempdir()?;
        let out = tempfile::tempdir()?;
        let cache = tempfile::tempdir()?;
        let mut config = BuildConfig::new(context.path(), out.path().join("image"));
        config.cache_dir = Some(cache.path().to_path_buf());
        config
            .build_args
            .insert("BASE".to_string(), "scratch".to_string());
        let engine = BuildEngine::new(config)?;

        let instructions = recipe(&[
            ("ARG", "BASE=alpine"),
            ("FROM", "$BASE"),
            ("ARG", "GREETING=hello"),
            ("LABEL", "greeting=${GREETING}"),
        ]);
        let compiled = engine.compile_graph(&instructions, &Platform::new("linux", "amd64"))?;
        let base = compiled.graph.get("stage0-base").unwrap();
        // Caller-provided build args beat ARG defaults
        assert_eq!(base.metadata.get("image").map(String::as_str), Some("scratch"));
        let label = compiled.graph.get("stage0-meta0").unwrap();
        assert_eq!(
            label.metadata.get("label.greeting").map(String::as_str),
            Some("hello")
        );
        Ok(())
    }

    #[test]
    fn pair_parsing() {
        let pairs = parse_pairs("A=1 B=2");
        assert_eq!(pairs.get("A").map(String::as_str), Some("1"));
        assert_eq!(pairs.get("B").map(String::as_str), Some("2"));
        let spaced = parse_pairs("MODE fast and loose");
        assert_eq!(
            spaced.get("MODE").map(String::as_str),
            Some("fast and loose")
        );
    }
}
