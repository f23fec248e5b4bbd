//! Operation executors: materialize one operation into a filesystem delta.
//!
//! Two backends share the [Executor] contract: a rootless user-namespace
//! variant and a container-runtime variant. Which one a build uses is decided
//! through an explicit [ExecutorRegistry] rather than process-global state.

pub mod capture;
pub mod rootless;
pub mod runtime;
mod workspace;

pub use workspace::Workspace;

use crate::{
    error::{Error, Result},
    graph::Operation,
    instruction::{BackendKind, ResourceLimits, SecurityContext},
    layer::{ChangeContent, ChangeKind, FileChange},
    Platform,
};
use capture::CaptureOptions;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Cooperative cancellation signal shared by a build and its executors.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Outcome of executing one operation. Recipe-level failures are reported
/// here, not as errors; only engine-level aborts surface as [Error].
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub outputs: Vec<String>,
    /// Accumulated environment after the operation
    pub environment: BTreeMap<String, String>,
    pub error: Option<String>,
    /// Filesystem delta for the layer builder, sorted by path
    pub changes: Vec<FileChange>,
}

impl ExecResult {
    pub fn succeeded(
        op: &Operation,
        environment: BTreeMap<String, String>,
        changes: Vec<FileChange>,
    ) -> Self {
        ExecResult {
            success: true,
            outputs: op.outputs.clone(),
            environment,
            error: None,
            changes,
        }
    }

    pub fn failed(op: &Operation, environment: BTreeMap<String, String>, error: String) -> Self {
        ExecResult {
            success: false,
            outputs: op.outputs.clone(),
            environment,
            error: Some(error),
            changes: Vec::new(),
        }
    }
}

/// One operation at a time against an engine-provided workspace.
pub trait Executor {
    fn execute(&mut self, op: &Operation, workspace: &Path) -> Result<ExecResult>;
    /// Materialize a cached layer blob into the accumulated base tree so
    /// later operations see its files without re-executing the producer.
    fn apply_layer(&mut self, blob: &[u8], compressed: bool) -> Result<()>;
    fn cleanup(&mut self) -> Result<()>;
}

/// Everything an executor needs at construction time.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub platform: Platform,
    /// Build context root; File sources must stay inside it
    pub context: PathBuf,
    /// Per-platform scratch directory for base and stage trees
    pub state_root: PathBuf,
    pub security_context: SecurityContext,
    pub resource_limits: ResourceLimits,
    pub cancel: CancelToken,
}

pub type ExecutorFactory = fn(&ExecutorConfig) -> Result<Box<dyn Executor>>;

/// Explicit map of available executor backends, consulted per build.
pub struct ExecutorRegistry {
    factories: HashMap<&'static str, ExecutorFactory>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        ExecutorRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("rootless", rootless::RootlessExecutor::factory);
        registry.register("runtime", runtime::RuntimeExecutor::factory);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ExecutorFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, kind: BackendKind, config: &ExecutorConfig) -> Result<Box<dyn Executor>> {
        let name = match kind {
            BackendKind::Rootless => "rootless",
            BackendKind::Runtime => "runtime",
            BackendKind::Auto => {
                if runtime::detect_runtime().is_some() {
                    "runtime"
                } else {
                    "rootless"
                }
            }
        };
        let factory = self
            .factories
            .get(name)
            .ok_or(Error::RuntimeNotFound)?;
        log::debug!("constructing {name} executor");
        factory(config)
    }
}

/// Captured outcome of a finished child process.
pub(crate) struct ChildOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ChildOutput {
    /// Stdout and stderr interleaved for error reporting.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
        }
    }
}

/// Run a child process to completion while polling the cancellation token.
/// Stdout and stderr are drained on reader threads so the child never blocks
/// on a full pipe; on cancellation the child is killed.
pub(crate) fn run_child(command: &mut Command, cancel: &CancelToken) -> Result<ChildOutput> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    let out_reader = std::thread::spawn(move || drain(stdout));
    let err_reader = std::thread::spawn(move || drain(stderr));

    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Cancelled);
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    };

    Ok(ChildOutput {
        status,
        stdout: out_reader.join().expect("stdout reader thread panicked"),
        stderr: err_reader.join().expect("stderr reader thread panicked"),
    })
}

fn drain(mut reader: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// State both backends share: the accumulated base tree per stage, completed
/// stage trees, and the metadata-driven build state.
pub(crate) struct CommonState {
    pub platform: Platform,
    pub context: PathBuf,
    pub state_root: PathBuf,
    pub base: PathBuf,
    pub stages: HashMap<String, PathBuf>,
    pub current_stage: Option<String>,
    pub stage_counter: usize,
    pub env: BTreeMap<String, String>,
    pub workdir: String,
    pub user: String,
    pub cancel: CancelToken,
    pub capture_opts: CaptureOptions,
}

impl CommonState {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        if !config.context.is_dir() {
            return Err(Error::NotADirectory(config.context.clone()));
        }
        let context = config.context.canonicalize()?;
        let base = config.state_root.join("base");
        fs::create_dir_all(&base)?;
        fs::create_dir_all(config.state_root.join("stages"))?;
        let host_uid = rustix::process::getuid().as_raw() as u64;
        let host_gid = rustix::process::getgid().as_raw() as u64;
        Ok(CommonState {
            platform: config.platform.clone(),
            context,
            state_root: config.state_root.clone(),
            base,
            stages: HashMap::new(),
            current_stage: None,
            stage_counter: 0,
            env: BTreeMap::new(),
            workdir: "/".to_string(),
            user: String::new(),
            cancel: config.cancel.clone(),
            capture_opts: CaptureOptions {
                content_hash: true,
                uid: host_uid,
                gid: host_gid,
            },
        })
    }

    /// Archive the finished stage tree and start a fresh base for the next
    /// one. Finished stages stay addressable by alias and by index.
    pub fn begin_stage(&mut self, op: &Operation) -> Result<()> {
        if self.stage_counter > 0 {
            let index_name = (self.stage_counter - 1).to_string();
            let archived = self.state_root.join("stages").join(&index_name);
            fs::rename(&self.base, &archived)?;
            self.stages.insert(index_name, archived.clone());
            if let Some(alias) = self.current_stage.take() {
                self.stages.insert(alias, archived);
            }
            fs::create_dir_all(&self.base)?;
        }
        self.stage_counter += 1;
        self.current_stage = op.metadata.get("stage").cloned();
        self.env.clear();
        self.workdir = "/".to_string();
        self.user = op.user.clone();
        Ok(())
    }

    /// Handle the backend-independent Source cases. Returns `None` when the
    /// backend must pull a remote image.
    ///
    /// An imported tree (stage reference, or a pull reported through
    /// [CommonState::base_changes]) is returned as one flattened set of Add
    /// changes so the engine can emit it as the stage's base layer.
    pub fn source_common(&mut self, op: &Operation) -> Result<Option<ExecResult>> {
        self.cancel.check()?;
        self.begin_stage(op)?;
        if let Some(stage_ref) = op.metadata.get("stage_ref") {
            let Some(tree) = self.stages.get(stage_ref).cloned() else {
                return Ok(Some(ExecResult::failed(
                    op,
                    self.env.clone(),
                    format!("undefined stage: {stage_ref}"),
                )));
            };
            capture::copy_tree(&tree, &self.base)?;
            let changes = self.base_changes()?;
            return Ok(Some(ExecResult::succeeded(op, self.env.clone(), changes)));
        }
        match op.metadata.get("image").map(String::as_str) {
            Some("scratch") => Ok(Some(ExecResult::succeeded(op, self.env.clone(), Vec::new()))),
            _ => Ok(None),
        }
    }

    /// The whole base tree as Add changes, for squashing an imported base
    /// into a single layer.
    pub fn base_changes(&self) -> Result<Vec<FileChange>> {
        capture::diff(&capture::Snapshot::new(), &self.base, &self.capture_opts)
    }

    /// Import files from the build context or a completed stage tree into the
    /// base, reporting every touched path as a change.
    pub fn file(&mut self, op: &Operation) -> Result<ExecResult> {
        self.cancel.check()?;
        let Some(dest) = op.metadata.get("dest") else {
            return Ok(ExecResult::failed(
                op,
                self.env.clone(),
                "file operation is missing a destination".to_string(),
            ));
        };
        let sources: Vec<&String> = op.inputs.iter().filter(|i| i.starts_with('/')).collect();
        if sources.is_empty() {
            return Ok(ExecResult::failed(
                op,
                self.env.clone(),
                "file operation has no sources".to_string(),
            ));
        }

        let stage_root = match op.metadata.get("from_stage") {
            Some(stage) => match self.stages.get(stage) {
                Some(tree) => Some(tree.clone()),
                None => {
                    return Ok(ExecResult::failed(
                        op,
                        self.env.clone(),
                        format!("undefined stage: {stage}"),
                    ));
                }
            },
            None => None,
        };

        let mut changes = Vec::new();
        let dest_is_dir = dest.ends_with('/') || sources.len() > 1;
        for source in sources {
            let resolved = match &stage_root {
                Some(root) => root.join(source.trim_start_matches('/')),
                None => {
                    let path = PathBuf::from(source);
                    match path.canonicalize() {
                        Ok(canonical) if canonical.starts_with(&self.context) => canonical,
                        Ok(canonical) => return Err(Error::OutsideContext(canonical)),
                        Err(_) => {
                            return Ok(ExecResult::failed(
                                op,
                                self.env.clone(),
                                format!("source not found: {source}"),
                            ));
                        }
                    }
                }
            };
            if !resolved.exists() {
                return Ok(ExecResult::failed(
                    op,
                    self.env.clone(),
                    format!("source not found: {source}"),
                ));
            }
            let image_dest = if resolved.is_dir() {
                PathBuf::from(dest)
            } else if dest_is_dir {
                Path::new(dest).join(
                    resolved
                        .file_name()
                        .expect("resolved source file has a name"),
                )
            } else {
                PathBuf::from(dest)
            };
            self.import_path(&resolved, &image_dest, &mut changes)?;
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(ExecResult::succeeded(op, self.env.clone(), changes))
    }

    fn import_path(
        &self,
        source: &Path,
        image_dest: &Path,
        changes: &mut Vec<FileChange>,
    ) -> Result<()> {
        self.record_parents(image_dest, changes)?;
        if source.is_dir() {
            for entry in walkdir::WalkDir::new(source) {
                let entry = entry?;
                let rel = entry
                    .path()
                    .strip_prefix(source)
                    .expect("walkdir yields paths under its root");
                let dest = image_dest.join(rel);
                if entry.file_type().is_dir() {
                    self.import_dir(&dest, changes)?;
                } else {
                    self.import_file(entry.path(), &dest, changes)?;
                }
            }
        } else {
            self.import_file(source, image_dest, changes)?;
        }
        Ok(())
    }

    fn record_parents(&self, image_dest: &Path, changes: &mut Vec<FileChange>) -> Result<()> {
        let mut partial = PathBuf::from("/");
        for component in image_dest
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .components()
        {
            partial.push(component);
            if partial == Path::new("/") {
                continue;
            }
            let host = self.host_path(&partial);
            if !host.exists() {
                self.import_dir(&partial, changes)?;
            }
        }
        Ok(())
    }

    fn import_dir(&self, image_path: &Path, changes: &mut Vec<FileChange>) -> Result<()> {
        let host = self.host_path(image_path);
        if !host.exists() {
            fs::create_dir_all(&host)?;
            changes.push(FileChange {
                path: image_path.to_path_buf(),
                kind: ChangeKind::Add,
                mode: 0o755,
                size: 0,
                mtime: chrono::Utc::now().timestamp(),
                uid: self.capture_opts.uid,
                gid: self.capture_opts.gid,
                content: Some(ChangeContent::Directory),
            });
        }
        Ok(())
    }

    fn import_file(
        &self,
        source: &Path,
        image_path: &Path,
        changes: &mut Vec<FileChange>,
    ) -> Result<()> {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let host = self.host_path(image_path);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent)?;
        }
        let kind = if host.exists() {
            ChangeKind::Modify
        } else {
            ChangeKind::Add
        };
        fs::copy(source, &host)?;
        let metadata = fs::metadata(&host)?;
        changes.push(FileChange {
            path: image_path.to_path_buf(),
            kind,
            mode: metadata.permissions().mode() & 0o7777,
            size: metadata.len(),
            mtime: metadata.mtime(),
            uid: self.capture_opts.uid,
            gid: self.capture_opts.gid,
            content: Some(ChangeContent::File(host)),
        });
        Ok(())
    }

    /// Apply a metadata-only operation to the in-memory build state.
    pub fn meta(&mut self, op: &Operation) -> ExecResult {
        for (key, value) in &op.env {
            self.env.insert(key.clone(), value.clone());
        }
        if let Some(workdir) = op.metadata.get("workdir") {
            self.workdir = workdir.clone();
        }
        if !op.user.is_empty() {
            self.user = op.user.clone();
        }
        ExecResult::succeeded(op, self.env.clone(), Vec::new())
    }

    /// Location of an image path inside the current base tree.
    pub fn host_path(&self, image_path: &Path) -> PathBuf {
        self.base.join(
            image_path
                .strip_prefix("/")
                .unwrap_or(image_path),
        )
    }
}
