//! Input surface of the build engine: parsed recipe instructions and the
//! per-build configuration.
//!
//! Recipe text parsing lives in the frontend; the engine only consumes the
//! flat [Instruction] records the frontend produced.

use crate::{error::Result, ImageName, Platform};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// One parsed recipe instruction, e.g. `RUN make install` at line 12.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    /// Upper-case instruction keyword (`FROM`, `RUN`, `COPY`, ...)
    pub command: String,
    /// Raw value with the keyword stripped
    pub value: String,
    /// 1-based source line, for error reporting
    pub line: usize,
    /// Stage alias active when the instruction was parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl Instruction {
    pub fn new(command: &str, value: &str, line: usize) -> Self {
        Instruction {
            command: command.to_ascii_uppercase(),
            value: value.to_string(),
            line,
            stage: None,
        }
    }
}

/// Selects the on-disk output flavor of a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Single-platform image layout
    Image,
    /// Image index covering every target platform
    Multiarch,
}

/// Which executor backend the engine should construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Use a container runtime when one is installed, rootless otherwise
    Auto,
    /// User-namespace based execution without a container runtime
    Rootless,
    /// Delegate to podman or docker
    Runtime,
}

/// Requested identity and capability set for executed commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<u32>,
    #[serde(default)]
    pub run_as_non_root: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Advisory resource ceilings for executed commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit, e.g. `512Mi`, `2Gi`, or plain bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU limit as decimal cores (`1.5`) or millicores (`1500m`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Disk limit, same units as memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
}

/// Everything a single build run needs to know beyond the instruction list.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root of the build context; `COPY` sources resolve under it
    pub context: PathBuf,
    /// Image references to record in the output (and push when requested)
    pub tags: Vec<ImageName>,
    /// Directory receiving the OCI layout; must not exist yet
    pub output_dir: PathBuf,
    pub output: OutputKind,
    /// Disable cache lookups (results are still written)
    pub no_cache: bool,
    pub build_args: HashMap<String, String>,
    /// Target platforms; defaults to the host platform
    pub platforms: Vec<Platform>,
    pub push: bool,
    /// Opaque registry options handed to the push callback
    pub registry_config: HashMap<String, String>,
    pub security_context: SecurityContext,
    pub resource_limits: ResourceLimits,
    pub backend: BackendKind,
    /// Cache root; defaults to the per-user data directory
    pub cache_dir: Option<PathBuf>,
    /// Per-build deadline, enforced as cooperative cancellation
    pub timeout: Duration,
}

impl BuildConfig {
    pub fn new(context: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        BuildConfig {
            context: context.into(),
            tags: Vec::new(),
            output_dir: output_dir.into(),
            output: OutputKind::Image,
            no_cache: false,
            build_args: HashMap::new(),
            platforms: vec![Platform::host()],
            push: false,
            registry_config: HashMap::new(),
            security_context: SecurityContext::default(),
            resource_limits: ResourceLimits::default(),
            backend: BackendKind::Rootless,
            cache_dir: None,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Persistent builder settings loaded from `ocibuild.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuilderConfig {
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

impl BuilderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

lazy_static::lazy_static! {
    static ref VAR_RE: Regex = Regex::new(r"\$(?:([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)\})").unwrap();
}

/// Substitute `$NAME` and `${NAME}` occurrences with build-arg values.
/// Unknown names expand to the empty string.
pub fn expand_args(value: &str, args: &HashMap<String, String>) -> String {
    VAR_RE
        .replace_all(value, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .expect("one alternative always matches")
                .as_str();
            args.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}
