use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid build recipe
    //
    #[error("Unknown instruction `{command}` at line {line}")]
    UnknownInstruction { command: String, line: usize },
    #[error("Instruction at line {0} appears before the first FROM")]
    InstructionBeforeFrom(usize),
    #[error("Invalid {command} instruction at line {line}: {reason}")]
    InvalidInstruction {
        command: String,
        line: usize,
        reason: String,
    },
    #[error("Instruction at line {line} references undefined stage: {stage}")]
    UnknownStage { stage: String, line: usize },
    #[error("Cycle detected in operation graph at node: {0}")]
    GraphCycle(String),
    #[error("Operation node already exists: {0}")]
    DuplicateNode(String),
    #[error("Operation node not found: {0}")]
    MissingNode(String),
    #[error("Invalid name for repository: {0}")]
    InvalidName(String),
    #[error("Invalid reference to image: {0}")]
    InvalidReference(String),
    #[error(transparent)]
    InvalidPort(#[from] std::num::ParseIntError),
    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),
    #[error("Not a file, or not exist: {0}")]
    NotAFile(PathBuf),
    #[error("Not a directory, or not exist: {0}")]
    NotADirectory(PathBuf),
    #[error("Path escapes the build context: {0}")]
    OutsideContext(PathBuf),

    //
    // Rootless policy violation
    //
    #[error("Operation violates rootless policy: {0}")]
    PolicyViolation(String),
    #[error("Resource limit out of bounds: {0}")]
    ResourceLimit(String),

    //
    // Cache
    //
    #[error("Corrupted cache metadata for key {0}")]
    CorruptedCacheEntry(String),
    #[error("Timed out waiting for cache lease on {0}")]
    LeaseTimeout(String),

    //
    // Executor
    //
    #[error("Operation failed at line {line}: {message}")]
    OperationFailed { line: usize, message: String },
    #[error("No container runtime found (tried podman, docker)")]
    RuntimeNotFound,
    #[error("Emulation unavailable for platform {0}")]
    EmulationUnavailable(String),
    #[error("Output directory already exists: {0}")]
    OutputAlreadyExists(PathBuf),

    //
    // Integrity
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },
    #[error("Blob {digest} has size {found}, expected {expected}")]
    SizeMismatch {
        digest: String,
        expected: i64,
        found: i64,
    },
    #[error("Float values are not permitted in canonical JSON")]
    FloatInCanonicalJson,

    //
    // Cooperative shutdown
    //
    #[error("Build cancelled")]
    Cancelled,

    //
    // System error
    //
    #[error("No valid home directory path could be retrieved from the operating system")]
    NoValidHomeDirectory,
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidToml(#[from] toml::de::Error),
    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<oci_spec::OciSpecError> for Error {
    fn from(e: oci_spec::OciSpecError) -> Self {
        match e {
            oci_spec::OciSpecError::SerDe(e) => Error::InvalidJson(e),
            oci_spec::OciSpecError::Io(e) => Error::UnknownIo(e),
            oci_spec::OciSpecError::Builder(e) => Error::UnknownIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            )),
            oci_spec::OciSpecError::Other(e) => {
                Error::UnknownIo(std::io::Error::new(std::io::ErrorKind::Other, e))
            }
        }
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::UnknownIo(e.into())
    }
}

impl Error {
    /// True when the error is a per-operation policy rejection rather than an
    /// engine-level abort.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Error::PolicyViolation(_) | Error::ResourceLimit(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
