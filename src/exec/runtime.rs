//! Container-runtime executor: delegates pulls and command execution to
//! podman or docker while keeping the filesystem I/O boundary in-process.

use super::{capture, run_child, CommonState, ExecResult, Executor, ExecutorConfig};
use crate::{
    error::{Error, Result},
    graph::{Operation, OperationKind},
    instruction::{ResourceLimits, SecurityContext},
    policy,
};
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

/// Image installing qemu binfmt handlers for cross-platform emulation.
const BINFMT_IMAGE: &str = "docker.io/tonistiigi/binfmt";
/// Where the workspace volume appears inside build containers.
const BUILD_ROOT: &str = "/build-root";
const DEFAULT_BUILD_UID: u32 = 1000;

/// Locate a usable container runtime binary on PATH, podman preferred.
pub fn detect_runtime() -> Option<PathBuf> {
    ["podman", "docker"].iter().find_map(|bin| find_in_path(bin))
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(bin))
            .find(|candidate| candidate.is_file())
    })
}

/// Removes the disposable container on every exit path.
struct Disposable {
    runtime: PathBuf,
    id: String,
}

impl Drop for Disposable {
    fn drop(&mut self) {
        let result = Command::new(&self.runtime)
            .args(["rm", "-f", self.id.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            log::warn!("failed to remove container {}: {}", self.id, e);
        }
    }
}

pub struct RuntimeExecutor {
    common: CommonState,
    runtime: PathBuf,
    security: SecurityContext,
    limits: ResourceLimits,
    /// Image the current stage was pulled from; commands run inside it
    run_image: Option<String>,
    emulation_ready: bool,
}

impl RuntimeExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        policy::validate_security_context(&config.security_context)?;
        policy::validate_resource_limits(&config.resource_limits)?;
        let runtime = detect_runtime().ok_or(Error::RuntimeNotFound)?;
        log::debug!("using container runtime {}", runtime.display());
        Ok(RuntimeExecutor {
            common: CommonState::new(config)?,
            runtime,
            security: config.security_context.clone(),
            limits: config.resource_limits.clone(),
            run_image: None,
            emulation_ready: false,
        })
    }

    pub fn factory(config: &ExecutorConfig) -> Result<Box<dyn Executor>> {
        Ok(Box::new(Self::new(config)?))
    }

    /// Register qemu handlers through the binfmt helper image. Failure is an
    /// explicit error rather than a silent fallthrough to the host platform.
    fn ensure_emulation(&mut self) -> Result<()> {
        if self.emulation_ready || self.common.platform == crate::Platform::host() {
            return Ok(());
        }
        let mut command = Command::new(&self.runtime);
        command.args(["run", "--rm", "--privileged", BINFMT_IMAGE, "--install"]);
        command.arg(&self.common.platform.architecture);
        let output = run_child(&mut command, &self.common.cancel)?;
        if !output.status.success() {
            log::error!("binfmt install failed: {}", output.combined().trim_end());
            return Err(Error::EmulationUnavailable(
                self.common.platform.to_string(),
            ));
        }
        self.emulation_ready = true;
        Ok(())
    }

    fn source(&mut self, op: &Operation) -> Result<ExecResult> {
        if let Some(result) = self.common.source_common(op)? {
            return Ok(result);
        }
        let image = op
            .metadata
            .get("image")
            .cloned()
            .unwrap_or_default();
        self.ensure_emulation()?;

        let platform = self.common.platform.to_string();
        let mut pull = Command::new(&self.runtime);
        pull.arg("pull").arg("--platform").arg(&platform).arg(&image);
        let output = run_child(&mut pull, &self.common.cancel)?;
        if !output.status.success() {
            return Ok(ExecResult::failed(
                op,
                self.common.env.clone(),
                format!("failed to pull {image}: {}", output.combined().trim_end()),
            ));
        }

        let mut create = Command::new(&self.runtime);
        create
            .arg("create")
            .arg("--platform")
            .arg(&platform)
            .arg(&image);
        let output = run_child(&mut create, &self.common.cancel)?;
        if !output.status.success() {
            return Ok(ExecResult::failed(
                op,
                self.common.env.clone(),
                format!(
                    "failed to create container from {image}: {}",
                    output.combined().trim_end()
                ),
            ));
        }
        let container = Disposable {
            runtime: self.runtime.clone(),
            id: output.stdout.trim().to_string(),
        };

        let base = self.common.base.clone();
        self.export_rootfs(&container.id, &base)?;
        drop(container);
        self.run_image = Some(image);
        let changes = self.common.base_changes()?;
        Ok(ExecResult::succeeded(op, self.common.env.clone(), changes))
    }

    /// `runtime export | tar -x` pipeline. The export's stdout handle moves
    /// into tar's stdin, so its write end closes as soon as export exits and
    /// the reader cannot deadlock.
    fn export_rootfs(&self, container: &str, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        let mut export = Command::new(&self.runtime)
            .args(["export", container])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stream = export.stdout.take().expect("stdout is piped");

        let mut extract = Command::new("tar");
        extract
            .arg("-x")
            .arg("--no-same-owner")
            .arg("-C")
            .arg(dest);
        extract.stdin(Stdio::from(stream));
        let mut extract = extract
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let tar_status = extract.wait()?;
        let export_status = export.wait()?;
        if !export_status.success() {
            return Err(Error::UnknownIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("container export failed for {container}"),
            )));
        }
        if !tar_status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = extract.stderr.take() {
                use std::io::Read;
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(Error::UnknownIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("rootfs extraction failed: {}", stderr.trim_end()),
            )));
        }
        Ok(())
    }

    fn exec(&mut self, op: &Operation, workspace: &Path) -> Result<ExecResult> {
        self.common.cancel.check()?;
        let Some(image) = self.run_image.clone() else {
            return Ok(ExecResult::failed(
                op,
                self.common.env.clone(),
                "commands cannot run on a scratch base".to_string(),
            ));
        };

        // Work on a disposable copy of the base; the delta is merged back
        // only after the command succeeds.
        let rootfs = workspace.join("rootfs");
        capture::copy_tree(&self.common.base, &rootfs)?;
        let before = capture::snapshot(&rootfs, &self.common.capture_opts)?;

        let platform = self.common.platform.to_string();
        let name = format!("build-{}", uuid::Uuid::new_v4().simple());
        let mut run = Command::new(&self.runtime);
        run.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("--platform")
            .arg(&platform);
        run.arg("-v")
            .arg(format!("{}:{}:rw", rootfs.display(), BUILD_ROOT));
        run.args(["--cap-drop", "ALL"]);
        for capability in &self.security.capabilities {
            run.arg("--cap-add").arg(capability);
        }
        run.args(["--security-opt", "no-new-privileges"]);
        run.args(["--read-only", "--tmpfs", "/tmp:rw,size=64m"]);
        if let Some(memory) = &self.limits.memory {
            run.arg("--memory")
                .arg(policy::parse_byte_size(memory)?.to_string());
        }
        if let Some(cpu) = &self.limits.cpu {
            let millis = policy::parse_cpu_millis(cpu)?;
            run.arg("--cpus")
                .arg(format!("{}.{:03}", millis / 1000, millis % 1000));
        }
        let workdir = Path::new(BUILD_ROOT).join(self.common.workdir.trim_start_matches('/'));
        run.arg("-w").arg(&workdir);
        let uid = self.security.run_as_user.unwrap_or(DEFAULT_BUILD_UID);
        let gid = self.security.run_as_group.unwrap_or(uid);
        run.arg("-u").arg(format!("{uid}:{gid}"));
        for (key, value) in self.common.env.iter().chain(op.env.iter()) {
            run.arg("-e").arg(format!("{key}={value}"));
        }
        run.arg(&image);
        run.args(&op.command);

        let output = run_child(&mut run, &self.common.cancel)?;
        if !output.status.success() {
            return Ok(ExecResult::failed(
                op,
                self.common.env.clone(),
                format!(
                    "command exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    output.combined().trim_end()
                ),
            ));
        }

        let changes = capture::diff(&before, &rootfs, &self.common.capture_opts)?;
        // The mutated copy becomes the new base.
        fs::remove_dir_all(&self.common.base)?;
        if fs::rename(&rootfs, &self.common.base).is_err() {
            capture::copy_tree(&rootfs, &self.common.base)?;
        }
        let mut env = self.common.env.clone();
        env.extend(op.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(ExecResult::succeeded(op, env, changes))
    }
}

impl Executor for RuntimeExecutor {
    fn execute(&mut self, op: &Operation, workspace: &Path) -> Result<ExecResult> {
        self.common.cancel.check()?;
        if let Err(e) = policy::validate_operation(op) {
            if e.is_policy_violation() {
                return Ok(ExecResult::failed(op, self.common.env.clone(), e.to_string()));
            }
            return Err(e);
        }
        match op.kind {
            OperationKind::Source => self.source(op),
            OperationKind::File => self.common.file(op),
            OperationKind::Meta => Ok(self.common.meta(op)),
            OperationKind::Exec => self.exec(op, workspace),
        }
    }

    fn apply_layer(&mut self, blob: &[u8], compressed: bool) -> Result<()> {
        crate::layer::apply_to_tree(blob, compressed, &self.common.base)
    }

    fn cleanup(&mut self) -> Result<()> {
        self.run_image = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup_misses_nonexistent_binary() {
        assert!(find_in_path("definitely-not-a-real-binary-name").is_none());
    }
}
