//! Rootless executor: runs build commands inside a user namespace without a
//! container runtime, via `unshare`.

use super::{capture, run_child, CancelToken, CommonState, ExecResult, Executor, ExecutorConfig};
use crate::{
    error::{Error, Result},
    graph::{Operation, OperationKind},
    instruction::ResourceLimits,
    policy::{self, IdMap},
};
use std::{io::ErrorKind, path::Path, process::Command};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Executor for hosts without a container runtime. Operations run
/// sequentially; each command executes in a fresh user+mount namespace
/// chrooted into the accumulated base tree.
pub struct RootlessExecutor {
    common: CommonState,
    idmap: IdMap,
    limits: ResourceLimits,
}

impl RootlessExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        policy::validate_security_context(&config.security_context)?;
        policy::validate_resource_limits(&config.resource_limits)?;
        let idmap = IdMap::load();
        log::debug!(
            "rootless executor for {}: multiple identities {}",
            config.platform,
            if idmap.supports_multiple_ids() {
                "available"
            } else {
                "unavailable"
            }
        );
        Ok(RootlessExecutor {
            common: CommonState::new(config)?,
            idmap,
            limits: config.resource_limits.clone(),
        })
    }

    pub fn factory(config: &ExecutorConfig) -> Result<Box<dyn Executor>> {
        Ok(Box::new(Self::new(config)?))
    }

    fn cancel(&self) -> &CancelToken {
        &self.common.cancel
    }

    fn exec(&mut self, op: &Operation, _workspace: &Path) -> Result<ExecResult> {
        self.cancel().check()?;
        if !op.user.is_empty()
            && op.user != self.idmap.host_uid.to_string()
            && !self.idmap.supports_multiple_ids()
        {
            return Ok(ExecResult::failed(
                op,
                self.common.env.clone(),
                format!(
                    "user `{}` requires a subordinate id range; none is delegated to this account",
                    op.user
                ),
            ));
        }
        if self.limits.memory.is_some() || self.limits.cpu.is_some() {
            log::debug!("resource limits are advisory in rootless mode");
        }

        let before = capture::snapshot(&self.common.base, &self.common.capture_opts)?;

        let mut command = Command::new("unshare");
        command
            .arg("--map-root-user")
            .arg("--mount")
            .arg("--fork")
            .arg("--pid")
            .arg("chroot")
            .arg(&self.common.base)
            .arg("/bin/sh")
            .arg("-c")
            .arg(shell_script(op, &self.common.workdir));
        command.env_clear();
        command.env("PATH", DEFAULT_PATH).env("HOME", "/root");
        command.envs(&self.common.env);
        command.envs(&op.env);

        let output = match run_child(&mut command, self.cancel()) {
            Ok(output) => output,
            Err(Error::UnknownIo(e)) if e.kind() == ErrorKind::NotFound => {
                return Ok(ExecResult::failed(
                    op,
                    self.common.env.clone(),
                    "unshare: command not found; rootless execution is unavailable".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };
        if !output.status.success() {
            let combined = output.combined();
            return Ok(ExecResult::failed(
                op,
                self.common.env.clone(),
                format!(
                    "command exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    tail(&combined)
                ),
            ));
        }

        let changes = capture::diff(&before, &self.common.base, &self.common.capture_opts)?;
        let mut env = self.common.env.clone();
        env.extend(op.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(ExecResult::succeeded(op, env, changes))
    }
}

impl Executor for RootlessExecutor {
    fn execute(&mut self, op: &Operation, workspace: &Path) -> Result<ExecResult> {
        self.cancel().check()?;
        if let Err(e) = policy::validate_operation(op) {
            if e.is_policy_violation() {
                return Ok(ExecResult::failed(op, self.common.env.clone(), e.to_string()));
            }
            return Err(e);
        }
        match op.kind {
            OperationKind::Source => match self.common.source_common(op)? {
                Some(result) => Ok(result),
                None => Ok(ExecResult::failed(
                    op,
                    self.common.env.clone(),
                    format!(
                        "pulling {} requires a container runtime",
                        op.metadata.get("image").map(String::as_str).unwrap_or("?")
                    ),
                )),
            },
            OperationKind::File => self.common.file(op),
            OperationKind::Meta => Ok(self.common.meta(op)),
            OperationKind::Exec => self.exec(op, workspace),
        }
    }

    fn apply_layer(&mut self, blob: &[u8], compressed: bool) -> Result<()> {
        crate::layer::apply_to_tree(blob, compressed, &self.common.base)
    }

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Single shell script for the chrooted command, honoring the working
/// directory accumulated from the recipe.
fn shell_script(op: &Operation, workdir: &str) -> String {
    let body = match op.command.as_slice() {
        [shell, flag, script] if flag == "-c" && shell.ends_with("sh") => script.clone(),
        argv => argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" "),
    };
    if workdir.is_empty() || workdir == "/" {
        body
    } else {
        format!("cd {} && {}", shell_quote(workdir), body)
    }
}

fn shell_quote(input: &str) -> String {
    if !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        input.to_string()
    } else {
        format!("'{}'", input.replace('\'', r"'\''"))
    }
}

fn tail(output: &str) -> &str {
    const MAX: usize = 4096;
    let trimmed = output.trim_end();
    if trimmed.len() <= MAX {
        return trimmed;
    }
    let mut start = trimmed.len() - MAX;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
