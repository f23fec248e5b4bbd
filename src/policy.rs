//! Rootless build policy: permission filtering, command and capability
//! validation, and user-namespace identity mapping.

use crate::{
    error::{Error, Result},
    graph::{Operation, OperationKind},
    instruction::{ResourceLimits, SecurityContext},
};
use std::{fs, path::Path};

/// Commands whose basename must never run inside a build step.
pub const DENIED_COMMANDS: &[&str] = &[
    "sudo",
    "su",
    "mount",
    "umount",
    "chroot",
    "setuid",
    "setgid",
    "iptables",
    "ip6tables",
    "modprobe",
    "insmod",
    "rmmod",
];

/// Capabilities that imply privileged access and are always refused.
pub const PRIVILEGED_CAPABILITIES: &[&str] = &[
    "SYS_ADMIN",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_PTRACE",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "SETUID",
    "SETGID",
    "NET_ADMIN",
    "NET_RAW",
];

const MAX_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;
const MAX_DISK_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// Normalize the mode bits of a file entering a layer.
///
/// Setuid and setgid are stripped, the owner keeps at least read+write, and
/// group/other lose their write bits. Applied to every captured file
/// regardless of its source mode.
pub fn normalize_mode(mode: u32) -> u32 {
    let mut mode = mode & !0o6000;
    mode |= 0o600;
    mode &= !0o022;
    mode
}

/// Validate an operation before execution. Covers the forbidden command,
/// user, and environment combinations.
pub fn validate_operation(op: &Operation) -> Result<()> {
    if op.kind == OperationKind::Meta {
        return Ok(());
    }
    if op.user == "root" || op.user == "0" {
        return Err(Error::PolicyViolation(format!(
            "operations must not run as root (user = {})",
            op.user
        )));
    }
    for (key, value) in &op.env {
        if value.contains("/proc") || value.contains("/sys") {
            return Err(Error::PolicyViolation(format!(
                "environment variable {key} references a host pseudo-filesystem"
            )));
        }
    }
    if op.kind == OperationKind::Exec {
        let program = exec_program(&op.command);
        if let Some(program) = program {
            let basename = Path::new(&program)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(program);
            if DENIED_COMMANDS.contains(&basename.as_str()) {
                return Err(Error::PolicyViolation(format!(
                    "command `{basename}` is denied"
                )));
            }
        }
    }
    Ok(())
}

/// First program named by an exec command, looking through the `sh -c`
/// wrapper the frontend emits for shell-form RUN.
fn exec_program(command: &[String]) -> Option<String> {
    match command {
        [shell, flag, script, ..] if flag == "-c" && shell.ends_with("sh") => {
            script.split_whitespace().next().map(str::to_string)
        }
        [program, ..] => Some(program.clone()),
        [] => None,
    }
}

/// Validate a security context at executor construction time.
pub fn validate_security_context(ctx: &SecurityContext) -> Result<()> {
    if ctx.run_as_user == Some(0) {
        return Err(Error::PolicyViolation(
            "security context requests uid 0".to_string(),
        ));
    }
    for capability in &ctx.capabilities {
        let capability = capability
            .strip_prefix("CAP_")
            .unwrap_or(capability)
            .to_ascii_uppercase();
        if PRIVILEGED_CAPABILITIES.contains(&capability.as_str()) {
            return Err(Error::PolicyViolation(format!(
                "privileged capability {capability} is denied"
            )));
        }
    }
    Ok(())
}

/// Validate resource limits at executor construction time.
pub fn validate_resource_limits(limits: &ResourceLimits) -> Result<()> {
    if let Some(memory) = &limits.memory {
        let bytes = parse_byte_size(memory)?;
        if bytes > MAX_MEMORY_BYTES {
            return Err(Error::ResourceLimit(format!(
                "memory limit {memory} exceeds 8Gi"
            )));
        }
    }
    if let Some(disk) = &limits.disk {
        let bytes = parse_byte_size(disk)?;
        if bytes > MAX_DISK_BYTES {
            return Err(Error::ResourceLimit(format!(
                "disk limit {disk} exceeds 50Gi"
            )));
        }
    }
    if let Some(cpu) = &limits.cpu {
        parse_cpu_millis(cpu)?;
    }
    Ok(())
}

/// Parse `512Mi` / `2Gi` / `1024Ki` / plain byte counts.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let input = input.trim();
    let (number, multiplier) = if let Some(n) = input.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = input.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = input.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else {
        (input, 1)
    };
    let number: u64 = number
        .parse()
        .map_err(|_| Error::ResourceLimit(format!("unparsable size: {input}")))?;
    Ok(number * multiplier)
}

/// Parse a CPU limit into millicores: `2` -> 2000, `1.5` -> 1500, `500m` -> 500.
pub fn parse_cpu_millis(input: &str) -> Result<u64> {
    let input = input.trim();
    if let Some(millis) = input.strip_suffix('m') {
        return millis
            .parse()
            .map_err(|_| Error::ResourceLimit(format!("unparsable cpu limit: {input}")));
    }
    match input.split_once('.') {
        None => input
            .parse::<u64>()
            .map(|cores| cores * 1000)
            .map_err(|_| Error::ResourceLimit(format!("unparsable cpu limit: {input}"))),
        Some((whole, frac)) => {
            let whole: u64 = whole
                .parse()
                .map_err(|_| Error::ResourceLimit(format!("unparsable cpu limit: {input}")))?;
            let frac = format!("{frac:0<3}");
            let frac: u64 = frac[..3]
                .parse()
                .map_err(|_| Error::ResourceLimit(format!("unparsable cpu limit: {input}")))?;
            Ok(whole * 1000 + frac)
        }
    }
}

/// A uid/gid range delegated to the current user through the subordinate id
/// tables, or the single-identity fallback when no usable range exists.
#[derive(Debug, Clone)]
pub struct IdMap {
    pub host_uid: u32,
    pub host_gid: u32,
    pub sub_uid: Option<IdRange>,
    pub sub_gid: Option<IdRange>,
}

#[derive(Debug, Clone, Copy)]
pub struct IdRange {
    pub start: u32,
    pub count: u32,
}

/// Ranges shorter than a full 16-bit id space cannot represent a standard
/// container identity set.
const MIN_SUBID_COUNT: u32 = 65536;

impl IdMap {
    /// Read `/etc/subuid` and `/etc/subgid` for the current user.
    pub fn load() -> Self {
        let host_uid = rustix::process::getuid().as_raw();
        let host_gid = rustix::process::getgid().as_raw();
        let user = std::env::var("USER").unwrap_or_else(|_| host_uid.to_string());
        let sub_uid = read_subid_table(Path::new("/etc/subuid"), &user, host_uid);
        let sub_gid = read_subid_table(Path::new("/etc/subgid"), &user, host_uid);
        if sub_uid.is_none() || sub_gid.is_none() {
            log::warn!(
                "no usable subordinate id range for {user}; falling back to single-identity mapping"
            );
        }
        IdMap {
            host_uid,
            host_gid,
            sub_uid,
            sub_gid,
        }
    }

    pub fn single(host_uid: u32, host_gid: u32) -> Self {
        IdMap {
            host_uid,
            host_gid,
            sub_uid: None,
            sub_gid: None,
        }
    }

    /// Whether more than one identity can exist inside the container.
    pub fn supports_multiple_ids(&self) -> bool {
        self.sub_uid.is_some() && self.sub_gid.is_some()
    }

    /// Host uid owning container uid `id`: container root maps to the current
    /// user, everything else maps into the subordinate range.
    pub fn map_uid(&self, id: u32) -> u32 {
        match (id, self.sub_uid) {
            (0, _) | (_, None) => self.host_uid,
            (id, Some(range)) => range.start + (id - 1).min(range.count - 1),
        }
    }

    pub fn map_gid(&self, id: u32) -> u32 {
        match (id, self.sub_gid) {
            (0, _) | (_, None) => self.host_gid,
            (id, Some(range)) => range.start + (id - 1).min(range.count - 1),
        }
    }
}

fn read_subid_table(path: &Path, user: &str, uid: u32) -> Option<IdRange> {
    let text = fs::read_to_string(path).ok()?;
    let uid_name = uid.to_string();
    for line in text.lines() {
        let mut fields = line.trim().split(':');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(start), Some(count)) if name == user || name == uid_name => {
                let start: u32 = start.parse().ok()?;
                let count: u32 = count.parse().ok()?;
                if count >= MIN_SUBID_COUNT {
                    return Some(IdRange { start, count });
                }
            }
            _ => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Platform;
    use std::collections::BTreeMap;

    fn exec_op(command: &[&str]) -> Operation {
        Operation {
            kind: OperationKind::Exec,
            command: command.iter().map(|s| s.to_string()).collect(),
            inputs: vec![],
            outputs: vec!["layer-0".to_string()],
            env: BTreeMap::new(),
            metadata: BTreeMap::new(),
            workdir: "/".to_string(),
            user: String::new(),
            platform: Platform::new("linux", "amd64"),
        }
    }

    #[test]
    fn mode_normalization() {
        // setuid and setgid stripped
        assert_eq!(normalize_mode(0o4755), 0o755);
        assert_eq!(normalize_mode(0o2644), 0o644);
        // owner gains read+write
        assert_eq!(normalize_mode(0o400), 0o600);
        assert_eq!(normalize_mode(0o000), 0o600);
        // group/other write stripped, read/execute kept
        assert_eq!(normalize_mode(0o777), 0o755);
        assert_eq!(normalize_mode(0o666), 0o644);
    }

    #[test]
    fn denied_commands() {
        assert!(validate_operation(&exec_op(&["sudo", "true"])).is_err());
        assert!(validate_operation(&exec_op(&["/usr/bin/mount", "/dev/sda1"])).is_err());
        assert!(validate_operation(&exec_op(&["/bin/sh", "-c", "sudo true"])).is_err());
        assert!(validate_operation(&exec_op(&["/bin/sh", "-c", "echo ok"])).is_ok());
        assert!(validate_operation(&exec_op(&["make", "install"])).is_ok());
    }

    #[test]
    fn root_user_rejected() {
        let mut op = exec_op(&["true"]);
        op.user = "root".to_string();
        assert!(validate_operation(&op).is_err());
        op.user = "0".to_string();
        assert!(validate_operation(&op).is_err());
        op.user = "builder".to_string();
        assert!(validate_operation(&op).is_ok());
    }

    #[test]
    fn pseudo_fs_env_rejected() {
        let mut op = exec_op(&["true"]);
        op.env
            .insert("TRACE".to_string(), "/proc/self/status".to_string());
        assert!(validate_operation(&op).is_err());
    }

    #[test]
    fn capability_filtering() {
        let allowed = SecurityContext {
            capabilities: vec!["NET_BIND_SERVICE".to_string(), "CHOWN".to_string()],
            ..Default::default()
        };
        assert!(validate_security_context(&allowed).is_ok());

        let denied = SecurityContext {
            capabilities: vec!["CAP_SYS_ADMIN".to_string()],
            ..Default::default()
        };
        assert!(validate_security_context(&denied).is_err());
    }

    #[test]
    fn limit_bounds() {
        let ok = ResourceLimits {
            memory: Some("512Mi".to_string()),
            cpu: Some("1500m".to_string()),
            disk: Some("10Gi".to_string()),
        };
        assert!(validate_resource_limits(&ok).is_ok());

        let too_big = ResourceLimits {
            memory: Some("16Gi".to_string()),
            ..Default::default()
        };
        assert!(validate_resource_limits(&too_big).is_err());
    }

    #[test]
    fn cpu_parsing() -> Result<()> {
        assert_eq!(parse_cpu_millis("2")?, 2000);
        assert_eq!(parse_cpu_millis("1.5")?, 1500);
        assert_eq!(parse_cpu_millis("500m")?, 500);
        assert_eq!(parse_cpu_millis("0.25")?, 250);
        assert!(parse_cpu_millis("fast").is_err());
        Ok(())
    }

    #[test]
    fn single_identity_map() {
        let map = IdMap::single(1000, 1000);
        assert!(!map.supports_multiple_ids());
        assert_eq!(map.map_uid(0), 1000);
        assert_eq!(map.map_uid(42), 1000);
    }
}
