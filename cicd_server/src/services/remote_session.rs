//! Run commands and move files on a target host.
//!
//! [`OpenSshConnector`] drives the system OpenSSH client through
//! `tokio::process`. Password and passphrase auth go through a private
//! askpass helper; host keys are either pinned to a stored SHA-256
//! fingerprint or explicitly not checked. [`LocalSession`] runs the same
//! operations inside the orchestrator process for `local` steps.
//!
//! Every blocking call races a hard deadline and the caller's cancellation
//! token. On either, the process group is SIGKILLed (remotely through a
//! pidfile for SSH sessions).

use std::collections::BTreeMap;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{CicdError, Result};
use crate::services::output_stream::OutputSink;

/// Deadline for connect, keyscan, pidfile kill and file transfers.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

const ASKPASS_ENV: &str = "OPSDECK_ASKPASS_SECRET";

#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Decrypted authentication material for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAuth {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept only a host key whose fingerprint is `SHA256:<base64>`.
    Pinned(String),
    Skip,
}

#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SessionAuth,
    pub host_key: HostKeyPolicy,
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run to completion, capturing stdout/stderr.
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput>;

    /// Run to completion, forwarding output to `sink` as it arrives. Returns
    /// the exit code.
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32>;

    /// Write `bytes` to `path`, creating parent directories.
    async fn push(&self, path: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<()>;

    async fn pull(&self, path: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>>;
}

/// Single-quote for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `cd` + `export` prelude followed by the command, for remote shells.
pub fn remote_script(spec: &CommandSpec) -> String {
    let mut script = String::new();
    for (k, v) in &spec.env {
        if is_env_name(k) {
            script.push_str(&format!("export {}={}; ", k, shell_quote(v)));
        }
    }
    if let Some(dir) = spec.workdir.as_deref().filter(|d| !d.is_empty()) {
        script.push_str(&format!("cd {} && ", shell_quote(dir)));
    }
    script.push_str(&spec.command);
    script
}

enum Finished {
    Done(std::io::Result<CommandOutput>),
    TimedOut,
    Cancelled,
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, sink: Option<&dyn OutputSink>) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(sink) = sink {
                    sink.write(&buf[..n]);
                }
                captured.extend_from_slice(&buf[..n]);
            }
        }
    }
    captured
}

/// Wait for `child` while pumping its output, racing `timeout` and `cancel`.
async fn drive(
    child: &mut Child,
    stdin: Option<Vec<u8>>,
    sink: Option<&dyn OutputSink>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Finished {
    if let Some(data) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = pipe.write_all(&data).await;
                let _ = pipe.shutdown().await;
            });
        }
    } else {
        drop(child.stdin.take());
    }
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let work = async {
        let (out, err, status) = tokio::join!(pump(stdout, sink), pump(stderr, sink), child.wait());
        status.map(|s| CommandOutput {
            stdout: out,
            stderr: err,
            exit_code: s.code().unwrap_or(-1),
        })
    };

    tokio::select! {
        r = work => Finished::Done(r),
        _ = tokio::time::sleep(timeout) => Finished::TimedOut,
        _ = cancel.cancelled() => Finished::Cancelled,
    }
}

fn interrupted(finished: &Finished, timeout: Duration) -> Option<CicdError> {
    match finished {
        Finished::TimedOut => Some(CicdError::Timeout(format!(
            "command timed out after {}s",
            timeout.as_secs()
        ))),
        Finished::Cancelled => Some(CicdError::Cancelled),
        Finished::Done(_) => None,
    }
}

// ── Local ──

/// Runs commands with `sh -c` in its own process group on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalSession {
    /// Base environment applied before each command's own variables.
    pub base_env: BTreeMap<String, String>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .envs(&self.base_env)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = spec.workdir.as_deref().filter(|d| !d.is_empty()) {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn exec(
        &self,
        spec: &CommandSpec,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| CicdError::Session(format!("failed to spawn local shell: {e}")))?;
        let pid = child.id();
        let finished = drive(&mut child, None, sink, spec.timeout, cancel).await;
        if let Some(err) = interrupted(&finished, spec.timeout) {
            kill_group(pid);
            let _ = child.kill().await;
            return Err(err);
        }
        match finished {
            Finished::Done(r) => r.map_err(CicdError::from),
            _ => Err(CicdError::Internal("unreachable process state".to_string())),
        }
    }
}

/// SIGKILL a whole process group led by `pid`.
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: plain syscall on a pgid we created; failure only means the
        // group is already gone.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        self.exec(spec, None, cancel).await
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        Ok(self.exec(spec, Some(sink), cancel).await?.exit_code)
    }

    async fn push(&self, path: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CicdError::Cancelled);
        }
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn pull(&self, path: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(CicdError::Cancelled);
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| CicdError::Session(format!("cannot read {path}: {e}")))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ── OpenSSH ──

#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    pub ssh_bin: String,
    pub keyscan_bin: String,
    pub connect_timeout: Duration,
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self {
            ssh_bin: "ssh".to_string(),
            keyscan_bin: "ssh-keyscan".to_string(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// `SHA256:<base64 no pad>` of a base64 host-key blob, as `ssh-keygen -l` prints.
pub fn fingerprint_of(key_blob_b64: &str) -> Option<String> {
    let blob = BASE64.decode(key_blob_b64.trim()).ok()?;
    Some(format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&blob))))
}

/// Keep only `ssh-keyscan` lines whose key matches `fingerprint`.
pub fn pinned_known_hosts(keyscan_output: &str, fingerprint: &str) -> Vec<String> {
    let wanted = fingerprint.trim().trim_end_matches('=');
    keyscan_output
        .lines()
        .filter(|l| !l.starts_with('#'))
        .filter(|l| {
            l.split_whitespace()
                .nth(2)
                .and_then(fingerprint_of)
                .is_some_and(|fp| fp == wanted)
        })
        .map(String::from)
        .collect()
}

impl OpenSshConnector {
    async fn keyscan(&self, target: &SessionTarget) -> Result<String> {
        let output = tokio::time::timeout(
            CONTROL_TIMEOUT,
            Command::new(&self.keyscan_bin)
                .args(["-p", &target.port.to_string(), "-T", "10", &target.host])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CicdError::Session(format!("host key scan of {} timed out", target.host)))?
        .map_err(|e| CicdError::Session(format!("failed to run {}: {e}", self.keyscan_bin)))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SessionConnector for OpenSshConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        let dir = std::env::temp_dir().join(format!("opsdeck-ssh-{}", uuid::Uuid::new_v4()));
        std::fs::DirBuilder::new().mode(0o700).create(&dir)?;

        let session = match self.prepare(target, &dir).await {
            Ok(s) => s,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        // Prove the credentials work before handing the session out.
        let probe = CommandSpec::new("true", self.connect_timeout);
        let out = session.run(&probe, &CancellationToken::new()).await;
        match out {
            Ok(o) if o.success() => {
                tracing::debug!(host = %target.host, port = target.port, "SSH session established");
                Ok(Box::new(session))
            }
            Ok(o) => {
                let _ = session.close().await;
                Err(CicdError::Session(format!(
                    "ssh to {}@{}:{} failed: {}",
                    target.username,
                    target.host,
                    target.port,
                    o.stderr_text()
                )))
            }
            Err(e) => {
                let _ = session.close().await;
                Err(CicdError::Session(format!(
                    "ssh to {}:{} failed: {e}",
                    target.host, target.port
                )))
            }
        }
    }
}

impl OpenSshConnector {
    async fn prepare(&self, target: &SessionTarget, dir: &Path) -> Result<SshSession> {
        let mut args: Vec<String> = vec![
            "-p".into(),
            target.port.to_string(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".into(),
            "ServerAliveInterval=30".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            "NumberOfPasswordPrompts=1".into(),
        ];

        match &target.host_key {
            HostKeyPolicy::Skip => {
                args.extend([
                    "-o".into(),
                    "StrictHostKeyChecking=no".into(),
                    "-o".into(),
                    "UserKnownHostsFile=/dev/null".into(),
                ]);
            }
            HostKeyPolicy::Pinned(fingerprint) => {
                let scanned = self.keyscan(target).await?;
                let lines = pinned_known_hosts(&scanned, fingerprint);
                if lines.is_empty() {
                    return Err(CicdError::Session(format!(
                        "host key of {} does not match pinned fingerprint {}",
                        target.host, fingerprint
                    )));
                }
                let known_hosts = dir.join("known_hosts");
                std::fs::write(&known_hosts, lines.join("\n") + "\n")?;
                args.extend([
                    "-o".into(),
                    "StrictHostKeyChecking=yes".into(),
                    "-o".into(),
                    format!("UserKnownHostsFile={}", known_hosts.display()),
                ]);
            }
        }

        let secret = match &target.auth {
            SessionAuth::Password(password) => {
                args.extend([
                    "-o".into(),
                    "PubkeyAuthentication=no".into(),
                    "-o".into(),
                    "PreferredAuthentications=password,keyboard-interactive".into(),
                ]);
                Some(password.clone())
            }
            SessionAuth::PrivateKey { key, passphrase } => {
                let key_path = dir.join("id");
                let mut material = key.clone();
                if !material.ends_with('\n') {
                    material.push('\n');
                }
                std::fs::write(&key_path, material)?;
                std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
                args.extend([
                    "-i".into(),
                    key_path.display().to_string(),
                    "-o".into(),
                    "IdentitiesOnly=yes".into(),
                    "-o".into(),
                    "PasswordAuthentication=no".into(),
                ]);
                passphrase.clone().filter(|p| !p.is_empty())
            }
        };

        let askpass = match &secret {
            Some(_) => {
                let path = dir.join("askpass");
                std::fs::write(&path, format!("#!/bin/sh\nprintf '%s\\n' \"${ASKPASS_ENV}\"\n"))?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
                Some(path)
            }
            None => {
                args.extend(["-o".into(), "BatchMode=yes".into()]);
                None
            }
        };

        args.push(format!("{}@{}", target.username, target.host));

        Ok(SshSession {
            ssh_bin: self.ssh_bin.clone(),
            args,
            askpass,
            secret,
            dir: dir.to_path_buf(),
        })
    }
}

/// One authenticated target. Each operation is its own `ssh` invocation
/// sharing the same options and credentials.
pub struct SshSession {
    ssh_bin: String,
    args: Vec<String>,
    askpass: Option<PathBuf>,
    secret: Option<String>,
    dir: PathBuf,
}

impl SshSession {
    fn command(&self, remote: &str, with_stdin: bool) -> Command {
        let mut cmd = Command::new(&self.ssh_bin);
        cmd.args(&self.args)
            .arg("--")
            .arg(remote)
            .stdin(if with_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let (Some(askpass), Some(secret)) = (&self.askpass, &self.secret) {
            cmd.env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into()))
                .env(ASKPASS_ENV, secret);
        }
        cmd
    }

    /// Run `remote` under a pidfile so a timeout or cancel can kill it.
    async fn exec(
        &self,
        remote: &str,
        stdin: Option<Vec<u8>>,
        sink: Option<&dyn OutputSink>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let pidfile = format!("/tmp/.opsdeck-{}.pid", uuid::Uuid::new_v4().simple());
        // sshd runs the command as a session leader, so $$ is also the pgid.
        let wrapped = format!(
            "echo $$ > {pf}; trap 'rm -f {pf}' EXIT; sh -c {inner}",
            pf = pidfile,
            inner = shell_quote(remote)
        );
        let mut child = self
            .command(&wrapped, stdin.is_some())
            .spawn()
            .map_err(|e| CicdError::Session(format!("failed to spawn {}: {e}", self.ssh_bin)))?;

        let finished = drive(&mut child, stdin, sink, timeout, cancel).await;
        if let Some(err) = interrupted(&finished, timeout) {
            self.kill_remote(&pidfile).await;
            let _ = child.kill().await;
            return Err(err);
        }
        match finished {
            Finished::Done(Ok(out)) if out.exit_code == 255 => Err(CicdError::Session(format!(
                "ssh connection failed: {}",
                out.stderr_text()
            ))),
            Finished::Done(r) => r.map_err(CicdError::from),
            _ => Err(CicdError::Internal("unreachable process state".to_string())),
        }
    }

    async fn kill_remote(&self, pidfile: &str) {
        let script = format!(
            "p=$(cat {pf} 2>/dev/null) && [ -n \"$p\" ] && (kill -KILL -- -\"$p\" 2>/dev/null || kill -KILL \"$p\"); rm -f {pf}",
            pf = pidfile
        );
        let mut child = match self.command(&script, false).spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to spawn remote kill: {e}");
                return;
            }
        };
        match tokio::time::timeout(CONTROL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::debug!(pidfile, "Remote process killed");
            }
            _ => tracing::warn!(pidfile, "Remote kill did not confirm"),
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        self.exec(&remote_script(spec), None, None, spec.timeout, cancel).await
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let out = self
            .exec(&remote_script(spec), None, Some(sink), spec.timeout, cancel)
            .await?;
        Ok(out.exit_code)
    }

    async fn push(&self, path: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<()> {
        let quoted = shell_quote(path);
        let remote = format!("mkdir -p \"$(dirname {quoted})\" && cat > {quoted}");
        let out = self
            .exec(&remote, Some(bytes.to_vec()), None, CONTROL_TIMEOUT.max(transfer_budget(bytes.len())), cancel)
            .await?;
        if !out.success() {
            return Err(CicdError::Session(format!(
                "upload to {path} failed: {}",
                out.stderr_text()
            )));
        }
        Ok(())
    }

    async fn pull(&self, path: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let remote = format!("cat {}", shell_quote(path));
        let out = self
            .exec(&remote, None, None, CONTROL_TIMEOUT * 10, cancel)
            .await?;
        if !out.success() {
            return Err(CicdError::Session(format!(
                "download of {path} failed: {}",
                out.stderr_text()
            )));
        }
        Ok(out.stdout)
    }

    async fn close(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// One second per MiB on top of the control deadline.
fn transfer_budget(len: usize) -> Duration {
    CONTROL_TIMEOUT + Duration::from_secs((len / (1024 * 1024)) as u64)
}
