//! Git clone/fetch over a [`RemoteSession`].
//!
//! Everything runs on the build's checkout host through the session, so the
//! same code serves remote hosts and `local` builds. HTTPS credentials are
//! injected into the clone URL; SSH keys are loaded into a throwaway agent
//! for the duration of one clone.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{CicdError, Result};
use crate::models::freestyle::ScmConfig;
use crate::models::host::GitAuth;
use crate::services::output_stream::OutputSink;
use crate::services::remote_session::{shell_quote, CommandSpec, RemoteSession};

/// Per-command deadline for clone/fetch.
const GIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    pub job_name: &'a str,
    pub build_number: u64,
    pub scm: &'a ScmConfig,
    /// Decrypted credential per repository, same order as `scm.repositories`.
    pub credentials: Vec<Option<GitAuth>>,
    pub workspace_root: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutResult {
    pub workspace: String,
    pub commit: String,
    pub branch: String,
}

/// `<root>/<job>/<build-number>` with the job name made path-safe.
pub fn workspace_path(root: &str, job_name: &str, build_number: u64) -> String {
    let job: String = job_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '-' })
        .collect();
    format!("{}/{}/{}", root.trim_end_matches('/'), job, build_number)
}

/// `*/main`, `refs/heads/main`, `origin/main` and `main` all mean `main`.
pub fn normalize_branch(spec: &str) -> Option<String> {
    let mut b = spec.trim();
    for prefix in ["*/", "refs/heads/", "origin/"] {
        if let Some(rest) = b.strip_prefix(prefix) {
            b = rest;
        }
    }
    if b.is_empty() || b == "*" {
        None
    } else {
        Some(b.to_string())
    }
}

/// Directory name a repository clones into when it is not the first one.
pub fn repo_dir_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let base = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let base = base.strip_suffix(".git").unwrap_or(base);
    if base.is_empty() {
        "repo".to_string()
    } else {
        base.to_string()
    }
}

/// Inject token/password credentials into an HTTP(S) URL.
pub fn authenticated_url(url: &str, auth: Option<&GitAuth>) -> Result<String> {
    let (user, secret) = match auth {
        Some(GitAuth::Token { username, token }) if username.is_empty() => (token.as_str(), None),
        Some(GitAuth::Token { username, token }) => (username.as_str(), Some(token.as_str())),
        Some(GitAuth::Password { username, password }) => (username.as_str(), Some(password.as_str())),
        Some(GitAuth::SshKey { .. }) | None => return Ok(url.to_string()),
    };
    let mut parsed = url::Url::parse(url)
        .map_err(|e| CicdError::Validation(format!("repository url '{url}' is not a URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CicdError::Validation(format!(
            "token/password credentials need an http(s) url, got '{url}'"
        )));
    }
    parsed
        .set_username(user)
        .map_err(|_| CicdError::Validation(format!("cannot set credentials on '{url}'")))?;
    parsed
        .set_password(secret)
        .map_err(|_| CicdError::Validation(format!("cannot set credentials on '{url}'")))?;
    Ok(parsed.to_string())
}

/// Sink that blanks out credentials before forwarding.
struct MaskingSink<'a> {
    inner: &'a dyn OutputSink,
    secrets: Vec<String>,
}

impl MaskingSink<'_> {
    fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for s in &self.secrets {
            out = out.replace(s.as_str(), "****");
        }
        out
    }
}

impl OutputSink for MaskingSink<'_> {
    fn write(&self, chunk: &[u8]) {
        if self.secrets.is_empty() {
            self.inner.write(chunk);
            return;
        }
        let masked = self.mask(&String::from_utf8_lossy(chunk));
        self.inner.write(masked.as_bytes());
    }
}

fn secrets_of(auth: Option<&GitAuth>) -> Vec<String> {
    let raw = match auth {
        Some(GitAuth::Token { token, .. }) => vec![token.clone()],
        Some(GitAuth::Password { password, .. }) => vec![
            password.clone(),
            url::form_urlencoded::byte_serialize(password.as_bytes()).collect(),
        ],
        Some(GitAuth::SshKey { passphrase, .. }) => vec![passphrase.clone()],
        None => vec![],
    };
    raw.into_iter().filter(|s| s.len() >= 4).collect()
}

/// Shell for cloning or refreshing one repository into `dir`.
fn repo_script(url: &str, dir: &str, scm: &ScmConfig, branch: Option<&str>) -> String {
    let q_url = shell_quote(url);
    let q_dir = shell_quote(dir);

    let mut clone = String::from("git clone");
    if let Some(depth) = scm.depth.filter(|d| *d > 0) {
        clone.push_str(&format!(" --depth {depth} --no-single-branch"));
    }
    if scm.submodules {
        clone.push_str(" --recurse-submodules");
    }
    clone.push_str(&format!(" {q_url} {q_dir}"));

    let mut fetch = format!("git -C {q_dir} remote set-url origin {q_url} && git -C {q_dir} fetch --prune origin");
    if let Some(depth) = scm.depth.filter(|d| *d > 0) {
        fetch.push_str(&format!(" --depth {depth}"));
    }

    let mut script = format!(
        "if [ -d {q_dir}/.git ]; then {fetch}; else {clone}; fi",
    );
    match branch {
        Some(b) => {
            let q_branch = shell_quote(b);
            let q_remote = shell_quote(&format!("origin/{b}"));
            script.push_str(&format!(
                " && git -C {q_dir} checkout -B {q_branch} {q_remote}"
            ));
        }
        None => script.push_str(&format!(
            " && (git -C {q_dir} merge --ff-only @{{u}} >/dev/null 2>&1 || true)"
        )),
    }
    if scm.submodules {
        script.push_str(&format!(" && git -C {q_dir} submodule update --init --recursive"));
    }
    script
}

/// Wrap `inner` so it runs with the key loaded into a private ssh-agent.
fn with_ssh_agent(inner: &str, private_key: &str, passphrase: &str) -> String {
    let mut key = private_key.to_string();
    if !key.ends_with('\n') {
        key.push('\n');
    }
    let mut script = String::from(
        "set -e; umask 077; KEYFILE=$(mktemp); ASKFILE=$(mktemp); \
         trap 'rm -f \"$KEYFILE\" \"$ASKFILE\"; [ -n \"$SSH_AGENT_PID\" ] && kill \"$SSH_AGENT_PID\" >/dev/null 2>&1' EXIT; ",
    );
    script.push_str(&format!("printf '%s' {} > \"$KEYFILE\"; ", shell_quote(&key)));
    script.push_str("eval \"$(ssh-agent -s)\" >/dev/null; ");
    if passphrase.is_empty() {
        script.push_str("ssh-add \"$KEYFILE\" </dev/null >/dev/null 2>&1; ");
    } else {
        script.push_str(&format!(
            "printf '#!/bin/sh\\nprintf \"%%s\\\\n\" %s\\n' {} > \"$ASKFILE\"; chmod 700 \"$ASKFILE\"; \
             DISPLAY=:0 SSH_ASKPASS=\"$ASKFILE\" SSH_ASKPASS_REQUIRE=force ssh-add \"$KEYFILE\" </dev/null >/dev/null 2>&1; ",
            shell_quote(&shell_quote(passphrase))
        ));
    }
    script.push_str(
        "export GIT_SSH_COMMAND='ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null'; ",
    );
    script.push_str(inner);
    script
}

/// Clone or refresh every configured repository into the build workspace.
pub async fn checkout(
    session: &dyn RemoteSession,
    req: &CheckoutRequest<'_>,
    sink: &dyn OutputSink,
    cancel: &CancellationToken,
) -> Result<CheckoutResult> {
    if req.scm.repositories.is_empty() {
        return Err(CicdError::Validation(
            "scm config has no repositories".to_string(),
        ));
    }
    let workspace = workspace_path(req.workspace_root, req.job_name, req.build_number);
    let branch = normalize_branch(&req.scm.branch);

    let mut prep = String::new();
    if req.scm.clean_before {
        prep.push_str(&format!("rm -rf {} && ", shell_quote(&workspace)));
    }
    prep.push_str(&format!("mkdir -p {}", shell_quote(&workspace)));
    sink.write(format!("==> Preparing workspace {workspace}\n").as_bytes());
    run_checked(session, &prep, sink, cancel, "workspace setup").await?;

    for (index, repo) in req.scm.repositories.iter().enumerate() {
        let auth = req.credentials.get(index).and_then(Option::as_ref);
        let dir = if index == 0 {
            workspace.clone()
        } else {
            format!("{}/{}", workspace, repo_dir_name(&repo.url))
        };
        let url = authenticated_url(&repo.url, auth)?;
        let inner = repo_script(&url, &dir, req.scm, branch.as_deref());
        let script = match auth {
            Some(GitAuth::SshKey {
                private_key,
                passphrase,
            }) => with_ssh_agent(&inner, private_key, passphrase),
            _ => inner,
        };

        let masked = MaskingSink {
            inner: sink,
            secrets: secrets_of(auth),
        };
        masked.write(format!("==> Checking out {} into {}\n", repo.url, dir).as_bytes());
        tracing::info!(repo = %repo.url, dir = %dir, branch = ?branch, "Checking out repository");
        run_checked(session, &script, &masked, cancel, "git checkout").await?;
    }

    let head = read_back(session, &workspace, "git rev-parse HEAD", cancel).await?;
    let current = read_back(session, &workspace, "git rev-parse --abbrev-ref HEAD", cancel).await?;
    let branch_name = match (current.as_str(), &branch) {
        ("HEAD", Some(b)) => b.clone(),
        _ => current,
    };
    sink.write(format!("==> HEAD {head} ({branch_name})\n").as_bytes());

    Ok(CheckoutResult {
        workspace,
        commit: head,
        branch: branch_name,
    })
}

async fn run_checked(
    session: &dyn RemoteSession,
    script: &str,
    sink: &dyn OutputSink,
    cancel: &CancellationToken,
    what: &str,
) -> Result<()> {
    let spec = CommandSpec::new(script, GIT_TIMEOUT);
    let code = session.run_streaming(&spec, sink, cancel).await?;
    if code != 0 {
        return Err(CicdError::Session(format!("{what} failed with exit code {code}")));
    }
    Ok(())
}

async fn read_back(
    session: &dyn RemoteSession,
    dir: &str,
    command: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut spec = CommandSpec::new(command, Duration::from_secs(30));
    spec.workdir = Some(dir.to_string());
    let out = session.run(&spec, cancel).await?;
    if !out.success() {
        return Err(CicdError::Session(format!(
            "`{command}` failed: {}",
            out.stderr_text()
        )));
    }
    Ok(out.stdout_text())
}
