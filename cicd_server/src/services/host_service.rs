//! SSH hosts and Git credentials, encrypted at rest by the vault.
//!
//! Reads for display go through the `*View` projections. Decrypted material
//! only leaves this service as a [`SessionTarget`] or [`GitAuth`] handed
//! straight to a connector or a checkout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{CicdError, Result};
use crate::models::host::{
    ConnectionTestStatus, GitAuth, GitAuthKind, GitCredential, GitCredentialView, SshAuthMethod,
    SshHost, SshHostView,
};
use crate::services::remote_session::{
    CommandSpec, HostKeyPolicy, RemoteSession, SessionAuth, SessionConnector, SessionTarget,
};
use crate::services::vault::CredentialVault;
use crate::storage::{Bucket, KvStore, KvStoreExt};

fn default_port() -> u16 {
    22
}

/// Create/update payload for an SSH host. `None` secrets keep the stored value.
#[derive(Debug, Clone, Deserialize)]
pub struct SshHostInput {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: SshAuthMethod,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub skip_host_key_check: bool,
}

impl SshHostInput {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("host", &self.host),
            ("username", &self.username),
        ] {
            if value.trim().is_empty() {
                return Err(CicdError::Validation(format!("{field} is required")));
            }
        }
        if self.port == 0 {
            return Err(CicdError::Validation("port must be non-zero".to_string()));
        }
        match self.host_key_fingerprint.as_deref().map(str::trim) {
            Some(fp) if !fp.is_empty() && !fp.starts_with("SHA256:") => {
                return Err(CicdError::Validation(
                    "host_key_fingerprint must look like SHA256:<base64>".to_string(),
                ));
            }
            Some(fp) if !fp.is_empty() => {}
            _ if self.skip_host_key_check => {}
            _ => {
                return Err(CicdError::Validation(
                    "host_key_fingerprint is required unless skip_host_key_check is set"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitCredentialInput {
    pub name: String,
    pub kind: GitAuthKind,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

pub struct HostService {
    store: Arc<dyn KvStore>,
    vault: Arc<CredentialVault>,
    connector: Arc<dyn SessionConnector>,
}

impl HostService {
    pub fn new(
        store: Arc<dyn KvStore>,
        vault: Arc<CredentialVault>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        Self {
            store,
            vault,
            connector,
        }
    }

    // ── SSH hosts ──

    pub async fn create_host(&self, input: SshHostInput) -> Result<SshHostView> {
        input.validate()?;
        let now = Utc::now();
        let mut host = SshHost {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            host: input.host.trim().to_string(),
            port: input.port,
            username: input.username.trim().to_string(),
            auth_method: input.auth_method,
            password: String::new(),
            private_key: String::new(),
            passphrase: String::new(),
            host_key_fingerprint: input
                .host_key_fingerprint
                .as_ref()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
            skip_host_key_check: input.skip_host_key_check,
            last_test_status: None,
            last_test_at: None,
            last_test_error: None,
            created_at: now,
            updated_at: now,
        };
        self.seal_host_secrets(&mut host, &input)?;
        require_host_secret(&host)?;

        self.store.put_json(Bucket::SshHosts, &host.id, &host).await?;
        tracing::info!(host_id = %host.id, name = %host.name, "SSH host created");
        Ok(SshHostView::from(&host))
    }

    pub async fn update_host(&self, id: &str, input: SshHostInput) -> Result<SshHostView> {
        input.validate()?;
        let mut host = self.load_host(id).await?;
        host.name = input.name.trim().to_string();
        host.host = input.host.trim().to_string();
        host.port = input.port;
        host.username = input.username.trim().to_string();
        host.auth_method = input.auth_method;
        host.host_key_fingerprint = input
            .host_key_fingerprint
            .clone()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        host.skip_host_key_check = input.skip_host_key_check;
        self.seal_host_secrets(&mut host, &input)?;
        require_host_secret(&host)?;
        host.updated_at = Utc::now();

        self.store.put_json(Bucket::SshHosts, &host.id, &host).await?;
        Ok(SshHostView::from(&host))
    }

    fn seal_host_secrets(&self, host: &mut SshHost, input: &SshHostInput) -> Result<()> {
        host.password = self.vault.reseal(&host.password, input.password.as_deref())?;
        host.private_key = self
            .vault
            .reseal(&host.private_key, input.private_key.as_deref())?;
        host.passphrase = self
            .vault
            .reseal(&host.passphrase, input.passphrase.as_deref())?;
        Ok(())
    }

    pub async fn delete_host(&self, id: &str) -> Result<()> {
        self.load_host(id).await?;
        self.store.delete(Bucket::SshHosts, id).await?;
        tracing::info!(host_id = %id, "SSH host deleted");
        Ok(())
    }

    pub async fn get_host(&self, id: &str) -> Result<SshHostView> {
        Ok(SshHostView::from(&self.load_host(id).await?))
    }

    pub async fn list_hosts(&self) -> Result<Vec<SshHostView>> {
        let mut hosts: Vec<SshHost> = self.store.list_json(Bucket::SshHosts).await?;
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts.iter().map(SshHostView::from).collect())
    }

    async fn load_host(&self, id: &str) -> Result<SshHost> {
        self.store
            .get_json(Bucket::SshHosts, id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("ssh host {id}")))
    }

    /// Decrypted connection target for a stored host.
    pub async fn session_target(&self, id: &str) -> Result<SessionTarget> {
        let host = self.load_host(id).await?;
        self.target_for(&host)
    }

    fn target_for(&self, host: &SshHost) -> Result<SessionTarget> {
        let auth = match host.auth_method {
            SshAuthMethod::Password => SessionAuth::Password(self.vault.decrypt(&host.password)?),
            SshAuthMethod::PrivateKey => {
                let passphrase = self.vault.decrypt(&host.passphrase)?;
                SessionAuth::PrivateKey {
                    key: self.vault.decrypt(&host.private_key)?,
                    passphrase: Some(passphrase).filter(|p| !p.is_empty()),
                }
            }
        };
        let host_key = match (&host.host_key_fingerprint, host.skip_host_key_check) {
            (_, true) => HostKeyPolicy::Skip,
            (Some(fp), false) => HostKeyPolicy::Pinned(fp.clone()),
            (None, false) => {
                return Err(CicdError::Validation(format!(
                    "host {} has no pinned host key",
                    host.name
                )))
            }
        };
        Ok(SessionTarget {
            host: host.host.clone(),
            port: host.port,
            username: host.username.clone(),
            auth,
            host_key,
        })
    }

    /// Open a session to a stored host.
    pub async fn connect(&self, id: &str) -> Result<Box<dyn RemoteSession>> {
        let target = self.session_target(id).await?;
        self.connector.connect(&target).await
    }

    /// Connect, run a no-op, and record the outcome on the host.
    pub async fn test_connection(&self, id: &str) -> Result<SshHostView> {
        let mut host = self.load_host(id).await?;
        let outcome = self.probe(&host).await;

        host.last_test_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                host.last_test_status = Some(ConnectionTestStatus::Ok);
                host.last_test_error = None;
                tracing::info!(host_id = %host.id, "SSH connection test succeeded");
            }
            Err(e) => {
                host.last_test_status = Some(ConnectionTestStatus::Failed);
                host.last_test_error = Some(e.to_string());
                tracing::warn!(host_id = %host.id, "SSH connection test failed: {e}");
            }
        }
        self.store.put_json(Bucket::SshHosts, &host.id, &host).await?;
        Ok(SshHostView::from(&host))
    }

    async fn probe(&self, host: &SshHost) -> Result<()> {
        let target = self.target_for(host)?;
        let session = self.connector.connect(&target).await?;
        let spec = CommandSpec::new("echo ok", Duration::from_secs(15));
        let result = session.run(&spec, &CancellationToken::new()).await;
        let _ = session.close().await;
        let output = result?;
        if !output.success() {
            return Err(CicdError::Session(format!(
                "probe exited with {}: {}",
                output.exit_code,
                output.stderr_text()
            )));
        }
        Ok(())
    }

    // ── Git credentials ──

    pub async fn create_credential(&self, input: GitCredentialInput) -> Result<GitCredentialView> {
        if input.name.trim().is_empty() {
            return Err(CicdError::Validation("name is required".to_string()));
        }
        let now = Utc::now();
        let mut cred = GitCredential {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            kind: input.kind,
            username: input.username.clone(),
            token: String::new(),
            password: String::new(),
            private_key: String::new(),
            passphrase: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.seal_credential(&mut cred, &input)?;
        require_credential_secret(&cred)?;
        self.store
            .put_json(Bucket::GitCredentials, &cred.id, &cred)
            .await?;
        tracing::info!(credential_id = %cred.id, name = %cred.name, "Git credential created");
        Ok(GitCredentialView::from(&cred))
    }

    pub async fn update_credential(
        &self,
        id: &str,
        input: GitCredentialInput,
    ) -> Result<GitCredentialView> {
        if input.name.trim().is_empty() {
            return Err(CicdError::Validation("name is required".to_string()));
        }
        let mut cred = self.load_credential(id).await?;
        cred.name = input.name.trim().to_string();
        cred.kind = input.kind;
        cred.username = input.username.clone();
        self.seal_credential(&mut cred, &input)?;
        require_credential_secret(&cred)?;
        cred.updated_at = Utc::now();
        self.store
            .put_json(Bucket::GitCredentials, &cred.id, &cred)
            .await?;
        Ok(GitCredentialView::from(&cred))
    }

    fn seal_credential(&self, cred: &mut GitCredential, input: &GitCredentialInput) -> Result<()> {
        cred.token = self.vault.reseal(&cred.token, input.token.as_deref())?;
        cred.password = self.vault.reseal(&cred.password, input.password.as_deref())?;
        cred.private_key = self
            .vault
            .reseal(&cred.private_key, input.private_key.as_deref())?;
        cred.passphrase = self
            .vault
            .reseal(&cred.passphrase, input.passphrase.as_deref())?;
        Ok(())
    }

    pub async fn delete_credential(&self, id: &str) -> Result<()> {
        self.load_credential(id).await?;
        self.store.delete(Bucket::GitCredentials, id).await
    }

    pub async fn get_credential(&self, id: &str) -> Result<GitCredentialView> {
        Ok(GitCredentialView::from(&self.load_credential(id).await?))
    }

    pub async fn list_credentials(&self) -> Result<Vec<GitCredentialView>> {
        let mut creds: Vec<GitCredential> = self.store.list_json(Bucket::GitCredentials).await?;
        creds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(creds.iter().map(GitCredentialView::from).collect())
    }

    async fn load_credential(&self, id: &str) -> Result<GitCredential> {
        self.store
            .get_json(Bucket::GitCredentials, id)
            .await?
            .ok_or_else(|| CicdError::NotFound(format!("git credential {id}")))
    }

    /// Decrypted credential material for a checkout.
    pub async fn git_auth(&self, id: &str) -> Result<GitAuth> {
        let cred = self.load_credential(id).await?;
        let auth = match cred.kind {
            GitAuthKind::Token => GitAuth::Token {
                username: cred.username,
                token: self.vault.decrypt(&cred.token)?,
            },
            GitAuthKind::Password => GitAuth::Password {
                username: cred.username,
                password: self.vault.decrypt(&cred.password)?,
            },
            GitAuthKind::SshKey => GitAuth::SshKey {
                private_key: self.vault.decrypt(&cred.private_key)?,
                passphrase: self.vault.decrypt(&cred.passphrase)?,
            },
        };
        Ok(auth)
    }
}

fn require_host_secret(host: &SshHost) -> Result<()> {
    let missing = match host.auth_method {
        SshAuthMethod::Password => host.password.is_empty(),
        SshAuthMethod::PrivateKey => host.private_key.is_empty(),
    };
    if missing {
        return Err(CicdError::Validation(match host.auth_method {
            SshAuthMethod::Password => "password is required".to_string(),
            SshAuthMethod::PrivateKey => "private_key is required".to_string(),
        }));
    }
    Ok(())
}

fn require_credential_secret(cred: &GitCredential) -> Result<()> {
    let (missing, field) = match cred.kind {
        GitAuthKind::Token => (cred.token.is_empty(), "token"),
        GitAuthKind::Password => (cred.password.is_empty() || cred.username.is_empty(), "username and password"),
        GitAuthKind::SshKey => (cred.private_key.is_empty(), "private_key"),
    };
    if missing {
        return Err(CicdError::Validation(format!("{field} is required")));
    }
    Ok(())
}
