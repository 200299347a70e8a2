//! SSH hosts and Git credentials.
//!
//! Secret fields hold vault ciphertext. Callers only ever see the `*View`
//! projections, which carry presence flags instead of secrets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshAuthMethod {
    Password,
    PrivateKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionTestStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshHost {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: SshAuthMethod,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub passphrase: String,
    /// `SHA256:<base64>` as printed by `ssh-keygen -lf`.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub skip_host_key_check: bool,
    #[serde(default)]
    pub last_test_status: Option<ConnectionTestStatus>,
    #[serde(default)]
    pub last_test_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_test_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Display projection of an [`SshHost`].
#[derive(Debug, Clone, Serialize)]
pub struct SshHostView {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: SshAuthMethod,
    pub has_password: bool,
    pub has_private_key: bool,
    pub host_key_fingerprint: Option<String>,
    pub skip_host_key_check: bool,
    pub last_test_status: Option<ConnectionTestStatus>,
    pub last_test_at: Option<DateTime<Utc>>,
    pub last_test_error: Option<String>,
}

impl From<&SshHost> for SshHostView {
    fn from(h: &SshHost) -> Self {
        Self {
            id: h.id.clone(),
            name: h.name.clone(),
            host: h.host.clone(),
            port: h.port,
            username: h.username.clone(),
            auth_method: h.auth_method,
            has_password: !h.password.is_empty(),
            has_private_key: !h.private_key.is_empty(),
            host_key_fingerprint: h.host_key_fingerprint.clone(),
            skip_host_key_check: h.skip_host_key_check,
            last_test_status: h.last_test_status,
            last_test_at: h.last_test_at,
            last_test_error: h.last_test_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitAuthKind {
    Token,
    Password,
    SshKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCredential {
    pub id: String,
    pub name: String,
    pub kind: GitAuthKind,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub passphrase: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitCredentialView {
    pub id: String,
    pub name: String,
    pub kind: GitAuthKind,
    pub username: String,
    pub has_token: bool,
    pub has_password: bool,
    pub has_private_key: bool,
}

impl From<&GitCredential> for GitCredentialView {
    fn from(c: &GitCredential) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            kind: c.kind,
            username: c.username.clone(),
            has_token: !c.token.is_empty(),
            has_password: !c.password.is_empty(),
            has_private_key: !c.private_key.is_empty(),
        }
    }
}

/// Decrypted Git credential material, only held for the duration of a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitAuth {
    Token {
        username: String,
        token: String,
    },
    Password {
        username: String,
        password: String,
    },
    SshKey {
        private_key: String,
        passphrase: String,
    },
}
