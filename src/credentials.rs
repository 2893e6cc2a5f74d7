use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::DispatchError;

/// Opaque per-tenant credential blobs. `put` overwrites any previous blob.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<Vec<u8>>, DispatchError>;
    async fn put(&self, tenant_id: &str, blob: &[u8]) -> Result<(), DispatchError>;
    async fn delete(&self, tenant_id: &str) -> Result<bool, DispatchError>;
    async fn exists(&self, tenant_id: &str) -> Result<bool, DispatchError>;
}

/// Google service account JSON, as downloaded from the Firebase console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceAccount {
    #[serde(rename = "type", default)]
    pub account_type: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub private_key_id: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub client_email: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccount {
    /// Parses and checks a blob. The error string lists what is wrong.
    pub fn parse(blob: &[u8]) -> Result<Self, String> {
        let account: ServiceAccount = serde_json::from_slice(blob)
            .map_err(|e| format!("Invalid JSON format for service account: {}", e))?;
        account.check()?;
        Ok(account)
    }

    fn check(&self) -> Result<(), String> {
        let missing: Vec<&str> = [
            ("type", &self.account_type),
            ("project_id", &self.project_id),
            ("private_key_id", &self.private_key_id),
            ("private_key", &self.private_key),
            ("client_email", &self.client_email),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if !missing.is_empty() {
            return Err(format!(
                "Missing required fields in service account: {}",
                missing.join(", ")
            ));
        }

        if self.account_type != "service_account" {
            return Err("Service account type must be 'service_account'".to_string());
        }

        Ok(())
    }
}

/// SHA-256 of the raw blob, hex encoded. Lets operators tell rotations apart
/// without exposing key material.
pub fn fingerprint(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    format!("{:x}", hasher.finalize())
}

pub fn generate_tenant_id() -> String {
    format!("client-{}", uuid::Uuid::new_v4())
}

/// Stores blobs as `<root>/clients/<tenant_id>.json`.
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn clients_dir(&self) -> PathBuf {
        self.root.join("clients")
    }

    fn blob_path(&self, tenant_id: &str) -> Result<PathBuf, DispatchError> {
        check_tenant_key(tenant_id)?;
        Ok(self.clients_dir().join(format!("{}.json", tenant_id)))
    }
}

fn check_tenant_key(tenant_id: &str) -> Result<(), DispatchError> {
    if tenant_id.trim().is_empty()
        || tenant_id.contains('/')
        || tenant_id.contains('\\')
        || tenant_id.contains("..")
    {
        return Err(DispatchError::Validation(format!(
            "invalid tenant id: {:?}",
            tenant_id
        )));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<Vec<u8>>, DispatchError> {
        let path = self.blob_path(tenant_id)?;
        debug!(tenant_id = %tenant_id, path = %path.display(), "Loading service account");

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, tenant_id: &str, blob: &[u8]) -> Result<(), DispatchError> {
        let path = self.blob_path(tenant_id)?;
        tokio::fs::create_dir_all(self.clients_dir()).await?;

        // Write then rename so readers never observe a half-written blob.
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(tenant_id = %tenant_id, "Stored service account");
        Ok(())
    }

    async fn delete(&self, tenant_id: &str) -> Result<bool, DispatchError> {
        let path = self.blob_path(tenant_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(tenant_id = %tenant_id, "Deleted service account");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, tenant_id: &str) -> Result<bool, DispatchError> {
        let path = self.blob_path(tenant_id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
