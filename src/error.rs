use thiserror::Error;

/// Kinds of domain records that can be looked up by id or token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Application,
    Device,
    Segment,
    ScheduledNotification,
    NotificationLog,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Entity::Application => "Application",
            Entity::Device => "Device",
            Entity::Segment => "Segment",
            Entity::ScheduledNotification => "Scheduled notification",
            Entity::NotificationLog => "Notification",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Tenant id is required. Please ensure your application has a valid tenant id and an uploaded service account")]
    TenantIdMissing,

    #[error("Service account not found for tenant {tenant_id}. Please upload your Firebase service account JSON file")]
    CredentialNotFound { tenant_id: String },

    #[error("Service account for tenant {tenant_id} is unusable: {reason}")]
    CredentialMalformed { tenant_id: String, reason: String },

    #[error("Push gateway error for tenant {tenant_id}: {message}")]
    Gateway { tenant_id: String, message: String },

    #[error("{0} not found")]
    NotFound(Entity),

    #[error("No matching devices found")]
    NoMatchingDevices,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    /// Credential configuration problems abort a whole dispatch; everything
    /// else raised by a partition only fails that partition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::TenantIdMissing
                | DispatchError::CredentialNotFound { .. }
                | DispatchError::CredentialMalformed { .. }
        )
    }

    /// Tenant the error refers to, when it carries one.
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            DispatchError::CredentialNotFound { tenant_id }
            | DispatchError::CredentialMalformed { tenant_id, .. }
            | DispatchError::Gateway { tenant_id, .. } => Some(tenant_id),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(e: sqlx::Error) -> Self {
        DispatchError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(e: std::io::Error) -> Self {
        DispatchError::Storage(e.to_string())
    }
}
