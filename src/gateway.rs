use async_trait::async_trait;
use std::sync::Arc;

use crate::{error::DispatchError, models::Platform};

/// Delivery hints attached to every push. Fixed policy, never set per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformHints {
    pub platform: Platform,
    pub high_priority: bool,
    pub default_sound: bool,
    pub default_vibration: bool,
    pub badge: Option<u32>,
}

impl PlatformHints {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Android => Self {
                platform,
                high_priority: true,
                default_sound: true,
                default_vibration: true,
                badge: None,
            },
            Platform::Ios => Self {
                platform,
                high_priority: true,
                default_sound: true,
                default_vibration: false,
                badge: Some(1),
            },
            Platform::Web => Self {
                platform,
                high_priority: true,
                default_sound: false,
                default_vibration: false,
                badge: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MulticastMessage {
    pub title: String,
    pub body: String,
    pub tokens: Vec<String>,
    pub hints: PlatformHints,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MulticastOutcome {
    pub success_count: usize,
    pub failure_count: usize,
}

/// A push client bound to one tenant's credential.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_multicast(
        &self,
        message: &MulticastMessage,
    ) -> Result<MulticastOutcome, DispatchError>;

    /// Frees resources held by the handle once it leaves the registry.
    async fn release(&self) {}
}

/// Builds gateway handles from raw credential blobs. Must fail with
/// `CredentialMalformed` when the blob cannot back a usable client.
#[async_trait]
pub trait GatewayFactory: Send + Sync {
    async fn build(
        &self,
        tenant_id: &str,
        blob: &[u8],
    ) -> Result<Arc<dyn PushGateway>, DispatchError>;
}
