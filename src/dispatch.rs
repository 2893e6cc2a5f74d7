use sqlx::types::{time::OffsetDateTime, uuid::Uuid};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    error::DispatchError,
    gateway::{MulticastMessage, PlatformHints},
    metrics,
    models::{Device, DispatchResult, FilterSpec, NotificationLogEntry, NotificationType, Platform},
    partition::{partition, Partition},
    registry::TenantRegistry,
    repository::LogRepository,
};

/// What is being sent, independent of who receives it.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub application_id: Uuid,
    pub platform: Platform,
    pub title: String,
    pub body: String,
    pub notification_type: NotificationType,
    /// Recorded on every log entry for later inspection.
    pub filter: Option<FilterSpec>,
}

/// Fans a notification out to devices, one gateway call per tenant.
pub struct DispatchCoordinator {
    registry: Arc<TenantRegistry>,
    logs: Arc<dyn LogRepository>,
}

impl DispatchCoordinator {
    pub fn new(registry: Arc<TenantRegistry>, logs: Arc<dyn LogRepository>) -> Self {
        Self { registry, logs }
    }

    /// Credential errors abort the remaining partitions and are returned;
    /// any other partition failure counts all its tokens as failed and the
    /// dispatch carries on. Log entries gathered so far are written in both
    /// cases.
    pub async fn dispatch(
        &self,
        devices: Vec<Device>,
        request: &DispatchRequest,
    ) -> Result<DispatchResult, DispatchError> {
        let timer = std::time::Instant::now();
        let mut result = DispatchResult {
            devices_found: devices.len(),
            ..Default::default()
        };

        let hints = PlatformHints::for_platform(request.platform);
        let mut fatal: Option<DispatchError> = None;

        for part in partition(devices) {
            result.tenants_attempted += 1;
            metrics::PARTITIONS_ATTEMPTED.inc();

            match self.dispatch_partition(&part, request, hints).await {
                Ok((success, failure)) => {
                    result.success_count += success;
                    result.failure_count += failure;
                    result
                        .log_entries
                        .extend(log_entries_for(&part, request, OffsetDateTime::now_utc()));
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        tenant = %part.key,
                        error = %e,
                        "Credential problem, aborting dispatch"
                    );
                    metrics::FATAL_DISPATCH_ABORTS.inc();
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        tenant = %part.key,
                        devices = part.devices.len(),
                        error = %e,
                        "Partition dispatch failed, counting its devices as failed"
                    );
                    result.failure_count += part.devices.len();
                }
            }
        }

        self.persist_logs(&result.log_entries).await;
        metrics::DISPATCH_TIME.observe(timer.elapsed().as_secs_f64());

        if let Some(e) = fatal {
            return Err(e);
        }

        metrics::NOTIFICATIONS_SENT.inc_by(result.success_count as f64);
        metrics::NOTIFICATIONS_FAILED.inc_by(result.failure_count as f64);
        info!(
            application_id = %request.application_id,
            notification_type = %request.notification_type,
            success = result.success_count,
            failure = result.failure_count,
            tenants = result.tenants_attempted,
            "Dispatch finished"
        );

        Ok(result)
    }

    async fn dispatch_partition(
        &self,
        part: &Partition,
        request: &DispatchRequest,
        hints: PlatformHints,
    ) -> Result<(usize, usize), DispatchError> {
        let gateway = self.registry.resolve(part.key.tenant_id()).await?;

        let message = MulticastMessage {
            title: request.title.clone(),
            body: request.body.clone(),
            tokens: part.tokens(),
            hints,
        };

        info!(
            tenant = %part.key,
            devices = message.tokens.len(),
            "Sending notification to tenant partition"
        );
        let outcome = gateway.send_multicast(&message).await?;
        Ok((outcome.success_count, outcome.failure_count))
    }

    async fn persist_logs(&self, entries: &[NotificationLogEntry]) {
        if entries.is_empty() {
            return;
        }
        // The pushes already went out; a failed write only loses history.
        if let Err(e) = self.logs.insert_logs(entries).await {
            error!(count = entries.len(), error = %e, "Failed to persist notification logs");
        }
    }
}

fn log_entries_for(
    part: &Partition,
    request: &DispatchRequest,
    sent_at: OffsetDateTime,
) -> Vec<NotificationLogEntry> {
    part.devices
        .iter()
        .map(|device| NotificationLogEntry {
            id: Uuid::new_v4(),
            token: device.token.clone(),
            application_id: request.application_id,
            title: request.title.clone(),
            body: request.body.clone(),
            sent_at,
            notification_type: request.notification_type,
            filter: request.filter.clone(),
        })
        .collect()
}
