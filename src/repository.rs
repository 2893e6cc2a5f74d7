use async_trait::async_trait;
use sqlx::types::{time::OffsetDateTime, uuid::Uuid};
use std::sync::Arc;

use crate::{
    error::DispatchError,
    models::{
        Application, Device, DeviceProfile, Location, NotificationLogEntry, ScheduledNotification,
        Segment,
    },
};

#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    async fn insert_application(&self, app: &Application) -> Result<(), DispatchError>;
    async fn find_application(&self, id: Uuid) -> Result<Option<Application>, DispatchError>;
    /// Newest first.
    async fn applications_for_owner(&self, owner_id: &str)
        -> Result<Vec<Application>, DispatchError>;
    /// Also removes the application's devices, segments, schedules and logs.
    async fn delete_application(&self, id: Uuid) -> Result<bool, DispatchError>;
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Inserts or updates in place on (token, application_id, tenant_id).
    async fn upsert_device(&self, device: &Device) -> Result<Device, DispatchError>;
    async fn devices_for_application(&self, application_id: Uuid)
        -> Result<Vec<Device>, DispatchError>;
    async fn devices_by_tokens(
        &self,
        application_id: Uuid,
        tokens: &[String],
    ) -> Result<Vec<Device>, DispatchError>;
    async fn device_by_token(&self, token: &str) -> Result<Option<Device>, DispatchError>;
    async fn update_profile(
        &self,
        token: &str,
        profile: &DeviceProfile,
    ) -> Result<Option<Device>, DispatchError>;
    async fn update_location(
        &self,
        token: &str,
        location: Location,
        at: OffsetDateTime,
    ) -> Result<Option<Device>, DispatchError>;
    async fn delete_by_token(&self, token: &str) -> Result<bool, DispatchError>;
}

#[async_trait]
pub trait SegmentRepository: Send + Sync {
    async fn insert_segment(&self, segment: &Segment) -> Result<(), DispatchError>;
    async fn find_segment(&self, id: Uuid) -> Result<Option<Segment>, DispatchError>;
    async fn segments_for_application(&self, application_id: Uuid)
        -> Result<Vec<Segment>, DispatchError>;
    async fn delete_segment(&self, id: Uuid) -> Result<bool, DispatchError>;
}

#[async_trait]
pub trait ScheduledNotificationRepository: Send + Sync {
    async fn insert_scheduled(&self, notification: &ScheduledNotification)
        -> Result<(), DispatchError>;
    async fn find_scheduled(&self, id: Uuid)
        -> Result<Option<ScheduledNotification>, DispatchError>;
    /// Ordered by `send_at`.
    async fn scheduled_for_application(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<ScheduledNotification>, DispatchError>;
    /// Pending records with `send_at <= now`, ascending by `send_at`.
    async fn due_scheduled(&self, now: OffsetDateTime)
        -> Result<Vec<ScheduledNotification>, DispatchError>;
    /// Overwrites the editable fields; only applies while still pending.
    async fn update_pending(&self, notification: &ScheduledNotification)
        -> Result<bool, DispatchError>;
    /// pending -> sent. Returns false if the record was not pending.
    async fn mark_sent(&self, id: Uuid) -> Result<bool, DispatchError>;
    async fn delete_scheduled(&self, id: Uuid) -> Result<bool, DispatchError>;
}

#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn insert_logs(&self, entries: &[NotificationLogEntry]) -> Result<(), DispatchError>;
    /// Newest first.
    async fn logs_for_application(&self, application_id: Uuid)
        -> Result<Vec<NotificationLogEntry>, DispatchError>;
    /// Newest first.
    async fn logs_for_token(&self, token: &str) -> Result<Vec<NotificationLogEntry>, DispatchError>;
    async fn delete_log(&self, id: Uuid) -> Result<bool, DispatchError>;
}

/// Data-access handles shared by the service, dispatcher and scheduler.
#[derive(Clone)]
pub struct Repositories {
    pub applications: Arc<dyn ApplicationRepository>,
    pub devices: Arc<dyn DeviceRepository>,
    pub segments: Arc<dyn SegmentRepository>,
    pub scheduled: Arc<dyn ScheduledNotificationRepository>,
    pub logs: Arc<dyn LogRepository>,
}

impl Repositories {
    /// All five repositories backed by one store.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ApplicationRepository
            + DeviceRepository
            + SegmentRepository
            + ScheduledNotificationRepository
            + LogRepository
            + 'static,
    {
        Self {
            applications: store.clone(),
            devices: store.clone(),
            segments: store.clone(),
            scheduled: store.clone(),
            logs: store,
        }
    }
}
