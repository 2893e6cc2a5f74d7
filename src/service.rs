use serde::{Deserialize, Serialize};
use sqlx::types::{time::OffsetDateTime, uuid::Uuid};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    credentials::{self, CredentialStore, ServiceAccount},
    dispatch::{DispatchCoordinator, DispatchRequest},
    error::{DispatchError, Entity},
    filter,
    models::{
        Application, Bounds, Device, DeviceProfile, DispatchResult, FilterSpec, Location,
        NotificationLogEntry, NotificationType, Platform, ScheduleStatus, ScheduledNotification,
        ScheduledNotificationPatch, Segment,
    },
    registry::{is_missing_tenant_id, TenantRegistry},
    repository::Repositories,
    stats::{self, DayCount, OverviewStats, UserStats},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApplication {
    pub name: String,
    pub platform: Platform,
    pub owner_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub interests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", rename_all_fields = "camelCase", tag = "status")]
pub enum CredentialStatus {
    Active {
        tenant_id: String,
        project_id: String,
        client_email: String,
        fingerprint: String,
    },
    Missing {
        tenant_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialUpload {
    pub tenant_id: String,
    pub project_id: String,
}

/// Every operation the HTTP layer and the scheduler call into.
pub struct NotificationService {
    repos: Repositories,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<TenantRegistry>,
    coordinator: DispatchCoordinator,
}

impl NotificationService {
    pub fn new(
        repos: Repositories,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<TenantRegistry>,
    ) -> Self {
        let coordinator = DispatchCoordinator::new(registry.clone(), repos.logs.clone());
        Self {
            repos,
            credentials,
            registry,
            coordinator,
        }
    }

    // Dispatch

    /// Sends to every device of the application that passes `filter`.
    pub async fn send_immediate(
        &self,
        application_id: Uuid,
        title: &str,
        body: &str,
        filter: FilterSpec,
    ) -> Result<DispatchResult, DispatchError> {
        validate_message(title, body)?;
        filter::validate(&filter)?;
        let app = self.load_application(application_id).await?;

        let devices = self.repos.devices.devices_for_application(app.id).await?;
        let matched = filter::apply(devices, &filter);
        if matched.is_empty() {
            return Err(DispatchError::NoMatchingDevices);
        }

        let notification_type = if filter.location.is_some() || filter.bounds.is_some() {
            NotificationType::LocationBased
        } else {
            NotificationType::Broadcast
        };
        let request = dispatch_request(&app, title, body, notification_type, Some(filter));
        self.coordinator.dispatch(matched, &request).await
    }

    /// Sends to the listed tokens that belong to the application. Unknown
    /// tokens are ignored.
    pub async fn send_to_tokens(
        &self,
        application_id: Uuid,
        title: &str,
        body: &str,
        tokens: &[String],
    ) -> Result<DispatchResult, DispatchError> {
        validate_message(title, body)?;
        let tokens: Vec<String> = tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if tokens.is_empty() {
            return Err(DispatchError::Validation(
                "at least one device token is required".to_string(),
            ));
        }
        let app = self.load_application(application_id).await?;

        let devices = self.repos.devices.devices_by_tokens(app.id, &tokens).await?;
        if devices.is_empty() {
            return Err(DispatchError::NoMatchingDevices);
        }

        let request = dispatch_request(&app, title, body, NotificationType::Individual, None);
        self.coordinator.dispatch(devices, &request).await
    }

    /// Sends to devices whose last known location lies inside `bounds`.
    /// Finding no device is a successful, empty send.
    pub async fn send_by_bounds(
        &self,
        application_id: Uuid,
        title: &str,
        body: &str,
        bounds: Bounds,
    ) -> Result<DispatchResult, DispatchError> {
        validate_message(title, body)?;
        filter::validate_bounds(&bounds)?;
        let app = self.load_application(application_id).await?;

        let spec = FilterSpec {
            bounds: Some(bounds),
            ..Default::default()
        };
        let devices = self.repos.devices.devices_for_application(app.id).await?;
        let matched = filter::apply(devices, &spec);
        if matched.is_empty() {
            info!(application_id = %app.id, "No devices inside bounds");
            return Ok(DispatchResult::default());
        }

        let request = dispatch_request(&app, title, body, NotificationType::LocationBased, Some(spec));
        self.coordinator.dispatch(matched, &request).await
    }

    pub async fn send_to_segment(
        &self,
        segment_id: Uuid,
        title: &str,
        body: &str,
    ) -> Result<DispatchResult, DispatchError> {
        let segment = self
            .repos
            .segments
            .find_segment(segment_id)
            .await?
            .ok_or(DispatchError::NotFound(Entity::Segment))?;
        self.send_immediate(segment.application_id, title, body, segment.filter)
            .await
    }

    /// Stores a pending notification for the scheduler. Nothing is sent now.
    pub async fn schedule_notification(
        &self,
        application_id: Uuid,
        title: &str,
        body: &str,
        filter: FilterSpec,
        send_at: OffsetDateTime,
    ) -> Result<ScheduledNotification, DispatchError> {
        validate_message(title, body)?;
        filter::validate(&filter)?;
        let app = self.load_application(application_id).await?;

        let notification = ScheduledNotification {
            id: Uuid::new_v4(),
            application_id: app.id,
            title: title.trim().to_string(),
            body: body.trim().to_string(),
            filter,
            send_at,
            status: ScheduleStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
        };
        self.repos.scheduled.insert_scheduled(&notification).await?;

        info!(
            id = %notification.id,
            application_id = %app.id,
            send_at = %notification.send_at,
            "Scheduled notification"
        );
        Ok(notification)
    }

    /// Runs one due scheduled notification. `None` means nothing matched.
    pub async fn dispatch_scheduled(
        &self,
        notification: &ScheduledNotification,
    ) -> Result<Option<DispatchResult>, DispatchError> {
        let app = self.load_application(notification.application_id).await?;

        let devices = self.repos.devices.devices_for_application(app.id).await?;
        let matched = filter::apply(devices, &notification.filter);
        if matched.is_empty() {
            return Ok(None);
        }

        let request = dispatch_request(
            &app,
            &notification.title,
            &notification.body,
            NotificationType::Broadcast,
            Some(notification.filter.clone()),
        );
        self.coordinator.dispatch(matched, &request).await.map(Some)
    }

    pub async fn invalidate_tenant_cache(&self, tenant_id: &str) -> Result<bool, DispatchError> {
        if is_missing_tenant_id(tenant_id) {
            return Err(DispatchError::TenantIdMissing);
        }
        Ok(self.registry.invalidate(tenant_id).await)
    }

    pub async fn invalidate_all_tenant_caches(&self) -> usize {
        self.registry.invalidate_all().await
    }

    pub async fn cached_tenants(&self) -> BTreeSet<String> {
        self.registry.cached_tenants().await
    }

    // Credentials

    /// Validates and stores a service account. A tenant id is generated when
    /// none is given. Any cached handle for the tenant is dropped afterwards.
    pub async fn upload_credential(
        &self,
        tenant_id: Option<&str>,
        blob: &[u8],
    ) -> Result<CredentialUpload, DispatchError> {
        let account = ServiceAccount::parse(blob).map_err(DispatchError::Validation)?;
        let tenant_id = match tenant_id {
            Some(id) if !is_missing_tenant_id(id) => id.trim().to_string(),
            _ => credentials::generate_tenant_id(),
        };

        self.credentials.put(&tenant_id, blob).await?;
        self.registry.invalidate(&tenant_id).await;

        info!(
            tenant_id = %tenant_id,
            project_id = %account.project_id,
            "Stored service account"
        );
        Ok(CredentialUpload {
            tenant_id,
            project_id: account.project_id,
        })
    }

    pub async fn replace_application_credential(
        &self,
        application_id: Uuid,
        blob: &[u8],
    ) -> Result<CredentialStatus, DispatchError> {
        let app = self.load_application(application_id).await?;
        self.upload_credential(Some(&app.tenant_id), blob).await?;
        self.credential_status(application_id).await
    }

    pub async fn credential_status(
        &self,
        application_id: Uuid,
    ) -> Result<CredentialStatus, DispatchError> {
        let app = self.load_application(application_id).await?;

        let Some(blob) = self.credentials.get(&app.tenant_id).await? else {
            return Ok(CredentialStatus::Missing {
                tenant_id: app.tenant_id,
            });
        };
        let account =
            ServiceAccount::parse(&blob).map_err(|reason| DispatchError::CredentialMalformed {
                tenant_id: app.tenant_id.clone(),
                reason,
            })?;

        Ok(CredentialStatus::Active {
            tenant_id: app.tenant_id,
            project_id: account.project_id,
            client_email: account.client_email,
            fingerprint: credentials::fingerprint(&blob),
        })
    }

    // Applications

    pub async fn create_application(
        &self,
        new: NewApplication,
    ) -> Result<Application, DispatchError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(DispatchError::Validation("name is required".to_string()));
        }
        if new.owner_id.trim().is_empty() {
            return Err(DispatchError::Validation("ownerId is required".to_string()));
        }
        if is_missing_tenant_id(&new.tenant_id) {
            return Err(DispatchError::TenantIdMissing);
        }
        let tenant_id = new.tenant_id.trim().to_string();
        if !self.credentials.exists(&tenant_id).await? {
            return Err(DispatchError::Validation(format!(
                "No service account uploaded for tenant {}. Upload it before creating the application",
                tenant_id
            )));
        }

        let app = Application {
            id: Uuid::new_v4(),
            name: name.to_string(),
            platform: new.platform,
            owner_id: new.owner_id.trim().to_string(),
            tenant_id,
            interests: new.interests,
            created_at: OffsetDateTime::now_utc(),
        };
        self.repos.applications.insert_application(&app).await?;

        info!(id = %app.id, tenant_id = %app.tenant_id, "Created application");
        Ok(app)
    }

    pub async fn get_application(&self, id: Uuid) -> Result<Application, DispatchError> {
        self.load_application(id).await
    }

    pub async fn list_applications(&self, owner_id: &str) -> Result<Vec<Application>, DispatchError> {
        self.repos.applications.applications_for_owner(owner_id).await
    }

    pub async fn application_interests(&self, id: Uuid) -> Result<Vec<String>, DispatchError> {
        Ok(self.load_application(id).await?.interests)
    }

    /// Removes the application with its devices, segments, schedules and
    /// history. The tenant credential is left in place.
    pub async fn delete_application(&self, id: Uuid) -> Result<(), DispatchError> {
        if !self.repos.applications.delete_application(id).await? {
            return Err(DispatchError::NotFound(Entity::Application));
        }
        info!(id = %id, "Deleted application");
        Ok(())
    }

    // Devices

    pub async fn register_device(
        &self,
        application_id: Uuid,
        token: &str,
        mut profile: DeviceProfile,
    ) -> Result<Device, DispatchError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(DispatchError::Validation("token is required".to_string()));
        }
        if let Some(loc) = profile.location {
            filter::validate_coordinate(loc.lat, loc.lng)?;
            if profile.last_location_update.is_none() {
                profile.last_location_update = Some(OffsetDateTime::now_utc());
            }
        }
        let app = self.load_application(application_id).await?;

        let now = OffsetDateTime::now_utc();
        let device = Device {
            id: Uuid::new_v4(),
            token: token.to_string(),
            application_id: app.id,
            tenant_id: app.tenant_id,
            profile,
            created_at: now,
            updated_at: now,
        };
        let stored = self.repos.devices.upsert_device(&device).await?;

        info!(application_id = %app.id, tenant_id = %stored.tenant_id, "Registered device");
        Ok(stored)
    }

    pub async fn update_device_profile(
        &self,
        token: &str,
        profile: DeviceProfile,
    ) -> Result<Device, DispatchError> {
        if let Some(loc) = profile.location {
            filter::validate_coordinate(loc.lat, loc.lng)?;
        }
        self.repos
            .devices
            .update_profile(token, &profile)
            .await?
            .ok_or(DispatchError::NotFound(Entity::Device))
    }

    pub async fn update_device_location(
        &self,
        token: &str,
        lat: f64,
        lng: f64,
    ) -> Result<Device, DispatchError> {
        filter::validate_coordinate(lat, lng)?;
        self.repos
            .devices
            .update_location(token, Location { lat, lng }, OffsetDateTime::now_utc())
            .await?
            .ok_or(DispatchError::NotFound(Entity::Device))
    }

    pub async fn unregister_device(&self, token: &str) -> Result<(), DispatchError> {
        if !self.repos.devices.delete_by_token(token).await? {
            return Err(DispatchError::NotFound(Entity::Device));
        }
        Ok(())
    }

    pub async fn devices_for_application(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<Device>, DispatchError> {
        self.repos.devices.devices_for_application(application_id).await
    }

    pub async fn devices_with_location(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<Device>, DispatchError> {
        let mut devices = self.devices_for_application(application_id).await?;
        devices.retain(|d| d.profile.location.is_some());
        Ok(devices)
    }

    pub async fn device_by_token(&self, token: &str) -> Result<Device, DispatchError> {
        self.repos
            .devices
            .device_by_token(token)
            .await?
            .ok_or(DispatchError::NotFound(Entity::Device))
    }

    // Segments

    pub async fn create_segment(
        &self,
        application_id: Uuid,
        name: &str,
        filter: FilterSpec,
    ) -> Result<Segment, DispatchError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DispatchError::Validation("name is required".to_string()));
        }
        filter::validate(&filter)?;
        let app = self.load_application(application_id).await?;

        let segment = Segment {
            id: Uuid::new_v4(),
            application_id: app.id,
            name: name.to_string(),
            filter,
            created_at: OffsetDateTime::now_utc(),
        };
        self.repos.segments.insert_segment(&segment).await?;
        Ok(segment)
    }

    pub async fn list_segments(&self, application_id: Uuid) -> Result<Vec<Segment>, DispatchError> {
        self.repos.segments.segments_for_application(application_id).await
    }

    pub async fn delete_segment(&self, id: Uuid) -> Result<(), DispatchError> {
        if !self.repos.segments.delete_segment(id).await? {
            return Err(DispatchError::NotFound(Entity::Segment));
        }
        Ok(())
    }

    // Scheduled notifications

    pub async fn list_scheduled(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<ScheduledNotification>, DispatchError> {
        self.repos.scheduled.scheduled_for_application(application_id).await
    }

    /// Edits a notification that has not been sent yet.
    pub async fn update_scheduled(
        &self,
        id: Uuid,
        patch: ScheduledNotificationPatch,
    ) -> Result<ScheduledNotification, DispatchError> {
        let mut notification = self
            .repos
            .scheduled
            .find_scheduled(id)
            .await?
            .ok_or(DispatchError::NotFound(Entity::ScheduledNotification))?;
        if notification.status != ScheduleStatus::Pending {
            return Err(already_sent());
        }

        if let Some(title) = patch.title {
            notification.title = title.trim().to_string();
        }
        if let Some(body) = patch.body {
            notification.body = body.trim().to_string();
        }
        if let Some(filter) = patch.filter {
            notification.filter = filter;
        }
        if let Some(send_at) = patch.send_at {
            notification.send_at = send_at;
        }
        validate_message(&notification.title, &notification.body)?;
        filter::validate(&notification.filter)?;

        // The scheduler may have picked it up since the read.
        if !self.repos.scheduled.update_pending(&notification).await? {
            return Err(already_sent());
        }
        Ok(notification)
    }

    pub async fn delete_scheduled(&self, id: Uuid) -> Result<(), DispatchError> {
        if !self.repos.scheduled.delete_scheduled(id).await? {
            return Err(DispatchError::NotFound(Entity::ScheduledNotification));
        }
        Ok(())
    }

    // History and statistics

    pub async fn history_for_application(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<NotificationLogEntry>, DispatchError> {
        self.repos.logs.logs_for_application(application_id).await
    }

    pub async fn history_for_token(
        &self,
        token: &str,
    ) -> Result<Vec<NotificationLogEntry>, DispatchError> {
        self.repos.logs.logs_for_token(token).await
    }

    pub async fn delete_log_entry(&self, id: Uuid) -> Result<(), DispatchError> {
        if !self.repos.logs.delete_log(id).await? {
            return Err(DispatchError::NotFound(Entity::NotificationLog));
        }
        Ok(())
    }

    pub async fn daily_stats(&self, application_id: Uuid) -> Result<Vec<DayCount>, DispatchError> {
        let logs = self.repos.logs.logs_for_application(application_id).await?;
        Ok(stats::daily(&logs))
    }

    pub async fn overview_stats(&self, application_id: Uuid) -> Result<OverviewStats, DispatchError> {
        let logs = self.repos.logs.logs_for_application(application_id).await?;
        let devices = self.repos.devices.devices_for_application(application_id).await?;
        Ok(stats::overview(&logs, &devices))
    }

    pub async fn per_user_stats(&self, application_id: Uuid) -> Result<Vec<UserStats>, DispatchError> {
        let logs = self.repos.logs.logs_for_application(application_id).await?;
        let devices = self.repos.devices.devices_for_application(application_id).await?;
        Ok(stats::per_user(&logs, &devices))
    }

    async fn load_application(&self, id: Uuid) -> Result<Application, DispatchError> {
        self.repos
            .applications
            .find_application(id)
            .await?
            .ok_or_else(|| {
                debug!(application_id = %id, "Application not found");
                DispatchError::NotFound(Entity::Application)
            })
    }
}

fn validate_message(title: &str, body: &str) -> Result<(), DispatchError> {
    if title.trim().is_empty() || body.trim().is_empty() {
        return Err(DispatchError::Validation(
            "title and body are required".to_string(),
        ));
    }
    Ok(())
}

fn already_sent() -> DispatchError {
    DispatchError::Validation("Scheduled notification was already sent".to_string())
}

fn dispatch_request(
    app: &Application,
    title: &str,
    body: &str,
    notification_type: NotificationType,
    filter: Option<FilterSpec>,
) -> DispatchRequest {
    DispatchRequest {
        application_id: app.id,
        platform: app.platform,
        title: title.trim().to_string(),
        body: body.trim().to_string(),
        notification_type,
        filter,
    }
}
