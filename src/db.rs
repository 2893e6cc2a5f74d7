use anyhow::Result;
use async_trait::async_trait;
use sqlx::{
    postgres::PgPoolOptions,
    types::{time::OffsetDateTime, uuid::Uuid, Json},
    FromRow, Pool, Postgres, QueryBuilder,
};
use tracing::{debug, info};

use crate::{
    error::DispatchError,
    models::{
        Application, Device, DeviceProfile, FilterSpec, Location, NotificationLogEntry,
        ScheduleStatus, ScheduledNotification, Segment,
    },
    repository::{
        ApplicationRepository, DeviceRepository, LogRepository, ScheduledNotificationRepository,
        SegmentRepository,
    },
};

// Keeps bulk inserts well below the Postgres bind-parameter limit.
const LOG_INSERT_CHUNK: usize = 1000;

pub async fn init_db_pool(database_url: &str, max_connections: u32) -> Result<Pool<Postgres>> {
    info!("Initializing database connection pool");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[derive(Debug, FromRow)]
struct ApplicationRow {
    id: Uuid,
    name: String,
    platform: String,
    owner_id: String,
    tenant_id: String,
    interests: Vec<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<ApplicationRow> for Application {
    type Error = DispatchError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            platform: row.platform.parse()?,
            owner_id: row.owner_id,
            tenant_id: row.tenant_id,
            interests: row.interests,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DeviceRow {
    id: Uuid,
    token: String,
    application_id: Uuid,
    tenant_id: String,
    user_id: Option<String>,
    gender: Option<String>,
    age: Option<i32>,
    interests: Vec<String>,
    platform: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    last_location_update: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Self {
            id: row.id,
            token: row.token,
            application_id: row.application_id,
            tenant_id: row.tenant_id,
            profile: DeviceProfile {
                user_id: row.user_id,
                gender: row.gender,
                age: row.age,
                interests: row.interests.into_iter().collect(),
                platform: row.platform,
                location: row.lat.zip(row.lng).map(|(lat, lng)| Location { lat, lng }),
                last_location_update: row.last_location_update,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SegmentRow {
    id: Uuid,
    application_id: Uuid,
    name: String,
    filter: Json<FilterSpec>,
    created_at: OffsetDateTime,
}

impl From<SegmentRow> for Segment {
    fn from(row: SegmentRow) -> Self {
        Self {
            id: row.id,
            application_id: row.application_id,
            name: row.name,
            filter: row.filter.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ScheduledRow {
    id: Uuid,
    application_id: Uuid,
    title: String,
    body: String,
    filter: Json<FilterSpec>,
    send_at: OffsetDateTime,
    status: String,
    created_at: OffsetDateTime,
}

impl TryFrom<ScheduledRow> for ScheduledNotification {
    type Error = DispatchError;

    fn try_from(row: ScheduledRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            application_id: row.application_id,
            title: row.title,
            body: row.body,
            filter: row.filter.0,
            send_at: row.send_at,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: Uuid,
    token: String,
    application_id: Uuid,
    title: String,
    body: String,
    sent_at: OffsetDateTime,
    notification_type: String,
    filter: Option<Json<FilterSpec>>,
}

impl TryFrom<LogRow> for NotificationLogEntry {
    type Error = DispatchError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            token: row.token,
            application_id: row.application_id,
            title: row.title,
            body: row.body,
            sent_at: row.sent_at,
            notification_type: row.notification_type.parse()?,
            filter: row.filter.map(|f| f.0),
        })
    }
}

const DEVICE_COLUMNS: &str = "id, token, application_id, tenant_id, user_id, gender, age, \
    interests, platform, lat, lng, last_location_update, created_at, updated_at";

const SCHEDULED_COLUMNS: &str =
    "id, application_id, title, body, filter, send_at, status, created_at";

const LOG_COLUMNS: &str =
    "id, token, application_id, title, body, sent_at, notification_type, filter";

/// Postgres-backed implementation of every repository.
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApplicationRepository for PgStore {
    async fn insert_application(&self, app: &Application) -> Result<(), DispatchError> {
        sqlx::query(
            r#"
            INSERT INTO applications (id, name, platform, owner_id, tenant_id, interests, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(app.id)
        .bind(&app.name)
        .bind(app.platform.as_str())
        .bind(&app.owner_id)
        .bind(&app.tenant_id)
        .bind(&app.interests)
        .bind(app.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_application(&self, id: Uuid) -> Result<Option<Application>, DispatchError> {
        sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT id, name, platform, owner_id, tenant_id, interests, created_at
            FROM applications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Application::try_from)
        .transpose()
    }

    async fn applications_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<Application>, DispatchError> {
        sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT id, name, platform, owner_id, tenant_id, interests, created_at
            FROM applications
            WHERE owner_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Application::try_from)
        .collect()
    }

    async fn delete_application(&self, id: Uuid) -> Result<bool, DispatchError> {
        // Dependent rows go with it via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DeviceRepository for PgStore {
    async fn upsert_device(&self, device: &Device) -> Result<Device, DispatchError> {
        let profile = &device.profile;
        let interests: Vec<String> = profile.interests.iter().cloned().collect();
        let query = format!(
            r#"
            INSERT INTO devices (id, token, application_id, tenant_id, user_id, gender, age,
                                 interests, platform, lat, lng, last_location_update)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (token, application_id, tenant_id) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                gender = EXCLUDED.gender,
                age = EXCLUDED.age,
                interests = EXCLUDED.interests,
                platform = EXCLUDED.platform,
                lat = EXCLUDED.lat,
                lng = EXCLUDED.lng,
                last_location_update = EXCLUDED.last_location_update,
                updated_at = NOW()
            RETURNING {}
            "#,
            DEVICE_COLUMNS
        );

        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device.id)
            .bind(&device.token)
            .bind(device.application_id)
            .bind(&device.tenant_id)
            .bind(&profile.user_id)
            .bind(&profile.gender)
            .bind(profile.age)
            .bind(&interests)
            .bind(&profile.platform)
            .bind(profile.location.map(|l| l.lat))
            .bind(profile.location.map(|l| l.lng))
            .bind(profile.last_location_update)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn devices_for_application(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<Device>, DispatchError> {
        let query = format!(
            "SELECT {} FROM devices WHERE application_id = $1 ORDER BY created_at",
            DEVICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(application_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn devices_by_tokens(
        &self,
        application_id: Uuid,
        tokens: &[String],
    ) -> Result<Vec<Device>, DispatchError> {
        let query = format!(
            "SELECT {} FROM devices WHERE application_id = $1 AND token = ANY($2) ORDER BY created_at",
            DEVICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(application_id)
            .bind(tokens)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn device_by_token(&self, token: &str) -> Result<Option<Device>, DispatchError> {
        let query = format!(
            "SELECT {} FROM devices WHERE token = $1 ORDER BY created_at LIMIT 1",
            DEVICE_COLUMNS
        );
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Device::from))
    }

    async fn update_profile(
        &self,
        token: &str,
        profile: &DeviceProfile,
    ) -> Result<Option<Device>, DispatchError> {
        let interests: Vec<String> = profile.interests.iter().cloned().collect();
        let query = format!(
            r#"
            UPDATE devices
            SET user_id = $2, gender = $3, age = $4, interests = $5, platform = $6,
                lat = $7, lng = $8, last_location_update = $9, updated_at = NOW()
            WHERE token = $1
            RETURNING {}
            "#,
            DEVICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(token)
            .bind(&profile.user_id)
            .bind(&profile.gender)
            .bind(profile.age)
            .bind(&interests)
            .bind(&profile.platform)
            .bind(profile.location.map(|l| l.lat))
            .bind(profile.location.map(|l| l.lng))
            .bind(profile.last_location_update)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().next().map(Device::from))
    }

    async fn update_location(
        &self,
        token: &str,
        location: Location,
        at: OffsetDateTime,
    ) -> Result<Option<Device>, DispatchError> {
        let query = format!(
            r#"
            UPDATE devices
            SET lat = $2, lng = $3, last_location_update = $4, updated_at = NOW()
            WHERE token = $1
            RETURNING {}
            "#,
            DEVICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(token)
            .bind(location.lat)
            .bind(location.lng)
            .bind(at)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().next().map(Device::from))
    }

    async fn delete_by_token(&self, token: &str) -> Result<bool, DispatchError> {
        let result = sqlx::query("DELETE FROM devices WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SegmentRepository for PgStore {
    async fn insert_segment(&self, segment: &Segment) -> Result<(), DispatchError> {
        sqlx::query(
            r#"
            INSERT INTO segments (id, application_id, name, filter, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(segment.id)
        .bind(segment.application_id)
        .bind(&segment.name)
        .bind(Json(&segment.filter))
        .bind(segment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_segment(&self, id: Uuid) -> Result<Option<Segment>, DispatchError> {
        let row = sqlx::query_as::<_, SegmentRow>(
            "SELECT id, application_id, name, filter, created_at FROM segments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Segment::from))
    }

    async fn segments_for_application(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<Segment>, DispatchError> {
        let rows = sqlx::query_as::<_, SegmentRow>(
            r#"
            SELECT id, application_id, name, filter, created_at
            FROM segments
            WHERE application_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(application_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Segment::from).collect())
    }

    async fn delete_segment(&self, id: Uuid) -> Result<bool, DispatchError> {
        let result = sqlx::query("DELETE FROM segments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ScheduledNotificationRepository for PgStore {
    async fn insert_scheduled(
        &self,
        notification: &ScheduledNotification,
    ) -> Result<(), DispatchError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_notifications
                (id, application_id, title, body, filter, send_at, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(notification.id)
        .bind(notification.application_id)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(Json(&notification.filter))
        .bind(notification.send_at)
        .bind(notification.status.as_str())
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_scheduled(
        &self,
        id: Uuid,
    ) -> Result<Option<ScheduledNotification>, DispatchError> {
        let query = format!(
            "SELECT {} FROM scheduled_notifications WHERE id = $1",
            SCHEDULED_COLUMNS
        );
        sqlx::query_as::<_, ScheduledRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScheduledNotification::try_from)
            .transpose()
    }

    async fn scheduled_for_application(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<ScheduledNotification>, DispatchError> {
        let query = format!(
            "SELECT {} FROM scheduled_notifications WHERE application_id = $1 ORDER BY send_at",
            SCHEDULED_COLUMNS
        );
        sqlx::query_as::<_, ScheduledRow>(&query)
            .bind(application_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ScheduledNotification::try_from)
            .collect()
    }

    async fn due_scheduled(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<ScheduledNotification>, DispatchError> {
        let query = format!(
            r#"
            SELECT {}
            FROM scheduled_notifications
            WHERE status = 'pending' AND send_at <= $1
            ORDER BY send_at ASC
            "#,
            SCHEDULED_COLUMNS
        );
        sqlx::query_as::<_, ScheduledRow>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ScheduledNotification::try_from)
            .collect()
    }

    async fn update_pending(
        &self,
        notification: &ScheduledNotification,
    ) -> Result<bool, DispatchError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET title = $2, body = $3, filter = $4, send_at = $5, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(notification.id)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(Json(&notification.filter))
        .bind(notification.send_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<bool, DispatchError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(id)
        .bind(ScheduleStatus::Sent.as_str())
        .bind(ScheduleStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_scheduled(&self, id: Uuid) -> Result<bool, DispatchError> {
        let result = sqlx::query("DELETE FROM scheduled_notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl LogRepository for PgStore {
    async fn insert_logs(&self, entries: &[NotificationLogEntry]) -> Result<(), DispatchError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in entries.chunks(LOG_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO notification_logs (id, token, application_id, title, body, sent_at, notification_type, filter) ",
            );
            builder.push_values(chunk, |mut row, entry| {
                row.push_bind(entry.id)
                    .push_bind(&entry.token)
                    .push_bind(entry.application_id)
                    .push_bind(&entry.title)
                    .push_bind(&entry.body)
                    .push_bind(entry.sent_at)
                    .push_bind(entry.notification_type.as_str())
                    .push_bind(entry.filter.as_ref().map(Json));
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(count = entries.len(), "Persisted notification logs");
        Ok(())
    }

    async fn logs_for_application(
        &self,
        application_id: Uuid,
    ) -> Result<Vec<NotificationLogEntry>, DispatchError> {
        let query = format!(
            "SELECT {} FROM notification_logs WHERE application_id = $1 ORDER BY sent_at DESC",
            LOG_COLUMNS
        );
        sqlx::query_as::<_, LogRow>(&query)
            .bind(application_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(NotificationLogEntry::try_from)
            .collect()
    }

    async fn logs_for_token(&self, token: &str) -> Result<Vec<NotificationLogEntry>, DispatchError> {
        let query = format!(
            "SELECT {} FROM notification_logs WHERE token = $1 ORDER BY sent_at DESC",
            LOG_COLUMNS
        );
        sqlx::query_as::<_, LogRow>(&query)
            .bind(token)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(NotificationLogEntry::try_from)
            .collect()
    }

    async fn delete_log(&self, id: Uuid) -> Result<bool, DispatchError> {
        let result = sqlx::query("DELETE FROM notification_logs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
