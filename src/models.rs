use serde::{Deserialize, Serialize};
use sqlx::types::{time::OffsetDateTime, uuid::Uuid};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Android,
    Ios,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Web => "web",
        }
    }
}

impl FromStr for Platform {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "web" => Ok(Platform::Web),
            other => Err(DispatchError::Validation(format!(
                "unknown platform: {}",
                other
            ))),
        }
    }
}

/// An application owned by a dashboard user. Every application is bound to
/// exactly one tenant credential identifier, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub platform: Platform,
    pub owner_id: String,
    pub tenant_id: String,
    /// Interest vocabulary shown in the dashboard; not enforced on devices.
    pub interests: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub age: Option<i32>,
    #[serde(default)]
    pub interests: BTreeSet<String>,
    /// Client-reported OS of the device, e.g. "android" or "ios".
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_location_update: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: Uuid,
    pub token: String,
    pub application_id: Uuid,
    pub tenant_id: String,
    pub profile: DeviceProfile,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoRadius {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
}

/// Axis-aligned lat/lng box. `west` must not exceed `east`; boxes crossing
/// the antimeridian are not representable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

/// Optional targeting predicates. An absent field places no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_min: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_max: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interests: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoRadius>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    pub application_id: Uuid,
    pub name: String,
    pub filter: FilterSpec,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Sent,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Sent => "sent",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScheduleStatus::Pending),
            "sent" => Ok(ScheduleStatus::Sent),
            other => Err(DispatchError::Storage(format!(
                "unknown schedule status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotification {
    pub id: Uuid,
    pub application_id: Uuid,
    pub title: String,
    pub body: String,
    pub filter: FilterSpec,
    #[serde(with = "time::serde::rfc3339")]
    pub send_at: OffsetDateTime,
    pub status: ScheduleStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// User-editable fields of a pending scheduled notification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotificationPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub filter: Option<FilterSpec>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub send_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationType {
    Broadcast,
    Individual,
    LocationBased,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Broadcast => "broadcast",
            NotificationType::Individual => "individual",
            NotificationType::LocationBased => "location-based",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(NotificationType::Broadcast),
            "individual" => Ok(NotificationType::Individual),
            "location-based" => Ok(NotificationType::LocationBased),
            other => Err(DispatchError::Storage(format!(
                "unknown notification type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationLogEntry {
    pub id: Uuid,
    pub token: String,
    pub application_id: Uuid,
    pub title: String,
    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSpec>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub devices_found: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub tenants_attempted: usize,
    #[serde(skip)]
    pub log_entries: Vec<NotificationLogEntry>,
}
