use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use time::{OffsetDateTime, UtcOffset};

use crate::models::{Device, NotificationLogEntry};

const AGE_BOUNDARIES: [i32; 8] = [0, 18, 25, 35, 45, 55, 65, 100];
const UNKNOWN_AGE: &str = "Unknown";
const ENGAGEMENT_BOUNDARIES: [usize; 7] = [0, 1, 5, 10, 25, 50, 100];
const TOP_INTERESTS: usize = 10;
const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourCount {
    pub hour: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeCount {
    pub range: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthCount {
    pub month: String,
    pub count: usize,
}

/// `day_number` runs 1 (Sunday) through 7 (Saturday).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekdayCount {
    pub day: String,
    pub day_number: u8,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapCell {
    pub hour: u8,
    pub day_of_week: u8,
    pub day: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    pub per_day: Vec<DayCount>,
    pub gender_distribution: BTreeMap<String, usize>,
    pub interests: Vec<NamedCount>,
    pub total: usize,
    pub total_devices: usize,
    pub total_users: usize,
    pub hourly_distribution: Vec<HourCount>,
    pub age_distribution: Vec<RangeCount>,
    pub type_distribution: BTreeMap<String, usize>,
    pub monthly_stats: Vec<MonthCount>,
    pub weekday_distribution: Vec<WeekdayCount>,
    pub platform_distribution: BTreeMap<String, usize>,
    pub engagement_stats: Vec<RangeCount>,
    pub top_interests: Vec<NamedCount>,
    pub heatmap_data: Vec<HeatmapCell>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub gender: Option<String>,
    pub age: Option<i32>,
    pub interests: BTreeSet<String>,
    pub notifications: usize,
    pub per_day: Vec<DayCount>,
}

/// Log entries per UTC calendar day, ascending.
pub fn daily(logs: &[NotificationLogEntry]) -> Vec<DayCount> {
    let mut days: BTreeMap<String, usize> = BTreeMap::new();
    for log in logs {
        *days.entry(day_key(log)).or_default() += 1;
    }
    days.into_iter()
        .map(|(date, count)| DayCount { date, count })
        .collect()
}

pub fn overview(logs: &[NotificationLogEntry], devices: &[Device]) -> OverviewStats {
    let mut gender_distribution = BTreeMap::new();
    let mut platform_distribution = BTreeMap::new();
    let mut interest_counts: HashMap<&str, usize> = HashMap::new();
    let mut users = BTreeSet::new();

    for device in devices {
        let gender = device
            .profile
            .gender
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or("unknown");
        *gender_distribution.entry(gender.to_string()).or_default() += 1;

        let platform = device
            .profile
            .platform
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or("unknown");
        *platform_distribution.entry(platform.to_string()).or_default() += 1;

        for interest in &device.profile.interests {
            *interest_counts.entry(interest.as_str()).or_default() += 1;
        }

        if let Some(user_id) = device.profile.user_id.as_deref() {
            users.insert(user_id);
        }
    }

    let mut interests: Vec<NamedCount> = interest_counts
        .into_iter()
        .map(|(name, count)| NamedCount {
            name: name.to_string(),
            count,
        })
        .collect();
    interests.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    let top_interests = interests.iter().take(TOP_INTERESTS).cloned().collect();

    let mut hours: BTreeMap<u8, usize> = BTreeMap::new();
    let mut months: BTreeMap<(i32, u8), usize> = BTreeMap::new();
    let mut weekdays: BTreeMap<u8, usize> = BTreeMap::new();
    let mut heatmap: BTreeMap<(u8, u8), usize> = BTreeMap::new();
    let mut type_distribution = BTreeMap::new();
    for log in logs {
        let sent_at = utc(log.sent_at);
        let weekday = sent_at.weekday().number_from_sunday();
        *hours.entry(sent_at.hour()).or_default() += 1;
        *months
            .entry((sent_at.year(), u8::from(sent_at.month())))
            .or_default() += 1;
        *weekdays.entry(weekday).or_default() += 1;
        *heatmap.entry((weekday, sent_at.hour())).or_default() += 1;
        *type_distribution
            .entry(log.notification_type.to_string())
            .or_default() += 1;
    }

    OverviewStats {
        per_day: daily(logs),
        gender_distribution,
        interests,
        total: logs.len(),
        total_devices: devices.len(),
        total_users: users.len(),
        hourly_distribution: hours
            .into_iter()
            .map(|(hour, count)| HourCount {
                hour: format!("{:02}", hour),
                count,
            })
            .collect(),
        age_distribution: age_buckets(devices),
        type_distribution,
        monthly_stats: months
            .into_iter()
            .map(|((year, month), count)| MonthCount {
                month: format!("{:04}-{:02}", year, month),
                count,
            })
            .collect(),
        weekday_distribution: weekdays
            .into_iter()
            .map(|(day_number, count)| WeekdayCount {
                day: day_name(day_number).to_string(),
                day_number,
                count,
            })
            .collect(),
        platform_distribution,
        engagement_stats: engagement_buckets(logs, devices),
        top_interests,
        heatmap_data: heatmap
            .into_iter()
            .map(|((day_of_week, hour), count)| HeatmapCell {
                hour,
                day_of_week,
                day: day_name(day_of_week).to_string(),
                count,
            })
            .collect(),
    }
}

/// Devices that report a user id, grouped by user, with that user's
/// notification history across all of their tokens.
pub fn per_user(logs: &[NotificationLogEntry], devices: &[Device]) -> Vec<UserStats> {
    let mut users: BTreeMap<&str, (UserStats, BTreeSet<&str>)> = BTreeMap::new();

    for device in devices {
        let Some(user_id) = device.profile.user_id.as_deref() else {
            continue;
        };
        let (_, tokens) = users.entry(user_id).or_insert_with(|| {
            (
                UserStats {
                    user_id: user_id.to_string(),
                    gender: device.profile.gender.clone(),
                    age: device.profile.age,
                    interests: device.profile.interests.clone(),
                    notifications: 0,
                    per_day: Vec::new(),
                },
                BTreeSet::new(),
            )
        });
        tokens.insert(device.token.as_str());
    }

    users
        .into_values()
        .map(|(mut stats, tokens)| {
            let own: Vec<NotificationLogEntry> = logs
                .iter()
                .filter(|l| tokens.contains(l.token.as_str()))
                .cloned()
                .collect();
            stats.notifications = own.len();
            stats.per_day = daily(&own);
            stats
        })
        .collect()
}

fn utc(at: OffsetDateTime) -> OffsetDateTime {
    at.to_offset(UtcOffset::UTC)
}

fn day_name(day_number: u8) -> &'static str {
    DAY_NAMES
        .get(usize::from(day_number).wrapping_sub(1))
        .copied()
        .unwrap_or("Unknown")
}

fn day_key(log: &NotificationLogEntry) -> String {
    let date = utc(log.sent_at).date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Buckets are half-open `[lo, hi)`. Ages outside `[0, 100)` or absent are
/// counted as unknown. Empty buckets are omitted.
fn age_buckets(devices: &[Device]) -> Vec<RangeCount> {
    let mut counts = vec![0usize; AGE_BOUNDARIES.len() - 1];
    let mut unknown = 0usize;

    for device in devices {
        let bucket = device.profile.age.and_then(|age| {
            AGE_BOUNDARIES
                .windows(2)
                .position(|w| age >= w[0] && age < w[1])
        });
        match bucket {
            Some(i) => counts[i] += 1,
            None => unknown += 1,
        }
    }

    let mut ranges: Vec<RangeCount> = AGE_BOUNDARIES
        .windows(2)
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .map(|(w, count)| RangeCount {
            range: format!("{}-{}", w[0], w[1] - 1),
            count,
        })
        .collect();

    if unknown > 0 {
        ranges.push(RangeCount {
            range: UNKNOWN_AGE.to_string(),
            count: unknown,
        });
    }
    ranges
}

/// Devices bucketed by how many notifications their token received.
/// Buckets are half-open, with everything from 100 up in "100+". Empty
/// buckets are omitted.
fn engagement_buckets(logs: &[NotificationLogEntry], devices: &[Device]) -> Vec<RangeCount> {
    let mut per_token: HashMap<&str, usize> = HashMap::new();
    for log in logs {
        *per_token.entry(log.token.as_str()).or_default() += 1;
    }

    let mut counts = vec![0usize; ENGAGEMENT_BOUNDARIES.len() - 1];
    let mut overflow = 0usize;
    for device in devices {
        let received = per_token.get(device.token.as_str()).copied().unwrap_or(0);
        match ENGAGEMENT_BOUNDARIES
            .windows(2)
            .position(|w| received >= w[0] && received < w[1])
        {
            Some(i) => counts[i] += 1,
            None => overflow += 1,
        }
    }

    let mut ranges: Vec<RangeCount> = ENGAGEMENT_BOUNDARIES
        .windows(2)
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .map(|(w, count)| RangeCount {
            range: if w[1] - w[0] == 1 {
                w[0].to_string()
            } else {
                format!("{}-{}", w[0], w[1] - 1)
            },
            count,
        })
        .collect();

    if overflow > 0 {
        ranges.push(RangeCount {
            range: "100+".to_string(),
            count: overflow,
        });
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;
    use crate::testing::device;
    use sqlx::types::{time::OffsetDateTime, uuid::Uuid};
    use time::macros::datetime;

    fn log(token: &str, sent_at: OffsetDateTime, kind: NotificationType) -> NotificationLogEntry {
        NotificationLogEntry {
            id: Uuid::new_v4(),
            token: token.to_string(),
            application_id: Uuid::nil(),
            title: "t".into(),
            body: "b".into(),
            sent_at,
            notification_type: kind,
            filter: None,
        }
    }

    fn profiled(token: &str, user: Option<&str>, gender: Option<&str>, age: Option<i32>, interests: &[&str]) -> Device {
        let mut d = device(token, "tenant-a");
        d.profile.user_id = user.map(str::to_string);
        d.profile.gender = gender.map(str::to_string);
        d.profile.age = age;
        d.profile.interests = interests.iter().map(|s| s.to_string()).collect();
        d
    }

    #[test]
    fn daily_groups_by_utc_day() {
        let logs = vec![
            log("a", datetime!(2024-03-01 23:30 UTC), NotificationType::Broadcast),
            log("b", datetime!(2024-03-02 00:30 +02:00), NotificationType::Broadcast),
            log("c", datetime!(2024-03-02 10:00 UTC), NotificationType::Individual),
        ];

        assert_eq!(
            daily(&logs),
            vec![
                DayCount { date: "2024-03-01".into(), count: 2 },
                DayCount { date: "2024-03-02".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn age_buckets_are_half_open_with_unknown() {
        let devices = vec![
            profiled("a", None, None, Some(17), &[]),
            profiled("b", None, None, Some(18), &[]),
            profiled("c", None, None, Some(24), &[]),
            profiled("d", None, None, Some(65), &[]),
            profiled("e", None, None, None, &[]),
            profiled("f", None, None, Some(100), &[]),
        ];

        let buckets = age_buckets(&devices);
        let as_pairs: Vec<(&str, usize)> = buckets.iter().map(|r| (r.range.as_str(), r.count)).collect();
        assert_eq!(
            as_pairs,
            vec![("0-17", 1), ("18-24", 2), ("65-99", 1), ("Unknown", 2)]
        );
    }

    #[test]
    fn overview_counts_devices_and_logs() {
        let devices = vec![
            profiled("a", Some("u1"), Some("female"), Some(30), &["sports", "music"]),
            profiled("b", Some("u1"), Some("female"), Some(30), &["sports"]),
            profiled("c", Some("u2"), None, None, &["news"]),
        ];
        let logs = vec![
            log("a", datetime!(2024-03-01 09:15 UTC), NotificationType::Broadcast),
            log("b", datetime!(2024-03-01 09:45 UTC), NotificationType::LocationBased),
            log("c", datetime!(2024-03-01 17:00 UTC), NotificationType::Broadcast),
        ];

        let stats = overview(&logs, &devices);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.total_devices, 3);
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.gender_distribution.get("female"), Some(&2));
        assert_eq!(stats.gender_distribution.get("unknown"), Some(&1));
        assert_eq!(stats.interests[0], NamedCount { name: "sports".into(), count: 2 });
        assert_eq!(stats.interests.len(), 3);
        assert_eq!(
            stats.hourly_distribution,
            vec![
                HourCount { hour: "09".into(), count: 2 },
                HourCount { hour: "17".into(), count: 1 },
            ]
        );
        assert_eq!(stats.type_distribution.get("broadcast"), Some(&2));
        assert_eq!(stats.type_distribution.get("location-based"), Some(&1));
    }

    #[test]
    fn overview_time_breakdowns_use_utc() {
        let devices = vec![profiled("a", None, None, None, &[])];
        let logs = vec![
            // Sunday 2024-03-03 in UTC, Monday locally.
            log("a", datetime!(2024-03-04 01:00 +03:00), NotificationType::Broadcast),
            log("a", datetime!(2024-03-03 22:10 UTC), NotificationType::Broadcast),
            log("a", datetime!(2024-04-01 08:00 UTC), NotificationType::Broadcast),
        ];

        let stats = overview(&logs, &devices);
        assert_eq!(
            stats.monthly_stats,
            vec![
                MonthCount { month: "2024-03".into(), count: 2 },
                MonthCount { month: "2024-04".into(), count: 1 },
            ]
        );
        assert_eq!(
            stats.weekday_distribution,
            vec![
                WeekdayCount { day: "Sunday".into(), day_number: 1, count: 2 },
                WeekdayCount { day: "Monday".into(), day_number: 2, count: 1 },
            ]
        );
        assert_eq!(
            stats.heatmap_data,
            vec![
                HeatmapCell { hour: 22, day_of_week: 1, day: "Sunday".into(), count: 2 },
                HeatmapCell { hour: 8, day_of_week: 2, day: "Monday".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn engagement_buckets_count_devices_by_received() {
        let devices = vec![
            profiled("idle", None, None, None, &[]),
            profiled("once", None, None, None, &[]),
            profiled("few", None, None, None, &[]),
            profiled("heavy", None, None, None, &[]),
        ];
        let at = datetime!(2024-03-01 09:00 UTC);
        let mut logs = vec![log("once", at, NotificationType::Broadcast)];
        logs.extend((0..3).map(|_| log("few", at, NotificationType::Broadcast)));
        logs.extend((0..120).map(|_| log("heavy", at, NotificationType::Broadcast)));
        // Logs for tokens no longer registered don't create devices.
        logs.push(log("gone", at, NotificationType::Broadcast));

        let buckets = engagement_buckets(&logs, &devices);
        let as_pairs: Vec<(&str, usize)> = buckets.iter().map(|r| (r.range.as_str(), r.count)).collect();
        assert_eq!(as_pairs, vec![("0", 1), ("1-4", 2), ("100+", 1)]);
    }

    #[test]
    fn platforms_and_top_interests() {
        let mut ios = profiled("a", None, None, None, &[]);
        ios.profile.platform = Some("ios".into());
        let mut android = profiled("b", None, None, None, &[]);
        android.profile.platform = Some("android".into());
        let mut devices = vec![ios, android, profiled("c", None, None, None, &[])];

        let many: Vec<String> = (0..12).map(|i| format!("topic-{:02}", i)).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        devices.push(profiled("d", None, None, None, &refs));
        devices.push(profiled("e", None, None, None, &["topic-05"]));

        let stats = overview(&[], &devices);
        assert_eq!(stats.platform_distribution.get("ios"), Some(&1));
        assert_eq!(stats.platform_distribution.get("android"), Some(&1));
        assert_eq!(stats.platform_distribution.get("unknown"), Some(&3));
        assert_eq!(stats.interests.len(), 12);
        assert_eq!(stats.top_interests.len(), 10);
        assert_eq!(stats.top_interests[0], NamedCount { name: "topic-05".into(), count: 2 });
    }

    #[test]
    fn per_user_merges_tokens() {
        let devices = vec![
            profiled("a", Some("u1"), Some("male"), Some(40), &[]),
            profiled("b", Some("u1"), Some("male"), Some(40), &[]),
            profiled("c", None, None, None, &[]),
        ];
        let logs = vec![
            log("a", datetime!(2024-03-01 09:00 UTC), NotificationType::Broadcast),
            log("b", datetime!(2024-03-02 09:00 UTC), NotificationType::Broadcast),
            log("c", datetime!(2024-03-02 09:00 UTC), NotificationType::Broadcast),
        ];

        let stats = per_user(&logs, &devices);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].user_id, "u1");
        assert_eq!(stats[0].notifications, 2);
        assert_eq!(stats[0].per_day.len(), 2);
    }
}
