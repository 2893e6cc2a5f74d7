use sqlx::types::time::OffsetDateTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::oneshot, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    metrics, models::ScheduledNotification, repository::ScheduledNotificationRepository,
    service::NotificationService,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    pub left_pending: usize,
}

/// Polls for due scheduled notifications and sends them one at a time,
/// oldest `send_at` first.
///
/// A record becomes `sent` once its dispatch returns, whatever the delivery
/// counts were. If the dispatch itself fails (for example the tenant has no
/// credential) the record stays `pending` and is picked up again next tick.
pub struct ScheduledDispatchLoop {
    service: Arc<NotificationService>,
    scheduled: Arc<dyn ScheduledNotificationRepository>,
}

impl ScheduledDispatchLoop {
    pub fn new(
        service: Arc<NotificationService>,
        scheduled: Arc<dyn ScheduledNotificationRepository>,
    ) -> Self {
        Self { service, scheduled }
    }

    /// One poll. Never fails; problems are logged and retried next tick.
    pub async fn tick(&self, now: OffsetDateTime) -> TickReport {
        metrics::SCHEDULER_TICKS.inc();

        let due = match self.scheduled.due_scheduled(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to fetch due scheduled notifications");
                return TickReport::default();
            }
        };

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            debug!("No scheduled notifications due");
            return report;
        }
        info!(count = due.len(), "Processing due scheduled notifications");

        for notification in &due {
            if self.process(notification).await {
                report.sent += 1;
            } else {
                report.left_pending += 1;
            }
        }

        info!(
            sent = report.sent,
            left_pending = report.left_pending,
            "Scheduler tick finished"
        );
        report
    }

    async fn process(&self, notification: &ScheduledNotification) -> bool {
        match self.service.dispatch_scheduled(notification).await {
            Ok(Some(result)) => {
                info!(
                    id = %notification.id,
                    success = result.success_count,
                    failure = result.failure_count,
                    tenants = result.tenants_attempted,
                    "Sent scheduled notification"
                );
            }
            Ok(None) => {
                info!(id = %notification.id, "No matching devices for scheduled notification");
            }
            Err(e) => {
                error!(
                    id = %notification.id,
                    tenant_id = e.tenant_id().unwrap_or("-"),
                    error = %e,
                    "Scheduled notification failed, leaving it pending"
                );
                return false;
            }
        }

        match self.scheduled.mark_sent(notification.id).await {
            Ok(true) => {
                metrics::SCHEDULED_PROCESSED.inc();
                true
            }
            Ok(false) => {
                warn!(id = %notification.id, "Scheduled notification was no longer pending");
                true
            }
            Err(e) => {
                error!(id = %notification.id, error = %e, "Failed to mark scheduled notification sent");
                false
            }
        }
    }

    /// Runs `tick` every `interval` on a background task until stopped.
    pub fn start(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs_f64(), "Scheduler started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.tick(OffsetDateTime::now_utc()).await;
                    }
                }
            }

            info!("Scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Lets an in-progress tick finish, then ends the loop.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }
}
