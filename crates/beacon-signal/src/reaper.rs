//! Presence reaper
//!
//! Three independent jobs form an escalation ladder over the same store:
//!
//! | Job         | Candidates                         | Action                      |
//! |-------------|------------------------------------|-----------------------------|
//! | ping        | `seen < now - ping_after`          | send ping                   |
//! | reap-client | `seen < now - reap_client_after`   | send bye, delete, commit    |
//! | reap-room   | `active < now - reap_room_after`   | delete, commit              |
//!
//! Each pass uses one `now` snapshot for its whole batch. Every deletion is
//! committed on its own, and a failure on one entity is logged without
//! stopping the rest of the pass.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::ReaperConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::notify::{Notifier, NotifyError};
use crate::store::{PresenceStore, StoreError};
use crate::timer::{PeriodicTask, TaskHandle};

/// Thresholds and job intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperPolicy {
    pub ping_after: Duration,
    pub reap_client_after: Duration,
    pub reap_room_after: Duration,
    pub ping_interval: Duration,
    pub reap_client_interval: Duration,
    pub reap_room_interval: Duration,
}

impl Default for ReaperPolicy {
    fn default() -> Self {
        Self::from(&ReaperConfig::default())
    }
}

impl From<&ReaperConfig> for ReaperPolicy {
    fn from(config: &ReaperConfig) -> Self {
        Self {
            ping_after: config.ping_after(),
            reap_client_after: config.reap_client_after(),
            reap_room_after: config.reap_room_after(),
            ping_interval: config.ping_interval(),
            reap_client_interval: config.reap_client_interval(),
            reap_room_interval: config.reap_room_interval(),
        }
    }
}

/// Outcome of a single pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Entities matched by the stale query
    pub candidates: usize,
    /// Notifications delivered
    pub notified: usize,
    /// Entities deleted (already-gone entities are not counted)
    pub removed: usize,
    /// Per-entity notification or deletion failures
    pub failures: usize,
}

/// Pings and evicts silent clients, evicts idle rooms
pub struct Reaper {
    store: Arc<dyn PresenceStore>,
    notifier: Arc<dyn Notifier>,
    policy: ReaperPolicy,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        notifier: Arc<dyn Notifier>,
        policy: ReaperPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> &ReaperPolicy {
        &self.policy
    }

    /// Ping every client silent for longer than `ping_after`
    pub async fn ping_clients(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let clients = self
            .store
            .clients_seen_before(cutoff(now, self.policy.ping_after))
            .await?;
        let mut report = PassReport {
            candidates: clients.len(),
            ..PassReport::default()
        };

        for client in &clients {
            match self.notifier.send_ping(&client.id).await {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    log_notify_failure(&client.id, "ping", &e);
                    report.failures += 1;
                }
            }
        }

        log_pass("ping clients", &report);
        Ok(report)
    }

    /// Say bye to and delete every client silent for longer than `reap_client_after`
    pub async fn reap_clients(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let clients = self
            .store
            .clients_seen_before(cutoff(now, self.policy.reap_client_after))
            .await?;
        let mut report = PassReport {
            candidates: clients.len(),
            ..PassReport::default()
        };

        for client in &clients {
            // The client is evicted whether or not the bye gets through
            match self.notifier.send_bye(&client.id).await {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    log_notify_failure(&client.id, "bye", &e);
                    report.failures += 1;
                }
            }

            match self.delete_client(&client.id).await {
                Ok(true) => report.removed += 1,
                Ok(false) => debug!(client = %client.id, "Client already removed"),
                Err(e) => {
                    warn!(client = %client.id, error = %e, "Failed to remove client");
                    report.failures += 1;
                }
            }
        }

        log_pass("reap clients", &report);
        Ok(report)
    }

    /// Delete every room inactive for longer than `reap_room_after`
    pub async fn reap_rooms(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let rooms = self
            .store
            .rooms_active_before(cutoff(now, self.policy.reap_room_after))
            .await?;
        let mut report = PassReport {
            candidates: rooms.len(),
            ..PassReport::default()
        };

        for room in &rooms {
            match self.delete_room(&room.id).await {
                Ok(true) => report.removed += 1,
                Ok(false) => debug!(room = %room.id, "Room already removed"),
                Err(e) => {
                    warn!(room = %room.id, error = %e, "Failed to remove room");
                    report.failures += 1;
                }
            }
        }

        log_pass("reap rooms", &report);
        Ok(report)
    }

    async fn delete_client(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self.store.delete_client(id).await?;
        self.store.commit().await?;
        Ok(deleted)
    }

    async fn delete_room(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self.store.delete_room(id).await?;
        self.store.commit().await?;
        Ok(deleted)
    }

    /// Start the three jobs on their own schedules
    pub fn start(self: Arc<Self>) -> ReaperHandles {
        let reaper = self.clone();
        let ping = PeriodicTask::start("ping-clients", self.policy.ping_interval, move || {
            let reaper = reaper.clone();
            async move { reaper.ping_clients(Utc::now()).await.map(|_| ()) }
        });

        let reaper = self.clone();
        let reap_clients =
            PeriodicTask::start("reap-clients", self.policy.reap_client_interval, move || {
                let reaper = reaper.clone();
                async move { reaper.reap_clients(Utc::now()).await.map(|_| ()) }
            });

        let reaper = self.clone();
        let reap_rooms =
            PeriodicTask::start("reap-rooms", self.policy.reap_room_interval, move || {
                let reaper = reaper.clone();
                async move { reaper.reap_rooms(Utc::now()).await.map(|_| ()) }
            });

        info!(
            ping_after = ?self.policy.ping_after,
            reap_client_after = ?self.policy.reap_client_after,
            reap_room_after = ?self.policy.reap_room_after,
            "Presence reaper started"
        );

        ReaperHandles {
            ping,
            reap_clients,
            reap_rooms,
        }
    }
}

/// Handles for the three reaper jobs
pub struct ReaperHandles {
    ping: TaskHandle,
    reap_clients: TaskHandle,
    reap_rooms: TaskHandle,
}

impl ReaperHandles {
    /// Stop scheduling further passes
    pub fn cancel(&self) {
        self.ping.cancel();
        self.reap_clients.cancel();
        self.reap_rooms.cancel();
    }

    /// Cancel and wait for in-flight passes to finish
    pub async fn shutdown(self) {
        self.cancel();
        self.ping.shutdown().await;
        self.reap_clients.shutdown().await;
        self.reap_rooms.shutdown().await;
    }
}

/// `now - age`, or the earliest representable time if that underflows
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn log_notify_failure(client: &str, kind: &str, err: &NotifyError) {
    if err.is_disconnected() {
        debug!(client, kind, "Client has no open connection");
    } else {
        warn!(client, kind, error = %err, "Failed to notify client");
    }
}

fn log_pass(job: &str, report: &PassReport) {
    if report.candidates == 0 {
        debug!(job, "Nothing stale");
    } else {
        info!(
            job,
            candidates = report.candidates,
            notified = report.notified,
            removed = report.removed,
            failures = report.failures,
            "Pass complete"
        );
    }
}
