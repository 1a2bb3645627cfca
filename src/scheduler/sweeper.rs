//! Periodic timeout sweep for interactive scan sessions.
//!
//! Three timeout classes per tick: expired leases (attempts-capped requeue),
//! silent user heartbeats (force-cancel), and absolute session age
//! (force-expire). Each class is swept independently; an error in one does
//! not stop the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::cache::CoordinationStore;
use crate::scheduler::TaskHandle;
use crate::server::ws::{ScanHub, ScanPush};
use crate::store::Store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// A running session with no user heartbeat for this long is abandoned.
const USER_HEARTBEAT_TIMEOUT: chrono::Duration = chrono::Duration::seconds(60);

/// No session lives longer than this, leased or not.
const MAX_SESSION_AGE: chrono::Duration = chrono::Duration::minutes(15);

pub struct Sweeper {
    store: Arc<Store>,
    cache: Arc<dyn CoordinationStore>,
    hub: Arc<ScanHub>,
}

impl Sweeper {
    pub fn new(store: Arc<Store>, cache: Arc<dyn CoordinationStore>, hub: Arc<ScanHub>) -> Self {
        Self { store, cache, hub }
    }

    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tracing::info!("scan timeout sweeper started");
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            // Skip the immediate first tick; nothing can have timed out yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep_once(Utc::now()).await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::info!("scan timeout sweeper stopped");
        });
        TaskHandle::new(shutdown_tx, handle)
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) {
        self.sweep_expired_leases(now).await;
        self.sweep_silent_users(now).await;
        self.sweep_overage(now).await;
    }

    async fn sweep_expired_leases(&self, now: DateTime<Utc>) {
        let repaired = match self.store.reset_expired_scan_leases(None, now).await {
            Ok(repaired) => repaired,
            Err(err) => {
                tracing::error!("scan lease sweep failed: {err}");
                return;
            }
        };
        for lease in repaired {
            if let Err(err) = self.cache.clear_scan_lease(lease.id).await {
                tracing::warn!(session_id = lease.id, "failed to clear scan lease: {err}");
            }
            if lease.expired {
                tracing::info!(session_id = lease.id, "scan session expired after lease timeouts");
            }
        }
    }

    async fn sweep_silent_users(&self, now: DateTime<Utc>) {
        let cutoff = now - USER_HEARTBEAT_TIMEOUT;
        let silent = match self.store.scans_without_user_heartbeat(cutoff).await {
            Ok(silent) => silent,
            Err(err) => {
                tracing::error!("user heartbeat sweep failed: {err}");
                return;
            }
        };
        for session in silent {
            if let Err(err) = self
                .store
                .cancel_scan(session.id, "user left the scan page", now)
                .await
            {
                tracing::error!(session_id = session.id, "failed to cancel scan: {err}");
                continue;
            }
            if let Some(node) = &session.leased_by_node {
                if let Err(err) = self.cache.release_scan_lease(session.id, node).await {
                    tracing::warn!(session_id = session.id, "lease release on cancel: {err}");
                }
            }
            self.hub.notify_user(
                session.user_id,
                ScanPush::cancelled("cancelled: user left the page"),
            );
        }
    }

    async fn sweep_overage(&self, now: DateTime<Utc>) {
        let cutoff = now - MAX_SESSION_AGE;
        match self.store.expire_overage_scans(cutoff, now).await {
            Ok(0) => {}
            Ok(expired) => tracing::info!(expired, "force-expired over-age scan sessions"),
            Err(err) => tracing::error!("session age sweep failed: {err}"),
        }
    }
}
