use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::lease_store::LeaseStore;

/// How many consecutive renewal failures a keepalive tolerates before
/// it relinquishes ownership so another worker can take over.
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Keeps a per-campaign ownership key alive while this worker drives
/// a background role (janitor, compactor, reconciler or dispatcher).
/// Ownership is claimed with a short-TTL `SET NX` key; this keepalive
/// extends it on a heartbeat and reports loss through a watch channel
/// so the owning loop can stand down.
pub struct OwnershipKeepalive {
    store: Arc<dyn LeaseStore>,
    campaign_id: String,
    role: String,
    owner: String,
    ttl_ms: u64,
    heartbeat_interval: Duration,
}

impl OwnershipKeepalive {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        campaign_id: &str,
        role: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Self {
        OwnershipKeepalive {
            store,
            campaign_id: campaign_id.to_string(),
            role: role.to_string(),
            owner: owner.to_string(),
            ttl_ms,
            // Renew at a third of the TTL so one missed beat does not
            // lose the key.
            heartbeat_interval: Duration::from_millis(ttl_ms / 3),
        }
    }

    /// Starts the heartbeat task. Returns a kill-switch sender and a
    /// watch receiver that flips to `true` when ownership is lost.
    #[instrument(name = "ownership_keepalive_initialiser", skip(self))]
    pub fn start(self: Arc<Self>) -> (oneshot::Sender<()>, watch::Receiver<bool>) {
        let heartbeat_task_span = info_span!(
            "ownership_keepalive_task",
            campaign_id = self.campaign_id.as_str(),
            role = self.role.as_str(),
        );
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (lost_tx, lost_rx) = watch::channel(false);
        tokio::spawn(
            {
                let me = Arc::clone(&self);
                async move {
                    tokio::select! {
                        _ = me.run_heartbeat(lost_tx) => {},
                        _ = kill_rx => {
                            debug!("keepalive kill switch fired, releasing ownership");
                            let _ = me
                                .store
                                .release_ownership(&me.campaign_id, &me.role, &me.owner)
                                .await;
                        }
                    }
                }
            }
            .instrument(heartbeat_task_span),
        );
        (kill_tx, lost_rx)
    }

    async fn run_heartbeat(&self, lost_tx: watch::Sender<bool>) {
        let mut interval = time::interval(self.heartbeat_interval);
        // The first tick fires immediately; skip it so the claim TTL
        // set by the caller is not double-counted.
        interval.tick().await;

        let mut consecutive_failures = 0;
        loop {
            interval.tick().await;
            match self
                .store
                .renew_ownership(&self.campaign_id, &self.role, &self.owner, self.ttl_ms)
                .await
            {
                Ok(true) => {
                    consecutive_failures = 0;
                }
                Ok(false) => {
                    info!(
                        campaign_id = self.campaign_id.as_str(),
                        role = self.role.as_str(),
                        "ownership key was claimed by another worker, standing down"
                    );
                    let _ = lost_tx.send(true);
                    return;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    error!(
                        campaign_id = self.campaign_id.as_str(),
                        role = self.role.as_str(),
                        consecutive_failures,
                        "failed to renew ownership key: {err}"
                    );
                    if consecutive_failures >= MAX_RENEWAL_FAILURES {
                        info!(
                            campaign_id = self.campaign_id.as_str(),
                            role = self.role.as_str(),
                            "relinquishing ownership after repeated renewal failures"
                        );
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        }
    }
}
