use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dialcast_campaign::service::{CampaignService, CampaignServiceError};
use dialcast_campaign::types::{CampaignStatus, ContactStatus};
use dialcast_helpers::time::Clock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, info_span, Instrument};

use crate::errors::DispatchError;
use crate::lease_store::{LeaseStore, PauseAction};
use crate::types::{ColdStartState, DispatchConfig, JanitorReport};

/// The result of one reconciliation pass over a campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Contacts stuck in `calling` with no matching lease, moved back
    /// to `pending` and re-enqueued.
    pub requeued: u64,
    /// Leases whose contact the durable store says is settled or
    /// gone, force-released.
    pub released: u64,
    /// Set when the durable store disagreed with Redis beyond what
    /// reconciliation can repair and the campaign was marked failed.
    pub campaign_failed: bool,
}

/// Hosts the per-campaign background loops: janitor, compactor and
/// reconciler. Each tick claims a short-TTL ownership key so exactly
/// one worker in the cluster runs each role per campaign.
pub struct MaintenanceRunner {
    store: Arc<dyn LeaseStore>,
    service: Arc<dyn CampaignService + Send + Sync>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    worker_name: String,
}

impl MaintenanceRunner {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        service: Arc<dyn CampaignService + Send + Sync>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
        worker_name: &str,
    ) -> Self {
        MaintenanceRunner {
            store,
            service,
            clock,
            config,
            worker_name: worker_name.to_string(),
        }
    }

    /// Spawns the three maintenance loops for a campaign. The handles
    /// finish when the shutdown channel fires.
    pub fn spawn_for_campaign(
        self: Arc<Self>,
        campaign_id: &str,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let roles: [(&str, u64); 3] = [
            ("janitor", self.config.janitor_interval_ms),
            ("compactor", self.config.compactor_interval_ms),
            ("reconciler", self.config.reconciler_interval_ms),
        ];

        roles
            .iter()
            .map(|(role, interval_ms)| {
                let runner = Arc::clone(&self);
                let campaign_id = campaign_id.to_string();
                let role = role.to_string();
                let interval_ms = *interval_ms;
                let mut shutdown_rx = shutdown_tx.subscribe();
                let span = info_span!(
                    "maintenance_loop",
                    campaign_id = campaign_id.as_str(),
                    role = role.as_str()
                );
                tokio::spawn(
                    async move {
                        let mut interval = time::interval(Duration::from_millis(interval_ms));
                        loop {
                            tokio::select! {
                                _ = shutdown_rx.recv() => {
                                    info!("received shutdown signal, stopping maintenance loop");
                                    break;
                                }
                                _ = interval.tick() => {
                                    runner.run_role_tick(&campaign_id, &role).await;
                                }
                            }
                        }
                    }
                    .instrument(span),
                )
            })
            .collect()
    }

    async fn run_role_tick(&self, campaign_id: &str, role: &str) {
        let claimed = match self
            .store
            .try_claim_ownership(
                campaign_id,
                role,
                &self.worker_name,
                self.config.ownership_ttl_ms,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!("failed to claim {role} ownership: {err}");
                return;
            }
        };
        if !claimed {
            debug!("another worker owns the {role} role, skipping tick");
            return;
        }

        let result = match role {
            "janitor" => self.janitor_tick(campaign_id).await,
            "compactor" => self.compactor_tick(campaign_id).await,
            "reconciler" => self.reconcile(campaign_id).await.map(|report| {
                if report.requeued > 0 || report.released > 0 {
                    info!(
                        requeued = report.requeued,
                        released = report.released,
                        "reconciler repaired campaign state"
                    );
                }
            }),
            _ => Ok(()),
        };
        if let Err(err) = result {
            error!("{role} tick failed: {err}");
        }
    }

    /// One janitor pass: reap orphaned reservations, clear stale
    /// gates, repair lease set/key desync and complete the campaign
    /// once it has fully drained.
    pub async fn janitor_tick(&self, campaign_id: &str) -> Result<(), DispatchError> {
        let report = self.run_janitor_scan(campaign_id).await?;
        if report.reservations_reaped > 0
            || report.gates_cleared > 0
            || report.desynced_released > 0
        {
            info!(
                reservations_reaped = report.reservations_reaped,
                gates_cleared = report.gates_cleared,
                desynced_released = report.desynced_released,
                "janitor repaired campaign state"
            );
        }
        self.try_complete(campaign_id).await?;
        Ok(())
    }

    /// Completes an active campaign once every contact is terminal and
    /// no scheduling work remains. Returns true when the transition
    /// was applied.
    pub async fn try_complete(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        let campaign = match self.service.get_campaign(campaign_id).await {
            Ok(campaign) => campaign,
            Err(CampaignServiceError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if campaign.status != CampaignStatus::Active {
            return Ok(false);
        }

        for status in [
            ContactStatus::Pending,
            ContactStatus::Queued,
            ContactStatus::Calling,
        ] {
            if self
                .service
                .count_contacts_by_status(campaign_id, status)
                .await?
                > 0
            {
                return Ok(false);
            }
        }

        let snapshot = self.store.snapshot(campaign_id).await?;
        if snapshot.inflight > 0
            || snapshot.reserved > 0
            || snapshot.queued_high > 0
            || snapshot.queued_normal > 0
            || snapshot.scheduled_retries > 0
        {
            return Ok(false);
        }

        self.service
            .update_campaign_status(campaign_id, &[CampaignStatus::Active], CampaignStatus::Completed)
            .await?;
        self.store
            .apply_transition(campaign_id, &["active"], "completed", PauseAction::None)
            .await?;
        info!(campaign_id, "campaign drained, marked completed");
        Ok(true)
    }

    /// Runs the janitor scan and returns its report, used directly by
    /// the on-demand maintenance API.
    pub async fn run_janitor_scan(
        &self,
        campaign_id: &str,
    ) -> Result<JanitorReport, DispatchError> {
        self.store
            .janitor_scan(
                campaign_id,
                self.clock.now_millis(),
                self.config.reservation_orphan_age_ms,
                self.config.stale_gate_age_ms,
            )
            .await
    }

    /// One compactor pass: dedupe both waitlists and trim them to the
    /// per-campaign cap.
    pub async fn compactor_tick(&self, campaign_id: &str) -> Result<(), DispatchError> {
        use dialcast_campaign::types::Priority;
        for priority in [Priority::High, Priority::Normal] {
            let report = self
                .store
                .compact_waitlist(campaign_id, priority, self.config.max_waitlist_length)
                .await?;
            if report.duplicates_removed > 0 || report.trimmed > 0 {
                info!(
                    ?priority,
                    duplicates_removed = report.duplicates_removed,
                    trimmed = report.trimmed,
                    "compactor cleaned waitlist"
                );
            }
        }
        Ok(())
    }

    /// Reconciles Redis against the durable store. The durable store
    /// is ground truth: contacts stuck in `calling` with no lease are
    /// re-enqueued, and leases whose contact is settled or missing are
    /// force-released.
    pub async fn reconcile(&self, campaign_id: &str) -> Result<ReconcileReport, DispatchError> {
        let leases = self.store.active_leases(campaign_id).await?;
        let leased_contacts: HashSet<&str> =
            leases.iter().map(|l| l.contact_id.as_str()).collect();

        let mut report = ReconcileReport::default();

        let calling = self
            .service
            .list_contacts_by_status(campaign_id, ContactStatus::Calling)
            .await?;
        for contact in calling {
            if !leased_contacts.contains(contact.id.as_str()) {
                debug!(
                    contact_id = contact.id.as_str(),
                    "contact is calling with no lease, re-enqueueing"
                );
                self.service
                    .update_contact_status(&contact.id, ContactStatus::Pending, None)
                    .await?;
                self.store
                    .enqueue_contacts(
                        campaign_id,
                        &[(contact.id.clone(), contact.priority)],
                        false,
                    )
                    .await?;
                report.requeued += 1;
            }
        }

        for lease in leases {
            let release = match self.service.get_contact(&lease.contact_id).await {
                Ok(contact) if contact.campaign_id != campaign_id => {
                    // A lease pointing at another campaign's contact is
                    // beyond repair; the durable store wins and the
                    // campaign is taken out of rotation.
                    self.mark_campaign_failed(campaign_id).await?;
                    report.campaign_failed = true;
                    true
                }
                Ok(contact) => contact.status.is_terminal(),
                Err(CampaignServiceError::NotFound(_)) => true,
                Err(err) => return Err(err.into()),
            };
            if release {
                debug!(
                    member = lease.member.as_str(),
                    contact_id = lease.contact_id.as_str(),
                    "lease has no live contact, force-releasing"
                );
                self.store
                    .force_release(campaign_id, &lease.member, true)
                    .await?;
                report.released += 1;
            }
        }

        Ok(report)
    }

    async fn mark_campaign_failed(&self, campaign_id: &str) -> Result<(), DispatchError> {
        error!(
            campaign_id,
            "durable store and scheduling state disagree beyond reconciliation, \
             marking campaign failed"
        );
        self.service
            .update_campaign_status(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Active,
                    CampaignStatus::Paused,
                ],
                CampaignStatus::Failed,
            )
            .await?;
        self.store
            .apply_transition(
                campaign_id,
                &["draft", "scheduled", "active", "paused"],
                "failed",
                PauseAction::Set,
            )
            .await?;
        Ok(())
    }

    /// Runs the cold-start sequence for a campaign (re)start: block
    /// dispatch, reconcile, then mark the campaign warm for 24 hours
    /// so restarts do not repeat the reconciliation.
    /// Returns the reconcile report, or `None` when a previous cold
    /// start already completed recently.
    pub async fn cold_start(
        &self,
        campaign_id: &str,
    ) -> Result<Option<ReconcileReport>, DispatchError> {
        if self.store.coldstart_state(campaign_id).await? == ColdStartState::Done {
            debug!("cold start already completed recently, skipping");
            return Ok(None);
        }

        self.store
            .set_coldstart_block(campaign_id, self.config.coldstart_block_ms)
            .await?;
        let report = self.reconcile(campaign_id).await?;
        self.store
            .mark_coldstart_done(campaign_id, 24 * 60 * 60 * 1000)
            .await?;
        info!(
            requeued = report.requeued,
            released = report.released,
            "cold start reconciliation completed"
        );
        Ok(Some(report))
    }
}
