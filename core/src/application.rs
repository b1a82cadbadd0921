use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use dialcast_campaign::lifecycle;
use dialcast_campaign::service::CampaignService;
use dialcast_campaign::types::{Campaign, CampaignStatus, ContactStatus, RetryAttemptStatus};
use dialcast_dispatch::breaker::CircuitBreaker;
use dialcast_dispatch::carrier::{CarrierProvider, HttpCarrierClient, MockCarrierClient};
use dialcast_dispatch::dispatcher::{CampaignDispatcher, DispatchContext};
use dialcast_dispatch::events::CallEventRouter;
use dialcast_dispatch::invariants::InvariantMonitor;
use dialcast_dispatch::janitor::MaintenanceRunner;
use dialcast_dispatch::lease_store::{
    CampaignKeys, LeaseStore, PauseAction, RedisLeaseStore, SlotSignals,
};
use dialcast_helpers::redis::{get_redis_connection, ConnectionConfig, ConnectionWrapper};
use dialcast_helpers::time::{Clock, DefaultClock};
use nanoid::nanoid;
use redis::{PushInfo, PushKind};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::consts::SCHEDULER_INTERVAL_MS;
use crate::errors::{ApiError, ApplicationStartError};
use crate::operator_api::create_operator_api;
use crate::types::ApiAppState;

/// Owns the per-campaign runtime machinery: spawning dispatcher,
/// maintenance and invariant loops for campaigns this worker drives,
/// and applying lifecycle transitions to the durable store and Redis
/// together.
pub struct CampaignManager {
    ctx: DispatchContext,
    maintenance: Arc<MaintenanceRunner>,
    monitor: Arc<InvariantMonitor>,
    shutdown_tx: broadcast::Sender<()>,
    /// Present when the lease store is Redis-backed; used to subscribe
    /// to each campaign's slot-available channel.
    subscriber: Option<ConnectionWrapper>,
    running: Mutex<HashSet<String>>,
}

impl CampaignManager {
    pub fn new(
        ctx: DispatchContext,
        maintenance: Arc<MaintenanceRunner>,
        monitor: Arc<InvariantMonitor>,
        shutdown_tx: broadcast::Sender<()>,
        subscriber: Option<ConnectionWrapper>,
    ) -> Self {
        CampaignManager {
            ctx,
            maintenance,
            monitor,
            shutdown_tx,
            subscriber,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Spawns the dispatcher, maintenance loops and invariant monitor
    /// for a campaign if they are not already running in this worker.
    pub async fn ensure_running(&self, campaign_id: &str) {
        {
            let mut running = self.running.lock().expect("lock should not be poisoned");
            if !running.insert(campaign_id.to_string()) {
                return;
            }
        }

        if let Some(conn) = &self.subscriber {
            let channel = CampaignKeys::new(campaign_id).slot_channel();
            let mut conn = conn.clone();
            if let Err(err) = conn.subscribe(&channel).await {
                warn!(campaign_id, "failed to subscribe to slot channel: {err}");
            }
        }

        let dispatcher =
            CampaignDispatcher::new(self.ctx.clone(), campaign_id, self.shutdown_tx.clone());
        tokio::spawn(async move { dispatcher.run().await });

        self.maintenance
            .clone()
            .spawn_for_campaign(campaign_id, &self.shutdown_tx);

        let monitor = self.monitor.clone();
        let monitor_campaign = campaign_id.to_string();
        let monitor_shutdown = self.shutdown_tx.clone();
        tokio::spawn(async move { monitor.run(&monitor_campaign, &monitor_shutdown).await });

        info!(campaign_id, "campaign runtime loops started");
    }

    /// Activates a campaign: durable CAS to `active`, Redis state
    /// mirror and limit, queueing of pending contacts, cold-start
    /// reconciliation and runtime loop startup.
    /// Returns a conflict for campaigns that are not startable.
    pub async fn activate(&self, campaign_id: &str) -> Result<Campaign, ApiError> {
        let campaign = self.ctx.service.get_campaign(campaign_id).await?;
        if !lifecycle::startable(campaign.status) {
            return Err(ApiError::Conflict(format!(
                "campaign \"{campaign_id}\" cannot start from {:?}",
                campaign.status
            )));
        }

        let updated = self
            .ctx
            .service
            .update_campaign_status(
                campaign_id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::Active,
            )
            .await?;

        self.ctx
            .store
            .set_limit(campaign_id, campaign.limit.max(1))
            .await?;
        self.ctx
            .store
            .apply_transition(
                campaign_id,
                &["draft", "scheduled"],
                "active",
                PauseAction::Clear,
            )
            .await?;

        let pending = self
            .ctx
            .service
            .list_contacts_by_status(campaign_id, ContactStatus::Pending)
            .await?;
        if !pending.is_empty() {
            let entries: Vec<(String, dialcast_campaign::types::Priority)> = pending
                .iter()
                .map(|contact| (contact.id.clone(), contact.priority))
                .collect();
            self.ctx
                .store
                .enqueue_contacts(campaign_id, &entries, false)
                .await?;
            for contact in &pending {
                self.ctx
                    .service
                    .update_contact_status(&contact.id, ContactStatus::Queued, None)
                    .await?;
            }
            info!(campaign_id, queued = pending.len(), "pending contacts queued");
        }

        self.maintenance.cold_start(campaign_id).await?;
        self.ensure_running(campaign_id).await;

        Ok(updated)
    }

    pub async fn pause(&self, campaign_id: &str) -> Result<Campaign, ApiError> {
        let updated = self
            .ctx
            .service
            .update_campaign_status(campaign_id, &[CampaignStatus::Active], CampaignStatus::Paused)
            .await?;
        // In-flight calls keep running; the pause flag only stops new
        // promotion batches.
        self.ctx
            .store
            .apply_transition(campaign_id, &["active"], "paused", PauseAction::Set)
            .await?;
        Ok(updated)
    }

    pub async fn resume(&self, campaign_id: &str) -> Result<Campaign, ApiError> {
        let updated = self
            .ctx
            .service
            .update_campaign_status(campaign_id, &[CampaignStatus::Paused], CampaignStatus::Active)
            .await?;
        self.ctx
            .store
            .apply_transition(campaign_id, &["paused"], "active", PauseAction::Clear)
            .await?;
        self.ensure_running(campaign_id).await;
        Ok(updated)
    }

    /// Cancels a campaign: future retry jobs are dropped, new
    /// promotion is stopped, and in-flight calls drain naturally.
    pub async fn cancel(&self, campaign_id: &str) -> Result<Campaign, ApiError> {
        let updated = self
            .ctx
            .service
            .update_campaign_status(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Active,
                    CampaignStatus::Paused,
                ],
                CampaignStatus::Cancelled,
            )
            .await?;

        self.ctx
            .store
            .apply_transition(
                campaign_id,
                &["draft", "scheduled", "active", "paused"],
                "cancelled",
                PauseAction::Set,
            )
            .await?;

        let dropped = self
            .ctx
            .store
            .cancel_scheduled_retries(campaign_id)
            .await?;
        let scheduled = self
            .ctx
            .service
            .list_retry_attempts_by_status(campaign_id, RetryAttemptStatus::Scheduled)
            .await?;
        for attempt in scheduled {
            self.ctx
                .service
                .update_retry_attempt_status(&attempt.id, RetryAttemptStatus::Cancelled)
                .await?;
        }

        info!(campaign_id, dropped_retry_jobs = dropped, "campaign cancelled");
        Ok(updated)
    }

    /// One scheduler pass: activates scheduled campaigns whose start
    /// time has elapsed and which have contacts to dial.
    pub async fn run_scheduler_tick(&self) {
        let scheduled = match self
            .ctx
            .service
            .list_campaigns_by_status(CampaignStatus::Scheduled)
            .await
        {
            Ok(scheduled) => scheduled,
            Err(err) => {
                error!("failed to list scheduled campaigns: {err}");
                return;
            }
        };

        for campaign in scheduled {
            let now_ms = self.ctx.clock.now_millis();
            let has_contacts = match self
                .ctx
                .service
                .count_contacts_by_status(&campaign.id, ContactStatus::Pending)
                .await
            {
                Ok(count) => count > 0,
                Err(err) => {
                    error!(
                        campaign_id = campaign.id.as_str(),
                        "failed to count pending contacts: {err}"
                    );
                    continue;
                }
            };

            if lifecycle::validate_transition(&campaign, CampaignStatus::Active, now_ms, has_contacts)
                .is_ok()
            {
                info!(
                    campaign_id = campaign.id.as_str(),
                    "scheduled campaign is due, activating"
                );
                if let Err(err) = self.activate(&campaign.id).await {
                    error!(
                        campaign_id = campaign.id.as_str(),
                        "failed to activate scheduled campaign: {err}"
                    );
                }
            }
        }
    }
}

/// The runtime application: wires the Redis-backed lease store, the
/// carrier provider, the campaign manager and the operator API, and
/// runs them until shutdown.
pub struct Application {
    runtime_config: RuntimeConfig,
    service: Arc<dyn CampaignService + Send + Sync>,
    shutdown_tx: broadcast::Sender<()>,
    operator_api: Option<Router>,
    manager: Option<Arc<CampaignManager>>,
}

impl Application {
    pub fn new(
        runtime_config: RuntimeConfig,
        service: Arc<dyn CampaignService + Send + Sync>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Application {
            runtime_config,
            service,
            shutdown_tx,
            operator_api: None,
            manager: None,
        }
    }

    /// Connects to Redis and assembles the runtime: stores, carrier,
    /// manager and the operator API router. Resumes loops for
    /// campaigns that were active before a restart.
    pub async fn setup(&mut self) -> Result<(), ApplicationStartError> {
        let conn_config = ConnectionConfig {
            nodes: self.runtime_config.redis_nodes.clone(),
            password: self.runtime_config.redis_password.clone(),
            cluster_mode: self.runtime_config.redis_cluster_mode,
        };

        let (push_tx, push_rx) = mpsc::unbounded_channel::<PushInfo>();
        let connection = get_redis_connection(&conn_config, Some(push_tx)).await?;

        let signals = Arc::new(SlotSignals::new());
        spawn_push_pump(push_rx, signals.clone());

        let store: Arc<dyn LeaseStore> = Arc::new(RedisLeaseStore::new(
            connection.clone(),
            signals,
            self.runtime_config.dispatch.fairness_ratio,
        ));

        let carrier = match &self.runtime_config.carrier {
            Some(carrier_config) => {
                let client = HttpCarrierClient::new(carrier_config.clone()).map_err(|err| {
                    ApplicationStartError::Environment(format!(
                        "failed to build carrier client: {err}"
                    ))
                })?;
                Arc::new(CarrierProvider::Http(client))
            }
            None => {
                warn!("no carrier configured, using the mock carrier");
                Arc::new(CarrierProvider::Mock(MockCarrierClient::new()))
            }
        };

        let clock: Arc<dyn Clock> = Arc::new(DefaultClock::new());
        let dispatch_config = self.runtime_config.dispatch.clone();
        let breaker = Arc::new(CircuitBreaker::new(store.clone(), &dispatch_config));
        let events = Arc::new(CallEventRouter::new());

        let ctx = DispatchContext {
            store: store.clone(),
            service: self.service.clone(),
            carrier,
            events,
            breaker,
            clock: clock.clone(),
            config: dispatch_config.clone(),
        };

        let worker_name = format!("{}-{}", self.runtime_config.service_name, nanoid!(8));
        let maintenance = Arc::new(MaintenanceRunner::new(
            store.clone(),
            self.service.clone(),
            clock.clone(),
            dispatch_config.clone(),
            &worker_name,
        ));
        let monitor = Arc::new(InvariantMonitor::new(store.clone(), dispatch_config));

        let manager = Arc::new(CampaignManager::new(
            ctx,
            maintenance.clone(),
            monitor,
            self.shutdown_tx.clone(),
            Some(connection),
        ));

        // Resume loops for campaigns that were active before this
        // worker (re)started.
        let active = self
            .service
            .list_campaigns_by_status(CampaignStatus::Active)
            .await
            .map_err(|err| ApplicationStartError::Environment(err.to_string()))?;
        for campaign in active {
            manager.ensure_running(&campaign.id).await;
        }

        let api_state = Arc::new(ApiAppState {
            service: self.service.clone(),
            store,
            maintenance,
            manager: manager.clone(),
            clock,
        });
        self.operator_api = Some(create_operator_api(api_state));
        self.manager = Some(manager);

        Ok(())
    }

    /// Serves the operator API and runs the campaign scheduler until
    /// the shutdown channel fires.
    pub async fn run(&self) -> Result<(), ApplicationStartError> {
        let router = self
            .operator_api
            .clone()
            .ok_or_else(|| {
                ApplicationStartError::Environment(
                    "application has not been set up, call setup() first".to_string(),
                )
            })?;
        let manager = self.manager.clone().ok_or_else(|| {
            ApplicationStartError::Environment(
                "application has not been set up, call setup() first".to_string(),
            )
        })?;

        let scheduler_shutdown = self.shutdown_tx.subscribe();
        let scheduler_handle = tokio::spawn(run_campaign_scheduler(manager, scheduler_shutdown));

        let host = if self.runtime_config.server_loopback_only.unwrap_or(true) {
            "127.0.0.1"
        } else {
            "0.0.0.0"
        };
        let addr = format!("{host}:{}", self.runtime_config.server_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|err| ApplicationStartError::Environment(err.to_string()))?;
        info!(addr, "operator API server listening");

        let mut server_shutdown = self.shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await
            .map_err(|err| ApplicationStartError::Environment(err.to_string()))?;

        scheduler_handle.await?;
        Ok(())
    }

    /// Signals every loop in the worker to stop. Dispatchers stop
    /// initiating new attempts; in-flight calls drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn run_campaign_scheduler(
    manager: Arc<CampaignManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = time::interval(Duration::from_millis(SCHEDULER_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("received shutdown signal, stopping campaign scheduler");
                break;
            }
            _ = interval.tick() => {
                manager.run_scheduler_tick().await;
            }
        }
    }
}

/// Forwards slot-available pub/sub pushes from the Redis connection
/// into the per-campaign wake-up channels.
fn spawn_push_pump(mut push_rx: mpsc::UnboundedReceiver<PushInfo>, signals: Arc<SlotSignals>) {
    tokio::spawn(async move {
        while let Some(push) = push_rx.recv().await {
            if push.kind != PushKind::Message {
                continue;
            }
            if let Some(redis::Value::BulkString(channel)) = push.data.first() {
                if let Ok(channel) = String::from_utf8(channel.clone()) {
                    signals.notify_channel(&channel);
                }
            }
        }
    });
}
