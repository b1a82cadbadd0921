use std::sync::Arc;
use std::time::Duration;

use dialcast_campaign::service::{CampaignService, CampaignServiceError};
use dialcast_campaign::types::{
    CallLog, CallOutcome, Campaign, Contact, ContactStatus, RetryAttemptStatus,
};
use dialcast_helpers::retries::{calculate_backoff_ms, first_attempt_jitter_ms, BackoffConfig};
use dialcast_helpers::time::Clock;
use nanoid::nanoid;
use opentelemetry::trace::SpanKind;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::admission::AdmissionController;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::carrier::{CarrierClient, CarrierError, CarrierProvider, DialSpec};
use crate::errors::DispatchError;
use crate::events::{CallEvent, CallEventRouter};
use crate::lease_store::LeaseStore;
use crate::ownership::OwnershipKeepalive;
use crate::retry::{FailureKind, RetryDecision, RetryScheduler};
use crate::types::{pre_dial_member, DispatchConfig, ReservedContact};

/// The shared collaborators a dispatcher needs, passed explicitly
/// rather than held as process globals.
pub struct DispatchContext {
    pub store: Arc<dyn LeaseStore>,
    pub service: Arc<dyn CampaignService + Send + Sync>,
    pub carrier: Arc<CarrierProvider>,
    pub events: Arc<CallEventRouter>,
    pub breaker: Arc<CircuitBreaker>,
    pub clock: Arc<dyn Clock>,
    pub config: DispatchConfig,
}

impl Clone for DispatchContext {
    fn clone(&self) -> Self {
        DispatchContext {
            store: self.store.clone(),
            service: self.service.clone(),
            carrier: self.carrier.clone(),
            events: self.events.clone(),
            breaker: self.breaker.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }
}

/// How one dispatch attempt ended, from the dispatcher's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The janitor reaped the reservation before conversion; nothing
    /// was dialed and no lease is held.
    ReservationGone,
    /// Another worker already dialed this contact within the
    /// idempotency window; the slot was released immediately.
    Deduplicated,
    /// The contact reached a terminal state before the dial; the slot
    /// was released.
    ContactSettled,
    /// The call completed normally.
    Completed,
    /// The attempt failed with the given kind; the retry decision
    /// records what happens next.
    Failed {
        kind: FailureKind,
        retry: RetryDecision,
    },
}

// How the pre-dial supervision phase ended.
enum PreDialResult {
    Answered,
    TimedOut,
    LeaseLost,
    Ended(CallEvent),
}

// How the active supervision phase ended.
enum ActiveResult {
    Ended(CallEvent),
    MaxDurationReached,
    LeaseLost,
}

// Why the owned dispatch loop returned control to the ownership loop.
enum DispatchExit {
    Shutdown,
    OwnershipLost,
}

/// A long-running cooperative loop dispatching one campaign: fires due
/// retries, requests promotion batches, and supervises each granted
/// attempt through its lease lifecycle.
pub struct CampaignDispatcher {
    ctx: DispatchContext,
    campaign_id: String,
    admission: AdmissionController,
    retry_scheduler: RetryScheduler,
    shutdown_tx: broadcast::Sender<()>,
}

impl CampaignDispatcher {
    pub fn new(
        ctx: DispatchContext,
        campaign_id: &str,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let admission = AdmissionController::new(
            ctx.store.clone(),
            ctx.clock.clone(),
            ctx.config.clone(),
        );
        let retry_scheduler = RetryScheduler::new(
            ctx.store.clone(),
            ctx.service.clone(),
            ctx.clock.clone(),
            ctx.config.clone(),
        );
        CampaignDispatcher {
            ctx,
            campaign_id: campaign_id.to_string(),
            admission,
            retry_scheduler,
            shutdown_tx,
        }
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    /// Runs the dispatch loop until shutdown. One worker dispatches a
    /// campaign at a time: the loop holds a short-TTL ownership key
    /// with a keepalive and stands down when the key is lost, letting
    /// another worker take over.
    pub async fn run(&self) {
        let owner = format!("dispatcher-{}", nanoid!(8));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Spread competing promoters so campaign start does not
        // stampede the lease store.
        let initial_jitter = first_attempt_jitter_ms(2_000);
        time::sleep(Duration::from_millis(initial_jitter)).await;

        async {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    info!("received shutdown signal, stopping dispatcher");
                    break;
                }

                let ttl_ms = self.ctx.config.ownership_ttl_ms;
                let claimed = match self
                    .ctx
                    .store
                    .try_claim_ownership(&self.campaign_id, "dispatcher", &owner, ttl_ms)
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(err) => {
                        error!("failed to claim dispatcher ownership: {err}");
                        time::sleep(Duration::from_millis(
                            self.ctx.config.blocked_poll_interval_ms,
                        ))
                        .await;
                        continue;
                    }
                };
                if !claimed {
                    debug!("another worker dispatches this campaign, standing by");
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("received shutdown signal, stopping dispatcher");
                            break;
                        }
                        _ = time::sleep(Duration::from_millis(ttl_ms / 2)) => {}
                    }
                    continue;
                }

                let keepalive = Arc::new(OwnershipKeepalive::new(
                    self.ctx.store.clone(),
                    &self.campaign_id,
                    "dispatcher",
                    &owner,
                    ttl_ms,
                ));
                let (kill_tx, lost_rx) = keepalive.start();

                let exit = self.dispatch_while_owner(&mut shutdown_rx, lost_rx).await;
                let _ = kill_tx.send(());

                match exit {
                    DispatchExit::Shutdown => break,
                    DispatchExit::OwnershipLost => {
                        info!("dispatcher ownership lost, standing down");
                    }
                }
            }
        }
        .instrument(info_span!(
            "campaign_dispatcher",
            campaign_id = self.campaign_id.as_str()
        ))
        .await
    }

    /// The dispatch loop proper, run while this worker owns the
    /// campaign. Pause, circuit-open and cold-start conditions are
    /// level-triggered: they are re-checked every iteration rather
    /// than reacted to once.
    async fn dispatch_while_owner(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        lost_rx: watch::Receiver<bool>,
    ) -> DispatchExit {
        let mut slot_rx = self.ctx.store.slot_signal(&self.campaign_id);
        let promoter_backoff = BackoffConfig::default();
        let mut backoff_attempt: u32 = 0;
        let mut last_seen_seq: u64 = 0;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("received shutdown signal, stopping dispatcher");
                return DispatchExit::Shutdown;
            }
            if *lost_rx.borrow() {
                return DispatchExit::OwnershipLost;
            }

            match self.blocked_reason().await {
                Ok(Some(reason)) => {
                    debug!(reason, "dispatch blocked, waiting");
                    time::sleep(Duration::from_millis(
                        self.ctx.config.blocked_poll_interval_ms,
                    ))
                    .await;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    error!("failed to read dispatch flags: {err}");
                    time::sleep(Duration::from_millis(
                        self.ctx.config.blocked_poll_interval_ms,
                    ))
                    .await;
                    continue;
                }
            }

            if let Err(err) = self.pump_due_retries().await {
                error!("failed to pump due retries: {err}");
            }

            let (max_batch, probe) = match self.ctx.breaker.state(&self.campaign_id).await {
                Ok(BreakerState::Closed) => (self.ctx.config.max_batch, false),
                Ok(BreakerState::HalfOpenProbe) => (1, true),
                Ok(BreakerState::Open) => {
                    debug!("carrier circuit open, holding dispatch");
                    time::sleep(Duration::from_millis(
                        self.ctx.config.blocked_poll_interval_ms,
                    ))
                    .await;
                    continue;
                }
                Err(err) => {
                    error!("failed to read circuit breaker: {err}");
                    time::sleep(Duration::from_millis(
                        self.ctx.config.blocked_poll_interval_ms,
                    ))
                    .await;
                    continue;
                }
            };

            let outcome = match self
                .admission
                .request_batch(&self.campaign_id, max_batch, &mut last_seen_seq)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!("promotion batch request failed: {err}");
                    let wait = calculate_backoff_ms(&promoter_backoff, backoff_attempt);
                    backoff_attempt = backoff_attempt.saturating_add(1);
                    time::sleep(Duration::from_millis(wait)).await;
                    continue;
                }
            };

            if outcome.granted.is_empty() {
                // No capacity or nothing queued: sleep until a slot
                // release wakes us or the backoff timer fires.
                let wait = calculate_backoff_ms(&promoter_backoff, backoff_attempt);
                backoff_attempt = backoff_attempt.saturating_add(1);
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("received shutdown signal, stopping dispatcher");
                        return DispatchExit::Shutdown;
                    }
                    result = slot_rx.recv() => {
                        if result.is_err() {
                            // Lagged or closed; resubscribe.
                            slot_rx = self.ctx.store.slot_signal(&self.campaign_id);
                        }
                    }
                    _ = time::sleep(Duration::from_millis(wait)) => {}
                }
                continue;
            }

            backoff_attempt = 0;
            for reserved in outcome.granted {
                let dispatcher = self.clone_for_attempt();
                let attempt_span = info_span!(
                    "dispatch_attempt",
                    campaign_id = self.campaign_id.as_str(),
                    contact_id = reserved.contact_id.as_str(),
                    "otel.kind" = ?SpanKind::Client,
                );
                tokio::spawn(
                    async move {
                        match dispatcher.run_attempt(&reserved, probe).await {
                            Ok(outcome) => {
                                debug!("attempt finished: {outcome:?}");
                            }
                            Err(err) => {
                                error!("attempt failed: {err}");
                            }
                        }
                    }
                    .instrument(attempt_span),
                );
            }
        }
    }

    fn clone_for_attempt(&self) -> CampaignDispatcher {
        CampaignDispatcher::new(self.ctx.clone(), &self.campaign_id, self.shutdown_tx.clone())
    }

    /// The level-triggered conditions that suspend dispatch entirely.
    async fn blocked_reason(&self) -> Result<Option<&'static str>, DispatchError> {
        if self.ctx.store.is_paused(&self.campaign_id).await? {
            return Ok(Some("paused"));
        }
        if self.ctx.store.coldstart_state(&self.campaign_id).await?
            == crate::types::ColdStartState::Blocked
        {
            return Ok(Some("cold-start"));
        }
        Ok(None)
    }

    /// Moves due retry jobs back onto their waitlists and records the
    /// firing durably. Safe to run on every iteration and from
    /// multiple workers; the move is atomic in the store.
    async fn pump_due_retries(&self) -> Result<(), DispatchError> {
        let fired = self
            .ctx
            .store
            .fire_due_retries(&self.campaign_id, self.ctx.clock.now_millis())
            .await?;
        if fired.is_empty() {
            return Ok(());
        }

        let fired_ids: Vec<&str> = fired.iter().map(|f| f.contact_id.as_str()).collect();
        info!(count = fired.len(), "retry jobs fired back onto waitlists");

        for contact_id in &fired_ids {
            self.ctx
                .service
                .update_contact_status(contact_id, ContactStatus::Queued, None)
                .await?;
        }

        let scheduled = self
            .ctx
            .service
            .list_retry_attempts_by_status(&self.campaign_id, RetryAttemptStatus::Scheduled)
            .await?;
        for attempt in scheduled {
            if fired_ids.contains(&attempt.contact_id.as_str()) {
                self.ctx
                    .service
                    .update_retry_attempt_status(&attempt.id, RetryAttemptStatus::Fired)
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs one dispatch attempt through its full lifecycle:
    /// reservation conversion, idempotency check, dial, pre-dial
    /// supervision, promotion on answer, active supervision, release
    /// and outcome settlement.
    pub async fn run_attempt(
        &self,
        reserved: &ReservedContact,
        probe: bool,
    ) -> Result<AttemptOutcome, DispatchError> {
        let call_id = nanoid!();
        let token = nanoid!();
        let member = pre_dial_member(&call_id);
        let config = &self.ctx.config;

        let pre_ttl_ms =
            config.pre_dial_base_ms + first_attempt_jitter_ms(config.pre_dial_jitter_ms);

        let converted = self
            .ctx
            .store
            .convert_reservation(
                &self.campaign_id,
                &reserved.contact_id,
                reserved.origin,
                &call_id,
                &token,
                pre_ttl_ms,
            )
            .await?;
        if !converted {
            debug!("reservation was reaped before conversion");
            return Ok(AttemptOutcome::ReservationGone);
        }
        // The pre-dial budget runs from conversion; promotion must
        // happen before it elapses or the lease is force-released.
        let pre_dial_deadline = self.ctx.clock.now_millis() + config.pre_dial_max_ms;

        let contact = match self.ctx.service.get_contact(&reserved.contact_id).await {
            Ok(contact) => contact,
            Err(CampaignServiceError::NotFound(_)) => {
                warn!("contact vanished from the durable store, releasing slot");
                self.ctx
                    .store
                    .release(&self.campaign_id, &member, &token, true)
                    .await?;
                return Ok(AttemptOutcome::ContactSettled);
            }
            Err(err) => return Err(err.into()),
        };
        if contact.status.is_terminal() {
            self.ctx
                .store
                .release(&self.campaign_id, &member, &token, true)
                .await?;
            return Ok(AttemptOutcome::ContactSettled);
        }

        let now_ms = self.ctx.clock.now_millis();
        let bucket = now_ms / config.dial_idempotency_ttl_ms;
        let claimed = self
            .ctx
            .store
            .try_claim_dial(&contact.id, bucket, config.dial_idempotency_ttl_ms)
            .await?;
        if !claimed {
            info!("dial already placed within the idempotency window, releasing");
            self.ctx
                .store
                .release(&self.campaign_id, &member, &token, true)
                .await?;
            return Ok(AttemptOutcome::Deduplicated);
        }

        let campaign = self.ctx.service.get_campaign(&self.campaign_id).await?;
        self.ctx
            .service
            .update_contact_status(&contact.id, ContactStatus::Calling, None)
            .await?;

        let mut events_rx = self.ctx.events.register(&call_id);
        let started_ms = self.ctx.clock.now_millis();

        let dial_spec = DialSpec {
            // The carrier resolves pool references to concrete
            // outbound numbers.
            from: campaign.phone_pool_ref.clone(),
            to: contact.phone_number.clone(),
            caller_id: campaign.phone_pool_ref.clone(),
            app_ref: campaign.agent_ref.clone(),
            correlation_id: call_id.clone(),
        };

        let dial_result = match self.ctx.carrier.dial(&dial_spec).await {
            Ok(result) => result,
            Err(err) => {
                self.ctx.events.deregister(&call_id);
                self.ctx
                    .store
                    .release(&self.campaign_id, &member, &token, true)
                    .await?;
                return self
                    .settle_dial_rejection(&campaign, &contact, &call_id, err, started_ms)
                    .await;
            }
        };

        if probe {
            // The half-open probe succeeded; close the breaker fully.
            self.ctx.breaker.record_success(&self.campaign_id).await?;
        }

        // Carrier accepted: single pre-dial renewal out to the rest of
        // the pre-dial budget, so the lease survives ringing for as
        // long as supervision is prepared to wait for an answer.
        let renew_ttl = pre_dial_deadline.saturating_sub(self.ctx.clock.now_millis());
        if renew_ttl > 0 {
            self.ctx
                .store
                .renew(&self.campaign_id, &member, &token, renew_ttl)
                .await?;
        }

        let pre_dial_result = self
            .supervise_pre_dial(&mut events_rx, &call_id, &token, pre_dial_deadline)
            .await?;

        let outcome = match pre_dial_result {
            PreDialResult::Answered => {
                let active_result = self
                    .supervise_active(&mut events_rx, &call_id, &token, &dial_result.carrier_id)
                    .await?;
                self.ctx
                    .store
                    .release(&self.campaign_id, &call_id, &token, true)
                    .await?;
                match active_result {
                    ActiveResult::Ended(event) => {
                        self.settle_call_end(
                            &campaign,
                            &contact,
                            &call_id,
                            &dial_result.carrier_id,
                            &event,
                            started_ms,
                        )
                        .await?
                    }
                    ActiveResult::MaxDurationReached => {
                        self.record_call_log(
                            &campaign,
                            &contact,
                            &call_id,
                            Some(&dial_result.carrier_id),
                            CallOutcome::Completed,
                            Some("max duration reached".to_string()),
                            started_ms,
                        )
                        .await?;
                        self.ctx
                            .service
                            .update_contact_status(&contact.id, ContactStatus::Completed, None)
                            .await?;
                        AttemptOutcome::Completed
                    }
                    ActiveResult::LeaseLost => {
                        // The lease expired while the call was live; the
                        // carrier call is torn down and the contact is
                        // retried as a network failure.
                        let _ = self.ctx.carrier.hangup(&dial_result.carrier_id).await;
                        self.settle_failure(
                            &campaign,
                            &contact,
                            &call_id,
                            Some(&dial_result.carrier_id),
                            FailureKind::NetworkError,
                            started_ms,
                        )
                        .await?
                    }
                }
            }
            PreDialResult::Ended(event) => {
                self.ctx
                    .store
                    .release(&self.campaign_id, &member, &token, true)
                    .await?;
                self.settle_call_end(
                    &campaign,
                    &contact,
                    &call_id,
                    &dial_result.carrier_id,
                    &event,
                    started_ms,
                )
                .await?
            }
            PreDialResult::TimedOut => {
                // Forced release: promotion did not happen within the
                // pre-dial budget.
                warn!("pre-dial budget elapsed without an answer, forcing release");
                let _ = self.ctx.carrier.hangup(&dial_result.carrier_id).await;
                self.ctx
                    .store
                    .release(&self.campaign_id, &member, &token, true)
                    .await?;
                self.settle_failure(
                    &campaign,
                    &contact,
                    &call_id,
                    Some(&dial_result.carrier_id),
                    FailureKind::NoAnswer,
                    started_ms,
                )
                .await?
            }
            PreDialResult::LeaseLost => {
                let _ = self.ctx.carrier.hangup(&dial_result.carrier_id).await;
                self.settle_failure(
                    &campaign,
                    &contact,
                    &call_id,
                    Some(&dial_result.carrier_id),
                    FailureKind::NetworkError,
                    started_ms,
                )
                .await?
            }
        };

        self.ctx.events.deregister(&call_id);
        Ok(outcome)
    }

    /// Waits for the answer (or a terminal event) while the pre-dial
    /// lease is held, promoting to an active lease on answer.
    async fn supervise_pre_dial(
        &self,
        events_rx: &mut mpsc::Receiver<CallEvent>,
        call_id: &str,
        token: &str,
        deadline_ms: u64,
    ) -> Result<PreDialResult, DispatchError> {
        loop {
            let remaining = deadline_ms.saturating_sub(self.ctx.clock.now_millis());
            if remaining == 0 {
                return Ok(PreDialResult::TimedOut);
            }

            let event = match time::timeout(Duration::from_millis(remaining), events_rx.recv())
                .await
            {
                Err(_) => return Ok(PreDialResult::TimedOut),
                Ok(None) => return Ok(PreDialResult::TimedOut),
                Ok(Some(event)) => event,
            };

            match event {
                CallEvent::Answered => {
                    let active_ttl = self.ctx.config.active_lease_base_ms
                        + first_attempt_jitter_ms(self.ctx.config.active_lease_jitter_ms);
                    let promoted = self
                        .ctx
                        .store
                        .promote_to_active(&self.campaign_id, call_id, token, active_ttl)
                        .await?;
                    if !promoted {
                        return Ok(PreDialResult::LeaseLost);
                    }
                    return Ok(PreDialResult::Answered);
                }
                CallEvent::Ringing | CallEvent::InProgress | CallEvent::MediaActive => {}
                terminal => return Ok(PreDialResult::Ended(terminal)),
            }
        }
    }

    /// Supervises an answered call: renews the active lease while
    /// media flows and waits for the end event.
    async fn supervise_active(
        &self,
        events_rx: &mut mpsc::Receiver<CallEvent>,
        call_id: &str,
        token: &str,
        _carrier_id: &str,
    ) -> Result<ActiveResult, DispatchError> {
        let config = &self.ctx.config;
        let call_deadline = self.ctx.clock.now_millis() + config.call_max_duration_ms;
        // Renew well before expiry; half the base TTL keeps one missed
        // renewal from losing the lease.
        let renew_interval = Duration::from_millis(config.active_lease_base_ms / 2);

        loop {
            if self.ctx.clock.now_millis() >= call_deadline {
                return Ok(ActiveResult::MaxDurationReached);
            }

            let event = match time::timeout(renew_interval, events_rx.recv()).await {
                Err(_) => {
                    let active_ttl = config.active_lease_base_ms
                        + first_attempt_jitter_ms(config.active_lease_jitter_ms);
                    let renewed = self
                        .ctx
                        .store
                        .renew(&self.campaign_id, call_id, token, active_ttl)
                        .await?;
                    if !renewed {
                        return Ok(ActiveResult::LeaseLost);
                    }
                    continue;
                }
                Ok(None) => return Ok(ActiveResult::LeaseLost),
                Ok(Some(event)) => event,
            };

            match event {
                CallEvent::MediaActive => {
                    let active_ttl = config.active_lease_base_ms
                        + first_attempt_jitter_ms(config.active_lease_jitter_ms);
                    self.ctx
                        .store
                        .renew(&self.campaign_id, call_id, token, active_ttl)
                        .await?;
                }
                CallEvent::Ringing | CallEvent::InProgress | CallEvent::Answered => {}
                terminal => return Ok(ActiveResult::Ended(terminal)),
            }
        }
    }

    /// Settles an attempt whose dial was rejected by the carrier
    /// before any call existed. The lease is already released.
    async fn settle_dial_rejection(
        &self,
        campaign: &Campaign,
        contact: &Contact,
        call_id: &str,
        err: CarrierError,
        started_ms: u64,
    ) -> Result<AttemptOutcome, DispatchError> {
        warn!(contact_id = contact.id.as_str(), "carrier rejected dial: {err}");

        if err.is_permanent() {
            let kind = match err {
                CarrierError::InvalidNumber => FailureKind::InvalidNumber,
                _ => FailureKind::Blocked,
            };
            self.record_call_log(
                campaign,
                contact,
                call_id,
                None,
                CallOutcome::Failed,
                Some(kind.as_str().to_string()),
                started_ms,
            )
            .await?;
            self.ctx
                .service
                .update_contact_status(
                    &contact.id,
                    ContactStatus::Failed,
                    Some(kind.as_str().to_string()),
                )
                .await?;
            return Ok(AttemptOutcome::Failed {
                kind,
                retry: RetryDecision::NotRetryable,
            });
        }

        // 429s, 5xx and transport errors all count toward the circuit
        // breaker and retry as network errors.
        self.ctx.breaker.record_failure(&self.campaign_id).await?;
        self.settle_failure(
            campaign,
            contact,
            call_id,
            None,
            FailureKind::NetworkError,
            started_ms,
        )
        .await
    }

    /// Settles an attempt that reached a terminal call event. The
    /// lease is already released.
    async fn settle_call_end(
        &self,
        campaign: &Campaign,
        contact: &Contact,
        call_id: &str,
        carrier_id: &str,
        event: &CallEvent,
        started_ms: u64,
    ) -> Result<AttemptOutcome, DispatchError> {
        match failure_kind_for_event(event) {
            None => {
                self.record_call_log(
                    campaign,
                    contact,
                    call_id,
                    Some(carrier_id),
                    CallOutcome::Completed,
                    hangup_reason(event),
                    started_ms,
                )
                .await?;
                self.ctx
                    .service
                    .update_contact_status(&contact.id, ContactStatus::Completed, None)
                    .await?;
                Ok(AttemptOutcome::Completed)
            }
            Some(kind) => {
                self.settle_failure(campaign, contact, call_id, Some(carrier_id), kind, started_ms)
                    .await
            }
        }
    }

    /// Settles a failed attempt: records the call log, consults the
    /// retry scheduler and moves the contact to its next status.
    async fn settle_failure(
        &self,
        campaign: &Campaign,
        contact: &Contact,
        call_id: &str,
        carrier_id: Option<&str>,
        kind: FailureKind,
        started_ms: u64,
    ) -> Result<AttemptOutcome, DispatchError> {
        self.record_call_log(
            campaign,
            contact,
            call_id,
            carrier_id,
            call_outcome_for_kind(kind),
            Some(kind.as_str().to_string()),
            started_ms,
        )
        .await?;

        let retry = self
            .retry_scheduler
            .schedule(campaign, contact, call_id, kind)
            .await?;

        let next_status = match &retry {
            RetryDecision::Scheduled { .. } => ContactStatus::Pending,
            // Another worker owns the retry; the contact stays pending
            // until that retry fires.
            RetryDecision::Deduplicated => ContactStatus::Pending,
            RetryDecision::Exhausted | RetryDecision::NotRetryable => match kind {
                FailureKind::Voicemail => ContactStatus::Voicemail,
                _ => ContactStatus::Failed,
            },
        };
        let failure_reason = match next_status {
            ContactStatus::Pending => None,
            _ => Some(kind.as_str().to_string()),
        };
        self.ctx
            .service
            .update_contact_status(&contact.id, next_status, failure_reason)
            .await?;

        Ok(AttemptOutcome::Failed { kind, retry })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_call_log(
        &self,
        campaign: &Campaign,
        contact: &Contact,
        call_id: &str,
        carrier_id: Option<&str>,
        outcome: CallOutcome,
        failure_reason: Option<String>,
        started_ms: u64,
    ) -> Result<(), DispatchError> {
        self.ctx
            .service
            .save_call_log(CallLog {
                id: nanoid!(),
                campaign_id: campaign.id.clone(),
                contact_id: contact.id.clone(),
                call_id: call_id.to_string(),
                carrier_id: carrier_id.map(|id| id.to_string()),
                outcome,
                failure_reason,
                started: started_ms,
                completed: Some(self.ctx.clock.now_millis()),
            })
            .await?;
        Ok(())
    }
}

/// Maps a terminal call event to the retry taxonomy; `None` means the
/// call is treated as completed.
fn failure_kind_for_event(event: &CallEvent) -> Option<FailureKind> {
    match event {
        CallEvent::Completed | CallEvent::Hangup { .. } => None,
        CallEvent::NoAnswer => Some(FailureKind::NoAnswer),
        CallEvent::Busy => Some(FailureKind::Busy),
        CallEvent::Voicemail => Some(FailureKind::Voicemail),
        CallEvent::Canceled | CallEvent::Failed { .. } => Some(FailureKind::CallRejected),
        CallEvent::Ringing
        | CallEvent::InProgress
        | CallEvent::Answered
        | CallEvent::MediaActive => None,
    }
}

fn call_outcome_for_kind(kind: FailureKind) -> CallOutcome {
    match kind {
        FailureKind::NoAnswer => CallOutcome::NoAnswer,
        FailureKind::Busy => CallOutcome::Busy,
        FailureKind::Voicemail => CallOutcome::Voicemail,
        FailureKind::CallRejected => CallOutcome::Canceled,
        FailureKind::NetworkError | FailureKind::InvalidNumber | FailureKind::Blocked => {
            CallOutcome::Failed
        }
    }
}

fn hangup_reason(event: &CallEvent) -> Option<String> {
    match event {
        CallEvent::Hangup { reason } => reason.clone(),
        _ => None,
    }
}
