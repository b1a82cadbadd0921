use std::sync::Arc;
use std::time::Duration;

use dialcast_campaign::service::{CampaignService, MemoryCampaignService};
use dialcast_campaign::types::{
    Campaign, CampaignStatus, Contact, ContactStatus, Priority, PriorityMode, RetryAttemptStatus,
    RetryPolicy,
};
use dialcast_dispatch::breaker::{BreakerState, CircuitBreaker};
use dialcast_dispatch::carrier::{CarrierError, CarrierProvider, MockCarrierClient};
use dialcast_dispatch::dispatcher::{AttemptOutcome, CampaignDispatcher, DispatchContext};
use dialcast_dispatch::events::{CallEvent, CallEventRouter};
use dialcast_dispatch::janitor::MaintenanceRunner;
use dialcast_dispatch::lease_store::{LeaseStore, MemoryLeaseStore};
use dialcast_dispatch::retry::{FailureKind, RetryDecision};
use dialcast_dispatch::types::{DispatchConfig, ReservedContact};
use dialcast_helpers::time::{Clock, ManualClock};
use tokio::sync::broadcast;

const CAMPAIGN: &str = "camp-1";

struct Harness {
    store: Arc<MemoryLeaseStore>,
    service: Arc<MemoryCampaignService>,
    mock_carrier: Arc<CarrierProvider>,
    events: Arc<CallEventRouter>,
    clock: Arc<ManualClock>,
    maintenance: Arc<MaintenanceRunner>,
    config: DispatchConfig,
}

async fn harness_with(limit: u32, config: DispatchConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryLeaseStore::new(clock.clone(), config.fairness_ratio));
    let service = Arc::new(MemoryCampaignService::new());
    let mock_carrier = Arc::new(CarrierProvider::Mock(MockCarrierClient::new()));
    let events = Arc::new(CallEventRouter::new());
    let maintenance = Arc::new(MaintenanceRunner::new(
        store.clone(),
        service.clone(),
        clock.clone(),
        config.clone(),
        "test-worker",
    ));

    service
        .upsert_campaign(Campaign {
            id: CAMPAIGN.to_string(),
            name: "Integration".to_string(),
            limit,
            status: CampaignStatus::Active,
            priority_mode: PriorityMode::Weighted,
            retry_policy: RetryPolicy::default(),
            agent_ref: "agent-1".to_string(),
            phone_pool_ref: "+14155550100".to_string(),
            scheduled_for: None,
            version: 1,
        })
        .await
        .unwrap();
    store.set_limit(CAMPAIGN, limit).await.unwrap();

    Harness {
        store,
        service,
        mock_carrier,
        events,
        clock,
        maintenance,
        config,
    }
}

async fn harness(limit: u32) -> Harness {
    harness_with(limit, DispatchConfig::default()).await
}

impl Harness {
    fn mock(&self) -> &MockCarrierClient {
        self.mock_carrier.mock().expect("harness uses the mock carrier")
    }

    async fn seed_contacts(&self, prefix: &str, priority: Priority, count: usize) {
        let mut entries = Vec::new();
        for i in 0..count {
            let id = format!("{prefix}-{i}");
            self.service
                .upsert_contact(Contact {
                    id: id.clone(),
                    campaign_id: CAMPAIGN.to_string(),
                    phone_number: format!("+1415555{:04}", i),
                    priority,
                    status: ContactStatus::Queued,
                    retry_count: 0,
                    next_retry_at: None,
                    failure_reason: None,
                    version: 1,
                })
                .await
                .unwrap();
            entries.push((id, priority));
        }
        self.store
            .enqueue_contacts(CAMPAIGN, &entries, false)
            .await
            .unwrap();
    }

    /// Waits until the mock carrier has recorded at least `count`
    /// dials and returns the correlation ids of the newest ones.
    async fn wait_for_dials(&self, count: usize) -> Vec<String> {
        for _ in 0..500 {
            let dials = self.mock().dials();
            if dials.len() >= count {
                return dials
                    .into_iter()
                    .map(|spec| spec.correlation_id)
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("carrier never observed {count} dials");
    }

    /// Runs the full batch of reserved contacts to completed calls.
    async fn complete_batch(&self, granted: Vec<ReservedContact>) -> Vec<AttemptOutcome> {
        let dials_before = self.mock().dials().len();
        let mut handles = Vec::new();
        for reserved in granted {
            let dispatcher =
                CampaignDispatcher::new(self.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
            handles.push(tokio::spawn(async move {
                dispatcher.run_attempt(&reserved, false).await
            }));
        }

        let expected = dials_before + handles.len();
        let correlation_ids = self.wait_for_dials(expected).await;
        for call_id in &correlation_ids[dials_before..] {
            assert!(self.events.deliver(call_id, CallEvent::Answered));
            assert!(self.events.deliver(call_id, CallEvent::Completed));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }
        outcomes
    }

    fn ctx_clone(&self) -> DispatchContext {
        DispatchContext {
            store: self.store.clone(),
            service: self.service.clone(),
            carrier: self.mock_carrier.clone(),
            events: self.events.clone(),
            breaker: Arc::new(CircuitBreaker::new(self.store.clone(), &self.config)),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }
}

// Scenario: single-campaign saturation. With limit 3 and 10 queued
// high-priority contacts, each batch grants exactly 3 concurrent
// slots, reserved returns to 0 between batches and the run finishes
// in at most 4 promotion batches with every contact completed.
#[test_log::test(tokio::test)]
async fn test_single_campaign_saturation() {
    let h = harness(3).await;
    h.seed_contacts("high", Priority::High, 10).await;

    let mut batches = 0;
    let mut completed_total = 0;
    while completed_total < 10 {
        let outcome = h
            .store
            .reserve_and_promote(CAMPAIGN, 8, 70_000, 20_000, h.clock.now_millis())
            .await
            .unwrap();
        batches += 1;
        assert!(batches <= 4, "needed more than 4 promotion batches");
        assert!(outcome.granted.len() <= 3);

        let outcomes = h.complete_batch(outcome.granted).await;
        for outcome in &outcomes {
            assert_eq!(*outcome, AttemptOutcome::Completed);
        }
        completed_total += outcomes.len();

        // All slots return between batches.
        assert_eq!(h.store.reserved_count(CAMPAIGN).await.unwrap(), 0);
        assert_eq!(h.store.inflight_count(CAMPAIGN).await.unwrap(), 0);
    }

    assert_eq!(batches, 4);
    assert_eq!(
        h.service
            .count_contacts_by_status(CAMPAIGN, ContactStatus::Completed)
            .await
            .unwrap(),
        10
    );

    // With everything drained, the next janitor pass completes the
    // campaign.
    assert!(h.maintenance.try_complete(CAMPAIGN).await.unwrap());
    assert_eq!(
        h.service.get_campaign(CAMPAIGN).await.unwrap().status,
        CampaignStatus::Completed
    );
}

// The concurrency cap holds while attempts are mid-flight: with three
// dials placed and none finished, inflight is exactly 3.
#[test_log::test(tokio::test)]
async fn test_inflight_never_exceeds_limit() {
    let h = harness(3).await;
    h.seed_contacts("high", Priority::High, 10).await;

    let outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 8, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    assert_eq!(outcome.granted.len(), 3);

    let mut handles = Vec::new();
    for reserved in outcome.granted {
        let dispatcher = CampaignDispatcher::new(h.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
        handles.push(tokio::spawn(async move {
            dispatcher.run_attempt(&reserved, false).await
        }));
    }

    let correlation_ids = h.wait_for_dials(3).await;
    assert_eq!(h.store.inflight_count(CAMPAIGN).await.unwrap(), 3);
    assert_eq!(h.store.reserved_count(CAMPAIGN).await.unwrap(), 0);

    // Another promotion grants nothing at capacity.
    let second = h
        .store
        .reserve_and_promote(CAMPAIGN, 8, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    assert!(second.granted.is_empty());

    for call_id in &correlation_ids {
        h.events.deliver(call_id, CallEvent::Answered);
        h.events.deliver(call_id, CallEvent::Completed);
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(h.store.inflight_count(CAMPAIGN).await.unwrap(), 0);
}

// Scenario: priority mix. Under saturated queues of both classes the
// normal class holds a 25% share and is never starved for more than
// the fairness window.
#[test_log::test(tokio::test)]
async fn test_priority_mix_fairness() {
    let h = harness(1_000).await;
    h.seed_contacts("high", Priority::High, 100).await;
    h.seed_contacts("normal", Priority::Normal, 100).await;

    let mut normal_granted = 0;
    let mut total_granted = 0;
    let mut batches_without_normal = 0;
    for _ in 0..24 {
        let outcome = h
            .store
            .reserve_and_promote(CAMPAIGN, 4, 70_000, 20_000, h.clock.now_millis())
            .await
            .unwrap();
        assert_eq!(outcome.granted.len(), 4);

        let normal_in_batch = outcome
            .granted
            .iter()
            .filter(|c| c.origin == Priority::Normal)
            .count();
        if normal_in_batch == 0 {
            batches_without_normal += 1;
            assert!(
                batches_without_normal < 4,
                "normal class starved for 4 consecutive batches"
            );
        } else {
            batches_without_normal = 0;
        }

        normal_granted += normal_in_batch;
        total_granted += outcome.granted.len();
    }

    let share = normal_granted as f64 / total_granted as f64;
    assert!(
        (0.22..=0.30).contains(&share),
        "normal share {share} outside [0.22, 0.30]"
    );
}

// Scenario: carrier rate-limit storm. Sustained 429s open the breaker,
// no contact is marked failed (all reschedule as network errors), and
// after the open window a single half-open probe closes it again.
#[test_log::test(tokio::test)]
async fn test_carrier_rate_limit_storm_opens_breaker_without_failing_contacts() {
    let config = DispatchConfig {
        cb_failure_threshold: 3,
        ..DispatchConfig::default()
    };
    let h = harness_with(4, config).await;
    h.seed_contacts("high", Priority::High, 6).await;

    for _ in 0..3 {
        h.mock().push_response(Err(CarrierError::RateLimited));
    }

    let outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 3, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    assert_eq!(outcome.granted.len(), 3);

    let breaker = Arc::new(CircuitBreaker::new(h.store.clone(), &h.config));
    for reserved in outcome.granted {
        let dispatcher = CampaignDispatcher::new(h.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
        let result = dispatcher.run_attempt(&reserved, false).await.unwrap();
        match result {
            AttemptOutcome::Failed { kind, retry } => {
                assert_eq!(kind, FailureKind::NetworkError);
                assert!(matches!(retry, RetryDecision::Scheduled { .. }));
            }
            other => panic!("expected a failed attempt, got {other:?}"),
        }
    }

    // Three failures crossed the threshold.
    assert!(h.store.is_circuit_open(CAMPAIGN).await.unwrap());
    assert_eq!(
        h.service
            .count_contacts_by_status(CAMPAIGN, ContactStatus::Failed)
            .await
            .unwrap(),
        0
    );
    // All slots were released despite the failures.
    assert_eq!(h.store.inflight_count(CAMPAIGN).await.unwrap(), 0);

    // After the open window one worker wins the half-open probe; a
    // successful probe dial closes the breaker.
    h.clock.advance_millis(h.config.cb_open_ttl_ms + 1_000);
    assert_eq!(
        breaker.state(CAMPAIGN).await.unwrap(),
        BreakerState::HalfOpenProbe
    );
    breaker.record_success(CAMPAIGN).await.unwrap();
    assert_eq!(breaker.state(CAMPAIGN).await.unwrap(), BreakerState::Closed);
}

// Scenario: worker crash mid-reservation. A batch is reserved and the
// worker dies before converting; the janitor reaps both reservations
// within the orphan age and restores the contacts to their original
// priority lists.
#[test_log::test(tokio::test)]
async fn test_worker_crash_mid_reservation_is_reaped() {
    let h = harness(4).await;
    h.seed_contacts("high", Priority::High, 1).await;
    h.seed_contacts("normal", Priority::Normal, 1).await;

    let outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 4, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    assert_eq!(outcome.granted.len(), 2);
    assert_eq!(h.store.reserved_count(CAMPAIGN).await.unwrap(), 2);

    // Too early: nothing is reaped yet.
    h.clock.advance_millis(30_000);
    let report = h.maintenance.run_janitor_scan(CAMPAIGN).await.unwrap();
    assert_eq!(report.reservations_reaped, 0);

    h.clock.advance_millis(31_000);
    let report = h.maintenance.run_janitor_scan(CAMPAIGN).await.unwrap();
    assert_eq!(report.reservations_reaped, 2);
    assert_eq!(h.store.reserved_count(CAMPAIGN).await.unwrap(), 0);
    assert_eq!(
        h.store
            .waitlist_members(CAMPAIGN, Priority::High)
            .await
            .unwrap(),
        vec!["high-0".to_string()]
    );
    assert_eq!(
        h.store
            .waitlist_members(CAMPAIGN, Priority::Normal)
            .await
            .unwrap(),
        vec!["normal-0".to_string()]
    );
}

// Scenario: state loss and reconciliation. Contacts stuck in `calling`
// with no lease in the store are re-enqueued by the cold-start
// reconciliation, and the cold-start marker transitions from blocked
// to the done sentinel.
#[test_log::test(tokio::test)]
async fn test_cold_start_reconciliation_recovers_lost_state() {
    let h = harness(5).await;

    // Five contacts were mid-call when the scheduling state was lost.
    for i in 0..5 {
        h.service
            .upsert_contact(Contact {
                id: format!("lost-{i}"),
                campaign_id: CAMPAIGN.to_string(),
                phone_number: format!("+1415555{:04}", i),
                priority: Priority::High,
                status: ContactStatus::Calling,
                retry_count: 0,
                next_retry_at: None,
                failure_reason: None,
                version: 1,
            })
            .await
            .unwrap();
    }

    h.store
        .set_coldstart_block(CAMPAIGN, h.config.coldstart_block_ms)
        .await
        .unwrap();
    assert_eq!(
        h.store.coldstart_state(CAMPAIGN).await.unwrap(),
        dialcast_dispatch::types::ColdStartState::Blocked
    );

    let report = h.maintenance.cold_start(CAMPAIGN).await.unwrap().unwrap();
    assert_eq!(report.requeued, 5);
    assert_eq!(
        h.store.coldstart_state(CAMPAIGN).await.unwrap(),
        dialcast_dispatch::types::ColdStartState::Done
    );
    assert_eq!(
        h.service
            .count_contacts_by_status(CAMPAIGN, ContactStatus::Pending)
            .await
            .unwrap(),
        5
    );
    let (queued_high, _) = h.store.waitlist_lengths(CAMPAIGN).await.unwrap();
    assert_eq!(queued_high, 5);

    // A repeated cold start is skipped while the done sentinel holds.
    assert!(h.maintenance.cold_start(CAMPAIGN).await.unwrap().is_none());
}

// Running the reconciler twice back-to-back produces the same state
// as running it once.
#[test_log::test(tokio::test)]
async fn test_reconciler_is_idempotent() {
    let h = harness(5).await;
    h.service
        .upsert_contact(Contact {
            id: "stuck-1".to_string(),
            campaign_id: CAMPAIGN.to_string(),
            phone_number: "+14155550001".to_string(),
            priority: Priority::Normal,
            status: ContactStatus::Calling,
            retry_count: 0,
            next_retry_at: None,
            failure_reason: None,
            version: 1,
        })
        .await
        .unwrap();
    // A lease for a contact the durable store says is already done.
    h.service
        .upsert_contact(Contact {
            id: "done-1".to_string(),
            campaign_id: CAMPAIGN.to_string(),
            phone_number: "+14155550002".to_string(),
            priority: Priority::Normal,
            status: ContactStatus::Completed,
            retry_count: 0,
            next_retry_at: None,
            failure_reason: None,
            version: 1,
        })
        .await
        .unwrap();
    assert!(h
        .store
        .acquire_pre(CAMPAIGN, "call-done", "done-1", "tok-1", 60_000)
        .await
        .unwrap());

    let first = h.maintenance.reconcile(CAMPAIGN).await.unwrap();
    assert_eq!(first.requeued, 1);
    assert_eq!(first.released, 1);
    let snapshot_after_first = h.store.snapshot(CAMPAIGN).await.unwrap();

    let second = h.maintenance.reconcile(CAMPAIGN).await.unwrap();
    assert_eq!(second.requeued, 0);
    assert_eq!(second.released, 0);
    let snapshot_after_second = h.store.snapshot(CAMPAIGN).await.unwrap();

    assert_eq!(snapshot_after_first.inflight, snapshot_after_second.inflight);
    assert_eq!(
        snapshot_after_first.queued_normal,
        snapshot_after_second.queued_normal
    );
    assert_eq!(snapshot_after_first.reserved, snapshot_after_second.reserved);
}

// A lease pointing at another campaign's contact is unrecoverable
// corruption: the reconciler releases it and marks the campaign
// failed.
#[test_log::test(tokio::test)]
async fn test_reconciler_marks_campaign_failed_on_corruption() {
    let h = harness(2).await;
    h.service
        .upsert_contact(Contact {
            id: "foreign-1".to_string(),
            campaign_id: "some-other-campaign".to_string(),
            phone_number: "+14155550009".to_string(),
            priority: Priority::Normal,
            status: ContactStatus::Calling,
            retry_count: 0,
            next_retry_at: None,
            failure_reason: None,
            version: 1,
        })
        .await
        .unwrap();
    assert!(h
        .store
        .acquire_pre(CAMPAIGN, "call-x", "foreign-1", "tok-1", 60_000)
        .await
        .unwrap());

    let report = h.maintenance.reconcile(CAMPAIGN).await.unwrap();
    assert!(report.campaign_failed);
    assert_eq!(report.released, 1);
    assert_eq!(
        h.service.get_campaign(CAMPAIGN).await.unwrap().status,
        CampaignStatus::Failed
    );
    assert!(h.store.is_paused(CAMPAIGN).await.unwrap());
}

// Scenario: duplicate dial under retry. Two workers race the same
// contact; the idempotency key admits exactly one carrier dial and
// the loser releases immediately.
#[test_log::test(tokio::test)]
async fn test_duplicate_dial_is_deduplicated_within_window() {
    let h = harness(2).await;
    h.seed_contacts("dup", Priority::High, 1).await;

    let outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 4, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    assert_eq!(outcome.granted.len(), 1);
    let first = outcome.granted[0].clone();

    let winner = tokio::spawn({
        let dispatcher = CampaignDispatcher::new(h.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
        async move { dispatcher.run_attempt(&first, false).await }
    });
    let call_ids = h.wait_for_dials(1).await;

    // A retry fires the same contact back onto the waitlist while the
    // winner's dial is in flight; another worker pops it.
    h.store
        .enqueue_contacts(CAMPAIGN, &[("dup-0".to_string(), Priority::High)], false)
        .await
        .unwrap();
    let second_outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 4, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    assert_eq!(second_outcome.granted.len(), 1);
    let second = second_outcome.granted[0].clone();

    let dispatcher = CampaignDispatcher::new(h.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
    let loser_outcome = dispatcher.run_attempt(&second, false).await.unwrap();
    assert_eq!(loser_outcome, AttemptOutcome::Deduplicated);

    h.events.deliver(&call_ids[0], CallEvent::Answered);
    h.events.deliver(&call_ids[0], CallEvent::Completed);
    let winner_outcome = winner.await.unwrap().unwrap();
    assert_eq!(winner_outcome, AttemptOutcome::Completed);

    // Exactly one dial reached the carrier.
    assert_eq!(h.mock().dials().len(), 1);
    assert_eq!(h.store.inflight_count(CAMPAIGN).await.unwrap(), 0);
}

// A terminal no-answer flows through the retry scheduler: the contact
// returns to pending with a scheduled attempt, and firing the retry
// re-queues it at the head of its origin list.
#[test_log::test(tokio::test)]
async fn test_no_answer_schedules_retry_and_fires_back_to_waitlist() {
    let h = harness(2).await;
    h.seed_contacts("ring", Priority::Normal, 1).await;

    let outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 1, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    let reserved = outcome.granted[0].clone();

    let handle = tokio::spawn({
        let dispatcher = CampaignDispatcher::new(h.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
        async move { dispatcher.run_attempt(&reserved, false).await }
    });
    let call_ids = h.wait_for_dials(1).await;
    h.events.deliver(&call_ids[0], CallEvent::NoAnswer);

    let result = handle.await.unwrap().unwrap();
    let AttemptOutcome::Failed { kind, retry } = result else {
        panic!("expected failure, got {result:?}");
    };
    assert_eq!(kind, FailureKind::NoAnswer);
    let RetryDecision::Scheduled { fire_at_ms, .. } = retry else {
        panic!("expected scheduled retry, got {retry:?}");
    };

    let contact = h.service.get_contact("ring-0").await.unwrap();
    assert_eq!(contact.status, ContactStatus::Pending);
    assert_eq!(contact.retry_count, 1);
    assert_eq!(contact.next_retry_at, Some(fire_at_ms));

    let attempts = h
        .service
        .list_retry_attempts_by_status(CAMPAIGN, RetryAttemptStatus::Scheduled)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].failure_kind, "no_answer");

    // Fire the retry and check the contact lands back on its list.
    h.clock.advance_millis(10 * 60 * 1000);
    let fired = h
        .store
        .fire_due_retries(CAMPAIGN, h.clock.now_millis())
        .await
        .unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(
        h.store
            .waitlist_members(CAMPAIGN, Priority::Normal)
            .await
            .unwrap(),
        vec!["ring-0".to_string()]
    );
}

// A reservation reaped by the janitor before conversion produces a
// clean no-op attempt.
#[test_log::test(tokio::test)]
async fn test_attempt_on_reaped_reservation_is_a_noop() {
    let h = harness(2).await;
    h.seed_contacts("gone", Priority::High, 1).await;

    let outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 1, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    let reserved = outcome.granted[0].clone();

    h.clock.advance_millis(61_000);
    h.maintenance.run_janitor_scan(CAMPAIGN).await.unwrap();

    let dispatcher = CampaignDispatcher::new(h.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
    let result = dispatcher.run_attempt(&reserved, false).await.unwrap();
    assert_eq!(result, AttemptOutcome::ReservationGone);
    assert_eq!(h.mock().dials().len(), 0);
    assert_eq!(h.store.inflight_count(CAMPAIGN).await.unwrap(), 0);
}

// Permanent carrier rejections mark the contact failed with the
// rejection reason and never schedule a retry.
#[test_log::test(tokio::test)]
async fn test_invalid_number_is_terminal() {
    let h = harness(2).await;
    h.seed_contacts("bad", Priority::High, 1).await;
    h.mock().push_response(Err(CarrierError::InvalidNumber));

    let outcome = h
        .store
        .reserve_and_promote(CAMPAIGN, 1, 70_000, 20_000, h.clock.now_millis())
        .await
        .unwrap();
    let reserved = outcome.granted[0].clone();

    let dispatcher = CampaignDispatcher::new(h.ctx_clone(), CAMPAIGN, broadcast::channel(1).0);
    let result = dispatcher.run_attempt(&reserved, false).await.unwrap();
    assert_eq!(
        result,
        AttemptOutcome::Failed {
            kind: FailureKind::InvalidNumber,
            retry: RetryDecision::NotRetryable,
        }
    );

    let contact = h.service.get_contact("bad-0").await.unwrap();
    assert_eq!(contact.status, ContactStatus::Failed);
    assert_eq!(contact.failure_reason, Some("invalid_number".to_string()));
    assert_eq!(h.store.inflight_count(CAMPAIGN).await.unwrap(), 0);
}
