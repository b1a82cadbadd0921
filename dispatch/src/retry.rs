use std::sync::Arc;

use chrono::{TimeZone, Timelike, Utc};
use dialcast_campaign::service::CampaignService;
use dialcast_campaign::types::{Campaign, Contact, RetryAttempt, RetryAttemptStatus};
use dialcast_helpers::retries::{calculate_backoff_ms, BackoffConfig};
use dialcast_helpers::time::Clock;
use nanoid::nanoid;
use tracing::{debug, info};

use crate::errors::DispatchError;
use crate::lease_store::LeaseStore;
use crate::types::DispatchConfig;

/// The failure taxonomy used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NoAnswer,
    Busy,
    Voicemail,
    NetworkError,
    CallRejected,
    InvalidNumber,
    Blocked,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoAnswer => "no_answer",
            FailureKind::Busy => "busy",
            FailureKind::Voicemail => "voicemail",
            FailureKind::NetworkError => "network_error",
            FailureKind::CallRejected => "call_rejected",
            FailureKind::InvalidNumber => "invalid_number",
            FailureKind::Blocked => "blocked",
        }
    }
}

/// The retry budget and backoff shape for one failure kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRule {
    pub retryable: bool,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub multiplier: f64,
    pub cap_secs: u64,
}

/// The per-kind retry table. Voicemail retryability is additionally
/// conditional on the campaign policy.
pub fn rule_for(kind: FailureKind) -> RetryRule {
    match kind {
        FailureKind::NoAnswer => RetryRule {
            retryable: true,
            max_attempts: 3,
            base_delay_secs: 300,
            multiplier: 2.0,
            cap_secs: 2_400,
        },
        FailureKind::Busy => RetryRule {
            retryable: true,
            max_attempts: 3,
            base_delay_secs: 120,
            multiplier: 2.0,
            cap_secs: 960,
        },
        FailureKind::Voicemail => RetryRule {
            retryable: true,
            max_attempts: 2,
            base_delay_secs: 1_800,
            multiplier: 2.0,
            cap_secs: 7_200,
        },
        FailureKind::NetworkError => RetryRule {
            retryable: true,
            max_attempts: 5,
            base_delay_secs: 10,
            multiplier: 2.0,
            cap_secs: 600,
        },
        FailureKind::CallRejected => RetryRule {
            retryable: true,
            max_attempts: 2,
            base_delay_secs: 900,
            multiplier: 1.0,
            cap_secs: 900,
        },
        FailureKind::InvalidNumber | FailureKind::Blocked => RetryRule {
            retryable: false,
            max_attempts: 0,
            base_delay_secs: 0,
            multiplier: 1.0,
            cap_secs: 0,
        },
    }
}

/// The outcome of asking the scheduler to retry a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled {
        fire_at_ms: u64,
        attempt_number: u32,
    },
    /// The retry budget for this failure kind is spent.
    Exhausted,
    /// The failure kind is terminal, or voicemail retries are excluded
    /// by the campaign policy.
    NotRetryable,
    /// Another worker already enqueued a retry for this contact within
    /// the dedup window.
    Deduplicated,
}

/// Clamps a retry fire time out of the off-peak window. The window is
/// `[start_hour, end_hour)` in UTC and may wrap midnight; fire times
/// inside it move to the window end.
pub fn clamp_to_calling_window(fire_at_ms: u64, start_hour: u8, end_hour: u8) -> u64 {
    if start_hour == end_hour {
        return fire_at_ms;
    }

    let Some(fire_at) = Utc.timestamp_millis_opt(fire_at_ms as i64).single() else {
        return fire_at_ms;
    };
    let hour = fire_at.hour() as u8;

    let in_off_peak = if start_hour < end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        hour >= start_hour || hour < end_hour
    };
    if !in_off_peak {
        return fire_at_ms;
    }

    let mut target_date = fire_at.date_naive();
    if start_hour > end_hour && hour >= start_hour {
        // The window wraps midnight and we are before it; the window
        // ends tomorrow morning.
        target_date = target_date.succ_opt().unwrap_or(target_date);
    }
    match target_date.and_hms_opt(end_hour as u32, 0, 0) {
        Some(clamped) => clamped.and_utc().timestamp_millis() as u64,
        None => fire_at_ms,
    }
}

/// Categorises terminal failures, computes backoff and enqueues
/// delayed retry jobs without double-scheduling, recording each
/// scheduled retry in the durable store.
pub struct RetryScheduler {
    store: Arc<dyn LeaseStore>,
    service: Arc<dyn CampaignService + Send + Sync>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        service: Arc<dyn CampaignService + Send + Sync>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        RetryScheduler {
            store,
            service,
            clock,
            config,
        }
    }

    /// Decides whether the contact gets another attempt for the given
    /// failure kind and, if so, schedules it.
    pub async fn schedule(
        &self,
        campaign: &Campaign,
        contact: &Contact,
        original_call_id: &str,
        kind: FailureKind,
    ) -> Result<RetryDecision, DispatchError> {
        let rule = rule_for(kind);

        if !rule.retryable {
            return Ok(RetryDecision::NotRetryable);
        }
        if kind == FailureKind::Voicemail && campaign.retry_policy.exclude_voicemail {
            return Ok(RetryDecision::NotRetryable);
        }

        let attempt_number = contact.retry_count + 1;
        if attempt_number > rule.max_attempts {
            info!(
                contact_id = contact.id.as_str(),
                kind = kind.as_str(),
                "retry budget exhausted"
            );
            return Ok(RetryDecision::Exhausted);
        }

        let now_ms = self.clock.now_millis();

        // At-least-once processors can hand the same terminal outcome
        // to two workers; only one gets to enqueue the retry.
        let bucket = now_ms / self.config.dial_idempotency_ttl_ms;
        let dedup_scope = format!("{}:retry", contact.id);
        if !self
            .store
            .try_claim_dial(&dedup_scope, bucket, self.config.dial_idempotency_ttl_ms)
            .await?
        {
            debug!(
                contact_id = contact.id.as_str(),
                "retry already enqueued within the dedup window"
            );
            return Ok(RetryDecision::Deduplicated);
        }

        let delay_ms = calculate_backoff_ms(
            &BackoffConfig {
                base_seconds: rule.base_delay_secs as f64,
                multiplier: rule.multiplier,
                cap_seconds: rule.cap_secs as f64,
                full_jitter: true,
            },
            contact.retry_count,
        );

        let mut fire_at_ms = now_ms + delay_ms;
        if campaign.retry_policy.respect_off_peak_hours {
            fire_at_ms = clamp_to_calling_window(
                fire_at_ms,
                campaign.retry_policy.off_peak_start_hour,
                campaign.retry_policy.off_peak_end_hour,
            );
        }

        self.store
            .schedule_retry(&campaign.id, &contact.id, contact.priority, fire_at_ms)
            .await?;

        self.service
            .save_retry_attempt(RetryAttempt {
                id: nanoid!(),
                campaign_id: campaign.id.clone(),
                contact_id: contact.id.clone(),
                original_call_id: original_call_id.to_string(),
                attempt_number,
                scheduled_for: fire_at_ms,
                failure_kind: kind.as_str().to_string(),
                status: RetryAttemptStatus::Scheduled,
            })
            .await?;
        self.service
            .record_contact_retry(&contact.id, attempt_number, Some(fire_at_ms))
            .await?;

        info!(
            contact_id = contact.id.as_str(),
            kind = kind.as_str(),
            attempt_number,
            fire_at_ms,
            "retry scheduled"
        );
        Ok(RetryDecision::Scheduled {
            fire_at_ms,
            attempt_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use coverage_helper::test;
    use super::*;
    use crate::lease_store::MemoryLeaseStore;
    use dialcast_campaign::service::MemoryCampaignService;
    use dialcast_campaign::types::{
        CampaignStatus, ContactStatus, Priority, PriorityMode, RetryPolicy,
    };
    use dialcast_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;

    fn campaign_with_policy(retry_policy: RetryPolicy) -> Campaign {
        Campaign {
            id: "camp-1".to_string(),
            name: "Follow-ups".to_string(),
            limit: 3,
            status: CampaignStatus::Active,
            priority_mode: PriorityMode::Weighted,
            retry_policy,
            agent_ref: "agent-1".to_string(),
            phone_pool_ref: "pool-1".to_string(),
            scheduled_for: None,
            version: 1,
        }
    }

    fn contact_with_retries(retry_count: u32) -> Contact {
        Contact {
            id: "contact-1".to_string(),
            campaign_id: "camp-1".to_string(),
            phone_number: "+14155552671".to_string(),
            priority: Priority::Normal,
            status: ContactStatus::Calling,
            retry_count,
            next_retry_at: None,
            failure_reason: None,
            version: 1,
        }
    }

    fn scheduler() -> (
        RetryScheduler,
        Arc<MemoryLeaseStore>,
        Arc<ManualClock>,
        Arc<MemoryCampaignService>,
    ) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryLeaseStore::new(clock.clone(), 3));
        let service = Arc::new(MemoryCampaignService::new());
        let scheduler = RetryScheduler::new(
            store.clone(),
            service.clone(),
            clock.clone(),
            DispatchConfig::default(),
        );
        (scheduler, store, clock, service)
    }

    #[test]
    fn test_retry_table_matches_the_policy() {
        assert_eq!(rule_for(FailureKind::NoAnswer).max_attempts, 3);
        assert_eq!(rule_for(FailureKind::NoAnswer).base_delay_secs, 300);
        assert_eq!(rule_for(FailureKind::Busy).base_delay_secs, 120);
        assert_eq!(rule_for(FailureKind::Voicemail).max_attempts, 2);
        assert_eq!(rule_for(FailureKind::NetworkError).max_attempts, 5);
        assert_eq!(rule_for(FailureKind::NetworkError).cap_secs, 600);
        assert_eq!(rule_for(FailureKind::CallRejected).multiplier, 1.0);
        assert!(!rule_for(FailureKind::InvalidNumber).retryable);
        assert!(!rule_for(FailureKind::Blocked).retryable);
    }

    #[test_log::test(tokio::test)]
    async fn test_schedules_retry_within_backoff_bounds() {
        let (scheduler, store, clock, service) = scheduler();
        let campaign = campaign_with_policy(RetryPolicy::default());
        let contact = contact_with_retries(0);
        service.upsert_contact(contact.clone()).await.unwrap();

        let decision = scheduler
            .schedule(&campaign, &contact, "call-1", FailureKind::NetworkError)
            .await
            .unwrap();

        let RetryDecision::Scheduled {
            fire_at_ms,
            attempt_number,
        } = decision
        else {
            panic!("expected a scheduled retry, got {decision:?}");
        };
        assert_eq!(attempt_number, 1);
        // Full jitter draws from [0, base) for the first attempt.
        let now = clock.now_millis();
        assert!(fire_at_ms >= now);
        assert!(fire_at_ms <= now + 10_000);

        // The job landed in the delay queue.
        clock.advance_millis(11_000);
        let fired = store
            .fire_due_retries("camp-1", clock.now_millis())
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].contact_id, "contact-1");
        assert_eq!(fired[0].origin, Priority::Normal);
    }

    #[test_log::test(tokio::test)]
    async fn test_exhausts_budget_after_max_attempts() {
        let (scheduler, _, _, _) = scheduler();
        let campaign = campaign_with_policy(RetryPolicy::default());
        let contact = contact_with_retries(3);

        let decision = scheduler
            .schedule(&campaign, &contact, "call-1", FailureKind::NoAnswer)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Exhausted);
    }

    #[test_log::test(tokio::test)]
    async fn test_voicemail_respects_campaign_exclusion() {
        let (scheduler, _, _, _) = scheduler();
        let campaign = campaign_with_policy(RetryPolicy {
            exclude_voicemail: true,
            ..RetryPolicy::default()
        });
        let contact = contact_with_retries(0);

        let decision = scheduler
            .schedule(&campaign, &contact, "call-1", FailureKind::Voicemail)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::NotRetryable);
    }

    #[test_log::test(tokio::test)]
    async fn test_permanent_failures_are_not_retryable() {
        let (scheduler, _, _, _) = scheduler();
        let campaign = campaign_with_policy(RetryPolicy::default());
        let contact = contact_with_retries(0);

        let decision = scheduler
            .schedule(&campaign, &contact, "call-1", FailureKind::InvalidNumber)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::NotRetryable);
    }

    #[test_log::test(tokio::test)]
    async fn test_second_enqueue_in_the_window_is_deduplicated() {
        let (scheduler, _, _, service) = scheduler();
        let campaign = campaign_with_policy(RetryPolicy::default());
        let contact = contact_with_retries(0);
        service.upsert_contact(contact.clone()).await.unwrap();

        let first = scheduler
            .schedule(&campaign, &contact, "call-1", FailureKind::Busy)
            .await
            .unwrap();
        assert!(matches!(first, RetryDecision::Scheduled { .. }));

        let second = scheduler
            .schedule(&campaign, &contact, "call-1", FailureKind::Busy)
            .await
            .unwrap();
        assert_eq!(second, RetryDecision::Deduplicated);
    }

    #[test]
    fn test_clamps_fire_times_inside_the_off_peak_window() {
        // 2024-01-15T22:30:00Z, off-peak 21:00-08:00.
        let fire_at = Utc
            .with_ymd_and_hms(2024, 1, 15, 22, 30, 0)
            .unwrap()
            .timestamp_millis() as u64;
        let clamped = clamp_to_calling_window(fire_at, 21, 8);
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 16, 8, 0, 0)
            .unwrap()
            .timestamp_millis() as u64;
        assert_eq!(clamped, expected);

        // 03:00 is inside the wrapped window; the end is the same morning.
        let fire_at = Utc
            .with_ymd_and_hms(2024, 1, 16, 3, 0, 0)
            .unwrap()
            .timestamp_millis() as u64;
        assert_eq!(clamp_to_calling_window(fire_at, 21, 8), expected);

        // Mid-afternoon is allowed as-is.
        let fire_at = Utc
            .with_ymd_and_hms(2024, 1, 15, 15, 0, 0)
            .unwrap()
            .timestamp_millis() as u64;
        assert_eq!(clamp_to_calling_window(fire_at, 21, 8), fire_at);
    }
}
