use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dialcast_campaign::types::Priority;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{error, info, info_span, Instrument};

use crate::errors::DispatchError;
use crate::lease_store::LeaseStore;
use crate::types::DispatchConfig;

/// How many lease members are sampled for live lease keys per tick.
const LEASE_SAMPLE_LIMIT: usize = 16;
/// How many waitlist entries per class are sampled for double-booking.
const WAITLIST_SAMPLE_LIMIT: usize = 100;

/// A detected invariant violation. Violations are alerted and counted,
/// never auto-remediated; correction belongs to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// `SCARD(leases) + reserved` exceeded the campaign limit.
    CapacityExceeded {
        inflight: u64,
        reserved: u64,
        limit: u32,
    },
    /// The reservation ledger cardinality diverged from the reserved
    /// counter.
    LedgerMismatch { ledger: u64, reserved: u64 },
    /// A lease set member has no live lease key.
    MissingLeaseKey { member: String },
    /// A contact appears both in a waitlist and in the leases set.
    DoubleBooked { contact_id: String },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InvariantViolation::CapacityExceeded {
                inflight,
                reserved,
                limit,
            } => write!(
                f,
                "capacity invariant violated: inflight {inflight} + reserved {reserved} > limit {limit}"
            ),
            InvariantViolation::LedgerMismatch { ledger, reserved } => write!(
                f,
                "ledger invariant violated: {ledger} ledger entries, reserved counter {reserved}"
            ),
            InvariantViolation::MissingLeaseKey { member } => {
                write!(f, "lease \"{member}\" has no live lease key")
            }
            InvariantViolation::DoubleBooked { contact_id } => {
                write!(f, "contact \"{contact_id}\" is both queued and leased")
            }
        }
    }
}

/// Counters exported for the invariant monitor, grouped by the
/// invariant they guard.
#[derive(Default)]
pub struct InvariantCounters {
    capacity_violations: AtomicU64,
    ledger_mismatches: AtomicU64,
    missing_lease_keys: AtomicU64,
    double_booked: AtomicU64,
    checks_run: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvariantCountersSnapshot {
    pub capacity_violations: u64,
    pub ledger_mismatches: u64,
    pub missing_lease_keys: u64,
    pub double_booked: u64,
    pub checks_run: u64,
}

impl InvariantCounters {
    pub fn snapshot(&self) -> InvariantCountersSnapshot {
        InvariantCountersSnapshot {
            capacity_violations: self.capacity_violations.load(Ordering::Relaxed),
            ledger_mismatches: self.ledger_mismatches.load(Ordering::Relaxed),
            missing_lease_keys: self.missing_lease_keys.load(Ordering::Relaxed),
            double_booked: self.double_booked.load(Ordering::Relaxed),
            checks_run: self.checks_run.load(Ordering::Relaxed),
        }
    }

    fn record(&self, violation: &InvariantViolation) {
        let counter = match violation {
            InvariantViolation::CapacityExceeded { .. } => &self.capacity_violations,
            InvariantViolation::LedgerMismatch { .. } => &self.ledger_mismatches,
            InvariantViolation::MissingLeaseKey { .. } => &self.missing_lease_keys,
            InvariantViolation::DoubleBooked { .. } => &self.double_booked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Asserts the global scheduling invariants for each campaign on a
/// fixed cadence. Detection is separated from correction: violations
/// are logged as alerts and exported as counters only.
pub struct InvariantMonitor {
    store: Arc<dyn LeaseStore>,
    config: DispatchConfig,
    counters: Arc<InvariantCounters>,
}

impl InvariantMonitor {
    pub fn new(store: Arc<dyn LeaseStore>, config: DispatchConfig) -> Self {
        InvariantMonitor {
            store,
            config,
            counters: Arc::new(InvariantCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<InvariantCounters> {
        self.counters.clone()
    }

    /// Runs the monitor loop for one campaign until shutdown.
    pub async fn run(&self, campaign_id: &str, shutdown_tx: &broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut interval =
            time::interval(Duration::from_millis(self.config.invariant_interval_ms));

        async {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("received shutdown signal, stopping invariant monitor");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.check_campaign(campaign_id).await {
                            Ok(violations) => {
                                for violation in &violations {
                                    error!(alert = true, "{violation}");
                                }
                            }
                            Err(err) => error!("invariant check failed: {err}"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!(
            "invariant_monitor",
            campaign_id = campaign_id
        ))
        .await
    }

    /// Checks all invariants for one campaign and returns the
    /// violations found, recording them in the exported counters.
    pub async fn check_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Vec<InvariantViolation>, DispatchError> {
        self.counters.checks_run.fetch_add(1, Ordering::Relaxed);
        let mut violations = Vec::new();

        let limit = self.store.limit(campaign_id).await?;
        let inflight = self.store.inflight_count(campaign_id).await?;
        let reserved = self.store.reserved_count(campaign_id).await?;
        if inflight + reserved > limit as u64 {
            violations.push(InvariantViolation::CapacityExceeded {
                inflight,
                reserved,
                limit,
            });
        }

        let ledger = self.store.ledger_entries(campaign_id).await?;
        if ledger.len() as u64 != reserved {
            violations.push(InvariantViolation::LedgerMismatch {
                ledger: ledger.len() as u64,
                reserved,
            });
        }

        let members = self.store.lease_members(campaign_id).await?;
        for member in members.iter().take(LEASE_SAMPLE_LIMIT) {
            if !self.store.lease_token_exists(campaign_id, member).await? {
                violations.push(InvariantViolation::MissingLeaseKey {
                    member: member.clone(),
                });
            }
        }

        let leases = self.store.active_leases(campaign_id).await?;
        let mut leased_contacts: HashSet<String> = HashSet::new();
        for lease in &leases {
            leased_contacts.insert(lease.contact_id.clone());
        }

        for priority in [Priority::High, Priority::Normal] {
            let members = self.store.waitlist_members(campaign_id, priority).await?;
            for contact_id in members.iter().take(WAITLIST_SAMPLE_LIMIT) {
                if leased_contacts.contains(contact_id) {
                    violations.push(InvariantViolation::DoubleBooked {
                        contact_id: contact_id.clone(),
                    });
                }
            }
        }

        for violation in &violations {
            self.counters.record(violation);
        }
        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_store::MemoryLeaseStore;
    use dialcast_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;

    const CAMPAIGN: &str = "camp-1";

    fn monitor() -> (InvariantMonitor, Arc<MemoryLeaseStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryLeaseStore::new(clock.clone(), 3));
        let monitor = InvariantMonitor::new(store.clone(), DispatchConfig::default());
        (monitor, store, clock)
    }

    #[test_log::test(tokio::test)]
    async fn test_healthy_campaign_has_no_violations() {
        let (monitor, store, _) = monitor();
        store.set_limit(CAMPAIGN, 3).await.unwrap();
        store
            .enqueue_contacts(CAMPAIGN, &[("c1".to_string(), Priority::High)], false)
            .await
            .unwrap();
        assert!(store
            .acquire_pre(CAMPAIGN, "call-1", "c2", "tok-1", 15_000)
            .await
            .unwrap());

        let violations = monitor.check_campaign(CAMPAIGN).await.unwrap();
        assert_eq!(violations, vec![]);
        assert_eq!(monitor.counters().snapshot().checks_run, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_detects_double_booked_contact() {
        let (monitor, store, _) = monitor();
        store.set_limit(CAMPAIGN, 3).await.unwrap();
        assert!(store
            .acquire_pre(CAMPAIGN, "call-1", "c1", "tok-1", 15_000)
            .await
            .unwrap());
        // The same contact also sits in a waitlist.
        store
            .enqueue_contacts(CAMPAIGN, &[("c1".to_string(), Priority::Normal)], false)
            .await
            .unwrap();

        let violations = monitor.check_campaign(CAMPAIGN).await.unwrap();
        assert_eq!(
            violations,
            vec![InvariantViolation::DoubleBooked {
                contact_id: "c1".to_string()
            }]
        );
        assert_eq!(monitor.counters().snapshot().double_booked, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_detects_lease_member_with_expired_key() {
        let (monitor, store, clock) = monitor();
        store.set_limit(CAMPAIGN, 3).await.unwrap();
        assert!(store
            .acquire_pre(CAMPAIGN, "call-1", "c1", "tok-1", 15_000)
            .await
            .unwrap());

        // The lease key expires while the set member lingers.
        clock.advance_millis(16_000);
        let violations = monitor.check_campaign(CAMPAIGN).await.unwrap();
        assert_eq!(
            violations,
            vec![InvariantViolation::MissingLeaseKey {
                member: "pre-call-1".to_string()
            }]
        );
        assert_eq!(monitor.counters().snapshot().missing_lease_keys, 1);
    }
}
