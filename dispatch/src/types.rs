use dialcast_campaign::types::Priority;
use serde::Serialize;

/// Tunable timing and capacity configuration for the dispatch
/// subsystem. All durations are in milliseconds; the environment
/// keys they are sourced from express seconds unless suffixed `_MS`.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Default concurrency limit applied when a campaign does not
    /// specify one.
    pub limit_default: u32,
    /// Base TTL for a pre-dial lease.
    pub pre_dial_base_ms: u64,
    /// Upper bound of the uniform jitter added to pre-dial lease TTLs.
    pub pre_dial_jitter_ms: u64,
    /// Hard cap on the total pre-dial lifetime of a lease, including
    /// the single renewal permitted on ringing.
    pub pre_dial_max_ms: u64,
    /// Base TTL for an active lease.
    pub active_lease_base_ms: u64,
    /// Upper bound of the uniform jitter added to active lease TTLs.
    pub active_lease_jitter_ms: u64,
    /// TTL of the reserved counter; strictly greater than
    /// `pre_dial_max_ms` so a reservation cannot outlive the lease
    /// it becomes.
    pub reservation_ttl_ms: u64,
    /// TTL of the promotion gate; at least twice the maximum
    /// promoter backoff.
    pub gate_ttl_ms: u64,
    /// High-to-normal pop ratio for promotion batches.
    pub fairness_ratio: u32,
    /// Window after campaign (re)start during which dispatch is
    /// blocked while reconciliation runs.
    pub coldstart_block_ms: u64,
    pub janitor_interval_ms: u64,
    pub compactor_interval_ms: u64,
    pub reconciler_interval_ms: u64,
    pub invariant_interval_ms: u64,
    /// Age beyond which a reservation-ledger entry is considered
    /// orphaned and reaped by the janitor.
    pub reservation_orphan_age_ms: u64,
    /// Age beyond which a promotion gate entry is considered stale.
    pub stale_gate_age_ms: u64,
    /// TTL of the dial idempotency key; also the dedup window size.
    pub dial_idempotency_ttl_ms: u64,
    /// Number of dial failures within the breaker window that opens
    /// the circuit.
    pub cb_failure_threshold: u32,
    /// The sliding window over which dial failures are counted.
    pub cb_window_ms: u64,
    /// How long the circuit stays open before a half-open probe
    /// is permitted.
    pub cb_open_ttl_ms: u64,
    /// Per-campaign cap applied to each waitlist by the compactor.
    pub max_waitlist_length: u64,
    /// Maximum number of contacts promoted in a single batch.
    pub max_batch: u32,
    /// TTL of per-campaign ownership keys for background loops.
    pub ownership_ttl_ms: u64,
    /// Hard cap on the duration of one call before the dispatcher
    /// hangs up and releases the lease.
    pub call_max_duration_ms: u64,
    /// How often a dispatcher re-checks the pause flag, circuit
    /// breaker and cold-start marker while they block dispatch.
    pub blocked_poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            limit_default: 1,
            pre_dial_base_ms: 15_000,
            pre_dial_jitter_ms: 5_000,
            pre_dial_max_ms: 45_000,
            active_lease_base_ms: 180_000,
            active_lease_jitter_ms: 60_000,
            reservation_ttl_ms: 70_000,
            gate_ttl_ms: 20_000,
            fairness_ratio: 3,
            coldstart_block_ms: 90_000,
            janitor_interval_ms: 30_000,
            compactor_interval_ms: 120_000,
            reconciler_interval_ms: 900_000,
            invariant_interval_ms: 30_000,
            reservation_orphan_age_ms: 60_000,
            stale_gate_age_ms: 15_000,
            dial_idempotency_ttl_ms: 300_000,
            cb_failure_threshold: 10,
            cb_window_ms: 60_000,
            cb_open_ttl_ms: 30_000,
            max_waitlist_length: 100_000,
            max_batch: 8,
            ownership_ttl_ms: 60_000,
            call_max_duration_ms: 600_000,
            blocked_poll_interval_ms: 2_000,
        }
    }
}

/// A contact that has been granted a reservation in a promotion batch.
/// The origin priority class is tracked so a push-back restores the
/// contact to the waitlist it was popped from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedContact {
    pub contact_id: String,
    pub origin: Priority,
}

/// The result of a `reserve_and_promote` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionOutcome {
    /// Contacts that now hold reservations, in pop order.
    pub granted: Vec<ReservedContact>,
    /// The promotion gate sequence observed for this batch; zero when
    /// nothing was promoted.
    pub seq: u64,
    /// The number of popped contacts that were pushed back for lack
    /// of capacity.
    pub pushed_back: u64,
}

/// The result of a janitor scan over one campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JanitorReport {
    /// Orphaned reservations reaped and restored to their waitlists.
    pub reservations_reaped: u64,
    /// Stale promotion gates cleared.
    pub gates_cleared: u64,
    /// Lease-set members released because their lease key had expired.
    pub desynced_released: u64,
}

/// The result of compacting one waitlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub duplicates_removed: u64,
    pub trimmed: u64,
}

/// The cold-start state of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartState {
    /// Reconciliation is in progress; dispatch must not start attempts.
    Blocked,
    /// Reconciliation completed recently; dispatch may proceed.
    Done,
    /// No cold-start marker present; dispatch may proceed.
    Unset,
}

/// A lease currently held for a campaign, as seen by the reconciler
/// and the maintenance API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseInfo {
    /// The lease set member, either `pre-{callId}` or `{callId}`.
    pub member: String,
    /// The contact the lease was issued for.
    pub contact_id: String,
}

impl LeaseInfo {
    pub fn is_pre_dial(&self) -> bool {
        self.member.starts_with("pre-")
    }
}

/// A raw dump of the scheduling state for one campaign, surfaced
/// through the maintenance API.
#[derive(Debug, Clone, Serialize)]
pub struct RedisStateSnapshot {
    pub limit: u32,
    pub inflight: u64,
    pub reserved: u64,
    pub leases: Vec<LeaseInfo>,
    pub ledger: Vec<LedgerEntry>,
    pub queued_high: u64,
    pub queued_normal: u64,
    pub scheduled_retries: u64,
    pub paused: bool,
    pub gate_seq: u64,
}

/// A reservation ledger entry: the priority-prefixed contact id and
/// the time the reservation was promoted.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub member: String,
    pub promoted_at_ms: u64,
}

/// Builds the lease set member for a pre-dial lease.
pub fn pre_dial_member(call_id: &str) -> String {
    format!("pre-{call_id}")
}

/// Builds the reservation ledger member for a contact, encoding the
/// origin priority class in the prefix.
pub fn ledger_member(origin: Priority, contact_id: &str) -> String {
    format!("{}:{}", origin.prefix(), contact_id)
}

/// Builds the promotion gate value, encoding the sequence number and
/// the time the gate was set so the janitor can age it.
pub fn gate_value(seq: u64, set_at_ms: u64) -> String {
    format!("{seq}|{set_at_ms}")
}

/// Splits a promotion gate value back into its sequence number and
/// set time.
pub fn parse_gate_value(value: &str) -> Option<(u64, u64)> {
    let (seq, set_at_ms) = value.split_once('|')?;
    Some((seq.parse().ok()?, set_at_ms.parse().ok()?))
}

/// Splits a reservation ledger member back into its priority class
/// and contact id.
pub fn parse_ledger_member(member: &str) -> Option<(Priority, &str)> {
    let (prefix, contact_id) = member.split_once(':')?;
    Some((Priority::from_prefix(prefix)?, contact_id))
}

#[cfg(test)]
mod tests {
    use coverage_helper::test;
    use super::*;

    #[test]
    fn test_ledger_member_round_trip() {
        let member = ledger_member(Priority::High, "contact-42");
        assert_eq!(member, "H:contact-42");
        assert_eq!(
            parse_ledger_member(&member),
            Some((Priority::High, "contact-42"))
        );
        assert_eq!(parse_ledger_member("bogus"), None);
        assert_eq!(parse_ledger_member("X:contact-42"), None);
    }

    #[test]
    fn test_gate_value_round_trip() {
        let value = gate_value(17, 1_700_000_000_000);
        assert_eq!(value, "17|1700000000000");
        assert_eq!(parse_gate_value(&value), Some((17, 1_700_000_000_000)));
        assert_eq!(parse_gate_value("17"), None);
        assert_eq!(parse_gate_value("seq|then"), None);
    }

    #[test]
    fn test_default_config_honours_safety_margins() {
        let config = DispatchConfig::default();
        // A reservation must outlive the longest possible pre-dial phase.
        assert!(config.reservation_ttl_ms > config.pre_dial_max_ms);
        // A single renewal must not extend a pre-dial lease past the cap.
        assert!(config.pre_dial_base_ms + config.pre_dial_jitter_ms <= config.pre_dial_max_ms);
    }

    #[test]
    fn test_pre_dial_member_format() {
        assert_eq!(pre_dial_member("abc"), "pre-abc");
        let info = LeaseInfo {
            member: pre_dial_member("abc"),
            contact_id: "c1".to_string(),
        };
        assert!(info.is_pre_dial());
    }
}
