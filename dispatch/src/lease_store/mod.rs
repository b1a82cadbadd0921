use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dialcast_campaign::types::Priority;
use tokio::sync::broadcast;

use crate::errors::DispatchError;
use crate::types::{
    ColdStartState, CompactReport, JanitorReport, LeaseInfo, LedgerEntry, PromotionOutcome,
    RedisStateSnapshot, ReservedContact,
};

mod memory;
mod redis;

pub use memory::MemoryLeaseStore;
pub use redis::RedisLeaseStore;

/// Builds the Redis keys for one campaign. The campaign id is wrapped
/// in braces so that every key for the campaign hashes to the same
/// cluster slot, permitting multi-key Lua scripts.
#[derive(Debug, Clone)]
pub struct CampaignKeys {
    prefix: String,
    campaign_id: String,
}

impl CampaignKeys {
    pub fn new(campaign_id: &str) -> Self {
        CampaignKeys {
            prefix: format!("campaign:{{{campaign_id}}}"),
            campaign_id: campaign_id.to_string(),
        }
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    pub fn waitlist(&self, priority: Priority) -> String {
        match priority {
            Priority::High => format!("{}:waitlist:high", self.prefix),
            Priority::Normal => format!("{}:waitlist:normal", self.prefix),
        }
    }

    pub fn limit(&self) -> String {
        format!("{}:limit", self.prefix)
    }

    pub fn leases(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    pub fn lease(&self, member: &str) -> String {
        format!("{}:lease:{member}", self.prefix)
    }

    /// The prefix of lease keys, passed to scripts that need to derive
    /// lease keys from set members.
    pub fn lease_prefix(&self) -> String {
        format!("{}:lease:", self.prefix)
    }

    pub fn reserved(&self) -> String {
        format!("{}:reserved", self.prefix)
    }

    pub fn ledger(&self) -> String {
        format!("{}:reserved:ledger", self.prefix)
    }

    pub fn gate(&self) -> String {
        format!("{}:promote-gate", self.prefix)
    }

    pub fn gate_seq(&self) -> String {
        format!("{}:promote-gate:seq", self.prefix)
    }

    pub fn fairness(&self) -> String {
        format!("{}:fairness", self.prefix)
    }

    pub fn coldstart(&self) -> String {
        format!("{}:coldstart", self.prefix)
    }

    pub fn paused(&self) -> String {
        format!("{}:paused", self.prefix)
    }

    pub fn status(&self) -> String {
        format!("{}:status", self.prefix)
    }

    pub fn circuit(&self) -> String {
        format!("{}:cb", self.prefix)
    }

    pub fn circuit_failures(&self) -> String {
        format!("{}:cb:failures", self.prefix)
    }

    pub fn circuit_cooldown(&self) -> String {
        format!("{}:cb:cooldown", self.prefix)
    }

    pub fn circuit_probe(&self) -> String {
        format!("{}:cb:probe", self.prefix)
    }

    pub fn scheduled_retries(&self) -> String {
        format!("{}:retry:scheduled", self.prefix)
    }

    pub fn owner(&self, role: &str) -> String {
        format!("{}:owner:{role}", self.prefix)
    }

    pub fn slot_channel(&self) -> String {
        format!("{}:slot-available", self.prefix)
    }
}

/// Builds the dial idempotency key for a contact within a dedup
/// window bucket.
pub fn dial_idempotency_key(contact_id: &str, bucket: u64) -> String {
    format!("dial:{contact_id}:{bucket}")
}

/// The pause action applied alongside a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAction {
    Set,
    Clear,
    None,
}

impl PauseAction {
    pub(crate) fn as_arg(&self) -> &'static str {
        match self {
            PauseAction::Set => "set",
            PauseAction::Clear => "clear",
            PauseAction::None => "none",
        }
    }
}

/// The cluster-shared scheduling state for campaigns: waitlists,
/// leases, reservations, gates and the assorted flags that coordinate
/// dispatchers across workers.
///
/// The Redis implementation executes every multi-key mutation as an
/// atomic Lua script; the in-memory implementation mirrors the same
/// semantics for tests and sandbox environments.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn set_limit(&self, campaign_id: &str, limit: u32) -> Result<(), DispatchError>;

    async fn limit(&self, campaign_id: &str) -> Result<u32, DispatchError>;

    /// Pushes contacts onto their priority waitlist; `to_head` selects
    /// LPUSH semantics used by retries and push-backs.
    async fn enqueue_contacts(
        &self,
        campaign_id: &str,
        entries: &[(String, Priority)],
        to_head: bool,
    ) -> Result<(), DispatchError>;

    async fn waitlist_lengths(&self, campaign_id: &str) -> Result<(u64, u64), DispatchError>;

    async fn waitlist_members(
        &self,
        campaign_id: &str,
        priority: Priority,
    ) -> Result<Vec<String>, DispatchError>;

    /// The central scheduling primitive; see the reserve_and_promote
    /// Lua script for the full algorithm.
    async fn reserve_and_promote(
        &self,
        campaign_id: &str,
        max_batch: u32,
        reserve_ttl_ms: u64,
        gate_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<PromotionOutcome, DispatchError>;

    /// Converts a reservation held by this worker into a pre-dial
    /// lease. Returns false when the janitor already reaped the
    /// reservation.
    async fn convert_reservation(
        &self,
        campaign_id: &str,
        contact_id: &str,
        origin: Priority,
        call_id: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    /// Single-attempt admission fast path that skips the reservation
    /// phase. Returns false at capacity.
    async fn acquire_pre(
        &self,
        campaign_id: &str,
        call_id: &str,
        contact_id: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    async fn renew(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    async fn promote_to_active(
        &self,
        campaign_id: &str,
        call_id: &str,
        token: &str,
        active_ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    async fn release(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        publish: bool,
    ) -> Result<bool, DispatchError>;

    /// Removes a lease without a token check. Only the reconciler uses
    /// this, when the durable store proves the call is over and the
    /// holder is gone.
    async fn force_release(
        &self,
        campaign_id: &str,
        member: &str,
        publish: bool,
    ) -> Result<bool, DispatchError>;

    async fn inflight_count(&self, campaign_id: &str) -> Result<u64, DispatchError>;

    async fn reserved_count(&self, campaign_id: &str) -> Result<u64, DispatchError>;

    async fn ledger_entries(&self, campaign_id: &str) -> Result<Vec<LedgerEntry>, DispatchError>;

    async fn active_leases(&self, campaign_id: &str) -> Result<Vec<LeaseInfo>, DispatchError>;

    /// The raw lease set members, including any whose lease key has
    /// expired. Used by the invariant monitor to detect desync.
    async fn lease_members(&self, campaign_id: &str) -> Result<Vec<String>, DispatchError>;

    async fn lease_token_exists(
        &self,
        campaign_id: &str,
        member: &str,
    ) -> Result<bool, DispatchError>;

    async fn gate_seq(&self, campaign_id: &str) -> Result<u64, DispatchError>;

    /// Reaps reservations older than `orphan_age_ms`, clears gates
    /// older than `stale_gate_age_ms` (or stripped of their expiry)
    /// and repairs lease set/key desync.
    async fn janitor_scan(
        &self,
        campaign_id: &str,
        now_ms: u64,
        orphan_age_ms: u64,
        stale_gate_age_ms: u64,
    ) -> Result<JanitorReport, DispatchError>;

    async fn compact_waitlist(
        &self,
        campaign_id: &str,
        priority: Priority,
        max_length: u64,
    ) -> Result<CompactReport, DispatchError>;

    /// Applies a lifecycle transition to the Redis status mirror with
    /// CAS semantics, toggling the pause flag atomically.
    async fn apply_transition(
        &self,
        campaign_id: &str,
        expected: &[&str],
        new_status: &str,
        pause: PauseAction,
    ) -> Result<bool, DispatchError>;

    async fn is_paused(&self, campaign_id: &str) -> Result<bool, DispatchError>;

    async fn set_coldstart_block(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<(), DispatchError>;

    async fn mark_coldstart_done(&self, campaign_id: &str, ttl_ms: u64)
        -> Result<(), DispatchError>;

    async fn coldstart_state(&self, campaign_id: &str) -> Result<ColdStartState, DispatchError>;

    /// Claims the dial idempotency key for a contact within a dedup
    /// window bucket. Returns false when another worker already
    /// claimed the window.
    async fn try_claim_dial(
        &self,
        contact_id: &str,
        bucket: u64,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    async fn schedule_retry(
        &self,
        campaign_id: &str,
        contact_id: &str,
        origin: Priority,
        fire_at_ms: u64,
    ) -> Result<(), DispatchError>;

    /// Moves due retry jobs back to the head of their origin waitlist,
    /// returning the contacts that fired.
    async fn fire_due_retries(
        &self,
        campaign_id: &str,
        now_ms: u64,
    ) -> Result<Vec<ReservedContact>, DispatchError>;

    async fn cancel_scheduled_retries(&self, campaign_id: &str) -> Result<u64, DispatchError>;

    /// Records one dial failure in the breaker window, returning the
    /// current failure count.
    async fn record_dial_failure(
        &self,
        campaign_id: &str,
        window_ms: u64,
    ) -> Result<u64, DispatchError>;

    async fn open_circuit(&self, campaign_id: &str, ttl_ms: u64) -> Result<(), DispatchError>;

    async fn is_circuit_open(&self, campaign_id: &str) -> Result<bool, DispatchError>;

    async fn circuit_in_cooldown(&self, campaign_id: &str) -> Result<bool, DispatchError>;

    async fn try_claim_half_open_probe(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    async fn reset_circuit(&self, campaign_id: &str) -> Result<(), DispatchError>;

    async fn try_claim_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    async fn renew_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError>;

    async fn release_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
    ) -> Result<bool, DispatchError>;

    async fn snapshot(&self, campaign_id: &str) -> Result<RedisStateSnapshot, DispatchError>;

    /// A receiver that fires when a slot is released for the campaign,
    /// waking idle promoters without polling.
    fn slot_signal(&self, campaign_id: &str) -> broadcast::Receiver<()>;
}

/// Routes slot-available pub/sub wake-ups to per-campaign broadcast
/// channels. The Redis store publishes into this registry from the
/// connection's push-message pump; the in-memory store publishes
/// directly on release.
#[derive(Default)]
pub struct SlotSignals {
    channels: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl SlotSignals {
    pub fn new() -> Self {
        SlotSignals::default()
    }

    pub fn subscribe(&self, campaign_id: &str) -> broadcast::Receiver<()> {
        let mut channels = self.channels.lock().expect("lock should not be poisoned");
        channels
            .entry(campaign_id.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe()
    }

    pub fn notify(&self, campaign_id: &str) {
        let channels = self.channels.lock().expect("lock should not be poisoned");
        if let Some(sender) = channels.get(campaign_id) {
            // Send failures only mean there are no current subscribers.
            let _ = sender.send(());
        }
    }

    /// Extracts the campaign id from a slot-available channel name
    /// and notifies its subscribers.
    pub fn notify_channel(&self, channel_name: &str) {
        if let Some(campaign_id) = parse_slot_channel(channel_name) {
            self.notify(campaign_id);
        }
    }
}

fn parse_slot_channel(channel_name: &str) -> Option<&str> {
    let rest = channel_name.strip_prefix("campaign:{")?;
    let (campaign_id, suffix) = rest.split_once('}')?;
    if suffix == ":slot-available" {
        Some(campaign_id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use coverage_helper::test;
    use super::*;

    #[test]
    fn test_campaign_keys_share_the_hash_tag() {
        let keys = CampaignKeys::new("camp-1");
        assert_eq!(keys.waitlist(Priority::High), "campaign:{camp-1}:waitlist:high");
        assert_eq!(
            keys.waitlist(Priority::Normal),
            "campaign:{camp-1}:waitlist:normal"
        );
        assert_eq!(keys.limit(), "campaign:{camp-1}:limit");
        assert_eq!(keys.lease("pre-abc"), "campaign:{camp-1}:lease:pre-abc");
        assert_eq!(keys.ledger(), "campaign:{camp-1}:reserved:ledger");
        assert_eq!(keys.owner("janitor"), "campaign:{camp-1}:owner:janitor");
        assert_eq!(keys.slot_channel(), "campaign:{camp-1}:slot-available");
    }

    #[test]
    fn test_dial_idempotency_key_format() {
        assert_eq!(dial_idempotency_key("contact-7", 5503), "dial:contact-7:5503");
    }

    #[test]
    fn test_parse_slot_channel() {
        assert_eq!(
            parse_slot_channel("campaign:{camp-1}:slot-available"),
            Some("camp-1")
        );
        assert_eq!(parse_slot_channel("campaign:{camp-1}:paused"), None);
        assert_eq!(parse_slot_channel("other"), None);
    }

    #[test]
    fn test_slot_signals_wake_subscribers() {
        let signals = SlotSignals::new();
        let mut receiver = signals.subscribe("camp-1");
        signals.notify_channel("campaign:{camp-1}:slot-available");
        assert!(receiver.try_recv().is_ok());
    }
}
