use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dialcast_campaign::types::Priority;
use dialcast_helpers::time::Clock;
use tokio::sync::broadcast;

use crate::errors::DispatchError;
use crate::lease_store::{dial_idempotency_key, LeaseStore, PauseAction, SlotSignals};
use crate::types::{
    gate_value, ledger_member, parse_gate_value, parse_ledger_member, pre_dial_member,
    ColdStartState, CompactReport, JanitorReport, LeaseInfo, LedgerEntry, PromotionOutcome,
    RedisStateSnapshot, ReservedContact,
};

const COLDSTART_DONE_SENTINEL: &str = "done";
const FAIRNESS_TTL_MS: u64 = 300_000;

/// A value with an optional expiry, mirroring a Redis string with TTL.
/// Expiry is evaluated lazily against the store's clock.
#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    expires_at_ms: Option<u64>,
}

impl Expiring {
    fn new(value: impl Into<String>, now_ms: u64, ttl_ms: u64) -> Self {
        Expiring {
            value: value.into(),
            expires_at_ms: Some(now_ms + ttl_ms),
        }
    }

    fn live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|expires| expires > now_ms)
    }
}

fn live_value(slot: &mut Option<Expiring>, now_ms: u64) -> Option<&Expiring> {
    if slot.as_ref().is_some_and(|e| !e.live(now_ms)) {
        *slot = None;
    }
    slot.as_ref()
}

fn live_number(slot: &mut Option<Expiring>, now_ms: u64) -> u64 {
    live_value(slot, now_ms)
        .and_then(|e| e.value.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct CampaignState {
    limit: Option<Expiring>,
    waitlist_high: VecDeque<String>,
    waitlist_normal: VecDeque<String>,
    leases: HashSet<String>,
    lease_keys: HashMap<String, Expiring>,
    reserved: Option<Expiring>,
    ledger: HashMap<String, u64>,
    fairness: Option<Expiring>,
    gate_seq: u64,
    gate: Option<Expiring>,
    status: Option<String>,
    paused: Option<Expiring>,
    coldstart: Option<Expiring>,
    circuit: Option<Expiring>,
    circuit_failures: Option<Expiring>,
    circuit_cooldown: Option<Expiring>,
    circuit_probe: Option<Expiring>,
    scheduled_retries: HashMap<String, u64>,
    owners: HashMap<String, Expiring>,
}

impl CampaignState {
    fn waitlist(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::High => &mut self.waitlist_high,
            Priority::Normal => &mut self.waitlist_normal,
        }
    }

    fn live_lease_key(&mut self, member: &str, now_ms: u64) -> Option<&Expiring> {
        if self
            .lease_keys
            .get(member)
            .is_some_and(|e| !e.live(now_ms))
        {
            self.lease_keys.remove(member);
        }
        self.lease_keys.get(member)
    }
}

/// An in-memory implementation of the `LeaseStore` trait with the same
/// semantics as the Redis-backed store, including TTL expiry driven by
/// the provided clock.
/// This is intended to be used in test and sandbox environments;
/// this should not be used in production.
pub struct MemoryLeaseStore {
    clock: Arc<dyn Clock>,
    fairness_ratio: u32,
    signals: Arc<SlotSignals>,
    campaigns: Mutex<HashMap<String, CampaignState>>,
    dial_claims: Mutex<HashMap<String, u64>>,
}

impl MemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>, fairness_ratio: u32) -> Self {
        MemoryLeaseStore {
            clock,
            fairness_ratio,
            signals: Arc::new(SlotSignals::new()),
            campaigns: Mutex::new(HashMap::new()),
            dial_claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn signals(&self) -> Arc<SlotSignals> {
        self.signals.clone()
    }

    fn with_campaign<R>(&self, campaign_id: &str, f: impl FnOnce(&mut CampaignState, u64) -> R) -> R {
        let now_ms = self.clock.now_millis();
        let mut campaigns = self.campaigns.lock().expect("lock should not be poisoned");
        let state = campaigns.entry(campaign_id.to_string()).or_default();
        f(state, now_ms)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn set_limit(&self, campaign_id: &str, limit: u32) -> Result<(), DispatchError> {
        self.with_campaign(campaign_id, |state, now_ms| {
            state.limit = Some(Expiring::new(
                limit.to_string(),
                now_ms,
                7 * 24 * 60 * 60 * 1000,
            ));
        });
        Ok(())
    }

    async fn limit(&self, campaign_id: &str) -> Result<u32, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            live_number(&mut state.limit, now_ms) as u32
        }))
    }

    async fn enqueue_contacts(
        &self,
        campaign_id: &str,
        entries: &[(String, Priority)],
        to_head: bool,
    ) -> Result<(), DispatchError> {
        self.with_campaign(campaign_id, |state, _| {
            if to_head {
                for (contact_id, priority) in entries.iter().rev() {
                    state.waitlist(*priority).push_front(contact_id.clone());
                }
            } else {
                for (contact_id, priority) in entries {
                    state.waitlist(*priority).push_back(contact_id.clone());
                }
            }
        });
        Ok(())
    }

    async fn waitlist_lengths(&self, campaign_id: &str) -> Result<(u64, u64), DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| {
            (
                state.waitlist_high.len() as u64,
                state.waitlist_normal.len() as u64,
            )
        }))
    }

    async fn waitlist_members(
        &self,
        campaign_id: &str,
        priority: Priority,
    ) -> Result<Vec<String>, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| {
            state.waitlist(priority).iter().cloned().collect()
        }))
    }

    async fn reserve_and_promote(
        &self,
        campaign_id: &str,
        max_batch: u32,
        reserve_ttl_ms: u64,
        gate_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<PromotionOutcome, DispatchError> {
        let ratio = self.fairness_ratio as u64;
        Ok(self.with_campaign(campaign_id, |state, clock_now_ms| {
            let fairness = live_number(&mut state.fairness, clock_now_ms) + 1;
            state.fairness = Some(Expiring::new(
                fairness.to_string(),
                clock_now_ms,
                FAIRNESS_TTL_MS,
            ));

            let max_batch = max_batch as usize;
            let mut popped: Vec<(String, Priority)> = Vec::new();

            let invert = fairness % (ratio + 1) == 0;
            if invert {
                if let Some(id) = state.waitlist_normal.pop_front() {
                    popped.push((id, Priority::Normal));
                }
            }

            let high_target = if invert {
                max_batch
            } else {
                (max_batch * ratio as usize).div_ceil(ratio as usize + 1)
            };

            while popped.len() < high_target {
                let Some(id) = state.waitlist_high.pop_front() else {
                    break;
                };
                popped.push((id, Priority::High));
            }
            while popped.len() < max_batch {
                let Some(id) = state.waitlist_normal.pop_front() else {
                    break;
                };
                popped.push((id, Priority::Normal));
            }
            let mut progressing = true;
            while popped.len() < max_batch && progressing {
                progressing = false;
                if let Some(id) = state.waitlist_high.pop_front() {
                    popped.push((id, Priority::High));
                    progressing = true;
                }
                if popped.len() < max_batch {
                    if let Some(id) = state.waitlist_normal.pop_front() {
                        popped.push((id, Priority::Normal));
                        progressing = true;
                    }
                }
            }

            let limit = live_number(&mut state.limit, clock_now_ms);
            let inflight = state.leases.len() as u64;
            let reserved = live_number(&mut state.reserved, clock_now_ms);
            let available = limit.saturating_sub(inflight + reserved) as usize;

            let granted_count = popped.len().min(available);
            let mut seq = 0;
            if granted_count > 0 {
                state.reserved = Some(Expiring::new(
                    (reserved + granted_count as u64).to_string(),
                    clock_now_ms,
                    reserve_ttl_ms,
                ));
                for (contact_id, origin) in popped.iter().take(granted_count) {
                    state
                        .ledger
                        .insert(ledger_member(*origin, contact_id), now_ms);
                }
                state.gate_seq += 1;
                seq = state.gate_seq;
                state.gate = Some(Expiring::new(
                    gate_value(seq, now_ms),
                    clock_now_ms,
                    gate_ttl_ms,
                ));
            }

            let pushed_back = popped.len() - granted_count;
            for (contact_id, origin) in popped.drain(granted_count..).rev() {
                match origin {
                    Priority::High => state.waitlist_high.push_front(contact_id),
                    Priority::Normal => state.waitlist_normal.push_front(contact_id),
                }
            }

            PromotionOutcome {
                granted: popped
                    .into_iter()
                    .map(|(contact_id, origin)| ReservedContact { contact_id, origin })
                    .collect(),
                seq,
                pushed_back: pushed_back as u64,
            }
        }))
    }

    async fn convert_reservation(
        &self,
        campaign_id: &str,
        contact_id: &str,
        origin: Priority,
        call_id: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            let member = ledger_member(origin, contact_id);
            if state.ledger.remove(&member).is_none() {
                return false;
            }

            let reserved = live_number(&mut state.reserved, now_ms);
            if reserved <= 1 {
                state.reserved = None;
            } else if let Some(expiring) = state.reserved.as_mut() {
                expiring.value = (reserved - 1).to_string();
            }

            let lease_member = pre_dial_member(call_id);
            state.leases.insert(lease_member.clone());
            state.lease_keys.insert(
                lease_member,
                Expiring::new(format!("{token}|{contact_id}"), now_ms, ttl_ms),
            );
            true
        }))
    }

    async fn acquire_pre(
        &self,
        campaign_id: &str,
        call_id: &str,
        contact_id: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            let limit = live_number(&mut state.limit, now_ms);
            if limit == 0 || state.leases.len() as u64 >= limit {
                return false;
            }
            let member = pre_dial_member(call_id);
            state.leases.insert(member.clone());
            state.lease_keys.insert(
                member,
                Expiring::new(format!("{token}|{contact_id}"), now_ms, ttl_ms),
            );
            true
        }))
    }

    async fn renew(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            let Some(existing) = state.live_lease_key(member, now_ms) else {
                return false;
            };
            if !lease_token_matches(&existing.value, token) {
                return false;
            }
            let value = existing.value.clone();
            state
                .lease_keys
                .insert(member.to_string(), Expiring::new(value, now_ms, ttl_ms));
            true
        }))
    }

    async fn promote_to_active(
        &self,
        campaign_id: &str,
        call_id: &str,
        token: &str,
        active_ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            let pre_member = pre_dial_member(call_id);
            let Some(existing) = state.live_lease_key(&pre_member, now_ms) else {
                return false;
            };
            if !lease_token_matches(&existing.value, token) {
                return false;
            }
            let value = existing.value.clone();
            state.leases.remove(&pre_member);
            state.lease_keys.remove(&pre_member);
            state.leases.insert(call_id.to_string());
            state
                .lease_keys
                .insert(call_id.to_string(), Expiring::new(value, now_ms, active_ttl_ms));
            true
        }))
    }

    async fn release(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        publish: bool,
    ) -> Result<bool, DispatchError> {
        let released = self.with_campaign(campaign_id, |state, now_ms| {
            let Some(existing) = state.live_lease_key(member, now_ms) else {
                return false;
            };
            if !lease_token_matches(&existing.value, token) {
                return false;
            }
            state.lease_keys.remove(member);
            state.leases.remove(member);
            true
        });

        if released && publish {
            self.signals.notify(campaign_id);
        }
        Ok(released)
    }

    async fn force_release(
        &self,
        campaign_id: &str,
        member: &str,
        publish: bool,
    ) -> Result<bool, DispatchError> {
        let removed = self.with_campaign(campaign_id, |state, _| {
            state.lease_keys.remove(member);
            state.leases.remove(member)
        });
        if removed && publish {
            self.signals.notify(campaign_id);
        }
        Ok(removed)
    }

    async fn inflight_count(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| state.leases.len() as u64))
    }

    async fn reserved_count(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            live_number(&mut state.reserved, now_ms)
        }))
    }

    async fn ledger_entries(&self, campaign_id: &str) -> Result<Vec<LedgerEntry>, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| {
            let mut entries: Vec<LedgerEntry> = state
                .ledger
                .iter()
                .map(|(member, promoted_at_ms)| LedgerEntry {
                    member: member.clone(),
                    promoted_at_ms: *promoted_at_ms,
                })
                .collect();
            entries.sort_by_key(|e| (e.promoted_at_ms, e.member.clone()));
            entries
        }))
    }

    async fn active_leases(&self, campaign_id: &str) -> Result<Vec<LeaseInfo>, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            let members: Vec<String> = state.leases.iter().cloned().collect();
            let mut leases = Vec::new();
            for member in members {
                if let Some(existing) = state.live_lease_key(&member, now_ms) {
                    let contact_id = existing
                        .value
                        .split_once('|')
                        .map(|(_, contact_id)| contact_id)
                        .unwrap_or_default();
                    leases.push(LeaseInfo {
                        member: member.clone(),
                        contact_id: contact_id.to_string(),
                    });
                }
            }
            leases.sort_by(|a, b| a.member.cmp(&b.member));
            leases
        }))
    }

    async fn lease_members(&self, campaign_id: &str) -> Result<Vec<String>, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| {
            let mut members: Vec<String> = state.leases.iter().cloned().collect();
            members.sort();
            members
        }))
    }

    async fn lease_token_exists(
        &self,
        campaign_id: &str,
        member: &str,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            state.live_lease_key(member, now_ms).is_some()
        }))
    }

    async fn gate_seq(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            live_value(&mut state.gate, now_ms)
                .and_then(|e| parse_gate_value(&e.value))
                .map(|(seq, _)| seq)
                .unwrap_or(0)
        }))
    }

    async fn janitor_scan(
        &self,
        campaign_id: &str,
        now_ms: u64,
        orphan_age_ms: u64,
        stale_gate_age_ms: u64,
    ) -> Result<JanitorReport, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, clock_now_ms| {
            let cutoff = now_ms.saturating_sub(orphan_age_ms);
            let orphans: Vec<String> = state
                .ledger
                .iter()
                .filter(|(_, promoted_at)| **promoted_at <= cutoff)
                .map(|(member, _)| member.clone())
                .collect();

            let mut reaped = 0;
            for member in orphans {
                state.ledger.remove(&member);
                if let Some((origin, contact_id)) = parse_ledger_member(&member) {
                    match origin {
                        Priority::High => state.waitlist_high.push_front(contact_id.to_string()),
                        Priority::Normal => {
                            state.waitlist_normal.push_front(contact_id.to_string())
                        }
                    }
                }
                let reserved = live_number(&mut state.reserved, clock_now_ms);
                if reserved <= 1 {
                    state.reserved = None;
                } else if let Some(expiring) = state.reserved.as_mut() {
                    expiring.value = (reserved - 1).to_string();
                }
                reaped += 1;
            }

            // A gate without an expiry cannot occur in this store, so
            // only the age check applies.
            let gate_is_stale = live_value(&mut state.gate, clock_now_ms)
                .and_then(|gate| parse_gate_value(&gate.value))
                .is_some_and(|(_, set_at_ms)| {
                    now_ms.saturating_sub(set_at_ms) > stale_gate_age_ms
                });
            let mut gates_cleared = 0;
            if gate_is_stale {
                state.gate = None;
                gates_cleared = 1;
            }

            let members: Vec<String> = state.leases.iter().cloned().collect();
            let mut desynced = 0;
            for member in members {
                if state.live_lease_key(&member, clock_now_ms).is_none() {
                    state.leases.remove(&member);
                    desynced += 1;
                }
            }

            JanitorReport {
                reservations_reaped: reaped,
                gates_cleared,
                desynced_released: desynced,
            }
        }))
    }

    async fn compact_waitlist(
        &self,
        campaign_id: &str,
        priority: Priority,
        max_length: u64,
    ) -> Result<CompactReport, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| {
            let list = state.waitlist(priority);
            let mut seen = HashSet::new();
            let mut kept = VecDeque::new();
            let mut duplicates = 0;
            for id in list.drain(..) {
                if seen.insert(id.clone()) {
                    kept.push_back(id);
                } else {
                    duplicates += 1;
                }
            }
            let mut trimmed = 0;
            while kept.len() as u64 > max_length {
                kept.pop_back();
                trimmed += 1;
            }
            *list = kept;
            CompactReport {
                duplicates_removed: duplicates,
                trimmed,
            }
        }))
    }

    async fn apply_transition(
        &self,
        campaign_id: &str,
        expected: &[&str],
        new_status: &str,
        pause: PauseAction,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            let matched = match &state.status {
                None => true,
                Some(current) => current == new_status || expected.contains(&current.as_str()),
            };
            if !matched {
                return false;
            }
            state.status = Some(new_status.to_string());
            match pause {
                PauseAction::Set => {
                    state.paused =
                        Some(Expiring::new("1", now_ms, 24 * 60 * 60 * 1000));
                }
                PauseAction::Clear => {
                    state.paused = None;
                }
                PauseAction::None => {}
            }
            true
        }))
    }

    async fn is_paused(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            live_value(&mut state.paused, now_ms).is_some()
        }))
    }

    async fn set_coldstart_block(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<(), DispatchError> {
        self.with_campaign(campaign_id, |state, now_ms| {
            state.coldstart = Some(Expiring::new("blocked", now_ms, ttl_ms));
        });
        Ok(())
    }

    async fn mark_coldstart_done(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<(), DispatchError> {
        self.with_campaign(campaign_id, |state, now_ms| {
            state.coldstart = Some(Expiring::new(COLDSTART_DONE_SENTINEL, now_ms, ttl_ms));
        });
        Ok(())
    }

    async fn coldstart_state(&self, campaign_id: &str) -> Result<ColdStartState, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            match live_value(&mut state.coldstart, now_ms) {
                None => ColdStartState::Unset,
                Some(existing) if existing.value == COLDSTART_DONE_SENTINEL => ColdStartState::Done,
                Some(_) => ColdStartState::Blocked,
            }
        }))
    }

    async fn try_claim_dial(
        &self,
        contact_id: &str,
        bucket: u64,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let now_ms = self.clock.now_millis();
        let mut claims = self
            .dial_claims
            .lock()
            .expect("lock should not be poisoned");
        let key = dial_idempotency_key(contact_id, bucket);
        if claims.get(&key).is_some_and(|expires| *expires > now_ms) {
            return Ok(false);
        }
        claims.insert(key, now_ms + ttl_ms);
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        campaign_id: &str,
        contact_id: &str,
        origin: Priority,
        fire_at_ms: u64,
    ) -> Result<(), DispatchError> {
        self.with_campaign(campaign_id, |state, _| {
            state
                .scheduled_retries
                .insert(ledger_member(origin, contact_id), fire_at_ms);
        });
        Ok(())
    }

    async fn fire_due_retries(
        &self,
        campaign_id: &str,
        now_ms: u64,
    ) -> Result<Vec<ReservedContact>, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| {
            let mut due: Vec<(String, u64)> = state
                .scheduled_retries
                .iter()
                .filter(|(_, fire_at)| **fire_at <= now_ms)
                .map(|(member, fire_at)| (member.clone(), *fire_at))
                .collect();
            due.sort_by_key(|(member, fire_at)| (*fire_at, member.clone()));

            let mut fired = Vec::new();
            for (member, _) in due {
                state.scheduled_retries.remove(&member);
                if let Some((origin, contact_id)) = parse_ledger_member(&member) {
                    match origin {
                        Priority::High => state.waitlist_high.push_front(contact_id.to_string()),
                        Priority::Normal => {
                            state.waitlist_normal.push_front(contact_id.to_string())
                        }
                    }
                    fired.push(ReservedContact {
                        contact_id: contact_id.to_string(),
                        origin,
                    });
                }
            }
            fired
        }))
    }

    async fn cancel_scheduled_retries(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, _| {
            let count = state.scheduled_retries.len() as u64;
            state.scheduled_retries.clear();
            count
        }))
    }

    async fn record_dial_failure(
        &self,
        campaign_id: &str,
        window_ms: u64,
    ) -> Result<u64, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            let count = live_number(&mut state.circuit_failures, now_ms) + 1;
            let expires_at = match &state.circuit_failures {
                // Preserve the window start set by the first failure.
                Some(existing) => existing.expires_at_ms,
                None => Some(now_ms + window_ms),
            };
            state.circuit_failures = Some(Expiring {
                value: count.to_string(),
                expires_at_ms: expires_at,
            });
            count
        }))
    }

    async fn open_circuit(&self, campaign_id: &str, ttl_ms: u64) -> Result<(), DispatchError> {
        self.with_campaign(campaign_id, |state, now_ms| {
            state.circuit = Some(Expiring::new("open", now_ms, ttl_ms));
            state.circuit_cooldown = Some(Expiring::new("1", now_ms, ttl_ms * 2));
        });
        Ok(())
    }

    async fn is_circuit_open(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            live_value(&mut state.circuit, now_ms).is_some()
        }))
    }

    async fn circuit_in_cooldown(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            live_value(&mut state.circuit_cooldown, now_ms).is_some()
        }))
    }

    async fn try_claim_half_open_probe(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            if live_value(&mut state.circuit_probe, now_ms).is_some() {
                return false;
            }
            state.circuit_probe = Some(Expiring::new("1", now_ms, ttl_ms));
            true
        }))
    }

    async fn reset_circuit(&self, campaign_id: &str) -> Result<(), DispatchError> {
        self.with_campaign(campaign_id, |state, _| {
            state.circuit = None;
            state.circuit_cooldown = None;
            state.circuit_failures = None;
            state.circuit_probe = None;
        });
        Ok(())
    }

    async fn try_claim_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            if let Some(existing) = state.owners.get(role) {
                if existing.live(now_ms) && existing.value != owner {
                    return false;
                }
            }
            state
                .owners
                .insert(role.to_string(), Expiring::new(owner, now_ms, ttl_ms));
            true
        }))
    }

    async fn renew_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            match state.owners.get(role) {
                Some(existing) if existing.live(now_ms) && existing.value == owner => {
                    state
                        .owners
                        .insert(role.to_string(), Expiring::new(owner, now_ms, ttl_ms));
                    true
                }
                _ => false,
            }
        }))
    }

    async fn release_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
    ) -> Result<bool, DispatchError> {
        Ok(self.with_campaign(campaign_id, |state, now_ms| {
            match state.owners.get(role) {
                Some(existing) if existing.live(now_ms) && existing.value == owner => {
                    state.owners.remove(role);
                    true
                }
                _ => false,
            }
        }))
    }

    async fn snapshot(&self, campaign_id: &str) -> Result<RedisStateSnapshot, DispatchError> {
        let limit = self.limit(campaign_id).await?;
        let inflight = self.inflight_count(campaign_id).await?;
        let reserved = self.reserved_count(campaign_id).await?;
        let leases = self.active_leases(campaign_id).await?;
        let ledger = self.ledger_entries(campaign_id).await?;
        let (queued_high, queued_normal) = self.waitlist_lengths(campaign_id).await?;
        let scheduled_retries = self.with_campaign(campaign_id, |state, _| {
            state.scheduled_retries.len() as u64
        });
        let paused = self.is_paused(campaign_id).await?;
        let gate_seq = self.gate_seq(campaign_id).await?;

        Ok(RedisStateSnapshot {
            limit,
            inflight,
            reserved,
            leases,
            ledger,
            queued_high,
            queued_normal,
            scheduled_retries,
            paused,
            gate_seq,
        })
    }

    fn slot_signal(&self, campaign_id: &str) -> broadcast::Receiver<()> {
        self.signals.subscribe(campaign_id)
    }
}

fn lease_token_matches(stored_value: &str, token: &str) -> bool {
    let stored_token = stored_value
        .split_once('|')
        .map(|(token, _)| token)
        .unwrap_or(stored_value);
    stored_token == token
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialcast_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;

    const CAMPAIGN: &str = "camp-1";

    fn store_with_clock() -> (MemoryLeaseStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryLeaseStore::new(clock.clone(), 3);
        (store, clock)
    }

    async fn enqueue_range(
        store: &MemoryLeaseStore,
        prefix: &str,
        priority: Priority,
        count: usize,
    ) {
        let entries: Vec<(String, Priority)> = (0..count)
            .map(|i| (format!("{prefix}-{i}"), priority))
            .collect();
        store
            .enqueue_contacts(CAMPAIGN, &entries, false)
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_reserve_and_promote_respects_the_limit() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 3).await.unwrap();
        enqueue_range(&store, "high", Priority::High, 10).await;

        let outcome = store
            .reserve_and_promote(CAMPAIGN, 8, 70_000, 20_000, clock.now_millis())
            .await
            .unwrap();

        assert_eq!(outcome.granted.len(), 3);
        assert_eq!(outcome.pushed_back, 5);
        assert_eq!(store.reserved_count(CAMPAIGN).await.unwrap(), 3);
        // Push-backs preserve FIFO order at the head of the list.
        let members = store
            .waitlist_members(CAMPAIGN, Priority::High)
            .await
            .unwrap();
        assert_eq!(members[0], "high-3");
        assert_eq!(members.last().unwrap(), "high-9");
    }

    #[test_log::test(tokio::test)]
    async fn test_reserve_and_promote_pops_three_to_one() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 8).await.unwrap();
        enqueue_range(&store, "high", Priority::High, 20).await;
        enqueue_range(&store, "normal", Priority::Normal, 20).await;

        let outcome = store
            .reserve_and_promote(CAMPAIGN, 8, 70_000, 20_000, clock.now_millis())
            .await
            .unwrap();

        let high = outcome
            .granted
            .iter()
            .filter(|c| c.origin == Priority::High)
            .count();
        assert_eq!(high, 6);
        assert_eq!(outcome.granted.len(), 8);
    }

    #[test_log::test(tokio::test)]
    async fn test_every_fourth_batch_pops_normal_first() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 100).await.unwrap();
        enqueue_range(&store, "high", Priority::High, 50).await;
        enqueue_range(&store, "normal", Priority::Normal, 50).await;

        for _ in 0..3 {
            store
                .reserve_and_promote(CAMPAIGN, 1, 70_000, 20_000, clock.now_millis())
                .await
                .unwrap();
        }
        let fourth = store
            .reserve_and_promote(CAMPAIGN, 1, 70_000, 20_000, clock.now_millis())
            .await
            .unwrap();

        assert_eq!(fourth.granted.len(), 1);
        assert_eq!(fourth.granted[0].origin, Priority::Normal);
    }

    #[test_log::test(tokio::test)]
    async fn test_gate_sequence_is_strictly_increasing() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 100).await.unwrap();
        enqueue_range(&store, "high", Priority::High, 10).await;

        let mut last_seq = 0;
        for _ in 0..5 {
            let outcome = store
                .reserve_and_promote(CAMPAIGN, 2, 70_000, 20_000, clock.now_millis())
                .await
                .unwrap();
            if !outcome.granted.is_empty() {
                assert!(outcome.seq > last_seq);
                last_seq = outcome.seq;
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_convert_promote_release_round_trip() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 2).await.unwrap();
        enqueue_range(&store, "high", Priority::High, 1).await;

        let outcome = store
            .reserve_and_promote(CAMPAIGN, 1, 70_000, 20_000, clock.now_millis())
            .await
            .unwrap();
        let granted = &outcome.granted[0];

        let converted = store
            .convert_reservation(
                CAMPAIGN,
                &granted.contact_id,
                granted.origin,
                "call-1",
                "tok-1",
                15_000,
            )
            .await
            .unwrap();
        assert!(converted);
        assert_eq!(store.reserved_count(CAMPAIGN).await.unwrap(), 0);
        assert_eq!(store.inflight_count(CAMPAIGN).await.unwrap(), 1);

        let promoted = store
            .promote_to_active(CAMPAIGN, "call-1", "tok-1", 180_000)
            .await
            .unwrap();
        assert!(promoted);
        let leases = store.active_leases(CAMPAIGN).await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].member, "call-1");
        assert!(!leases[0].is_pre_dial());

        let released = store.release(CAMPAIGN, "call-1", "tok-1", true).await.unwrap();
        assert!(released);
        assert_eq!(store.inflight_count(CAMPAIGN).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_release_rejects_stale_token() {
        let (store, _) = store_with_clock();
        store.set_limit(CAMPAIGN, 1).await.unwrap();
        assert!(store
            .acquire_pre(CAMPAIGN, "call-1", "contact-1", "tok-1", 15_000)
            .await
            .unwrap());

        assert!(!store
            .release(CAMPAIGN, "pre-call-1", "other-token", false)
            .await
            .unwrap());
        assert_eq!(store.inflight_count(CAMPAIGN).await.unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_janitor_reaps_orphaned_reservations_to_origin_lists() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 4).await.unwrap();
        store
            .enqueue_contacts(
                CAMPAIGN,
                &[
                    ("high-1".to_string(), Priority::High),
                    ("normal-1".to_string(), Priority::Normal),
                ],
                false,
            )
            .await
            .unwrap();

        let outcome = store
            .reserve_and_promote(CAMPAIGN, 4, 70_000, 20_000, clock.now_millis())
            .await
            .unwrap();
        assert_eq!(outcome.granted.len(), 2);

        // The worker dies before converting; the reservations age past
        // the orphan threshold.
        clock.advance_millis(61_000);
        let report = store
            .janitor_scan(CAMPAIGN, clock.now_millis(), 60_000, 15_000)
            .await
            .unwrap();

        assert_eq!(report.reservations_reaped, 2);
        assert_eq!(store.reserved_count(CAMPAIGN).await.unwrap(), 0);
        assert_eq!(
            store
                .waitlist_members(CAMPAIGN, Priority::High)
                .await
                .unwrap(),
            vec!["high-1".to_string()]
        );
        assert_eq!(
            store
                .waitlist_members(CAMPAIGN, Priority::Normal)
                .await
                .unwrap(),
            vec!["normal-1".to_string()]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_janitor_releases_desynced_lease_members() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 2).await.unwrap();
        assert!(store
            .acquire_pre(CAMPAIGN, "call-1", "contact-1", "tok-1", 15_000)
            .await
            .unwrap());

        // The lease key expires but the set member lingers.
        clock.advance_millis(16_000);
        let report = store
            .janitor_scan(CAMPAIGN, clock.now_millis(), 60_000, 15_000)
            .await
            .unwrap();

        assert_eq!(report.desynced_released, 1);
        assert_eq!(store.inflight_count(CAMPAIGN).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_janitor_clears_gates_older_than_the_stale_age() {
        let (store, clock) = store_with_clock();
        store.set_limit(CAMPAIGN, 4).await.unwrap();
        enqueue_range(&store, "high", Priority::High, 1).await;

        // A promotion sets the gate with a 30 second expiry; the
        // janitor still clears it once it passes the stale age.
        let outcome = store
            .reserve_and_promote(CAMPAIGN, 1, 70_000, 30_000, clock.now_millis())
            .await
            .unwrap();
        assert!(outcome.seq > 0);
        assert_eq!(store.gate_seq(CAMPAIGN).await.unwrap(), outcome.seq);

        clock.advance_millis(10_000);
        let report = store
            .janitor_scan(CAMPAIGN, clock.now_millis(), 60_000, 15_000)
            .await
            .unwrap();
        assert_eq!(report.gates_cleared, 0);

        clock.advance_millis(6_000);
        let report = store
            .janitor_scan(CAMPAIGN, clock.now_millis(), 60_000, 15_000)
            .await
            .unwrap();
        assert_eq!(report.gates_cleared, 1);
        assert_eq!(store.gate_seq(CAMPAIGN).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_compact_waitlist_dedupes_and_trims() {
        let (store, _) = store_with_clock();
        store
            .enqueue_contacts(
                CAMPAIGN,
                &[
                    ("a".to_string(), Priority::High),
                    ("b".to_string(), Priority::High),
                    ("a".to_string(), Priority::High),
                    ("c".to_string(), Priority::High),
                    ("b".to_string(), Priority::High),
                ],
                false,
            )
            .await
            .unwrap();

        let report = store
            .compact_waitlist(CAMPAIGN, Priority::High, 2)
            .await
            .unwrap();

        assert_eq!(report.duplicates_removed, 2);
        assert_eq!(report.trimmed, 1);
        assert_eq!(
            store
                .waitlist_members(CAMPAIGN, Priority::High)
                .await
                .unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_dial_idempotency_claims_once_per_window() {
        let (store, clock) = store_with_clock();
        assert!(store.try_claim_dial("contact-1", 42, 300_000).await.unwrap());
        assert!(!store.try_claim_dial("contact-1", 42, 300_000).await.unwrap());
        // A different bucket is a different window.
        assert!(store.try_claim_dial("contact-1", 43, 300_000).await.unwrap());

        clock.advance_millis(301_000);
        assert!(store.try_claim_dial("contact-1", 42, 300_000).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_fire_due_retries_pushes_to_origin_head() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();
        store
            .schedule_retry(CAMPAIGN, "contact-1", Priority::High, now + 5_000)
            .await
            .unwrap();
        store
            .schedule_retry(CAMPAIGN, "contact-2", Priority::Normal, now + 1_000)
            .await
            .unwrap();

        let fired = store.fire_due_retries(CAMPAIGN, now).await.unwrap();
        assert!(fired.is_empty());

        clock.advance_millis(6_000);
        let fired = store
            .fire_due_retries(CAMPAIGN, clock.now_millis())
            .await
            .unwrap();
        assert_eq!(fired.len(), 2);
        assert_eq!(
            store
                .waitlist_members(CAMPAIGN, Priority::High)
                .await
                .unwrap(),
            vec!["contact-1".to_string()]
        );
        assert_eq!(
            store
                .waitlist_members(CAMPAIGN, Priority::Normal)
                .await
                .unwrap(),
            vec!["contact-2".to_string()]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_ownership_claims_are_exclusive_until_expiry() {
        let (store, clock) = store_with_clock();
        assert!(store
            .try_claim_ownership(CAMPAIGN, "janitor", "worker-a", 60_000)
            .await
            .unwrap());
        assert!(!store
            .try_claim_ownership(CAMPAIGN, "janitor", "worker-b", 60_000)
            .await
            .unwrap());
        // Re-claiming by the current owner succeeds.
        assert!(store
            .try_claim_ownership(CAMPAIGN, "janitor", "worker-a", 60_000)
            .await
            .unwrap());

        clock.advance_millis(61_000);
        assert!(store
            .try_claim_ownership(CAMPAIGN, "janitor", "worker-b", 60_000)
            .await
            .unwrap());
        assert!(!store
            .renew_ownership(CAMPAIGN, "janitor", "worker-a", 60_000)
            .await
            .unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_slot_release_wakes_subscribers() {
        let (store, _) = store_with_clock();
        store.set_limit(CAMPAIGN, 1).await.unwrap();
        assert!(store
            .acquire_pre(CAMPAIGN, "call-1", "contact-1", "tok-1", 15_000)
            .await
            .unwrap());

        let mut signal = store.slot_signal(CAMPAIGN);
        store
            .release(CAMPAIGN, "pre-call-1", "tok-1", true)
            .await
            .unwrap();
        assert!(signal.try_recv().is_ok());
    }
}
