use std::sync::Arc;

use async_trait::async_trait;
use dialcast_campaign::types::Priority;
use dialcast_helpers::redis::ConnectionWrapper;
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::DispatchError;
use crate::lease_store::{
    dial_idempotency_key, CampaignKeys, LeaseStore, PauseAction, SlotSignals,
};
use crate::types::{
    pre_dial_member, ColdStartState, CompactReport, JanitorReport, LeaseInfo, LedgerEntry,
    PromotionOutcome, RedisStateSnapshot, ReservedContact,
};

const COLDSTART_DONE_SENTINEL: &str = "done";

/// The Redis-backed lease store. Every multi-key mutation is an atomic
/// server-side Lua script; all keys for one campaign share the campaign
/// hash tag so the scripts are valid in cluster mode.
pub struct RedisLeaseStore {
    connection: ConnectionWrapper,
    signals: Arc<SlotSignals>,
    /// High pops per normal pop in a promotion batch; deployment-level
    /// configuration, not per-campaign.
    fairness_ratio: u32,
}

impl RedisLeaseStore {
    pub fn new(
        connection: ConnectionWrapper,
        signals: Arc<SlotSignals>,
        fairness_ratio: u32,
    ) -> Self {
        RedisLeaseStore {
            connection,
            signals,
            fairness_ratio,
        }
    }

    /// The slot-signal registry, fed by the connection's push-message
    /// pump with slot-available publishes.
    pub fn signals(&self) -> Arc<SlotSignals> {
        self.signals.clone()
    }

    fn conn(&self) -> ConnectionWrapper {
        self.connection.clone()
    }

    /// Splits a lease key value of the form `{token}|{contactId}`.
    fn split_lease_value(value: &str) -> (&str, &str) {
        match value.split_once('|') {
            Some((token, contact_id)) => (token, contact_id),
            None => (value, ""),
        }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn set_limit(&self, campaign_id: &str, limit: u32) -> Result<(), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        // The limit mirror lives for as long as the campaign can be
        // dispatched; 7 days covers pauses without leaking keys forever.
        conn.pset_ex(&keys.limit(), &limit.to_string(), 7 * 24 * 60 * 60 * 1000)
            .await?;
        Ok(())
    }

    async fn limit(&self, campaign_id: &str) -> Result<u32, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let value = conn.get(&keys.limit()).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn enqueue_contacts(
        &self,
        campaign_id: &str,
        entries: &[(String, Priority)],
        to_head: bool,
    ) -> Result<(), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();

        let high: Vec<String> = entries
            .iter()
            .filter(|(_, p)| *p == Priority::High)
            .map(|(id, _)| id.clone())
            .collect();
        let normal: Vec<String> = entries
            .iter()
            .filter(|(_, p)| *p == Priority::Normal)
            .map(|(id, _)| id.clone())
            .collect();

        for (priority, ids) in [(Priority::High, high), (Priority::Normal, normal)] {
            if ids.is_empty() {
                continue;
            }
            let list_key = keys.waitlist(priority);
            if to_head {
                // Reverse so the first entry ends up at the head.
                let reversed: Vec<String> = ids.into_iter().rev().collect();
                conn.lpush(&list_key, &reversed).await?;
            } else {
                conn.rpush(&list_key, &ids).await?;
            }
        }
        Ok(())
    }

    async fn waitlist_lengths(&self, campaign_id: &str) -> Result<(u64, u64), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let high = conn.llen(&keys.waitlist(Priority::High)).await?;
        let normal = conn.llen(&keys.waitlist(Priority::Normal)).await?;
        Ok((high, normal))
    }

    async fn waitlist_members(
        &self,
        campaign_id: &str,
        priority: Priority,
    ) -> Result<Vec<String>, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.lrange(&keys.waitlist(priority), 0, -1).await?)
    }

    async fn reserve_and_promote(
        &self,
        campaign_id: &str,
        max_batch: u32,
        reserve_ttl_ms: u64,
        gate_ttl_ms: u64,
        now_ms: u64,
    ) -> Result<PromotionOutcome, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/reserve_and_promote.lua");

        let script_keys = [
            keys.fairness(),
            keys.waitlist(Priority::High),
            keys.waitlist(Priority::Normal),
            keys.limit(),
            keys.leases(),
            keys.reserved(),
            keys.ledger(),
            keys.gate_seq(),
            keys.gate(),
        ];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let max_batch_arg = max_batch.to_string();
        let reserve_ttl_arg = reserve_ttl_ms.to_string();
        let gate_ttl_arg = gate_ttl_ms.to_string();
        let now_arg = now_ms.to_string();
        let ratio_arg = self.fairness_ratio.to_string();
        let result: Vec<String> = conn
            .eval_script(
                script,
                &key_refs,
                &[
                    &max_batch_arg,
                    &reserve_ttl_arg,
                    &gate_ttl_arg,
                    &now_arg,
                    &ratio_arg,
                ],
            )
            .await?;

        parse_promotion_result(&result)
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
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/convert_reservation.lua");

        let member = pre_dial_member(call_id);
        let ledger_member = crate::types::ledger_member(origin, contact_id);
        let script_keys = [
            keys.reserved(),
            keys.ledger(),
            keys.leases(),
            keys.lease(&member),
        ];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let ttl_arg = ttl_ms.to_string();
        let converted: i64 = conn
            .eval_script(
                script,
                &key_refs,
                &[&ledger_member, &member, token, contact_id, &ttl_arg],
            )
            .await?;
        Ok(converted == 1)
    }

    async fn acquire_pre(
        &self,
        campaign_id: &str,
        call_id: &str,
        contact_id: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/acquire_pre.lua");

        let member = pre_dial_member(call_id);
        let script_keys = [keys.leases(), keys.lease(&member), keys.limit()];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let ttl_arg = ttl_ms.to_string();
        let acquired: i64 = conn
            .eval_script(script, &key_refs, &[&member, token, contact_id, &ttl_arg])
            .await?;
        Ok(acquired == 1)
    }

    async fn renew(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/renew_lease.lua");

        let lease_key = keys.lease(member);
        let ttl_arg = ttl_ms.to_string();
        let renewed: i64 = conn
            .eval_script(script, &[lease_key.as_str()], &[token, &ttl_arg])
            .await?;
        Ok(renewed == 1)
    }

    async fn promote_to_active(
        &self,
        campaign_id: &str,
        call_id: &str,
        token: &str,
        active_ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/promote_to_active.lua");

        let pre_member = pre_dial_member(call_id);
        let script_keys = [
            keys.leases(),
            keys.lease(&pre_member),
            keys.lease(call_id),
        ];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let ttl_arg = active_ttl_ms.to_string();
        let promoted: i64 = conn
            .eval_script(script, &key_refs, &[call_id, token, &ttl_arg])
            .await?;
        Ok(promoted == 1)
    }

    async fn release(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        publish: bool,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/release_lease.lua");

        let script_keys = [keys.leases(), keys.lease(member)];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let publish_arg = if publish { "1" } else { "0" };
        let channel = keys.slot_channel();
        let released: i64 = conn
            .eval_script(script, &key_refs, &[member, token, publish_arg, &channel])
            .await?;
        Ok(released == 1)
    }

    async fn force_release(
        &self,
        campaign_id: &str,
        member: &str,
        publish: bool,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let mut pipeline = ::redis::pipe();
        pipeline
            .cmd("DEL")
            .arg(keys.lease(member))
            .cmd("SREM")
            .arg(keys.leases())
            .arg(member);
        if publish {
            pipeline
                .cmd("PUBLISH")
                .arg(keys.slot_channel())
                .arg("slot-available");
        }
        conn.query_pipeline_async(&mut pipeline).await?;
        Ok(true)
    }

    async fn inflight_count(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.scard(&keys.leases()).await?)
    }

    async fn reserved_count(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let value = conn.get(&keys.reserved()).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn ledger_entries(&self, campaign_id: &str) -> Result<Vec<LedgerEntry>, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let entries = conn
            .zrangebyscore_withscores(&keys.ledger(), f64::MIN, f64::MAX)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| LedgerEntry {
                member,
                promoted_at_ms: score as u64,
            })
            .collect())
    }

    async fn active_leases(&self, campaign_id: &str) -> Result<Vec<LeaseInfo>, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let members = conn.smembers(&keys.leases()).await?;

        let mut leases = Vec::with_capacity(members.len());
        for member in members {
            let value = conn.get(&keys.lease(&member)).await?;
            if let Some(value) = value {
                let (_, contact_id) = Self::split_lease_value(&value);
                leases.push(LeaseInfo {
                    member,
                    contact_id: contact_id.to_string(),
                });
            } else {
                debug!(
                    campaign_id,
                    member, "lease member has no live lease key, leaving for the janitor"
                );
            }
        }
        Ok(leases)
    }

    async fn lease_members(&self, campaign_id: &str) -> Result<Vec<String>, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.smembers(&keys.leases()).await?)
    }

    async fn lease_token_exists(
        &self,
        campaign_id: &str,
        member: &str,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.exists(&keys.lease(member)).await?)
    }

    async fn gate_seq(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let value = conn.get(&keys.gate()).await?;
        Ok(value
            .as_deref()
            .and_then(crate::types::parse_gate_value)
            .map(|(seq, _)| seq)
            .unwrap_or(0))
    }

    async fn janitor_scan(
        &self,
        campaign_id: &str,
        now_ms: u64,
        orphan_age_ms: u64,
        stale_gate_age_ms: u64,
    ) -> Result<JanitorReport, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/janitor_scan.lua");

        let script_keys = [
            keys.ledger(),
            keys.reserved(),
            keys.waitlist(Priority::High),
            keys.waitlist(Priority::Normal),
            keys.gate(),
            keys.leases(),
        ];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let now_arg = now_ms.to_string();
        let orphan_age_arg = orphan_age_ms.to_string();
        let lease_prefix = keys.lease_prefix();
        let stale_gate_age_arg = stale_gate_age_ms.to_string();
        let result: Vec<i64> = conn
            .eval_script(
                script,
                &key_refs,
                &[&now_arg, &orphan_age_arg, &lease_prefix, &stale_gate_age_arg],
            )
            .await?;

        if result.len() != 3 {
            return Err(DispatchError::ScriptContract(format!(
                "janitor_scan returned {} values, expected 3",
                result.len()
            )));
        }

        Ok(JanitorReport {
            reservations_reaped: result[0] as u64,
            gates_cleared: result[1] as u64,
            desynced_released: result[2] as u64,
        })
    }

    async fn compact_waitlist(
        &self,
        campaign_id: &str,
        priority: Priority,
        max_length: u64,
    ) -> Result<CompactReport, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/compact_waitlist.lua");

        let list_key = keys.waitlist(priority);
        let max_length_arg = max_length.to_string();
        let result: Vec<i64> = conn
            .eval_script(script, &[list_key.as_str()], &[&max_length_arg])
            .await?;

        if result.len() != 2 {
            return Err(DispatchError::ScriptContract(format!(
                "compact_waitlist returned {} values, expected 2",
                result.len()
            )));
        }

        Ok(CompactReport {
            duplicates_removed: result[0] as u64,
            trimmed: result[1] as u64,
        })
    }

    async fn apply_transition(
        &self,
        campaign_id: &str,
        expected: &[&str],
        new_status: &str,
        pause: PauseAction,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/apply_transition.lua");

        let script_keys = [keys.status(), keys.paused()];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let expected_arg = expected.join(",");
        // Pause flags carry a long TTL so an abandoned campaign's
        // keys eventually expire rather than leak.
        let pause_ttl_arg = (24 * 60 * 60 * 1000u64).to_string();
        let applied: i64 = conn
            .eval_script(
                script,
                &key_refs,
                &[&expected_arg, new_status, pause.as_arg(), &pause_ttl_arg],
            )
            .await?;
        Ok(applied == 1)
    }

    async fn is_paused(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.exists(&keys.paused()).await?)
    }

    async fn set_coldstart_block(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<(), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        conn.pset_ex(&keys.coldstart(), "blocked", ttl_ms).await?;
        Ok(())
    }

    async fn mark_coldstart_done(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<(), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        conn.pset_ex(&keys.coldstart(), COLDSTART_DONE_SENTINEL, ttl_ms)
            .await?;
        Ok(())
    }

    async fn coldstart_state(&self, campaign_id: &str) -> Result<ColdStartState, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        match conn.get(&keys.coldstart()).await?.as_deref() {
            None => Ok(ColdStartState::Unset),
            Some(COLDSTART_DONE_SENTINEL) => Ok(ColdStartState::Done),
            Some(_) => Ok(ColdStartState::Blocked),
        }
    }

    async fn try_claim_dial(
        &self,
        contact_id: &str,
        bucket: u64,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let mut conn = self.conn();
        let key = dial_idempotency_key(contact_id, bucket);
        Ok(conn.pset_ex_nx(&key, "1", ttl_ms).await?)
    }

    async fn schedule_retry(
        &self,
        campaign_id: &str,
        contact_id: &str,
        origin: Priority,
        fire_at_ms: u64,
    ) -> Result<(), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let member = crate::types::ledger_member(origin, contact_id);
        conn.zadd(&keys.scheduled_retries(), &member, fire_at_ms as f64)
            .await?;
        Ok(())
    }

    async fn fire_due_retries(
        &self,
        campaign_id: &str,
        now_ms: u64,
    ) -> Result<Vec<ReservedContact>, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/fire_due_retries.lua");

        let script_keys = [
            keys.scheduled_retries(),
            keys.waitlist(Priority::High),
            keys.waitlist(Priority::Normal),
        ];
        let key_refs: Vec<&str> = script_keys.iter().map(String::as_str).collect();

        let now_arg = now_ms.to_string();
        let fired: Vec<String> = conn.eval_script(script, &key_refs, &[&now_arg]).await?;

        fired
            .iter()
            .map(|member| {
                crate::types::parse_ledger_member(member)
                    .map(|(origin, contact_id)| ReservedContact {
                        contact_id: contact_id.to_string(),
                        origin,
                    })
                    .ok_or_else(|| {
                        DispatchError::ScriptContract(format!(
                            "fire_due_retries returned malformed member \"{member}\""
                        ))
                    })
            })
            .collect()
    }

    async fn cancel_scheduled_retries(&self, campaign_id: &str) -> Result<u64, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let count = conn.zcard(&keys.scheduled_retries()).await?;
        conn.del(&keys.scheduled_retries()).await?;
        Ok(count)
    }

    async fn record_dial_failure(
        &self,
        campaign_id: &str,
        window_ms: u64,
    ) -> Result<u64, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let failures_key = keys.circuit_failures();
        let count = conn.incr_by(&failures_key, 1).await?;
        if count == 1 {
            conn.pexpire(&failures_key, window_ms as i64).await?;
        }
        Ok(count as u64)
    }

    async fn open_circuit(&self, campaign_id: &str, ttl_ms: u64) -> Result<(), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        conn.pset_ex(&keys.circuit(), "open", ttl_ms).await?;
        // The cooldown outlives the open window so that the first
        // dispatcher to observe the closed circuit runs a single
        // half-open probe instead of a full resumption.
        conn.pset_ex(&keys.circuit_cooldown(), "1", ttl_ms * 2)
            .await?;
        Ok(())
    }

    async fn is_circuit_open(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.exists(&keys.circuit()).await?)
    }

    async fn circuit_in_cooldown(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.exists(&keys.circuit_cooldown()).await?)
    }

    async fn try_claim_half_open_probe(
        &self,
        campaign_id: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        Ok(conn.pset_ex_nx(&keys.circuit_probe(), "1", ttl_ms).await?)
    }

    async fn reset_circuit(&self, campaign_id: &str) -> Result<(), DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        conn.del(&keys.circuit()).await?;
        conn.del(&keys.circuit_cooldown()).await?;
        conn.del(&keys.circuit_failures()).await?;
        conn.del(&keys.circuit_probe()).await?;
        Ok(())
    }

    async fn try_claim_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let key = keys.owner(role);
        if conn.pset_ex_nx(&key, owner, ttl_ms).await? {
            return Ok(true);
        }
        // Re-claiming a key this worker already owns counts as success,
        // covering loops that claim on every tick.
        Ok(conn.get(&key).await?.as_deref() == Some(owner))
    }

    async fn renew_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let script = include_str!("../../lua-scripts/renew_lease.lua");

        let key = keys.owner(role);
        let ttl_arg = ttl_ms.to_string();
        let renewed: i64 = conn
            .eval_script(script, &[key.as_str()], &[owner, &ttl_arg])
            .await?;
        Ok(renewed == 1)
    }

    async fn release_ownership(
        &self,
        campaign_id: &str,
        role: &str,
        owner: &str,
    ) -> Result<bool, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();
        let key = keys.owner(role);
        if conn.get(&key).await?.as_deref() == Some(owner) {
            conn.del(&key).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn snapshot(&self, campaign_id: &str) -> Result<RedisStateSnapshot, DispatchError> {
        let keys = CampaignKeys::new(campaign_id);
        let mut conn = self.conn();

        let limit = self.limit(campaign_id).await?;
        let inflight = conn.scard(&keys.leases()).await?;
        let reserved = self.reserved_count(campaign_id).await?;
        let leases = self.active_leases(campaign_id).await?;
        let ledger = self.ledger_entries(campaign_id).await?;
        let (queued_high, queued_normal) = self.waitlist_lengths(campaign_id).await?;
        let scheduled_retries = conn.zcard(&keys.scheduled_retries()).await?;
        let paused = conn.exists(&keys.paused()).await?;
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

fn parse_promotion_result(result: &[String]) -> Result<PromotionOutcome, DispatchError> {
    if result.len() < 3 {
        return Err(DispatchError::ScriptContract(format!(
            "reserve_and_promote returned {} values, expected at least 3",
            result.len()
        )));
    }

    let granted: usize = result[0].parse().map_err(|_| {
        DispatchError::ScriptContract(format!(
            "reserve_and_promote returned non-numeric grant count \"{}\"",
            result[0]
        ))
    })?;
    let seq: u64 = result[1].parse().map_err(|_| {
        DispatchError::ScriptContract(format!(
            "reserve_and_promote returned non-numeric gate sequence \"{}\"",
            result[1]
        ))
    })?;
    let pushed_back: u64 = result[2].parse().map_err(|_| {
        DispatchError::ScriptContract(format!(
            "reserve_and_promote returned non-numeric push-back count \"{}\"",
            result[2]
        ))
    })?;

    if result.len() != 3 + granted {
        return Err(DispatchError::ScriptContract(format!(
            "reserve_and_promote granted {granted} but returned {} members",
            result.len() - 3
        )));
    }

    let granted_contacts = result[3..]
        .iter()
        .map(|member| {
            crate::types::parse_ledger_member(member)
                .map(|(origin, contact_id)| ReservedContact {
                    contact_id: contact_id.to_string(),
                    origin,
                })
                .ok_or_else(|| {
                    DispatchError::ScriptContract(format!(
                        "reserve_and_promote returned malformed member \"{member}\""
                    ))
                })
        })
        .collect::<Result<Vec<ReservedContact>, DispatchError>>()?;

    Ok(PromotionOutcome {
        granted: granted_contacts,
        seq,
        pushed_back,
    })
}

#[cfg(test)]
mod tests {
    use coverage_helper::test;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_promotion_result() {
        let result = vec![
            "2".to_string(),
            "17".to_string(),
            "1".to_string(),
            "H:contact-1".to_string(),
            "N:contact-2".to_string(),
        ];
        let outcome = parse_promotion_result(&result).unwrap();
        assert_eq!(outcome.seq, 17);
        assert_eq!(outcome.pushed_back, 1);
        assert_eq!(
            outcome.granted,
            vec![
                ReservedContact {
                    contact_id: "contact-1".to_string(),
                    origin: Priority::High,
                },
                ReservedContact {
                    contact_id: "contact-2".to_string(),
                    origin: Priority::Normal,
                },
            ]
        );
    }

    #[test]
    fn test_parse_promotion_result_rejects_member_count_mismatch() {
        let result = vec![
            "2".to_string(),
            "17".to_string(),
            "0".to_string(),
            "H:contact-1".to_string(),
        ];
        assert!(matches!(
            parse_promotion_result(&result),
            Err(DispatchError::ScriptContract(_))
        ));
    }

    #[test]
    fn test_split_lease_value() {
        assert_eq!(
            RedisLeaseStore::split_lease_value("tok-1|contact-9"),
            ("tok-1", "contact-9")
        );
        assert_eq!(RedisLeaseStore::split_lease_value("tok-1"), ("tok-1", ""));
    }
}
