use std::sync::Arc;

use dialcast_helpers::time::Clock;
use tracing::{debug, warn};

use crate::errors::DispatchError;
use crate::lease_store::LeaseStore;
use crate::types::{DispatchConfig, PromotionOutcome};

/// The two-phase admission gate in front of the lease store: runs the
/// reserve-and-promote primitive and enforces monotonic progress of
/// the promotion gate sequence across retries.
pub struct AdmissionController {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: DispatchConfig) -> Self {
        AdmissionController {
            store,
            clock,
            config,
        }
    }

    /// Requests a promotion batch of up to `max_batch` contacts.
    ///
    /// `last_seen_seq` is this promoter's high-water mark of the gate
    /// sequence. Observing a sequence below it means the read raced a
    /// gate expiry or replica lag; the promoter re-enters the script
    /// rather than dialing against a stale gate.
    pub async fn request_batch(
        &self,
        campaign_id: &str,
        max_batch: u32,
        last_seen_seq: &mut u64,
    ) -> Result<PromotionOutcome, DispatchError> {
        // Bounded re-entry: gate regressions are rare and a second
        // read is almost always monotonic again.
        for _ in 0..3 {
            let outcome = self
                .store
                .reserve_and_promote(
                    campaign_id,
                    max_batch,
                    self.config.reservation_ttl_ms,
                    self.config.gate_ttl_ms,
                    self.clock.now_millis(),
                )
                .await?;

            if outcome.granted.is_empty() {
                return Ok(outcome);
            }

            if outcome.seq < *last_seen_seq {
                warn!(
                    campaign_id,
                    observed = outcome.seq,
                    expected_at_least = *last_seen_seq,
                    "promotion gate sequence regressed, re-entering"
                );
                continue;
            }

            debug!(
                campaign_id,
                granted = outcome.granted.len(),
                seq = outcome.seq,
                pushed_back = outcome.pushed_back,
                "promotion batch granted"
            );
            *last_seen_seq = outcome.seq;
            return Ok(outcome);
        }

        Err(DispatchError::ScriptContract(format!(
            "promotion gate for campaign \"{campaign_id}\" would not advance"
        )))
    }
}
