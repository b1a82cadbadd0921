use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::DispatchError;
use crate::lease_store::LeaseStore;
use crate::types::DispatchConfig;

/// What the dispatcher is allowed to do with the carrier right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// The open window elapsed; this caller won the single half-open
    /// probe and may place one dial to test the carrier.
    HalfOpenProbe,
}

/// A per-campaign circuit breaker over the carrier, backed by Redis
/// so the open state is shared across workers. Opens when the failure
/// count within the window crosses the threshold.
pub struct CircuitBreaker {
    store: Arc<dyn LeaseStore>,
    failure_threshold: u32,
    window_ms: u64,
    open_ttl_ms: u64,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn LeaseStore>, config: &DispatchConfig) -> Self {
        CircuitBreaker {
            store,
            failure_threshold: config.cb_failure_threshold,
            window_ms: config.cb_window_ms,
            open_ttl_ms: config.cb_open_ttl_ms,
        }
    }

    pub async fn state(&self, campaign_id: &str) -> Result<BreakerState, DispatchError> {
        if self.store.is_circuit_open(campaign_id).await? {
            return Ok(BreakerState::Open);
        }

        if self.store.circuit_in_cooldown(campaign_id).await? {
            // Exactly one worker gets the probe; the rest keep waiting
            // as if the circuit were still open.
            let probe_ttl_ms = self.open_ttl_ms.min(10_000);
            if self
                .store
                .try_claim_half_open_probe(campaign_id, probe_ttl_ms)
                .await?
            {
                info!(campaign_id, "circuit half-open, probing the carrier");
                return Ok(BreakerState::HalfOpenProbe);
            }
            return Ok(BreakerState::Open);
        }

        Ok(BreakerState::Closed)
    }

    /// Records a dial failure; opens the circuit when the failure
    /// density crosses the threshold. Returns true when this call
    /// opened the circuit.
    pub async fn record_failure(&self, campaign_id: &str) -> Result<bool, DispatchError> {
        let count = self
            .store
            .record_dial_failure(campaign_id, self.window_ms)
            .await?;
        if count >= self.failure_threshold as u64 {
            warn!(
                campaign_id,
                failures = count,
                "carrier failure density crossed the threshold, opening circuit"
            );
            self.store
                .open_circuit(campaign_id, self.open_ttl_ms)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Records a successful dial, closing the breaker entirely.
    pub async fn record_success(&self, campaign_id: &str) -> Result<(), DispatchError> {
        self.store.reset_circuit(campaign_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_store::MemoryLeaseStore;
    use dialcast_helpers::time::ManualClock;
    use pretty_assertions::assert_eq;

    const CAMPAIGN: &str = "camp-1";

    fn breaker_with_clock() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new(clock.clone(), 3));
        let config = DispatchConfig {
            cb_failure_threshold: 3,
            cb_window_ms: 60_000,
            cb_open_ttl_ms: 30_000,
            ..DispatchConfig::default()
        };
        (CircuitBreaker::new(store, &config), clock)
    }

    #[test_log::test(tokio::test)]
    async fn test_opens_after_threshold_failures() {
        let (breaker, _) = breaker_with_clock();
        assert_eq!(breaker.state(CAMPAIGN).await.unwrap(), BreakerState::Closed);

        assert!(!breaker.record_failure(CAMPAIGN).await.unwrap());
        assert!(!breaker.record_failure(CAMPAIGN).await.unwrap());
        assert!(breaker.record_failure(CAMPAIGN).await.unwrap());

        assert_eq!(breaker.state(CAMPAIGN).await.unwrap(), BreakerState::Open);
    }

    #[test_log::test(tokio::test)]
    async fn test_single_half_open_probe_after_open_window() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..3 {
            breaker.record_failure(CAMPAIGN).await.unwrap();
        }
        assert_eq!(breaker.state(CAMPAIGN).await.unwrap(), BreakerState::Open);

        clock.advance_millis(31_000);
        assert_eq!(
            breaker.state(CAMPAIGN).await.unwrap(),
            BreakerState::HalfOpenProbe
        );
        // A second caller in the same window does not get a probe.
        assert_eq!(breaker.state(CAMPAIGN).await.unwrap(), BreakerState::Open);
    }

    #[test_log::test(tokio::test)]
    async fn test_success_closes_the_breaker() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..3 {
            breaker.record_failure(CAMPAIGN).await.unwrap();
        }
        clock.advance_millis(31_000);
        assert_eq!(
            breaker.state(CAMPAIGN).await.unwrap(),
            BreakerState::HalfOpenProbe
        );

        breaker.record_success(CAMPAIGN).await.unwrap();
        assert_eq!(breaker.state(CAMPAIGN).await.unwrap(), BreakerState::Closed);
    }
}
