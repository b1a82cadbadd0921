use std::time::Duration;

use dialcast_dispatch::carrier::HttpCarrierConfig;
use dialcast_dispatch::types::DispatchConfig;
use dialcast_helpers::env::EnvVars;
use dialcast_helpers::runtime_types::RuntimePlatform;
use tracing::Level;

use crate::consts::{DEFAULT_SERVER_PORT, DEFAULT_TRACE_OTLP_COLLECTOR_ENDPOINT};

/// The idempotency window cannot exceed 24 hours.
const MAX_DIAL_IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

/// Core runtime configuration sourced from environment variables,
/// covering the server, telemetry, Redis, the carrier and the full
/// dispatch TTL table.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub redis_nodes: Vec<String>,
    pub redis_password: Option<String>,
    pub redis_cluster_mode: bool,
    pub server_port: i32,
    /// Optional flag to determine whether the HTTP server should only
    /// be exposed on the loopback interface (127.0.0.1).
    ///
    /// When running in an environment such as a docker container,
    /// this should be set to false so that the server can be accessed
    /// from outside the container.
    ///
    /// Defaults to true.
    pub server_loopback_only: Option<bool>,
    pub service_name: String,
    pub platform: RuntimePlatform,
    /// When true, tracing is installed as a thread default rather
    /// than globally so tests do not clash over the global subscriber.
    pub test_mode: bool,
    pub trace_otlp_collector_endpoint: String,
    pub runtime_max_diagnostics_level: Level,
    /// The REST carrier; absent in sandbox environments, where the
    /// mock carrier is used instead.
    pub carrier: Option<HttpCarrierConfig>,
    pub dispatch: DispatchConfig,
}

impl RuntimeConfig {
    /// Creates a new instance of runtime configuration, sourcing
    /// config from the current process environment variables.
    pub fn from_env(env: &impl EnvVars) -> Self {
        let redis_nodes = env
            .var("DIALCAST_REDIS_NODES")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
            .split(',')
            .map(|node| node.trim().to_string())
            .collect();
        let redis_password = env.var("DIALCAST_REDIS_PASSWORD").ok();
        let redis_cluster_mode = env_bool(env, "DIALCAST_REDIS_CLUSTER_MODE", false);

        let server_port = env
            .var("DIALCAST_SERVER_PORT")
            .unwrap_or(DEFAULT_SERVER_PORT.to_string())
            .parse()
            .expect("Invalid server port, must be a valid integer");

        let server_loopback_only_env_var = env
            .var("DIALCAST_SERVER_LOOPBACK_ONLY")
            .map(Some)
            .unwrap_or_else(|_| None);
        let server_loopback_only = server_loopback_only_env_var.map(|val| {
            val.parse().expect(
                "Invalid server loopback only value, must be either \\\"true\\\" or \\\"false\\\"",
            )
        });

        let service_name = env
            .var("DIALCAST_SERVICE_NAME")
            .unwrap_or_else(|_| "dialcast-runtime".to_string());

        let platform = match env.var("DIALCAST_PLATFORM").as_deref() {
            Ok("local") => RuntimePlatform::Local,
            _ => RuntimePlatform::Other,
        };
        let test_mode = env_bool(env, "DIALCAST_TEST_MODE", false);

        let trace_otlp_collector_endpoint = env
            .var("DIALCAST_TRACE_OTLP_COLLECTOR_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_TRACE_OTLP_COLLECTOR_ENDPOINT.to_string());

        let runtime_max_diagnostics_level = env
            .var("DIALCAST_MAX_DIAGNOSTICS_LEVEL")
            .map(|level| {
                level
                    .parse()
                    .expect("Invalid diagnostics level, must be a valid tracing level")
            })
            .unwrap_or(Level::INFO);

        let carrier = env.var("CARRIER_BASE_URL").ok().map(|base_url| {
            HttpCarrierConfig {
                base_url,
                account_id: env
                    .var("CARRIER_ACCOUNT_ID")
                    .expect("CARRIER_ACCOUNT_ID must be set when CARRIER_BASE_URL is provided"),
                auth_token: env
                    .var("CARRIER_AUTH_TOKEN")
                    .expect("CARRIER_AUTH_TOKEN must be set when CARRIER_BASE_URL is provided"),
                connect_timeout: Duration::from_secs(env_u64(env, "CARRIER_CONNECT_TIMEOUT", 10)),
                total_timeout: Duration::from_secs(env_u64(env, "CARRIER_TOTAL_TIMEOUT", 600)),
            }
        });

        let dispatch = dispatch_config_from_env(env);

        RuntimeConfig {
            redis_nodes,
            redis_password,
            redis_cluster_mode,
            server_port,
            server_loopback_only,
            service_name,
            platform,
            test_mode,
            trace_otlp_collector_endpoint,
            runtime_max_diagnostics_level,
            carrier,
            dispatch,
        }
    }
}

/// Builds the dispatch TTL table from environment variables, falling
/// back to the deployment defaults. Keys express seconds unless
/// suffixed `_MS`.
fn dispatch_config_from_env(env: &impl EnvVars) -> DispatchConfig {
    let defaults = DispatchConfig::default();
    DispatchConfig {
        limit_default: env_u64(env, "LIMIT_DEFAULT", defaults.limit_default as u64) as u32,
        pre_dial_base_ms: env_secs_to_ms(env, "PRE_DIAL_BASE", defaults.pre_dial_base_ms),
        pre_dial_jitter_ms: env_secs_to_ms(env, "PRE_DIAL_JITTER", defaults.pre_dial_jitter_ms),
        pre_dial_max_ms: env_secs_to_ms(env, "PRE_DIAL_MAX", defaults.pre_dial_max_ms),
        active_lease_base_ms: env_secs_to_ms(env, "ACTIVE_LEASE_BASE", defaults.active_lease_base_ms),
        active_lease_jitter_ms: env_secs_to_ms(
            env,
            "ACTIVE_LEASE_JITTER",
            defaults.active_lease_jitter_ms,
        ),
        reservation_ttl_ms: env_secs_to_ms(env, "RESERVATION_TTL", defaults.reservation_ttl_ms),
        gate_ttl_ms: env_secs_to_ms(env, "GATE_TTL", defaults.gate_ttl_ms),
        fairness_ratio: env_u64(env, "FAIRNESS_RATIO", defaults.fairness_ratio as u64) as u32,
        coldstart_block_ms: env_secs_to_ms(env, "COLDSTART_BLOCK", defaults.coldstart_block_ms),
        janitor_interval_ms: env_u64(env, "JANITOR_INTERVAL_MS", defaults.janitor_interval_ms),
        compactor_interval_ms: env_u64(
            env,
            "COMPACTOR_INTERVAL_MS",
            defaults.compactor_interval_ms,
        ),
        reconciler_interval_ms: env_u64(
            env,
            "RECONCILER_INTERVAL_MS",
            defaults.reconciler_interval_ms,
        ),
        invariant_interval_ms: env_u64(
            env,
            "INVARIANT_INTERVAL_MS",
            defaults.invariant_interval_ms,
        ),
        reservation_orphan_age_ms: defaults.reservation_orphan_age_ms,
        stale_gate_age_ms: defaults.stale_gate_age_ms,
        dial_idempotency_ttl_ms: env_secs_to_ms(
            env,
            "DIAL_IDEMPOTENCY_TTL",
            defaults.dial_idempotency_ttl_ms,
        )
        .min(MAX_DIAL_IDEMPOTENCY_TTL_SECS * 1000),
        cb_failure_threshold: env_u64(
            env,
            "CB_FAILURE_THRESHOLD",
            defaults.cb_failure_threshold as u64,
        ) as u32,
        cb_window_ms: defaults.cb_window_ms,
        cb_open_ttl_ms: env_secs_to_ms(env, "CB_OPEN_TTL", defaults.cb_open_ttl_ms),
        max_waitlist_length: env_u64(env, "MAX_WAITLIST_LENGTH", defaults.max_waitlist_length),
        max_batch: defaults.max_batch,
        ownership_ttl_ms: defaults.ownership_ttl_ms,
        call_max_duration_ms: defaults.call_max_duration_ms,
        blocked_poll_interval_ms: defaults.blocked_poll_interval_ms,
    }
}

fn env_u64(env: &impl EnvVars, key: &str, default: u64) -> u64 {
    env.var(key)
        .map(|val| {
            val.parse()
                .unwrap_or_else(|_| panic!("Invalid value for {key}, must be a valid integer"))
        })
        .unwrap_or(default)
}

fn env_secs_to_ms(env: &impl EnvVars, key: &str, default_ms: u64) -> u64 {
    env.var(key)
        .map(|val| {
            let secs: u64 = val
                .parse()
                .unwrap_or_else(|_| panic!("Invalid value for {key}, must be a valid integer"));
            secs * 1000
        })
        .unwrap_or(default_ms)
}

fn env_bool(env: &impl EnvVars, key: &str, default: bool) -> bool {
    env.var(key)
        .map(|val| {
            val.parse().unwrap_or_else(|_| {
                panic!("Invalid value for {key}, must be either \"true\" or \"false\"")
            })
        })
        .unwrap_or(default)
}
