// The default port the operator API server listens on.
pub const DEFAULT_SERVER_PORT: i32 = 8720;

// The default OTLP collector endpoint traces are exported to.
pub const DEFAULT_TRACE_OTLP_COLLECTOR_ENDPOINT: &str = "http://otelcollector:4317";

// How often the campaign scheduler checks for scheduled campaigns
// whose start time has elapsed.
pub const SCHEDULER_INTERVAL_MS: u64 = 30_000;
