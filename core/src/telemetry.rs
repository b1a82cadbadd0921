use dialcast_helpers::runtime_types::RuntimePlatform;
use opentelemetry_otlp::WithExportConfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format},
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::{config::RuntimeConfig, errors::ApplicationStartError};

/// Sets up tracing for the runtime: an OTLP export layer plus a fmt
/// layer that is pretty locally and JSON elsewhere.
///
/// The returned guard is `Some` only in test mode, where the
/// subscriber is installed as the thread default; dropping the guard
/// uninstalls it.
pub fn setup_tracing(
    runtime_config: &RuntimeConfig,
) -> Result<Option<tracing::subscriber::DefaultGuard>, ApplicationStartError> {
    let trace_config = opentelemetry_sdk::trace::config()
        .with_sampler(opentelemetry_sdk::trace::Sampler::AlwaysOn)
        .with_id_generator(opentelemetry_sdk::trace::RandomIdGenerator::default());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(runtime_config.trace_otlp_collector_endpoint.clone()),
        )
        .with_trace_config(
            trace_config.with_resource(opentelemetry_sdk::Resource::new(vec![
                opentelemetry::KeyValue::new("service.name", runtime_config.service_name.clone()),
            ])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let level_filter = LevelFilter::from_level(runtime_config.runtime_max_diagnostics_level);

    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_filter(
            EnvFilter::from_default_env()
                .add_directive(level_filter.into())
                .add_directive("dialcast_runtime_core".parse()?)
                .add_directive("dialcast_dispatch".parse()?)
                .add_directive("tower_http=info".parse()?)
                .add_directive("hyper=info".parse()?)
                .add_directive("axum::rejection=trace".parse()?),
        )
        .with_filter(level_filter);

    let fmt_layer_prod = fmt::layer()
        .event_format(format().json().with_span_list(true))
        // Since we're using the JSON event formatter, we must also
        // use the JSON field formatter.
        .fmt_fields(format::JsonFields::default())
        .with_filter(level_filter);

    let fmt_layer_local = fmt::layer()
        .event_format(format().pretty())
        .with_filter(level_filter);

    if runtime_config.test_mode {
        // In test mode the subscriber is only installed for the
        // current thread; a global install would fail once a second
        // test registers its own subscriber.
        let guard = tracing_subscriber::registry()
            .with(otel_layer)
            .with(fmt_layer_local)
            .set_default();
        return Ok(Some(guard));
    }

    if runtime_config.platform == RuntimePlatform::Local {
        tracing_subscriber::registry()
            .with(otel_layer)
            .with(fmt_layer_local)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(otel_layer)
            .with(fmt_layer_prod)
            .try_init()?;
    }

    Ok(None)
}
