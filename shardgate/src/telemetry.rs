use crate::config::{LogFormat, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::fmt::{
    self,
    format::{Format, PrettyFields},
};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("could not install the log subscriber: {0}")]
    Subscriber(#[from] TryInitError),
    #[error("could not build the statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderAlreadySet,
}

/// Installs the global log subscriber. RUST_LOG, when set, takes precedence
/// over the configured level.
///
/// The returned guard flushes pending Sentry events on drop, so it has to be
/// held for the lifetime of the process.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<sentry::ClientInitGuard>, TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?
        .add_directive("hyper=warn".parse()?);

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(sentry_layer);
    match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .event_format(Format::default().pretty().with_source_location(false))
                    .fmt_fields(PrettyFields::new()),
            )
            .try_init()?,
        LogFormat::Standard => registry.with(fmt::layer()).try_init()?,
    }

    Ok(guard)
}

/// Installs the statsd exporter as the global metrics recorder.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), TelemetryError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(config.prefix.as_str()))?;
    metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderAlreadySet)?;

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "sending metrics to statsd"
    );
    Ok(())
}
