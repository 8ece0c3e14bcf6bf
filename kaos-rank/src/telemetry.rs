//! Logging and distributed tracing.
//!
//! Console output is always on, compact or JSON. With the `telemetry` feature
//! spans are also exported over OTLP to Jaeger, Tempo, or other collectors.
//!
//! # Example
//!
//! ```rust,ignore
//! use kaos_rank::telemetry::{init_tracing, TracingConfig};
//!
//! let _guard = init_tracing(
//!     TracingConfig::new("kaos-rank")
//!         .with_level("info,kaos_rank=debug")
//!         .with_otlp("http://localhost:4317"),
//! )?;
//! ```

use crate::error::{RankError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[cfg(feature = "telemetry")]
use opentelemetry::{trace::TracerProvider, KeyValue};
#[cfg(feature = "telemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "telemetry")]
use opentelemetry_sdk::{
    runtime,
    trace::{Config, Sampler},
    Resource,
};

/// Tracing configuration.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Service name for traces.
    pub service_name: String,
    /// OTLP endpoint (e.g., "http://localhost:4317"). None for console-only.
    pub otlp_endpoint: Option<String>,
    /// Log level filter (e.g., "info", "kaos_rank=debug,sqlx=warn").
    pub log_level: String,
    /// Output logs as JSON (useful for log aggregation).
    pub json_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "kaos-rank".into(),
            otlp_endpoint: None,
            log_level: "info".into(),
            json_output: false,
        }
    }
}

impl TracingConfig {
    /// Create a new config with service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set OTLP endpoint for trace export.
    pub fn with_otlp(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Set log level filter.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable JSON output.
    pub fn with_json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Call this once at startup. `RUST_LOG` overrides `log_level` when set.
pub fn init_tracing(config: TracingConfig) -> Result<Option<TracingGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = if config.json_output {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .boxed()
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    #[cfg(feature = "telemetry")]
    {
        let (otel_layer, guard) = match &config.otlp_endpoint {
            Some(endpoint) => {
                let (provider, guard) = init_otlp_tracer(&config.service_name, endpoint)?;
                let layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("kaos-rank"));
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };
        registry
            .with(otel_layer)
            .try_init()
            .map_err(|e| RankError::Config(e.to_string()))?;
        return Ok(guard);
    }

    #[cfg(not(feature = "telemetry"))]
    {
        registry
            .try_init()
            .map_err(|e| RankError::Config(e.to_string()))?;
        if let Some(endpoint) = &config.otlp_endpoint {
            tracing::warn!(
                endpoint = %endpoint,
                "OTLP endpoint ignored: built without the telemetry feature"
            );
        }
        return Ok(None);
    }
}

/// Initialize OTLP tracer provider.
#[cfg(feature = "telemetry")]
fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<(opentelemetry_sdk::trace::TracerProvider, TracingGuard)> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| RankError::Config(format!("failed to create OTLP exporter: {}", e)))?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(resource),
        )
        .build();

    let guard = TracingGuard {
        provider: provider.clone(),
    };

    Ok((provider, guard))
}

/// Guard that shuts down the tracer provider on drop.
pub struct TracingGuard {
    #[cfg(feature = "telemetry")]
    provider: opentelemetry_sdk::trace::TracerProvider,
}

impl Drop for TracingGuard {
    #[cfg(feature = "telemetry")]
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }

    #[cfg(not(feature = "telemetry"))]
    fn drop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::new("test-service")
            .with_level("debug")
            .with_json();

        assert_eq!(config.service_name, "test-service");
        assert_eq!(config.log_level, "debug");
        assert!(config.json_output);
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_config_with_otlp() {
        let config = TracingConfig::new("rank-worker")
            .with_otlp("http://localhost:4317")
            .with_level("info,kaos_rank=debug");

        assert_eq!(config.otlp_endpoint, Some("http://localhost:4317".into()));
    }
}
