//! Subscriber setup. `RUST_LOG` wins over the configured level.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::error::{ProxyError, Result};

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    // Targets stay visible so `flow_proxy::alarm` lines can be routed separately.
    if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    }
}

pub fn init_tracing(level: &str, json_logs: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt_layer(json_logs))
        .try_init()
        .map_err(|err| ProxyError::Settings {
            reason: format!("failed to install tracing subscriber: {err}"),
        })
}

#[cfg(feature = "otel")]
pub use otel::{OtelGuard, init_tracing_with_otel};

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    use crate::error::{ProxyError, Result};

    /// Flushes and shuts the span exporter down when dropped.
    #[derive(Debug)]
    pub struct OtelGuard {
        provider: SdkTracerProvider,
    }

    impl Drop for OtelGuard {
        fn drop(&mut self) {
            let _ = self.provider.shutdown();
        }
    }

    pub fn init_tracing_with_otel(
        level: &str,
        json_logs: bool,
        endpoint: Option<&str>,
    ) -> Result<OtelGuard> {
        let mut exporter = SpanExporter::builder().with_http();
        if let Some(endpoint) = endpoint {
            exporter = exporter.with_endpoint(endpoint.to_string());
        }
        let exporter = exporter.build().map_err(|err| ProxyError::Settings {
            reason: format!("failed to build OTLP exporter: {err}"),
        })?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder_empty()
                    .with_service_name("flow-proxy")
                    .build(),
            )
            .build();
        global::set_tracer_provider(provider.clone());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("flow-proxy"));

        tracing_subscriber::registry()
            .with(super::env_filter(level))
            .with(super::fmt_layer(json_logs))
            .with(otel_layer)
            .try_init()
            .map_err(|err| ProxyError::Settings {
                reason: format!("failed to install tracing subscriber: {err}"),
            })?;

        Ok(OtelGuard { provider })
    }
}
