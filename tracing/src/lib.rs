//! Log and trace setup shared by the webcompile binaries.
//!
//! Events always go to stderr. With the `otlp` feature, spans can also be
//! exported to an OpenTelemetry collector, configured through the usual
//! `OTEL_*` environment variables.
use tracing::Level;
use tracing_subscriber::{
    filter::FromEnvError, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError,
    EnvFilter,
};

#[cfg(feature = "otlp")]
use opentelemetry::KeyValue;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::{ResourceDetector, SdkProvidedResourceDetector},
    trace::{BatchConfigBuilder, TracerProvider},
    Resource,
};

pub mod propagate;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to install the subscriber: {0}")]
    Init(#[from] TryInitError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] FromEnvError),

    #[cfg(feature = "otlp")]
    #[error("unable to set up the otlp exporter: {0}")]
    Otlp(#[from] opentelemetry::trace::TraceError),

    #[cfg(feature = "otlp")]
    #[error("otlp tracer is not backed by a provider")]
    NoProvider,
}

/// Keeps the span exporter (if any) around until [TracingHandle::shutdown].
#[derive(Default)]
#[must_use]
pub struct TracingHandle {
    #[cfg(feature = "otlp")]
    provider: Option<TracerProvider>,
}

impl TracingHandle {
    /// Exports all spans still queued and stops the exporter.
    /// Call this once the server stopped accepting requests.
    pub async fn shutdown(self) {
        #[cfg(feature = "otlp")]
        {
            if let Some(provider) = self.provider {
                // Flushing blocks until the collector answered.
                let flushed = tokio::task::spawn_blocking(move || {
                    let failures: Vec<_> = provider
                        .force_flush()
                        .into_iter()
                        .filter_map(Result::err)
                        .collect();
                    opentelemetry::global::shutdown_tracer_provider();
                    failures
                })
                .await;

                match flushed {
                    Ok(failures) => {
                        for e in failures {
                            tracing::warn!(err=%e, "failed to export spans");
                        }
                    }
                    Err(e) => tracing::warn!(err=%e, "span exporter shutdown panicked"),
                }
            }
        }
    }
}

pub struct TracingBuilder {
    level: Level,

    #[cfg(feature = "otlp")]
    otlp_service_name: Option<&'static str>,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,

            #[cfg(feature = "otlp")]
            otlp_service_name: None,
        }
    }
}

impl TracingBuilder {
    /// Default level for stderr and otlp. `RUST_LOG` takes precedence.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Export spans over otlp, reporting as `service_name` unless
    /// `OTEL_SERVICE_NAME` says otherwise.
    #[cfg(feature = "otlp")]
    pub fn enable_otlp(mut self, service_name: &'static str) -> TracingBuilder {
        self.otlp_service_name = Some(service_name);
        self
    }

    /// Installs the global subscriber. Needs to run inside a tokio runtime
    /// when otlp is enabled.
    pub fn build(self) -> Result<TracingHandle, Error> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;

        let registry = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        );

        #[cfg(feature = "otlp")]
        {
            if let Some(service_name) = self.otlp_service_name {
                opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

                let tracer = otlp_tracer(service_name)?;
                let provider = tracer.provider().ok_or(Error::NoProvider)?;

                registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init()?;
                return Ok(TracingHandle {
                    provider: Some(provider),
                });
            }
        }

        registry.try_init()?;
        Ok(TracingHandle::default())
    }
}

#[cfg(feature = "otlp")]
fn otlp_tracer(service_name: &'static str) -> Result<opentelemetry_sdk::trace::Tracer, Error> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_batch_config(
            BatchConfigBuilder::default()
                // A compile request yields a handful of spans, exporting on a
                // fixed schedule is enough and keeps an absent collector from
                // flooding the log with export errors.
                .with_scheduled_delay(std::time::Duration::from_secs(10))
                .build(),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default().with_resource(otlp_resource(service_name)),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracer)
}

/// Resource attributes detected from the environment, with `service_name`
/// filled in if the environment didn't name the service.
#[cfg(feature = "otlp")]
fn otlp_resource(service_name: &'static str) -> Resource {
    let detected = SdkProvidedResourceDetector.detect(std::time::Duration::ZERO);

    match detected.get("service.name".into()) {
        Some(name) if name.as_str() != "unknown_service" => detected,
        _ => detected.merge(&Resource::new([KeyValue::new("service.name", service_name)])),
    }
}
