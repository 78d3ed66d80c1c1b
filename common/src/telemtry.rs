use tracing::Subscriber;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt};

/// Builds a tracing subscriber that formats events as bunyan-style JSON lines
/// on `sink`, filtered by `RUST_LOG` (falling back to `env_filter`).
pub fn get_subscriber<Sink>(
    name: String,
    env_filter: String,
    sink: Sink,
) -> impl Subscriber + Send + Sync
where
    Sink: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));
    let formatting_layer = BunyanFormattingLayer::new(name, sink);

    let registry = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);

    #[cfg(feature = "otel")]
    {
        registry.with(otel::layer())
    }

    #[cfg(not(feature = "otel"))]
    {
        registry
    }
}

/// Installs `subscriber` as the global default and redirects `log` records
/// through `tracing`.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    tracing_log::LogTracer::init().expect("Failed to set logger");
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::Layer;

    /// Builds an OpenTelemetry tracing layer exporting spans over OTLP/HTTP.
    ///
    /// Falls back to a no-op tracer if the exporter cannot be built (e.g. no
    /// collector reachable at startup) so that telemetry setup never blocks
    /// the rest of the service from coming up.
    pub fn layer<S>() -> impl Layer<S>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let tracer = provider.tracer("vmd");
        tracing_opentelemetry::layer().with_tracer(tracer)
    }
}
