use anyhow::Result;
use axum::{extract::MatchedPath, http::Request};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{MakeSpan, TraceLayer},
};
use tracing::{error, Span};
use tracing_subscriber::{filter::Directive, layer::SubscriberExt, EnvFilter, Layer};

use crate::config::ServerConfig;

const SERVICE_NAME: &str = "thopter-server";

/// Used when RUST_LOG is unset. The provider and tracker clients log every
/// connection at info.
const DEFAULT_DIRECTIVES: &[&str] = &[
    "info",
    "hyper=warn",
    "hyper_util=warn",
    "reqwest=warn",
    "h2=warn",
];

pub fn get_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        DEFAULT_DIRECTIVES
            .iter()
            .filter_map(|directive| directive.parse::<Directive>().ok())
            .fold(EnvFilter::default(), |filter, directive| {
                filter.add_directive(directive)
            })
    })
}

pub fn get_log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging {
        return Box::new(
            json_subscriber::fmt::layer()
                .with_span_list(false)
                .flatten_event(true)
                .flatten_current_span_on_top_level(true),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

/// Span for one API request, tagged with the server instance so logs from
/// several control planes can be told apart.
#[derive(Clone)]
pub struct RequestSpan {
    env: String,
    instance_id: String,
}

impl RequestSpan {
    pub fn new(env: &str, instance_id: &str) -> Self {
        Self {
            env: env.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str());
        tracing::info_span!(
            "request",
            env = %self.env,
            instance_id = %self.instance_id,
            method = %request.method(),
            path = request.uri().path(),
            route,
        )
    }
}

pub fn http_trace_layer(
    env: &str,
    instance_id: &str,
) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan> {
    TraceLayer::new_for_http().make_span_with(RequestSpan::new(env, instance_id))
}

/// Owns the span exporter, if one was installed.
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }

    /// Flushes buffered spans and stops the exporter.
    pub fn shutdown(self) {
        let Some(provider) = self.provider else {
            return;
        };
        if let Err(err) = provider.force_flush() {
            eprintln!("failed to flush traces: {:?}", err);
        }
        if let Err(err) = provider.shutdown() {
            eprintln!("failed to shut down tracer provider: {:?}", err);
        }
    }
}

fn resource(config: &ServerConfig, instance_id: &str) -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new("service.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new("deployment.environment", config.env.clone()))
        .with_attribute(KeyValue::new("thopter.app", config.provider.app_name.clone()))
        .build()
}

pub fn setup_tracing(config: &ServerConfig, instance_id: &str) -> Result<TracingGuard> {
    let log_layer = get_log_layer(config);
    let subscriber =
        tracing_subscriber::Registry::default().with(log_layer.with_filter(get_env_filter()));

    if !config.telemetry.enable_tracing {
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            error!("logger was already initiated, continuing: {:?}", e);
        }
        return Ok(TracingGuard { provider: None });
    }

    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let span_exporter = span_exporter.build()?;

    let tracer_provider = TracerProviderBuilder::default()
        .with_resource(resource(config, instance_id))
        .with_batch_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(SERVICE_NAME));
    let subscriber = subscriber.with(otel_layer.with_filter(get_env_filter()));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }

    Ok(TracingGuard {
        provider: Some(tracer_provider),
    })
}

#[cfg(test)]
mod tests {
    use opentelemetry::{Key, Value};

    use super::*;

    #[test]
    fn test_default_directives_parse() {
        for directive in DEFAULT_DIRECTIVES {
            assert!(directive.parse::<Directive>().is_ok(), "{}", directive);
        }
    }

    #[test]
    fn test_resource_names_the_instance() {
        let mut config = ServerConfig::default();
        config.env = "staging".to_string();
        let resource = resource(&config, "staging-abc");
        assert_eq!(
            resource.get(&Key::new("service.instance.id")),
            Some(Value::from("staging-abc"))
        );
        assert_eq!(
            resource.get(&Key::new("deployment.environment")),
            Some(Value::from("staging"))
        );
        assert_eq!(
            resource.get(&Key::new("service.name")),
            Some(Value::from(SERVICE_NAME))
        );
    }
}
