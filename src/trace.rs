//! Tracer provider setup for jaeger and zipkin.
//!
//! The quickest path is [`setup`], which builds a [`Pipeline`] for the configured provider,
//! installs it as the process-wide tracer provider and returns a tracer. Building and installing
//! are separate steps on [`Pipeline`] for hosts that want to keep the provider around, for
//! example to flush it on shutdown.
//!
//! ```no_run
//! use trillium_x::{config::Config, trace};
//!
//! let config = Config::from_json(r#"{
//!     "service_name": "my-service",
//!     "provider": "jaeger",
//!     "providers": { "jaeger": { "local_agent_address": "jaeger:4318" } }
//! }"#).unwrap();
//!
//! let tracer = trace::setup(&config, "my-service").unwrap();
//! ```

use crate::{
    config::{Config, JaegerSampling, Provider},
    propagation::composite_propagator,
};
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    runtime,
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions as semconv;
use opentelemetry_zipkin::ZipkinExporter;
use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, Ordering},
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The tracer handed out by an installed [`Pipeline`].
pub type Tracer = <SdkTracerProvider as opentelemetry::trace::TracerProvider>::Tracer;

/// Why a tracer could not be set up. Nothing is installed when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// the collector address is not `host:port`
    #[error("invalid collector address {address:?}: {reason}")]
    Address {
        /// the configured address
        address: String,
        /// what is wrong with it
        reason: &'static str,
    },

    /// the span exporter could not be constructed
    #[error("unable to build span exporter: {0}")]
    Exporter(#[source] BoxError),

    /// the jaeger remote sampler could not be constructed
    #[error("unable to build jaeger remote sampler: {0}")]
    Sampler(#[source] BoxError),

    /// a remote sampling server is configured but there is no tokio runtime to poll it from
    #[error("a jaeger remote sampler must be set up from within a tokio runtime")]
    NoRuntime,

    /// zipkin was selected without a server url
    #[error("providers.zipkin.server_url is not configured")]
    MissingZipkinServerUrl,

    /// no provider was selected
    #[error("no tracing provider is configured")]
    NoProvider,
}

/// How root spans are sampled. Whatever the strategy, a sampling decision that arrives with an
/// incoming request is respected.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingStrategy {
    /// sample this fraction of trace ids
    Ratio(f64),
    /// poll a jaeger sampling server for the strategy, starting out with `initial_ratio`
    Remote {
        /// the sampling server url, e.g. `http://localhost:5778/sampling`
        server_url: String,
        /// the ratio used until the server has answered
        initial_ratio: f64,
    },
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        Self::Ratio(1.0)
    }
}

impl SamplingStrategy {
    /// Determines the strategy for the given jaeger sampling settings.
    pub fn from_config(sampling: Option<&JaegerSampling>) -> Self {
        let Some(sampling) = sampling else {
            return Self::default();
        };

        match sampling.server_url() {
            Some(server_url) => Self::Remote {
                server_url: server_url.to_string(),
                initial_ratio: sampling.ratio(),
            },
            None => Self::Ratio(sampling.ratio()),
        }
    }

    /// Builds the parent-based sampler for this strategy.
    pub fn sampler(&self, service_name: &str) -> Result<Sampler, Error> {
        let root = match self {
            Self::Ratio(ratio) => Sampler::TraceIdRatioBased(*ratio),

            Self::Remote {
                server_url,
                initial_ratio,
            } => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(Error::NoRuntime);
                }

                Sampler::jaeger_remote(
                    runtime::Tokio,
                    reqwest::Client::new(),
                    Sampler::TraceIdRatioBased(*initial_ratio),
                    service_name.to_string(),
                )
                .with_endpoint(server_url.as_str())
                .build()
                .map_err(|e| Error::Sampler(Box::new(e)))?
            }
        };

        Ok(Sampler::ParentBased(Box::new(root)))
    }
}

/// A built tracer provider that has not necessarily been installed yet.
#[derive(Debug, Clone)]
pub struct Pipeline {
    provider: SdkTracerProvider,
    backend: Provider,
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

impl Pipeline {
    /// Builds a pipeline for whichever provider `config` selects.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        match config.provider {
            Some(Provider::Jaeger) => Self::jaeger(config),
            Some(Provider::Zipkin) => Self::zipkin(config),
            None => Err(Error::NoProvider),
        }
    }

    /// Builds a pipeline that batches spans to the jaeger collector at
    /// `providers.jaeger.local_agent_address`, using the configured sampling.
    ///
    /// Jaeger ingests OTLP natively, so spans are sent as OTLP over http to
    /// `http://host:port/v1/traces`. The address must therefore be jaeger's OTLP/HTTP port
    /// (4318 by default), not the UDP agent ports 6831 or 6832, which are logged as a warning
    /// because nothing would arrive there. A remote sampling server requires this to be called
    /// from within a tokio runtime.
    pub fn jaeger(config: &Config) -> Result<Self, Error> {
        let jaeger = config.jaeger();
        let (host, port) = split_host_port(&jaeger.local_agent_address)?;
        if is_agent_port(port) {
            log::warn!(
                "{} is a jaeger agent (udp) port, spans are sent as OTLP over http and need the \
                 collector's OTLP port, usually 4318",
                jaeger.local_agent_address
            );
        }

        let exporter = SpanExporter::builder()
            .with_http()
            .with_endpoint(collector_endpoint(&host, port))
            .build()
            .map_err(|e| Error::Exporter(Box::new(e)))?;

        let sampler =
            SamplingStrategy::from_config(jaeger.sampling.as_ref()).sampler(&config.service_name)?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(service_resource(&config.service_name))
            .with_sampler(sampler)
            .build();

        Ok(Self {
            provider,
            backend: Provider::Jaeger,
        })
    }

    /// Builds a pipeline that batches spans to `providers.zipkin.server_url`, sampling
    /// everything that was not already decided upstream.
    pub fn zipkin(config: &Config) -> Result<Self, Error> {
        let server_url = config
            .providers
            .zipkin
            .as_ref()
            .map(|zipkin| zipkin.server_url.trim())
            .filter(|url| !url.is_empty())
            .ok_or(Error::MissingZipkinServerUrl)?;

        let exporter = ZipkinExporter::builder()
            .with_collector_endpoint(server_url)
            .build()
            .map_err(|e| Error::Exporter(Box::new(e)))?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(service_resource(&config.service_name))
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
            .build();

        Ok(Self {
            provider,
            backend: Provider::Zipkin,
        })
    }

    /// the built provider, e.g. to flush or shut it down
    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    /// Installs this pipeline's provider and the composite propagator as the process-wide
    /// defaults, and returns a tracer named `tracer_name`.
    ///
    /// This is meant to happen once, during startup.
    pub fn install(&self, tracer_name: impl Into<Cow<'static, str>>) -> Tracer {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            log::warn!("replacing the previously installed tracer provider");
        }

        global::set_tracer_provider(self.provider.clone());
        global::set_text_map_propagator(composite_propagator());
        log::info!("installed {:?} tracer provider", self.backend);

        self.provider.tracer(tracer_name)
    }
}

/// Installs a jaeger tracer provider as configured by `config` and returns a tracer named
/// `tracer_name`.
pub fn setup_jaeger(
    config: &Config,
    tracer_name: impl Into<Cow<'static, str>>,
) -> Result<Tracer, Error> {
    Ok(Pipeline::jaeger(config)?.install(tracer_name))
}

/// Installs a zipkin tracer provider as configured by `config` and returns a tracer named
/// `tracer_name`.
pub fn setup_zipkin(
    config: &Config,
    tracer_name: impl Into<Cow<'static, str>>,
) -> Result<Tracer, Error> {
    Ok(Pipeline::zipkin(config)?.install(tracer_name))
}

/// Installs the tracer provider selected by `config.provider` and returns a tracer named
/// `tracer_name`.
pub fn setup(config: &Config, tracer_name: impl Into<Cow<'static, str>>) -> Result<Tracer, Error> {
    Ok(Pipeline::from_config(config)?.install(tracer_name))
}

fn service_resource(service_name: &str) -> Resource {
    Resource::builder_empty()
        .with_attribute(KeyValue::new(
            semconv::resource::SERVICE_NAME,
            service_name.to_string(),
        ))
        .build()
}

/// The compact and binary thrift ports of the legacy jaeger agent.
fn is_agent_port(port: u16) -> bool {
    matches!(port, 6831 | 6832)
}

fn collector_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("http://[{host}]:{port}/v1/traces")
    } else {
        format!("http://{host}:{port}/v1/traces")
    }
}

/// Splits `host:port` or `[ipv6]:port`. An empty host means `localhost`.
fn split_host_port(address: &str) -> Result<(String, u16), Error> {
    let invalid = |reason| Error::Address {
        address: address.to_string(),
        reason,
    };

    let (host, port) = match address.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| invalid("missing ']' in address"))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port in address"))?;
            (host, port)
        }

        None => {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port in address"))?;
            if host.contains(':') {
                return Err(invalid("too many colons in address"));
            }
            (host, port)
        }
    };

    let port = port.parse().map_err(|_| invalid("invalid port"))?;
    let host = if host.is_empty() { "localhost" } else { host };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JaegerConfig, ProvidersConfig, SamplingType, ZipkinConfig};
    use opentelemetry::{
        trace::{
            SamplingDecision, SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId,
            TraceState,
        },
        Context,
    };
    use opentelemetry::trace::{Span as _, Tracer as _};
    use opentelemetry_sdk::trace::{InMemorySpanExporterBuilder, ShouldSample};
    use serial_test::serial;

    fn jaeger_config(address: &str, sampling: Option<JaegerSampling>) -> Config {
        Config {
            service_name: "test-service".into(),
            provider: Some(Provider::Jaeger),
            providers: ProvidersConfig {
                jaeger: Some(JaegerConfig {
                    local_agent_address: address.into(),
                    sampling,
                    ..JaegerConfig::default()
                }),
                zipkin: None,
            },
        }
    }

    fn ratio(trace_id_ratio: f64) -> JaegerSampling {
        JaegerSampling {
            trace_id_ratio: Some(trace_id_ratio),
            ..JaegerSampling::default()
        }
    }

    fn propagator_fields() -> Vec<String> {
        global::get_text_map_propagator(|propagator| {
            propagator.fields().map(String::from).collect()
        })
    }

    fn decide(sampler: &Sampler, parent: Option<&Context>) -> SamplingDecision {
        sampler
            .should_sample(
                parent,
                TraceId::from_u128(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
                "span",
                &SpanKind::Server,
                &[],
                &[],
            )
            .decision
    }

    fn parent(flags: TraceFlags) -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_u128(1),
            SpanId::from_u64(1),
            flags,
            true,
            TraceState::default(),
        ))
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            split_host_port("localhost:6831").unwrap(),
            ("localhost".into(), 6831)
        );
        assert_eq!(split_host_port(":4318").unwrap(), ("localhost".into(), 4318));
        assert_eq!(split_host_port("[::1]:4318").unwrap(), ("::1".into(), 4318));

        for address in ["not-a-host-port", "", "::1:4318", "[::1]", "host:port", "host:70000"] {
            assert!(
                matches!(split_host_port(address), Err(Error::Address { .. })),
                "{address}"
            );
        }
    }

    #[test]
    fn collector_endpoints() {
        assert_eq!(
            collector_endpoint("jaeger", 4318),
            "http://jaeger:4318/v1/traces"
        );
        assert_eq!(collector_endpoint("::1", 4318), "http://[::1]:4318/v1/traces");
    }

    #[test]
    fn strategy_from_config() {
        assert_eq!(SamplingStrategy::from_config(None), SamplingStrategy::Ratio(1.0));
        assert_eq!(
            SamplingStrategy::from_config(Some(&ratio(0.5))),
            SamplingStrategy::Ratio(0.5)
        );
        assert_eq!(
            SamplingStrategy::from_config(Some(&JaegerSampling {
                kind: SamplingType::Probabilistic,
                value: 0.1,
                server_url: Some("http://localhost:5778/sampling".into()),
                trace_id_ratio: None,
            })),
            SamplingStrategy::Remote {
                server_url: "http://localhost:5778/sampling".into(),
                initial_ratio: 0.1,
            }
        );
    }

    #[test]
    fn upstream_decisions_are_respected() {
        let sampler = SamplingStrategy::Ratio(0.0).sampler("svc").unwrap();
        assert_eq!(decide(&sampler, None), SamplingDecision::Drop);
        assert_eq!(
            decide(&sampler, Some(&parent(TraceFlags::SAMPLED))),
            SamplingDecision::RecordAndSample
        );

        let sampler = SamplingStrategy::Ratio(1.0).sampler("svc").unwrap();
        assert_eq!(decide(&sampler, None), SamplingDecision::RecordAndSample);
        assert_eq!(
            decide(&sampler, Some(&parent(TraceFlags::default()))),
            SamplingDecision::Drop
        );
    }

    #[test]
    fn remote_sampling_needs_a_runtime() {
        let strategy = SamplingStrategy::Remote {
            server_url: "http://127.0.0.1:5778/sampling".into(),
            initial_ratio: 1.0,
        };
        assert!(matches!(strategy.sampler("svc"), Err(Error::NoRuntime)));
    }

    #[tokio::test]
    async fn remote_sampling_within_runtime() {
        let strategy = SamplingStrategy::Remote {
            server_url: "http://127.0.0.1:5778/sampling".into(),
            initial_ratio: 1.0,
        };
        assert!(strategy.sampler("svc").is_ok());
    }

    #[test]
    #[serial]
    fn malformed_address_installs_nothing() {
        let exporter = InMemorySpanExporterBuilder::new().build();
        let current = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        global::set_tracer_provider(current.clone());

        let installed = INSTALLED.load(Ordering::SeqCst);
        let before = propagator_fields();
        let config = jaeger_config("not-a-host-port", Some(ratio(0.5)));

        assert!(matches!(
            setup_jaeger(&config, "test"),
            Err(Error::Address { .. })
        ));
        assert!(matches!(setup(&config, "test"), Err(Error::Address { .. })));
        assert_eq!(propagator_fields(), before);
        assert_eq!(INSTALLED.load(Ordering::SeqCst), installed);

        global::tracer("current").start("still-current").end();
        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "still-current");

        current.shutdown().ok();
    }

    #[test]
    fn agent_ports_are_recognized() {
        assert!(is_agent_port(6831));
        assert!(is_agent_port(6832));
        assert!(!is_agent_port(4318));
        assert!(!is_agent_port(14268));
    }

    #[test]
    #[serial]
    fn ratio_sampling_installs_without_runtime() {
        // no remote sampler is built: that would fail with NoRuntime outside of tokio
        let config = jaeger_config("localhost:4318", Some(ratio(0.5)));
        let pipeline = Pipeline::jaeger(&config).unwrap();
        let _tracer = pipeline.install("test");

        let fields = propagator_fields();
        for field in [
            "uber-trace-id",
            "b3",
            "x-b3-traceid",
            "x-b3-spanid",
            "x-b3-sampled",
            "traceparent",
            "tracestate",
            "baggage",
        ] {
            assert!(fields.iter().any(|f| f == field), "{field} in {fields:?}");
        }

        pipeline.provider().shutdown().ok();
    }

    #[test]
    fn provider_selection() {
        let mut config = jaeger_config("localhost:4318", None);
        config.provider = None;
        assert!(matches!(
            Pipeline::from_config(&config),
            Err(Error::NoProvider)
        ));

        config.provider = Some(Provider::Zipkin);
        assert!(matches!(
            Pipeline::from_config(&config),
            Err(Error::MissingZipkinServerUrl)
        ));

        config.providers.zipkin = Some(ZipkinConfig {
            server_url: "http://localhost:9411/api/v2/spans".into(),
        });
        let pipeline = Pipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.backend, Provider::Zipkin);
        pipeline.provider().shutdown().ok();
    }
}
