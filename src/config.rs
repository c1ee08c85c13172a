//! Tracing configuration, as loaded by the host application.
//!
//! The JSON shape is described by a bundled JSON Schema, [`CONFIG_SCHEMA`], which hosts can
//! register with whatever schema compiler they use through [`add_config_schema`].
use serde::{Deserialize, Serialize};
use std::io::Read;

/// The identifier [`CONFIG_SCHEMA`] is registered under.
pub const CONFIG_SCHEMA_ID: &str = "https://ory.sh/schemas/tracing.schema.json";

/// The bundled JSON Schema for [`Config`].
pub const CONFIG_SCHEMA: &[u8] = include_bytes!("config.schema.json");

/// Where spans are sent when no collector address is configured. Jaeger accepts OTLP/HTTP here.
pub const DEFAULT_LOCAL_AGENT_ADDRESS: &str = "localhost:4318";

/// Top level tracing configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// the `service.name` spans are reported under
    pub service_name: String,
    /// the active tracing backend, if any
    pub provider: Option<Provider>,
    /// per-backend settings
    pub providers: ProvidersConfig,
}

/// The tracing backends that can be selected in [`Config::provider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// see [`JaegerConfig`]
    Jaeger,
    /// see [`ZipkinConfig`]
    Zipkin,
}

/// Settings for every backend. Only the one named by [`Config::provider`] is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// jaeger settings
    pub jaeger: Option<JaegerConfig>,
    /// zipkin settings
    pub zipkin: Option<ZipkinConfig>,
}

/// Jaeger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JaegerConfig {
    /// `host:port` of the collector spans are exported to.
    ///
    /// Spans are sent as OTLP over http, so this is jaeger's OTLP/HTTP port (4318), not the
    /// legacy agent's UDP ports 6831 and 6832.
    pub local_agent_address: String,
    /// how traces are sampled
    pub sampling: Option<JaegerSampling>,
    /// the name of the header format requested by the host. Every supported format is always
    /// both read and written, so this is informational.
    pub propagation: String,
    /// the tag value length requested by the host
    pub max_tag_value_length: usize,
}

impl Default for JaegerConfig {
    fn default() -> Self {
        Self {
            local_agent_address: DEFAULT_LOCAL_AGENT_ADDRESS.into(),
            sampling: None,
            propagation: String::new(),
            max_tag_value_length: 0,
        }
    }
}

/// Jaeger sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JaegerSampling {
    /// the legacy jaeger sampler type, interpreted together with [`value`](Self::value)
    #[serde(rename = "type")]
    pub kind: SamplingType,
    /// the argument of [`kind`](Self::kind)
    pub value: f64,
    /// an explicit trace id ratio. Takes precedence over `type` and `value`.
    pub trace_id_ratio: Option<f64>,
    /// url of a jaeger remote sampling server. When set, the sampling strategy is fetched from
    /// there and the ratio is only the initial strategy.
    pub server_url: Option<String>,
}

impl Default for JaegerSampling {
    fn default() -> Self {
        Self {
            kind: SamplingType::Const,
            value: 1.0,
            trace_id_ratio: None,
            server_url: None,
        }
    }
}

/// Legacy jaeger sampler types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingType {
    /// sample everything when `value` is positive, nothing otherwise
    #[default]
    Const,
    /// sample a `value` fraction of traces
    Probabilistic,
    /// sample `value` traces per second. Not expressible as a ratio; everything is sampled.
    RateLimiting,
}

impl JaegerSampling {
    /// The fraction of trace ids that should be sampled, in `0.0..=1.0`.
    pub fn ratio(&self) -> f64 {
        let ratio = self.trace_id_ratio.unwrap_or(match self.kind {
            SamplingType::Const if self.value > 0.0 => 1.0,
            SamplingType::Const => 0.0,
            SamplingType::Probabilistic => self.value,
            SamplingType::RateLimiting => 1.0,
        });

        ratio.clamp(0.0, 1.0)
    }

    /// The remote sampling server, ignoring blank values.
    pub fn server_url(&self) -> Option<&str> {
        self.server_url.as_deref().filter(|url| !url.trim().is_empty())
    }
}

/// Zipkin settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZipkinConfig {
    /// the zipkin span collection endpoint, e.g. `http://localhost:9411/api/v2/spans`
    pub server_url: String,
}

impl Config {
    /// Parses a [`Config`] from json.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The jaeger settings, or their defaults.
    pub fn jaeger(&self) -> JaegerConfig {
        self.providers.jaeger.clone().unwrap_or_default()
    }
}

/// Anything that can take a named resource from a byte stream, such as a JSON Schema compiler.
///
/// This is deliberately narrow so that any schema library, or a version of one, can be adapted.
pub trait ResourceRegistrar {
    /// the error the registrar reports when it rejects a resource
    type Error;

    /// Adds the resource read from `resource` under `url`.
    fn add_resource(&mut self, url: &str, resource: &mut dyn Read) -> Result<(), Self::Error>;
}

/// Adds [`CONFIG_SCHEMA`] to `registrar` under [`CONFIG_SCHEMA_ID`].
pub fn add_config_schema<R>(registrar: &mut R) -> Result<(), R::Error>
where
    R: ResourceRegistrar + ?Sized,
{
    let mut schema = CONFIG_SCHEMA;
    registrar.add_resource(CONFIG_SCHEMA_ID, &mut schema)
}
