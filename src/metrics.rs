use crate::{fatal::fatal, instrument::Instrumented};
use prometheus::{
    core::{Collector, Desc},
    proto::MetricFamily,
    HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::{Mutex, OnceLock, PoisonError},
};
use trillium::Handler;

/// Per-process request metrics, exposed as a single prometheus [`Collector`].
///
/// Six instruments are kept, all prefixed with the application name and carrying the `version`,
/// `hash` and `buildTime` constant labels:
///
/// * `{app}_response_time_seconds`, labelled by `endpoint`
/// * `{app}_requests_total`, labelled by `code` and `method`
/// * `{app}_duration_seconds`, labelled by `code` and `method`
/// * `{app}_response_size_bytes`, labelled by `code` and `method`
/// * `{app}_request_size_bytes`, labelled by `code` and `method`
/// * `{app}_statuses_total`, labelled by `method` and `status_bucket`
///
/// Use [`Metrics::instrument`] to record them for a handler.
#[derive(Clone)]
pub struct Metrics {
    app: String,
    pub(crate) response_time: HistogramVec,
    pub(crate) total_requests: IntCounterVec,
    pub(crate) duration: HistogramVec,
    pub(crate) response_size: HistogramVec,
    pub(crate) request_size: HistogramVec,
    pub(crate) handler_statuses: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("app", &self.app)
            .field("response_time", &"..")
            .field("total_requests", &"..")
            .field("duration", &"..")
            .field("response_size", &"..")
            .field("request_size", &"..")
            .field("handler_statuses", &"..")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct Identity {
    app: String,
    version: String,
    hash: String,
    date: String,
}

/// Handles registered with the default registry through [`Metrics::try_new`].
fn registered() -> &'static Mutex<HashMap<Identity, Metrics>> {
    static REGISTERED: OnceLock<Mutex<HashMap<Identity, Metrics>>> = OnceLock::new();
    REGISTERED.get_or_init(Default::default)
}

impl Metrics {
    /// Builds the metrics for `app` and registers them with the default prometheus registry.
    ///
    /// Constructing the same metrics again returns the instruments that are already
    /// registered. Any other registration failure is [fatal](crate::fatal).
    pub fn new(app: &str, version: &str, hash: &str, date: &str) -> Self {
        Self::try_new(app, version, hash, date).unwrap_or_else(|error| {
            fatal(format!("unable to register {app} metrics: {error}"))
        })
    }

    /// Like [`Metrics::new`], returning registration failures instead.
    pub fn try_new(app: &str, version: &str, hash: &str, date: &str) -> prometheus::Result<Self> {
        let identity = Identity {
            app: app.into(),
            version: version.into(),
            hash: hash.into(),
            date: date.into(),
        };

        let mut registered = registered().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(metrics) = registered.get(&identity) {
            return Ok(metrics.clone());
        }

        let metrics = Self::build(app, version, hash, date)?;
        match metrics.register(prometheus::default_registry()) {
            Ok(()) => {
                registered.insert(identity, metrics.clone());
            }

            Err(prometheus::Error::AlreadyReg) => {
                log::warn!(
                    "{app} metrics were registered by another collector, these will not be exported"
                );
            }

            Err(error) => return Err(error),
        }

        Ok(metrics)
    }

    /// Builds the instruments without registering them anywhere.
    pub fn build(app: &str, version: &str, hash: &str, date: &str) -> prometheus::Result<Self> {
        let labels = HashMap::from([
            ("version".to_string(), version.to_string()),
            ("hash".to_string(), hash.to_string()),
            ("buildTime".to_string(), date.to_string()),
        ]);

        let histogram = |name: &str, help: &str, label_names: &[&str]| {
            HistogramVec::new(
                HistogramOpts::new(format!("{app}_{name}"), help).const_labels(labels.clone()),
                label_names,
            )
        };

        let counter = |name: &str, help: &str, label_names: &[&str]| {
            IntCounterVec::new(
                Opts::new(format!("{app}_{name}"), help).const_labels(labels.clone()),
                label_names,
            )
        };

        Ok(Self {
            app: app.to_string(),
            response_time: histogram(
                "response_time_seconds",
                "response time of an endpoint in seconds",
                &["endpoint"],
            )?,
            total_requests: counter("requests_total", "number of requests", &["code", "method"])?,
            duration: histogram(
                "duration_seconds",
                "duration of a requests in seconds",
                &["code", "method"],
            )?,
            response_size: histogram(
                "response_size_bytes",
                "size of the responses in bytes",
                &["code", "method"],
            )?,
            request_size: histogram(
                "request_size_bytes",
                "size of the requests in bytes",
                &["code", "method"],
            )?,
            handler_statuses: counter(
                "statuses_total",
                "count number of responses per status",
                &["method", "status_bucket"],
            )?,
        })
    }

    /// Registers these metrics with `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.clone()))
    }

    /// the application name the metrics are prefixed with
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Wraps `handler` so that every conn it sees is recorded, with `endpoint` as the label of
    /// the response time histogram.
    pub fn instrument<H: Handler>(&self, handler: H, endpoint: impl Into<String>) -> Instrumented<H> {
        Instrumented::new(handler, self.clone(), endpoint.into())
    }

    fn collectors(&self) -> [&dyn Collector; 6] {
        [
            &self.duration,
            &self.total_requests,
            &self.request_size,
            &self.response_size,
            &self.handler_statuses,
            &self.response_time,
        ]
    }
}

impl Collector for Metrics {
    fn desc(&self) -> Vec<&Desc> {
        self.collectors()
            .into_iter()
            .flat_map(|collector| collector.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.collectors()
            .into_iter()
            .flat_map(|collector| collector.collect())
            .collect()
    }
}

/// Groups a status code by its leading digit: `"2xx"` through `"5xx"`, and `"unknown"` for
/// anything outside `200..=599`.
pub fn status_bucket(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}
