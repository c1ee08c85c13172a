//! Trace context propagation across trillium request and response headers.
use opentelemetry::{
    global,
    propagation::{Extractor, Injector, TextMapCompositePropagator},
    Context,
};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_zipkin::{B3Encoding, Propagator as B3Propagator};
use trillium::{Conn, Headers};

/// A propagator that reads and writes jaeger (`uber-trace-id`), b3 in both its single and
/// multiple header encodings, [W3C trace context](https://www.w3.org/TR/trace-context/) and
/// [W3C baggage](https://www.w3.org/TR/baggage/).
///
/// Extraction accepts any of these formats. Injection writes all of them, so peers that only
/// understand one format can still correlate.
pub fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
        Box::new(B3Propagator::with_encoding(B3Encoding::SingleAndMultiHeader)),
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// [`Extractor`] over trillium [`Headers`].
#[derive(Debug)]
pub struct HeaderExtractor<'a> {
    headers: &'a Headers,
    keys: Vec<String>,
}

impl<'a> HeaderExtractor<'a> {
    /// Reads from `headers`.
    pub fn new(headers: &'a Headers) -> Self {
        let keys = headers
            .iter()
            .map(|(name, _)| name.to_string().to_lowercase())
            .collect();

        Self { headers, keys }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys.iter().map(String::as_str).collect()
    }
}

/// [`Injector`] into trillium [`Headers`].
#[derive(Debug)]
pub struct HeaderInjector<'a>(pub &'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Extracts the remote context carried by the request headers of `conn`, using the installed
/// process-wide propagator.
pub fn extract_context(conn: &Conn) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(conn.request_headers()))
    })
}

/// Writes `context` into `headers`, e.g. those of an outgoing request, using the installed
/// process-wide propagator.
pub fn inject_context(context: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(context, &mut HeaderInjector(headers))
    })
}
