use crate::metrics::{status_bucket, Metrics};
use prometheus::Histogram;
use std::{
    borrow::Cow,
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use trillium::{async_trait, Conn, Handler, Info, KnownHeaderName, Status, Upgrade};

/// What to do with the status bucket counter when a conn reaches `before_send` without a
/// status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusBucketPolicy {
    /// Skip the status bucket counter. Every other instrument is still recorded.
    #[default]
    BestEffort,
    /// Count the conn under the status it will be sent with, `404 Not Found`.
    Strict,
}

/// Trillium handler that records [`Metrics`] for every conn the wrapped handler runs on.
///
/// Observations are taken in `before_send` and recorded once the response has been sent, so
/// the duration includes transmission. Instrumented handlers may be nested or sequenced; each
/// one records the conns it ran on.
///
/// Constructed with [`Metrics::instrument`].
#[derive(Debug)]
pub struct Instrumented<H> {
    handler: H,
    id: u64,
    recorder: Arc<Recorder>,
}

#[derive(Clone)]
struct Recorder {
    metrics: Metrics,
    endpoint: String,
    response_time: Histogram,
    policy: StatusBucketPolicy,
}

impl Debug for Recorder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("metrics", &self.metrics)
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .finish()
    }
}

/// What a single conn looked like once its response was ready.
#[derive(Debug)]
struct Observation {
    method: &'static str,
    code: String,
    status: Option<u16>,
    duration_s: f64,
    request_size: u64,
    response_size: u64,
}

type Step = fn(&Recorder, &Observation);

/// Recording order. Each step is independent of the others.
const STEPS: [Step; 6] = [
    Recorder::response_size,
    Recorder::total_requests,
    Recorder::duration,
    Recorder::response_time,
    Recorder::request_size,
    Recorder::status_bucket,
];

impl Recorder {
    fn response_size(&self, observation: &Observation) {
        self.metrics
            .response_size
            .with_label_values(&[observation.code.as_str(), observation.method])
            .observe(observation.response_size as f64);
    }

    fn total_requests(&self, observation: &Observation) {
        self.metrics
            .total_requests
            .with_label_values(&[observation.code.as_str(), observation.method])
            .inc();
    }

    fn duration(&self, observation: &Observation) {
        self.metrics
            .duration
            .with_label_values(&[observation.code.as_str(), observation.method])
            .observe(observation.duration_s);
    }

    fn response_time(&self, observation: &Observation) {
        self.response_time.observe(observation.duration_s);
    }

    fn request_size(&self, observation: &Observation) {
        self.metrics
            .request_size
            .with_label_values(&[observation.code.as_str(), observation.method])
            .observe(observation.request_size as f64);
    }

    fn status_bucket(&self, observation: &Observation) {
        let status = match (observation.status, self.policy) {
            (Some(status), _) => status,
            (None, StatusBucketPolicy::Strict) => Status::NotFound as u16,
            (None, StatusBucketPolicy::BestEffort) => return,
        };

        self.metrics
            .handler_statuses
            .with_label_values(&[observation.method, status_bucket(status)])
            .inc();
    }

    fn record(&self, observation: &Observation) {
        for step in STEPS {
            step(self, observation);
        }
    }
}

/// An approximation of the request's size on the wire: request line, headers and the declared
/// body length.
fn approximate_request_size(conn: &Conn) -> u64 {
    let inner = conn.inner();
    let querystring = inner.querystring();

    let mut size = inner.path().len()
        + querystring.len()
        + usize::from(!querystring.is_empty())
        + conn.method().as_str().len()
        + inner.http_version().as_str().len();

    for (name, values) in conn.request_headers().iter() {
        let name: &str = name.as_ref();
        size += name.len();
        size += values
            .iter()
            .map(|value| value.to_string().len())
            .sum::<usize>();
    }

    let content_length = conn
        .request_headers()
        .get_str(KnownHeaderName::ContentLength)
        .and_then(|src| src.parse::<u64>().ok())
        .unwrap_or_default();

    size as u64 + content_length
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Ids of the instrumented handlers whose `run` has seen this conn and whose `before_send` has
/// not yet.
#[derive(Default)]
struct InstrumentedRuns(Vec<u64>);

impl InstrumentedRuns {
    fn remove(&mut self, id: u64) -> bool {
        match self.0.iter().position(|run| *run == id) {
            Some(index) => {
                self.0.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

impl<H: Handler> Instrumented<H> {
    pub(crate) fn new(handler: H, metrics: Metrics, endpoint: String) -> Self {
        let response_time = metrics.response_time.with_label_values(&[endpoint.as_str()]);
        Self {
            handler,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            recorder: Arc::new(Recorder {
                metrics,
                endpoint,
                response_time,
                policy: StatusBucketPolicy::default(),
            }),
        }
    }

    /// Sets the [`StatusBucketPolicy`]. Defaults to [`StatusBucketPolicy::BestEffort`].
    pub fn with_status_bucket_policy(mut self, policy: StatusBucketPolicy) -> Self {
        Arc::make_mut(&mut self.recorder).policy = policy;
        self
    }

    /// the `endpoint` label of the response time histogram
    pub fn endpoint(&self) -> &str {
        &self.recorder.endpoint
    }
}

#[async_trait]
impl<H: Handler> Handler for Instrumented<H> {
    async fn init(&mut self, info: &mut Info) {
        self.handler.init(info).await
    }

    async fn run(&self, mut conn: Conn) -> Conn {
        conn.mut_state_or_insert_with(InstrumentedRuns::default)
            .0
            .push(self.id);
        self.handler.run(conn).await
    }

    async fn before_send(&self, conn: Conn) -> Conn {
        let mut conn = self.handler.before_send(conn).await;

        let was_run = conn
            .state_mut::<InstrumentedRuns>()
            .is_some_and(|runs| runs.remove(self.id));
        if !was_run {
            return conn;
        }

        let status = conn.status().map(|status| status as u16);
        let start_time = conn.inner().start_time();
        let mut observation = Observation {
            method: conn.method().as_str(),
            code: status.unwrap_or(Status::NotFound as u16).to_string(),
            status,
            duration_s: 0.0,
            request_size: approximate_request_size(&conn),
            response_size: conn.response_len().unwrap_or_default(),
        };

        let recorder = Arc::clone(&self.recorder);
        conn.inner_mut().after_send(move |_| {
            observation.duration_s = (Instant::now() - start_time).as_secs_f64();
            recorder.record(&observation);
        });

        conn
    }

    fn has_upgrade(&self, upgrade: &Upgrade) -> bool {
        self.handler.has_upgrade(upgrade)
    }

    async fn upgrade(&self, upgrade: Upgrade) {
        self.handler.upgrade(upgrade).await
    }

    fn name(&self) -> Cow<'static, str> {
        self.handler.name()
    }
}
