use clap::{Arg, ArgAction};
use opentelemetry::trace::TraceContextExt;
use prometheus::{Encoder, TextEncoder};
use trillium::{Conn, KnownHeaderName, Status};
use trillium_router::router;
use trillium_x::{config::Config, fatal::fatal, flags, propagation, trace, Metrics};

const DEFAULT_TRACING_CONFIG: &str = r#"{
    "service_name": "trillium-x/demos/server",
    "provider": "jaeger",
    "providers": { "jaeger": { "local_agent_address": "localhost:4318" } }
}"#;

async fn metrics_endpoint(conn: Conn) -> Conn {
    let encoder = TextEncoder::new();
    let mut body = vec![];
    match encoder.encode(&prometheus::gather(), &mut body) {
        Ok(()) => conn
            .with_response_header(KnownHeaderName::ContentType, encoder.format_type().to_string())
            .ok(body),
        Err(e) => conn
            .with_status(Status::InternalServerError)
            .with_body(e.to_string())
            .halt(),
    }
}

async fn trace_id(conn: Conn) -> Conn {
    let context = propagation::extract_context(&conn);
    let trace_id = context.span().span_context().trace_id();
    conn.ok(trace_id.to_string())
}

#[tokio::main]
pub async fn main() {
    env_logger::init();

    let matches = flags::new_flag_set("server")
        .arg(
            Arg::new("tracing-config")
                .long("tracing-config")
                .default_value(DEFAULT_TRACING_CONFIG),
        )
        .arg(
            Arg::new("no-tracing")
                .long("no-tracing")
                .action(ArgAction::SetTrue),
        )
        .try_get_matches_from(std::env::args().skip(1))
        .unwrap_or_else(|e| e.exit());

    if !flags::must_get_bool(&matches, "no-tracing") {
        let config = Config::from_json(&flags::must_get_string(&matches, "tracing-config"))
            .unwrap_or_else(|e| fatal(format!("invalid tracing config: {e}")));

        if let Err(e) = trace::setup(&config, "trillium-x/demos/server") {
            log::warn!("continuing without tracing: {e}");
        }
    }

    let metrics = Metrics::new("trillium_x_demo", env!("CARGO_PKG_VERSION"), "dev", "unknown");

    trillium_tokio::run_async(
        router()
            .get("/metrics", metrics_endpoint)
            .get("/trace-id", metrics.instrument(trace_id, "trace_id"))
            .get("/some/:path", metrics.instrument("ok", "some_path"))
            .get(
                "/error",
                metrics.instrument(Status::InternalServerError, "error"),
            ),
    )
    .await;
}
