use prometheus::{Encoder, Registry, TextEncoder};
use trillium::{Conn, Status};
use trillium_testing::prelude::*;
use trillium_x::Metrics;

fn scrape(registry: &Registry) -> String {
    let mut body = vec![];
    TextEncoder::new()
        .encode(&registry.gather(), &mut body)
        .unwrap();
    String::from_utf8(body).unwrap()
}

#[test]
fn instrumented_handler_is_scraped() {
    let registry = Registry::new();
    let metrics = Metrics::build("scrape", "v1", "abc", "2024-01-01").unwrap();
    metrics.register(&registry).unwrap();

    let handler = metrics.instrument(
        |conn: Conn| async move { conn.with_status(Status::NotFound).with_body("0123456789").halt() },
        "lookup",
    );
    assert_eq!(handler.endpoint(), "lookup");

    let mut conn = get("/users/42").on(&handler);
    assert_status!(&conn, 404);
    assert_body!(&mut conn, "0123456789");
    drop(conn);

    let text = scrape(&registry);
    for line in [
        r#"scrape_requests_total{buildTime="2024-01-01",code="404",hash="abc",method="GET",version="v1"} 1"#,
        r#"scrape_statuses_total{buildTime="2024-01-01",hash="abc",method="GET",status_bucket="4xx",version="v1"} 1"#,
        r#"scrape_response_size_bytes_sum{buildTime="2024-01-01",code="404",hash="abc",method="GET",version="v1"} 10"#,
        r#"scrape_response_time_seconds_count{buildTime="2024-01-01",endpoint="lookup",hash="abc",version="v1"} 1"#,
        r#"scrape_duration_seconds_count{buildTime="2024-01-01",code="404",hash="abc",method="GET",version="v1"} 1"#,
        r#"scrape_request_size_bytes_count{buildTime="2024-01-01",code="404",hash="abc",method="GET",version="v1"} 1"#,
    ] {
        assert!(text.lines().any(|l| l == line), "missing {line} in\n{text}");
    }
}

#[test]
fn same_identity_twice_is_not_an_error() {
    let first = Metrics::try_new("scrape_twice", "v1", "abc", "2024-01-01").unwrap();
    let second = Metrics::try_new("scrape_twice", "v1", "abc", "2024-01-01").unwrap();

    get("/").on(&first.instrument("ok", "root"));
    get("/").on(&second.instrument("ok", "root"));

    let text = {
        let mut body = vec![];
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut body)
            .unwrap();
        String::from_utf8(body).unwrap()
    };

    assert!(text.lines().any(|l| l
        == r#"scrape_twice_requests_total{buildTime="2024-01-01",code="200",hash="abc",method="GET",version="v1"} 2"#));
}
