use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context carried through the proxy path.
///
/// `route` is the routing decision label used in logs and metrics:
/// "legitimate", "decoy", or "" before the block-table lookup.
pub struct RequestContext {
    pub source_ip: String,
    pub uri_path: String,
    pub method: String,
    pub route: &'static str,
    pub target: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(source_ip: String, uri_path: String, method: String) -> Self {
        Self {
            source_ip,
            uri_path,
            method,
            route: "",
            target: String::new(),
            start: Instant::now(),
        }
    }

    /// Build a JSON error response and record metrics in one place — the
    /// single exit point for all proxy error paths.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "mirage_http_requests_total",
            "route" => self.route,
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "mirage_http_request_duration_seconds",
            "route" => self.route,
        )
        .record(self.start.elapsed().as_secs_f64());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final metrics for a completed response.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "mirage_http_requests_total",
            "route" => self.route,
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "mirage_http_request_duration_seconds",
            "route" => self.route,
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
