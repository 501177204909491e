use super::context::{full_body, BoxBody};
use super::GatewayState;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Deserialize;
use tracing::info;

/// Control API request bodies. Anything that fails to deserialize or
/// validate is a 400 and leaves the block table untouched.
#[derive(Deserialize)]
struct BlockRequest {
    source_ip: String,
    decoy_urls: Vec<String>,
}

#[derive(Deserialize)]
struct CleanupRequest {
    source_ip: String,
}

/// The reserved control paths. Everything else on the listener is proxied
/// traffic — the protected app may well serve its own `/api/...` routes.
pub fn is_control_path(path: &str) -> bool {
    matches!(
        path,
        "/api/block_ip" | "/api/cleanup" | "/api/stats" | "/health" | "/metrics"
    )
}

pub async fn handle_control(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/api/block_ip" if method == Method::POST => handle_block(req, state).await,
        "/api/cleanup" if method == Method::POST => handle_cleanup(req, state).await,
        "/api/stats" if method == Method::GET => Ok(stats_response(&state)),
        "/health" if method == Method::GET => Ok(health_response(&state)),
        "/metrics" if method == Method::GET => Ok(metrics_response(&state)),
        "/api/block_ip" | "/api/cleanup" | "/api/stats" | "/health" | "/metrics" => Ok(
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        ),
        _ => Ok(error_response(StatusCode::NOT_FOUND, "not found")),
    }
}

async fn handle_block(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    let parsed: BlockRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid body: {}", e),
            ))
        }
    };

    if let Err(e) = state.table.install(&parsed.source_ip, &parsed.decoy_urls) {
        return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string()));
    }

    info!(
        action = "install_block",
        source_ip = %parsed.source_ip,
        decoys = parsed.decoy_urls.len(),
        "block entry installed"
    );

    let payload = serde_json::json!({
        "success": true,
        "source_ip": parsed.source_ip,
        "decoy_urls": parsed.decoy_urls,
    });
    Ok(json_response(StatusCode::OK, &payload))
}

async fn handle_cleanup(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    let parsed: CleanupRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid body: {}", e),
            ))
        }
    };

    let removed = state.table.clear(&parsed.source_ip);
    info!(
        action = "clear_block",
        source_ip = %parsed.source_ip,
        removed,
        "block entry cleared"
    );

    let payload = serde_json::json!({
        "success": true,
        "source_ip": parsed.source_ip,
        "removed": removed,
    });
    Ok(json_response(StatusCode::OK, &payload))
}

fn stats_response(state: &GatewayState) -> Response<BoxBody> {
    let (count, ips) = state.table.snapshot();
    let payload = serde_json::json!({
        "total_blocked_ips": count,
        "blocked_ips": ips,
    });
    json_response(StatusCode::OK, &payload)
}

fn health_response(state: &GatewayState) -> Response<BoxBody> {
    let (count, ips) = state.table.snapshot();
    let payload = serde_json::json!({
        "status": "healthy",
        "service": "manager",
        "stats": {
            "total_blocked_ips": count,
            "blocked_ips": ips,
        },
    });
    json_response(StatusCode::OK, &payload)
}

fn metrics_response(state: &GatewayState) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(full_body(state.metrics.render()))
        .unwrap()
}

fn json_response(status: StatusCode, payload: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(payload.to_string()))
        .unwrap()
}

fn error_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    let payload = serde_json::json!({ "error": msg });
    json_response(status, &payload)
}
