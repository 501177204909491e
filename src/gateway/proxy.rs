use super::context::{BoxBody, RequestContext};
use super::GatewayState;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::{info, warn};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
static X_DECOY_ROUTED: HeaderName = HeaderName::from_static("x-decoy-routed");

/// Handle one proxied request:
///
/// 1. extract the source address (forwarded-for → real-ip → TCP peer)
/// 2. look up the block table
/// 3. no entry → forward to the legitimate upstream
/// 4. entry → round-robin one decoy URL and forward there, marked
///
/// A decoy that cannot be reached is a 502 — never a fallback to the
/// legitimate upstream, or the attacker would learn which responses are real.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let source_ip = extract_source_ip(req.headers(), peer_addr);
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    let mut ctx = RequestContext::new(source_ip, uri_path, method);

    let entry = state.table.lookup(&ctx.source_ip);
    let (target_base, decoy_routed) = match entry {
        Some(ref entry) => {
            ctx.route = "decoy";
            (entry.select().clone(), true)
        }
        None => {
            ctx.route = "legitimate";
            (state.legitimate_url.clone(), false)
        }
    };

    let target_uri = match join_target(&target_base, req.uri()) {
        Some(uri) => uri,
        None => {
            warn!(
                action = "bad_target",
                source_ip = %ctx.source_ip,
                target = %target_base,
                "failed to build proxy target uri"
            );
            return Ok(ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"));
        }
    };
    ctx.target = target_uri.to_string();

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    inject_forwarded_headers(&mut headers, &ctx.source_ip, peer_addr);
    if decoy_routed {
        headers.insert(X_DECOY_ROUTED.clone(), HeaderValue::from_static("true"));
    }
    if let Some(authority) = target_uri.authority() {
        if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, v);
        }
    }

    let mut builder = Request::builder().method(parts.method).uri(&target_uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let outbound = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                action = "bad_request_build",
                source_ip = %ctx.source_ip,
                error = %e,
                "failed to build outbound request"
            );
            return Ok(ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"));
        }
    };

    let result = tokio::time::timeout(state.upstream_timeout, state.client.request(outbound)).await;

    let upstream_resp = match result {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(
                action = if decoy_routed { "decoy_error" } else { "upstream_error" },
                source_ip = %ctx.source_ip,
                target = %ctx.target,
                error = %e,
                "proxy target unreachable"
            );
            return Ok(ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway"));
        }
        Err(_) => {
            warn!(
                action = if decoy_routed { "decoy_error" } else { "upstream_error" },
                source_ip = %ctx.source_ip,
                target = %ctx.target,
                "proxy target timed out"
            );
            return Ok(ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout"));
        }
    };

    let resp = build_downstream_response(upstream_resp);
    let status = resp.status().as_u16();

    if decoy_routed {
        metrics::counter!("mirage_decoy_routed_total").increment(1);
    }
    ctx.finalize_metrics(status);

    info!(
        action = if decoy_routed { "route_to_decoy" } else { "route_to_legitimate" },
        source_ip = %ctx.source_ip,
        method = %ctx.method,
        path = %ctx.uri_path,
        target = %ctx.target,
        status,
        latency_ms = %ctx.start.elapsed().as_millis(),
        "proxied"
    );

    Ok(resp)
}

/// Source address precedence: first `X-Forwarded-For` element, then
/// `X-Real-IP`, then the TCP peer. The first two assume a trusted LB in
/// front; in-cluster the peer address is authoritative.
fn extract_source_ip(headers: &http::HeaderMap, peer_addr: SocketAddr) -> String {
    if let Some(v) = headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(v) = headers.get(&X_REAL_IP).and_then(|v| v.to_str().ok()) {
        let v = v.trim();
        if !v.is_empty() {
            return v.to_string();
        }
    }
    peer_addr.ip().to_string()
}

/// Splice the inbound path+query onto the target's scheme and authority.
fn join_target(base: &Uri, inbound: &Uri) -> Option<Uri> {
    let pq = inbound
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme(base.scheme_str().unwrap_or("http"))
        .authority(base.authority()?.as_str())
        .path_and_query(pq)
        .build()
        .ok()
}

/// `X-Forwarded-For`: append the determined source address to any existing
/// chain (comma-separated list per RFC 7239 semantics). `X-Real-IP` always
/// names the immediate peer.
fn inject_forwarded_headers(headers: &mut http::HeaderMap, source_ip: &str, peer_addr: SocketAddr) {
    if let Some(existing) = headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + source_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(source_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(X_FORWARDED_FOR.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(source_ip) {
        headers.insert(X_FORWARDED_FOR.clone(), v);
    }

    if let Ok(v) = HeaderValue::from_str(&peer_addr.ip().to_string()) {
        headers.insert(X_REAL_IP.clone(), v);
    }
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(body.boxed()).unwrap()
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:55555".parse().unwrap()
    }

    #[test]
    fn source_precedence_forwarded_for_first() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.9, 172.16.0.1".parse().unwrap());
        headers.insert("x-real-ip", "192.168.1.5".parse().unwrap());
        assert_eq!(extract_source_ip(&headers, peer()), "10.0.0.9");
    }

    #[test]
    fn source_precedence_real_ip_second() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-real-ip", "192.168.1.5".parse().unwrap());
        assert_eq!(extract_source_ip(&headers, peer()), "192.168.1.5");
    }

    #[test]
    fn source_precedence_peer_last() {
        let headers = http::HeaderMap::new();
        assert_eq!(extract_source_ip(&headers, peer()), "127.0.0.1");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.9, 172.16.0.1".parse().unwrap());
        inject_forwarded_headers(&mut headers, "10.0.0.9", peer());
        assert_eq!(headers["x-forwarded-for"], "10.0.0.9, 172.16.0.1, 10.0.0.9");
        assert_eq!(headers["x-real-ip"], "127.0.0.1");
    }

    #[test]
    fn forwarded_for_set_when_absent() {
        let mut headers = http::HeaderMap::new();
        inject_forwarded_headers(&mut headers, "127.0.0.1", peer());
        assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
    }

    #[test]
    fn join_target_preserves_path_and_query() {
        let base: Uri = "http://decoy-1:8080".parse().unwrap();
        let inbound: Uri = "/api/products?id=3".parse().unwrap();
        let joined = join_target(&base, &inbound).unwrap();
        assert_eq!(joined.to_string(), "http://decoy-1:8080/api/products?id=3");
    }

    #[test]
    fn join_target_defaults_empty_path() {
        let base: Uri = "http://decoy-1:8080".parse().unwrap();
        let inbound: Uri = "http://gw/".parse().unwrap();
        let joined = join_target(&base, &inbound).unwrap();
        assert_eq!(joined.path(), "/");
    }
}
