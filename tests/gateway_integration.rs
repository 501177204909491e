//! End-to-end gateway tests over real sockets: stub decoys and a stub
//! upstream on ephemeral ports, the gateway in front, reqwest as the client.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use mirage::config::GatewayConfig;
use mirage::gateway::{self, GatewayState};
use mirage::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Captured {
    path: String,
    forwarded_for: Option<String>,
    decoy_routed: Option<String>,
}

type Capture = Arc<Mutex<Vec<Captured>>>;

/// Minimal upstream stub: always 200 with a fixed body, recording what it saw.
async fn spawn_stub(body: &'static str) -> (SocketAddr, Capture) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured: Capture = Arc::new(Mutex::new(Vec::new()));
    let captured_srv = captured.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let captured = captured_srv.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let captured = captured.clone();
                    async move {
                        captured.lock().unwrap().push(Captured {
                            path: req.uri().path().to_string(),
                            forwarded_for: header(&req, "x-forwarded-for"),
                            decoy_routed: header(&req, "x-decoy-routed"),
                        });
                        Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                            Bytes::from_static(body.as_bytes()),
                        )))
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    (addr, captured)
}

fn header(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn spawn_gateway(upstream: SocketAddr) -> SocketAddr {
    let cfg = GatewayConfig {
        port: 0,
        legitimate_service_url: format!("http://{}", upstream),
        upstream_timeout: "2s".to_string(),
    };
    let state = GatewayState::new(&cfg, Metrics::install()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(async move {
        gateway::serve(listener, state, shutdown).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn round_robin_then_cleanup_restores_upstream() {
    let (upstream, upstream_seen) = spawn_stub("legit").await;
    let (d1, d1_seen) = spawn_stub("d1").await;
    let (d2, _) = spawn_stub("d2").await;
    let (d3, _) = spawn_stub("d3").await;
    let gw = spawn_gateway(upstream).await;
    let client = reqwest::Client::new();

    // install the block entry
    let resp = client
        .post(format!("http://{}/api/block_ip", gw))
        .json(&serde_json::json!({
            "source_ip": "10.0.0.9",
            "decoy_urls": [
                format!("http://{}", d1),
                format!("http://{}", d2),
                format!("http://{}", d3),
            ],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["source_ip"], "10.0.0.9");

    // 7 requests from the blocked address rotate d1,d2,d3,d1,d2,d3,d1
    let mut sequence = Vec::new();
    for _ in 0..7 {
        let resp = client
            .get(format!("http://{}/api/products", gw))
            .header("x-forwarded-for", "10.0.0.9")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        sequence.push(resp.text().await.unwrap());
    }
    assert_eq!(sequence, vec!["d1", "d2", "d3", "d1", "d2", "d3", "d1"]);

    // decoy-routed requests carry the marker and the forwarded-for chain
    // with the gateway's determined source appended
    {
        let seen = d1_seen.lock().unwrap();
        assert!(!seen.is_empty());
        for req in seen.iter() {
            assert_eq!(req.path, "/api/products");
            assert_eq!(req.decoy_routed.as_deref(), Some("true"));
            assert_eq!(req.forwarded_for.as_deref(), Some("10.0.0.9, 10.0.0.9"));
        }
    }

    // a different address flows to the legitimate upstream
    let resp = client
        .get(format!("http://{}/api/products", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "legit");
    {
        let seen = upstream_seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].decoy_routed, None);
    }

    // cleanup: the blocked address reaches the upstream again
    let resp = client
        .post(format!("http://{}/api/cleanup", gw))
        .json(&serde_json::json!({"source_ip": "10.0.0.9"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], true);

    let resp = client
        .get(format!("http://{}/whatever", gw))
        .header("x-forwarded-for", "10.0.0.9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "legit");

    // clearing twice is a no-op
    let resp = client
        .post(format!("http://{}/api/cleanup", gw))
        .json(&serde_json::json!({"source_ip": "10.0.0.9"}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], false);
}

#[tokio::test]
async fn reinstall_resets_rotation() {
    let (upstream, _) = spawn_stub("legit").await;
    let (d1, _) = spawn_stub("d1").await;
    let (d2, _) = spawn_stub("d2").await;
    let gw = spawn_gateway(upstream).await;
    let client = reqwest::Client::new();

    let install = |urls: Vec<String>| {
        let client = client.clone();
        async move {
            client
                .post(format!("http://{}/api/block_ip", gw))
                .json(&serde_json::json!({"source_ip": "10.1.1.1", "decoy_urls": urls}))
                .send()
                .await
                .unwrap()
        }
    };

    install(vec![format!("http://{}", d1), format!("http://{}", d2)]).await;
    for expected in ["d1", "d2", "d1"] {
        let resp = client
            .get(format!("http://{}/x", gw))
            .header("x-forwarded-for", "10.1.1.1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), expected);
    }

    // overwrite: selection space is exactly the new list, counter back to 0
    install(vec![format!("http://{}", d2), format!("http://{}", d1)]).await;
    for expected in ["d2", "d1", "d2"] {
        let resp = client
            .get(format!("http://{}/x", gw))
            .header("x-forwarded-for", "10.1.1.1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn decoy_unreachable_is_502_never_upstream() {
    let (upstream, upstream_seen) = spawn_stub("legit").await;
    let gw = spawn_gateway(upstream).await;
    let client = reqwest::Client::new();

    // reserve a port, then close it so the decoy address refuses connections
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    client
        .post(format!("http://{}/api/block_ip", gw))
        .json(&serde_json::json!({
            "source_ip": "10.2.2.2",
            "decoy_urls": [format!("http://{}", dead)],
        }))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("http://{}/anything", gw))
        .header("x-forwarded-for", "10.2.2.2")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    assert!(upstream_seen.lock().unwrap().is_empty(), "no fallback to upstream");
}

#[tokio::test]
async fn control_api_validation_and_shapes() {
    let (upstream, _) = spawn_stub("legit").await;
    let gw = spawn_gateway(upstream).await;
    let client = reqwest::Client::new();

    // empty decoy list
    let resp = client
        .post(format!("http://{}/api/block_ip", gw))
        .json(&serde_json::json!({"source_ip": "10.3.3.3", "decoy_urls": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // malformed url
    let resp = client
        .post(format!("http://{}/api/block_ip", gw))
        .json(&serde_json::json!({"source_ip": "10.3.3.3", "decoy_urls": ["not a url"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // no state change happened
    let resp = client
        .get(format!("http://{}/api/stats", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["total_blocked_ips"], 0);
    assert_eq!(stats["blocked_ips"], serde_json::json!([]));

    // method mismatch on a control path
    let resp = client
        .get(format!("http://{}/api/block_ip", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    // health shape
    let resp = client
        .get(format!("http://{}/health", gw))
        .send()
        .await
        .unwrap();
    let health: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "manager");
    assert_eq!(health["stats"]["total_blocked_ips"], 0);
}
