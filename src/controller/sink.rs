use super::crd::{response_name, AttackResponse, AttackResponseSpec};
use super::events::{EventBus, EventKind};
use crate::config::ControllerConfig;
use crate::detector::AttackRecord;
use crate::metrics::Metrics;
use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use kube::api::PostParams;
use kube::{Api, Client};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info, warn};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Everything the sink handlers need, cloneable per connection.
#[derive(Clone)]
pub struct SinkState {
    pub client: Client,
    pub cfg: Arc<ControllerConfig>,
    pub bus: EventBus,
    pub metrics: Metrics,
}

/// Serve the alert sink: detector POSTs on `/api/alerts`, observer clients
/// on `/ws`, probes on `/health` and `/metrics`.
pub async fn run(state: SinkState, shutdown: Arc<Notify>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], state.cfg.sink_port).into();
    let listener = TcpListener::bind(addr).await?;
    info!(action = "sink_listening", %addr, "alert sink up");
    serve(listener, state, shutdown).await
}

pub async fn serve(listener: TcpListener, state: SinkState, shutdown: Arc<Notify>) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!(action = "sink_stopping", "alert sink shutting down");
                return Ok(());
            }
        };

        let (stream, _) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!(action = "accept_error", error = %e, "sink accept failed");
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { handle(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(action = "connection_error", error = %e, "sink connection failed");
                }
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    state: SinkState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/api/alerts" if method == Method::POST => handle_alert(req, state).await,
        "/ws" if method == Method::GET => Ok(handle_ws_upgrade(req, state)),
        "/health" if method == Method::GET => Ok(json_response(
            StatusCode::OK,
            &json!({"status": "healthy", "service": "controller"}),
        )),
        "/metrics" if method == Method::GET => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap()),
        "/api/alerts" | "/ws" | "/health" | "/metrics" => Ok(json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({"error": "method not allowed"}),
        )),
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            &json!({"error": "not found"}),
        )),
    }
}

/// Accept an AttackRecord and persist the intent as an AttackResponse.
/// The reconciler does everything else.
async fn handle_alert(
    req: Request<Incoming>,
    state: SinkState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    let record: AttackRecord = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                &json!({"success": false, "message": format!("invalid alert body: {}", e)}),
            ))
        }
    };
    if record.source_ip.trim().is_empty() {
        return Ok(json_response(
            StatusCode::BAD_REQUEST,
            &json!({"success": false, "message": "source_ip must not be empty"}),
        ));
    }

    metrics::counter!("mirage_alerts_received_total").increment(1);
    state.bus.emit(
        EventKind::ReceivedAlert,
        json!({
            "source_ip": record.source_ip,
            "attack_type": record.attack_type,
            "severity": record.severity,
            "pod_name": record.pod_name,
        }),
    );

    let name = response_name(&record.source_ip, Utc::now());
    let response = AttackResponse::new(
        &name,
        AttackResponseSpec {
            services: state.cfg.protected_services.clone(),
            decoy_count: 3,
            auto_cleanup_minutes: state.cfg.ttl_minutes,
            source_ip: record.source_ip.clone(),
            attack_type: record.attack_type.clone(),
            severity: record.severity.clone(),
        },
    );

    let api: Api<AttackResponse> = Api::namespaced(state.client.clone(), &state.cfg.namespace);
    match api.create(&PostParams::default(), &response).await {
        Ok(_) => {
            info!(
                action = "alert_accepted",
                source_ip = %record.source_ip,
                attack_type = %record.attack_type,
                response = %name,
                reporting_pod = %record.pod_name,
                "attack response created"
            );
            Ok(json_response(
                StatusCode::ACCEPTED,
                &json!({
                    "success": true,
                    "message": "attack response created",
                    "appgraph": name,
                }),
            ))
        }
        Err(e) => {
            warn!(
                action = "alert_create_failed",
                source_ip = %record.source_ip,
                error = %e,
                "could not create attack response"
            );
            Ok(json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({"success": false, "message": format!("create failed: {}", e)}),
            ))
        }
    }
}

/// WebSocket upgrade for observer clients: complete the handshake, then
/// stream every bus event as a JSON text frame. A lagging client silently
/// skips dropped events; a closed socket ends the task.
fn handle_ws_upgrade(mut req: Request<Incoming>, state: SinkState) -> Response<BoxBody> {
    let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(k) => k.clone(),
        None => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": "missing sec-websocket-key"}),
            )
        }
    };
    let accept = derive_accept_key(key.as_bytes());

    let bus = state.bus.clone();
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(u) => u,
            Err(e) => {
                warn!(action = "ws_upgrade_failed", error = %e, "observer upgrade failed");
                return;
            }
        };
        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let (mut tx, mut rx) = ws.split();
        let mut events = bus.subscribe();

        info!(action = "observer_connected", "observer stream attached");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            let payload = match serde_json::to_string(&event) {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            if tx.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        // lagged: overflow dropped the oldest events, keep going
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = rx.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        // pings are answered by the protocol layer on write
                        Some(Ok(_)) => continue,
                    }
                }
            }
        }
        info!(action = "observer_disconnected", "observer stream closed");
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(full_body(Bytes::new()))
        .unwrap()
}

fn json_response(status: StatusCode, payload: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(payload.to_string()))
        .unwrap()
}
