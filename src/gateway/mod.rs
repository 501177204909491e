mod context;
mod control;
mod proxy;
pub mod table;

pub use table::BlockTable;

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use anyhow::Result;
use context::BoxBody;
use http::Uri;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Shared gateway state, cheaply cloneable into every connection task.
///
/// The block table is the only mutable piece; everything else is fixed at
/// startup. All proxied targets are cluster-internal plain HTTP.
#[derive(Clone)]
pub struct GatewayState {
    pub table: Arc<BlockTable>,
    pub legitimate_url: Uri,
    pub upstream_timeout: Duration,
    pub client: Client<HttpConnector, BoxBody>,
    pub metrics: Metrics,
}

impl GatewayState {
    pub fn new(cfg: &GatewayConfig, metrics: Metrics) -> Result<Self> {
        let legitimate_url: Uri = cfg.legitimate_service_url.parse()?;
        let upstream_timeout = cfg.upstream_timeout()?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(upstream_timeout));
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build(connector);

        Ok(Self {
            table: Arc::new(BlockTable::new()),
            legitimate_url,
            upstream_timeout,
            client,
            metrics,
        })
    }
}

/// Bind and serve. Split so tests can bind an ephemeral port themselves.
pub async fn run(cfg: &GatewayConfig, metrics: Metrics, shutdown: Arc<Notify>) -> Result<()> {
    let state = GatewayState::new(cfg, metrics)?;
    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = TcpListener::bind(addr).await?;
    info!(action = "gateway_listening", %addr, upstream = %state.legitimate_url, "gateway up");
    serve(listener, state, shutdown).await
}

/// Accept loop with graceful drain.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight requests to complete
/// before returning.
pub async fn serve(listener: TcpListener, state: GatewayState, shutdown: Arc<Notify>) -> Result<()> {
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!(action = "gateway_draining", "stop accepting new connections");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!(action = "accept_error", error = %e, "accept failed");
                continue;
            }
        };

        metrics::gauge!("mirage_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move {
                    if control::is_control_path(req.uri().path()) {
                        control::handle_control(req, state).await
                    } else {
                        proxy::handle_request(req, state, peer_addr).await
                    }
                }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(action = "connection_error", peer = %peer_addr, error = %e, "connection failed");
                }
            }

            metrics::gauge!("mirage_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections to finish (or time out).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(action = "gateway_draining", active, "waiting for connections to drain");
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            let remaining = active_conns.load(Ordering::Relaxed);
            info!(action = "gateway_drain_timeout", remaining, "drain timed out");
        }
    }

    Ok(())
}
