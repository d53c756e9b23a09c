//! C3 — the ingress server (spec §4.3).
//!
//! On each accepted config, gracefully drains the previous HTTP server (if
//! any) and rebuilds the router from scratch: one shared health handler
//! mounted at every configured path, plus the OTel and native Prometheus
//! scrape endpoints. Socket tuning, the `TraceLayer`/`CatchPanicLayer`/
//! `SetResponseHeaderLayer` stack, and the `http_builder()`/`TimeoutLayer`
//! wiring for the configured header-read/read/write/idle timeouts and
//! `maxHeaderBytes` are reduced from
//! `examples/unikmhz-uxum/src/builder/{server,app}.rs`.

pub mod health;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    error_handling::HandleErrorLayer,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use socket2::SockRef;
use tokio::{
    net::TcpSocket,
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tower::{timeout::TimeoutLayer, BoxError, ServiceBuilder};
use tower_http::{
    catch_panic::CatchPanicLayer,
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    config::BunnyConfig,
    logging::span::{register_request, CustomMakeSpan},
    telemetry::TelemetryPlane,
};

use self::health::HealthRule;

const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct IngressState {
    telemetry: Arc<RwLock<TelemetryPlane>>,
    rules: Arc<Vec<HealthRule>>,
}

/// C3's event loop state.
pub struct IngressServer {
    telemetry: Arc<RwLock<TelemetryPlane>>,
    config_rx: mpsc::Receiver<Arc<BunnyConfig>>,
    ready_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
    handle: Option<axum_server::Handle>,
    server_task: Option<JoinHandle<()>>,
}

impl IngressServer {
    /// Construct the server. No socket is bound until the first config is
    /// accepted.
    pub fn new(
        telemetry: Arc<RwLock<TelemetryPlane>>,
        config_rx: mpsc::Receiver<Arc<BunnyConfig>>,
        ready_rx: mpsc::Receiver<()>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            telemetry,
            config_rx,
            ready_rx,
            shutdown_rx,
            handle: None,
            server_task: None,
        }
    }

    /// Run until a shutdown token arrives, draining the listening socket
    /// first.
    pub async fn run(mut self) {
        info!("ingress server is go");
        loop {
            tokio::select! {
                biased;
                Some(()) = self.shutdown_rx.recv() => {
                    info!("ingress server shutting down");
                    self.drain().await;
                    return;
                }
                Some(cfg) = self.config_rx.recv() => {
                    self.ready_rx.recv().await;
                    self.apply_config(&cfg).await;
                }
            }
        }
    }

    async fn drain(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_GRACE));
        }
        if let Some(task) = self.server_task.take() {
            let _ = task.await;
        }
    }

    async fn apply_config(&mut self, cfg: &BunnyConfig) {
        info!("ingress server applying new configuration");
        self.drain().await;

        let http_cfg = &cfg.ingress.http_server;
        let mut rules = Vec::with_capacity(http_cfg.health.len());
        {
            let plane = self.telemetry.read().await;
            for rule_cfg in &http_cfg.health {
                match HealthRule::from_config(rule_cfg, &plane) {
                    Ok(rule) => rules.push(rule),
                    Err(e) => warn!(path = %rule_cfg.path, error = %e, "dropping invalid health rule"),
                }
            }
        }

        let state = Arc::new(IngressState {
            telemetry: Arc::clone(&self.telemetry),
            rules: Arc::new(rules),
        });

        let mut router = Router::new()
            .route(&http_cfg.open_telemetry_metrics_path, get(otel_metrics_handler))
            .route(&http_cfg.prometheus_metrics_path, get(prometheus_metrics_handler));
        for rule in state.rules.iter() {
            router = router.route(&rule.path, get(health_handler));
        }
        let router = router
            .with_state(state)
            .layer(middleware::from_fn(otel_context_middleware))
            .layer(TraceLayer::new_for_http().make_span_with(CustomMakeSpan::new()))
            .layer(CatchPanicLayer::new())
            .layer(SetResponseHeaderLayer::overriding(
                axum::http::header::SERVER,
                axum::http::HeaderValue::from_static(concat!("bunnysidecar/", env!("CARGO_PKG_VERSION"))),
            ));

        let addr: SocketAddr = match format!("0.0.0.0:{}", http_cfg.port).parse() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "invalid ingress listen address");
                return;
            }
        };
        let listener = match bind(addr) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "could not bind ingress listener");
                return;
            }
        };

        // Overall per-request budget: the read/write/idle timeouts from
        // config have no single hyper1 knob, so they're collapsed into one
        // `TimeoutLayer` bounding request handling end to end (the largest
        // of the three, since any of them firing should fail the request).
        // `header_read_timeout` and `max_buf_size` map onto their direct
        // `http1` builder equivalents below.
        let request_timeout = Duration::from_millis(
            http_cfg
                .read_timeout_milliseconds
                .max(http_cfg.write_timeout_milliseconds)
                .max(http_cfg.idle_timeout_milliseconds),
        );
        let router = router.layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_request_timeout))
                .layer(TimeoutLayer::new(request_timeout)),
        );

        let handle = axum_server::Handle::new();
        self.handle = Some(handle.clone());

        let mut server = axum_server::from_tcp(listener);
        {
            let http1 = server.http_builder().http1();
            http1.header_read_timeout(Duration::from_millis(http_cfg.read_header_timeout_milliseconds));
            http1.max_buf_size(http_cfg.max_header_bytes);
        }

        self.server_task = Some(tokio::spawn(async move {
            if let Err(e) = server
                .handle(handle)
                .serve(router.into_make_service())
                .await
            {
                warn!(error = %e, "ingress server task exited with an error");
            }
        }));
    }
}

/// Converts a timed-out request into a response; any other error bubbling up
/// through the layer stack is a bug, not something a client can retry its way
/// out of.
async fn handle_request_timeout(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request timed out\n".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled error: {err}\n"))
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let sref = SockRef::from(&socket);
    sref.set_reuse_address(true)?;
    socket.bind(addr)?;
    socket.set_nodelay(true)?;
    let listener = socket.listen(1024)?;
    listener.into_std()
}

async fn health_handler(
    State(state): State<Arc<IngressState>>,
    uri: axum::http::Uri,
) -> impl IntoResponse {
    let Some(rule) = state.rules.iter().find(|r| r.path == uri.path()) else {
        return (StatusCode::NOT_FOUND, "not found\n").into_response();
    };
    let plane = state.telemetry.read().await;
    if rule.evaluate(&plane).await {
        (StatusCode::OK, "healthy\n").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy\n").into_response()
    }
}

async fn prometheus_metrics_handler(State(state): State<Arc<IngressState>>) -> impl IntoResponse {
    use prometheus::Encoder;
    let plane = state.telemetry.read().await;
    let metric_families = plane.registry().gather();
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode prometheus metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

/// OTel-provided metrics. This crate wires the OTel Prometheus-compatibility
/// reader into the same native [`prometheus::Registry`] C1 owns (a
/// simplification noted in DESIGN.md), so this handler and
/// [`prometheus_metrics_handler`] currently expose the same text.
async fn otel_metrics_handler(state: State<Arc<IngressState>>) -> impl IntoResponse {
    prometheus_metrics_handler(state).await
}

/// Attach the OTel trace context propagated via request headers to the
/// current `tower-http`-created span.
async fn otel_context_middleware(req: Request<Body>, next: Next) -> Response {
    let req = register_request(req);
    next.run(req).await
}
