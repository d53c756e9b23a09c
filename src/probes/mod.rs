//! C2 — the probe engine (spec §4.2).
//!
//! One event loop multiplexing a config channel, a shutdown channel, and a
//! periodic ticker, the way `examples/original_source/src/bunny/egress/egress.go`'s
//! `GoEgress` multiplexes over `ConfigUpdateChannel`/`OSSignalsChannel`/`ticker.C`
//! with `select{}`. Each tick dispatches every enabled probe to its own
//! short-lived task so a slow probe (`timeout > period`) never stalls the loop.

pub mod action;
pub mod expect;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use opentelemetry::trace::{Span, SpanKind, Status, Tracer};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::{BunnyConfig, ProbeConfig},
    errors::ConfigError,
    telemetry::{CounterMetric, ResponseTimeMetric, TelemetryPlane},
};

use self::action::ProbeAction;

/// A single configured probe: its action plus up to three metric handles.
pub struct Probe {
    name: String,
    action: ProbeAction,
    timeout: Duration,
    attempts: Option<CounterMetric>,
    response_time: Option<ResponseTimeMetric>,
    successes: Option<CounterMetric>,
}

impl Probe {
    /// Build a probe from one `egress.probes[]` entry, registering its
    /// metric handles against `telemetry`. Rejects configs with zero or
    /// more than one action (spec §3 invariant i).
    fn from_config(cfg: &ProbeConfig, telemetry: &TelemetryPlane) -> Result<Self, ConfigError> {
        let actions = [
            cfg.http_get.is_some(),
            cfg.grpc.is_some(),
            cfg.tcp_socket.is_some(),
            cfg.exec.is_some(),
        ];
        if actions.iter().filter(|x| **x).count() != 1 {
            return Err(ConfigError::Validation(format!(
                "probe {:?} must specify exactly one action",
                cfg.name
            )));
        }
        let action = if let Some(http_get) = &cfg.http_get {
            ProbeAction::HttpGet(
                action::HttpGetAction::new(http_get).map_err(ConfigError::Validation)?,
            )
        } else if let Some(grpc) = &cfg.grpc {
            ProbeAction::Grpc(action::GrpcAction::new(grpc).map_err(ConfigError::Validation)?)
        } else if let Some(tcp_socket) = &cfg.tcp_socket {
            ProbeAction::TcpSocket(
                action::TcpSocketAction::new(tcp_socket).map_err(ConfigError::Validation)?,
            )
        } else {
            let exec = cfg.exec.as_ref().expect("exactly one action checked above");
            ProbeAction::Exec(action::ExecAction::new(exec).map_err(ConfigError::Validation)?)
        };
        Ok(Self {
            name: cfg.name.clone(),
            action,
            timeout: Duration::from_millis(0), // overridden by the engine at tick time
            attempts: cfg
                .metrics
                .attempts
                .as_ref()
                .and_then(|m| telemetry.new_counter_metric(m)),
            response_time: cfg
                .metrics
                .response_time
                .as_ref()
                .and_then(|m| telemetry.new_response_time_metric(m)),
            successes: cfg
                .metrics
                .successes
                .as_ref()
                .and_then(|m| telemetry.new_counter_metric(m)),
        })
    }

    /// Dispatch one invocation to its own task (spec §4.2 pseudocode).
    fn spawn(self: Arc<Self>, telemetry: Arc<RwLock<TelemetryPlane>>, timeout: Duration) {
        tokio::spawn(async move {
            let mut span = {
                let plane = telemetry.read().await;
                plane
                    .tracer()
                    .span_builder(format!("{}-probe", self.kind()))
                    .with_kind(SpanKind::Client)
                    .start(plane.tracer())
            };
            span.set_attribute(opentelemetry::KeyValue::new("bunny-probe-name", self.name.clone()));

            let start = {
                let plane = telemetry.read().await;
                plane.pre_measurable(self.attempts.as_ref(), self.response_time.as_ref())
            };

            let result = if let ProbeAction::Exec(exec) = &self.action {
                let trace_id = span.span_context().trace_id().to_string();
                tokio::time::timeout(timeout, exec.execute_with_trace_id(&trace_id))
                    .await
                    .unwrap_or(Err(crate::errors::ProbeError::Timeout))
            } else {
                self.action.execute(timeout).await
            };
            let ok = result.is_ok();

            {
                let plane = telemetry.read().await;
                plane.post_measurable(self.successes.as_ref(), self.response_time.as_ref(), start, ok);
            }

            match &result {
                Ok(detail) => {
                    span.set_status(Status::Ok);
                    debug!(probe = %self.name, detail, "probe succeeded");
                }
                Err(e) => {
                    span.set_status(Status::error(e.to_string()));
                    debug!(probe = %self.name, error = %e, "probe failed");
                }
            }
            span.end();
        });
    }

    fn kind(&self) -> &'static str {
        match self.action {
            ProbeAction::HttpGet(_) => "http",
            ProbeAction::Grpc(_) => "grpc",
            ProbeAction::TcpSocket(_) => "tcp-socket",
            ProbeAction::Exec(_) => "exec",
        }
    }
}

/// The probe engine's event loop state.
pub struct ProbeEngine {
    telemetry: Arc<RwLock<TelemetryPlane>>,
    config_rx: mpsc::Receiver<Arc<BunnyConfig>>,
    ready_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
    probes: Vec<Arc<Probe>>,
    timeout: Duration,
    period: Duration,
    initial_delay_time: Option<Instant>,
}

impl ProbeEngine {
    /// Construct the engine. Probes are populated on the first config
    /// update, not here; the loop starts idle.
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
            probes: Vec::new(),
            timeout: Duration::from_secs(5),
            period: Duration::ZERO,
            initial_delay_time: None,
        }
    }

    /// Run the event loop until a shutdown token arrives.
    pub async fn run(mut self) {
        info!("probe engine is go");
        let mut ticker = ticker_for(self.period);
        loop {
            tokio::select! {
                biased;
                Some(()) = self.shutdown_rx.recv() => {
                    info!("probe engine shutting down");
                    break;
                }
                Some(cfg) = self.config_rx.recv() => {
                    self.ready_rx.recv().await;
                    self.apply_config(&cfg).await;
                    ticker = ticker_for(self.period);
                }
                _ = tick(&mut ticker) => {
                    let past_initial_delay = match self.initial_delay_time {
                        Some(t) => Instant::now() >= t,
                        None => true,
                    };
                    if past_initial_delay {
                        self.perform_probes().await;
                    }
                }
            }
        }
    }

    async fn apply_config(&mut self, cfg: &BunnyConfig) {
        info!("probe engine applying new configuration");
        self.timeout = Duration::from_millis(cfg.egress.timeout_milliseconds);
        self.period = Duration::from_millis(cfg.egress.period_milliseconds);
        self.initial_delay_time =
            Some(Instant::now() + Duration::from_millis(cfg.egress.initial_delay_milliseconds));
        let plane = self.telemetry.read().await;
        let mut probes = Vec::with_capacity(cfg.egress.probes.len());
        for probe_cfg in &cfg.egress.probes {
            match Probe::from_config(probe_cfg, &plane) {
                Ok(probe) => probes.push(Arc::new(probe)),
                Err(e) => warn!(probe = %probe_cfg.name, error = %e, "dropping invalid probe"),
            }
        }
        self.probes = probes;
    }

    async fn perform_probes(&self) {
        for probe in &self.probes {
            Arc::clone(probe).spawn(Arc::clone(&self.telemetry), self.timeout);
        }
    }
}

fn ticker_for(period: Duration) -> Option<tokio::time::Interval> {
    if period.is_zero() {
        None
    } else {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Some(interval)
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}
