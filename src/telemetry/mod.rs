//! C1 — the telemetry plane (spec §4.1).
//!
//! Owns the Prometheus registry, the embedded TSDB, the PromQL engine, and
//! the OTel meter/tracer providers. C2 and C3 only ever see this type
//! through its metric-factory and query methods; neither holds a reference
//! to the registry or providers directly, matching spec §9's "acyclic
//! service graph" redesign note.

pub mod otel;
pub mod promql;
pub mod tsdb;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use opentelemetry::{
    metrics::{Counter, Meter, ObservableGauge},
    trace::TracerProvider as _,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::SdkTracerProvider};
use prometheus::{core::Collector, Registry};
use tracing::{debug, info, warn};

use crate::{
    config::{MetricConfig, TelemetryConfig},
    errors::{QueryError, TelemetryError},
};

use self::tsdb::Tsdb;

/// Shared response-time map: metric name to last-observed duration in
/// milliseconds. Read-and-clear by the OTel gauge callback (spec's
/// "one-shot observation" glossary entry).
type ResponseTimes = Arc<Mutex<HashMap<String, f64>>>;

/// A registered attempts/successes counter, OTel + Prometheus sides bound
/// together with their shared constant label set.
pub struct CounterMetric {
    otel: Counter<u64>,
    otel_labels: Vec<KeyValue>,
    prom: prometheus::Counter,
}

impl CounterMetric {
    /// Increment both sides by one.
    pub fn inc(&self) {
        self.otel.add(1, &self.otel_labels);
        self.prom.inc();
    }
}

/// A registered response-time gauge. The OTel side is an observable gauge
/// whose callback was registered at construction time and lives for as long
/// as this handle (and the meter it came from) does; there is nothing to
/// push to it directly.
pub struct ResponseTimeMetric {
    metric_name: String,
    response_times: ResponseTimes,
    prom: prometheus::Gauge,
    _otel_gauge: ObservableGauge<f64>,
}

impl ResponseTimeMetric {
    /// Record `millis` as the latest observation: one-shot for the OTel
    /// callback, eager for the Prometheus gauge (spec §4.1).
    pub fn observe(&self, millis: f64) {
        self.response_times
            .lock()
            .expect("response-time map poisoned")
            .insert(self.metric_name.clone(), millis);
        self.prom.set(millis);
    }
}

/// The telemetry plane.
pub struct TelemetryPlane {
    registry: Registry,
    tsdb: Arc<Tsdb>,
    meter: Meter,
    tracer: opentelemetry_sdk::trace::Tracer,
    meter_provider: SdkMeterProvider,
    tracer_provider: SdkTracerProvider,
    response_times: ResponseTimes,
    engine_timeout: Duration,
    max_concurrent_queries: Arc<tokio::sync::Semaphore>,
    service_version: String,
}

impl TelemetryPlane {
    /// Construct the plane from an initial configuration. The TSDB is
    /// opened here and never replaced for the lifetime of the process (spec
    /// §3 Lifecycle: "created once at first successful telemetry
    /// configuration and reused").
    pub fn new(cfg: &TelemetryConfig, service_version: &str) -> Result<Self, TelemetryError> {
        let registry = Registry::new();
        #[cfg(target_os = "linux")]
        {
            if let Ok(pc) = prometheus::process_collector::ProcessCollector::for_self() {
                let _ = registry.register(Box::new(pc));
            }
        }
        let retention = humantime::parse_duration(&cfg.prometheus.tsdb_options.retention_duration)
            .map_err(|e| TelemetryError::TsdbOpen(e.to_string()))?;
        let tsdb = Arc::new(Tsdb::open(cfg.prometheus.tsdb_path.as_deref(), retention)?);
        let resource = otel::build_resource(service_version);
        let meter_provider =
            otel::build_meter_provider(&resource, &cfg.open_telemetry.exporters, &registry)?;
        let tracer_provider = otel::build_tracer_provider(&resource, &cfg.open_telemetry.exporters)?;
        let meter = meter_provider.meter("bunnysidecar");
        let tracer = tracer_provider.tracer("bunnysidecar");
        let engine_timeout = humantime::parse_duration(&cfg.prometheus.promql.engine_options.timeout)
            .unwrap_or(Duration::from_secs(120));
        Ok(Self {
            registry,
            tsdb,
            meter,
            tracer,
            meter_provider,
            tracer_provider,
            response_times: Arc::new(Mutex::new(HashMap::new())),
            engine_timeout,
            max_concurrent_queries: Arc::new(tokio::sync::Semaphore::new(
                cfg.prometheus.promql.max_concurrent_queries.max(1),
            )),
            service_version: service_version.to_string(),
        })
    }

    /// Reconfigure OTel providers and PromQL/engine options for a new
    /// config snapshot. The TSDB and registry survive unchanged.
    pub fn apply(&mut self, cfg: &TelemetryConfig) -> Result<(), TelemetryError> {
        info!("applying telemetry configuration");
        let resource = otel::build_resource(&self.service_version);
        self.meter_provider =
            otel::build_meter_provider(&resource, &cfg.open_telemetry.exporters, &self.registry)?;
        self.tracer_provider = otel::build_tracer_provider(&resource, &cfg.open_telemetry.exporters)?;
        self.meter = self.meter_provider.meter("bunnysidecar");
        self.tracer = self.tracer_provider.tracer("bunnysidecar");
        self.engine_timeout = humantime::parse_duration(&cfg.prometheus.promql.engine_options.timeout)
            .unwrap_or(self.engine_timeout);
        self.max_concurrent_queries = Arc::new(tokio::sync::Semaphore::new(
            cfg.prometheus.promql.max_concurrent_queries.max(1),
        ));
        Ok(())
    }

    /// The tracer used to open probe/health spans.
    pub fn tracer(&self) -> &opentelemetry_sdk::trace::Tracer {
        &self.tracer
    }

    /// The TSDB handle, for probe actions to append samples directly
    /// (in addition to the Prometheus/OTel metric handles).
    pub fn tsdb(&self) -> Arc<Tsdb> {
        Arc::clone(&self.tsdb)
    }

    /// Register a new attempts/successes counter, idempotently
    /// unregistering any existing Prometheus collector of the same name
    /// first (spec §4.1).
    pub fn new_counter_metric(&self, cfg: &MetricConfig) -> Option<CounterMetric> {
        if !cfg.enabled {
            return None;
        }
        let otel_labels: Vec<KeyValue> = cfg
            .extra_labels
            .iter()
            .map(|l| KeyValue::new(l.name.clone(), l.value.clone()))
            .collect();
        let otel = self.meter.u64_counter(format!("otel_{}", cfg.name)).build();
        let const_labels: HashMap<String, String> = cfg
            .extra_labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect();
        let opts = prometheus::Opts::new(format!("prom_{}", cfg.name), cfg.name.clone())
            .const_labels(const_labels);
        let prom = match prometheus::Counter::with_opts(opts) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, metric = %cfg.name, "could not build prometheus counter");
                return None;
            }
        };
        reregister(&self.registry, prom.clone());
        Some(CounterMetric { otel, otel_labels, prom })
    }

    /// Register a new response-time gauge with a one-shot OTel observable
    /// callback (spec §4.1).
    pub fn new_response_time_metric(&self, cfg: &MetricConfig) -> Option<ResponseTimeMetric> {
        if !cfg.enabled {
            return None;
        }
        let metric_name = cfg.name.clone();
        let response_times = Arc::clone(&self.response_times);
        let otel_labels: Vec<KeyValue> = cfg
            .extra_labels
            .iter()
            .map(|l| KeyValue::new(l.name.clone(), l.value.clone()))
            .collect();
        let callback_name = metric_name.clone();
        let otel_gauge = self
            .meter
            .f64_observable_gauge(format!("otel_{}", cfg.name))
            .with_unit("ms")
            .with_callback(move |observer| {
                let mut map = response_times.lock().expect("response-time map poisoned");
                if let Some(value) = map.remove(&callback_name) {
                    observer.observe(value, &otel_labels);
                }
            })
            .build();
        let const_labels: HashMap<String, String> = cfg
            .extra_labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect();
        let opts = prometheus::Opts::new(format!("prom_{}", cfg.name), cfg.name.clone())
            .const_labels(const_labels);
        let prom = match prometheus::Gauge::with_opts(opts) {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, metric = %cfg.name, "could not build prometheus gauge");
                return None;
            }
        };
        reregister(&self.registry, prom.clone());
        Some(ResponseTimeMetric {
            metric_name,
            response_times: Arc::clone(&self.response_times),
            prom,
            _otel_gauge: otel_gauge,
        })
    }

    /// Start a timer if `rt` is present, and increment `attempts` if
    /// present. Mirrors `PreMeasurable` (spec §4.1).
    pub fn pre_measurable(
        &self,
        attempts: Option<&CounterMetric>,
        rt: Option<&ResponseTimeMetric>,
    ) -> Option<Instant> {
        if let Some(c) = attempts {
            c.inc();
        }
        rt.map(|_| Instant::now())
    }

    /// Record the elapsed time since `start` into `rt`, and increment
    /// `successes` iff `ok`. Mirrors `PostMeasurable` (spec §4.1).
    pub fn post_measurable(
        &self,
        successes: Option<&CounterMetric>,
        rt: Option<&ResponseTimeMetric>,
        start: Option<Instant>,
        ok: bool,
    ) {
        if let (Some(rt), Some(start)) = (rt, start) {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            rt.observe(elapsed_ms);
        }
        if ok {
            if let Some(c) = successes {
                c.inc();
            }
        }
    }

    /// Evaluate an instant PromQL query with a concurrency-bounded,
    /// deadline-bearing context.
    pub async fn instant_query(
        &self,
        timeout: Duration,
        query: &str,
        at_ms: i64,
    ) -> Result<bool, QueryError> {
        let _permit = self.max_concurrent_queries.acquire().await;
        let query = query.to_string();
        let timeout = timeout.min(self.engine_timeout);
        let tsdb = self.tsdb();
        tokio::task::spawn_blocking(move || promql::instant_query(&tsdb, &query, at_ms, timeout))
            .await
            .map_err(|e| QueryError::Unsupported(e.to_string()))?
    }

    /// Evaluate a range PromQL query with a concurrency-bounded,
    /// deadline-bearing context.
    pub async fn range_query(
        &self,
        timeout: Duration,
        query: &str,
        start_ms: i64,
        end_ms: i64,
        step_ms: i64,
    ) -> Result<bool, QueryError> {
        let _permit = self.max_concurrent_queries.acquire().await;
        let query = query.to_string();
        let timeout = timeout.min(self.engine_timeout);
        let tsdb = self.tsdb();
        tokio::task::spawn_blocking(move || {
            promql::range_query(&tsdb, &query, start_ms, end_ms, step_ms, timeout)
        })
        .await
        .map_err(|e| QueryError::Unsupported(e.to_string()))?
    }

    /// The native Prometheus registry, for C3's scrape handler.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Flush and shut down both providers, then drop the TSDB handle so
    /// in-flight queries complete first (spec §4.1 Shutdown).
    pub fn shutdown(self) {
        debug!("shutting down telemetry plane");
        if let Err(e) = self.meter_provider.shutdown() {
            warn!(error = %e, "meter provider shutdown failed");
        }
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!(error = %e, "tracer provider shutdown failed");
        }
    }
}

/// Unregister any existing collector with the same descriptor, then
/// register `collector`. Mirrors `PromRegistry.Unregister`/`MustRegister` in
/// `examples/original_source/src/bunny/telemetry/metrics.go`.
fn reregister<T: Collector + Clone + 'static>(registry: &Registry, collector: T) {
    let _ = registry.unregister(Box::new(collector.clone()));
    if let Err(e) = registry.register(Box::new(collector)) {
        warn!(error = %e, "prometheus collector registration failed");
    }
}
