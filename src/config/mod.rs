//! Configuration data model (spec §3, §6.1).
//!
//! Mirrors the YAML document's shape directly: four independent top-level
//! sections (`egress`, `ingress`, `signals`, `telemetry`), each deserialized
//! with `deny_unknown_fields` so a typo in the document is a validation
//! failure rather than a silently-ignored key, the way
//! `examples/unikmhz-uxum/src/config.rs` treats its own `AppConfig` tree.
//!
//! This module only describes shape and defaults. Cross-field validation
//! (exactly-one-action, exactly-one-query, duration parsing) is performed by
//! [`crate::config_controller`] and by the constructors of the validated
//! runtime types in [`crate::probes`] and [`crate::ingress`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration snapshot (spec §3 "Configuration snapshot").
///
/// Treated as immutable once broadcast; a new snapshot replaces the prior
/// one wholesale, never patched in place.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BunnyConfig {
    /// Outbound probe configuration.
    pub egress: EgressConfig,
    /// Inbound HTTP server configuration.
    pub ingress: IngressConfig,
    /// Peer-process watch configuration for shutdown gating.
    pub signals: SignalsConfig,
    /// Embedded TSDB / OTel provider configuration.
    pub telemetry: TelemetryConfig,
}

/// `egress` section: probe scheduling and probe definitions.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct EgressConfig {
    /// Configured probes. Each must specify exactly one action.
    pub probes: Vec<ProbeConfig>,
    /// Delay after config-accept before the first tick is allowed to fire.
    pub initial_delay_milliseconds: u64,
    /// Ticker period. Zero disables periodic ticking.
    pub period_milliseconds: u64,
    /// Deadline applied to every probe action.
    pub timeout_milliseconds: u64,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            probes: Vec::new(),
            initial_delay_milliseconds: 0,
            period_milliseconds: 10_000,
            timeout_milliseconds: 5_000,
        }
    }
}

/// One entry of `egress.probes[]`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ProbeConfig {
    /// Unique probe name, used as the default metric name stem.
    pub name: String,
    /// Metric enablement for this probe.
    pub metrics: ProbeMetricsConfig,
    /// `exec` action, if this probe is an exec probe.
    pub exec: Option<ExecActionConfig>,
    /// `grpc` action, if this probe is a gRPC health-check probe.
    pub grpc: Option<GrpcActionConfig>,
    /// `httpGet` action, if this probe is an HTTP GET probe.
    #[serde(rename = "httpGet")]
    pub http_get: Option<HttpGetActionConfig>,
    /// `tcpSocket` action, if this probe is a TCP expect-script probe.
    #[serde(rename = "tcpSocket")]
    pub tcp_socket: Option<TcpSocketActionConfig>,
}

/// Metric enablement block shared by probes and health rules.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ProbeMetricsConfig {
    /// Attempts counter.
    pub attempts: Option<MetricConfig>,
    /// Response-time gauge.
    #[serde(rename = "responseTime")]
    pub response_time: Option<MetricConfig>,
    /// Successes counter. Absent for health rules, which have no notion of success/failure counts.
    pub successes: Option<MetricConfig>,
}

/// One metric's enablement, name, and constant label set.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct MetricConfig {
    /// Whether this metric is registered at all.
    pub enabled: bool,
    /// Metric name, prefixed with `otel_`/`prom_` by the telemetry plane.
    pub name: String,
    /// Additional constant labels attached to every observation.
    #[serde(rename = "extraLabels")]
    pub extra_labels: Vec<LabelConfig>,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: String::new(),
            extra_labels: Vec::new(),
        }
    }
}

/// A single constant label name/value pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LabelConfig {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

/// `httpGet` probe action configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct HttpGetActionConfig {
    /// Target host. Defaults to `localhost` (probes run against the sidecar's peer).
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Request path, normalized with a leading slash at validation time.
    pub path: String,
    /// Extra headers applied verbatim.
    pub headers: HashMap<String, String>,
}

impl Default for HttpGetActionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 80,
            path: "/".into(),
            headers: HashMap::new(),
        }
    }
}

/// `grpc` probe action configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct GrpcActionConfig {
    /// Target port on `localhost`.
    pub port: u16,
    /// Specific gRPC health-check service name; unset checks the overall server.
    pub service: Option<String>,
}

/// `tcpSocket` probe action configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TcpSocketActionConfig {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Ordered send/receive steps.
    pub expect: Vec<ExpectStepConfig>,
}

/// One step of a TCP expect script.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ExpectStepConfig {
    /// `send` step, if this is one.
    pub send: Option<SendStepConfig>,
    /// `receive` step, if this is one.
    pub receive: Option<ReceiveStepConfig>,
}

/// A `send` expect step.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SendStepConfig {
    /// Text to write, followed by `delimiter`.
    pub text: String,
    /// Single-byte delimiter appended after `text`.
    pub delimiter: String,
}

/// A `receive` expect step.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ReceiveStepConfig {
    /// Regex the received (delimiter-stripped) text must match.
    pub regex: String,
    /// Single-byte delimiter the reader stops at.
    pub delimiter: String,
}

/// `exec` probe action configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ExecActionConfig {
    /// `argv`, `command[0]` is the executable.
    pub command: Vec<String>,
    /// Extra environment variables, appended to `OTEL_CLI_FORCE_TRACE_ID`.
    pub env: Vec<EnvVarConfig>,
}

/// A single environment variable entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct EnvVarConfig {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// `ingress` section: HTTP server and health rule definitions.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct IngressConfig {
    /// Inbound HTTP server configuration.
    #[serde(rename = "httpServer")]
    pub http_server: HttpServerConfig,
}

/// `ingress.httpServer` section.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct HttpServerConfig {
    /// Listen port.
    pub port: u16,
    /// Read timeout, milliseconds.
    pub read_timeout_milliseconds: u64,
    /// Read-header timeout, milliseconds.
    pub read_header_timeout_milliseconds: u64,
    /// Write timeout, milliseconds.
    pub write_timeout_milliseconds: u64,
    /// Idle-connection timeout, milliseconds.
    pub idle_timeout_milliseconds: u64,
    /// Maximum size of request headers, bytes.
    pub max_header_bytes: usize,
    /// Path serving OTel-collected metrics in Prometheus exposition format.
    pub open_telemetry_metrics_path: String,
    /// Path serving the native Prometheus registry.
    pub prometheus_metrics_path: String,
    /// Declarative health rules.
    pub health: Vec<HealthRuleConfig>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout_milliseconds: 5_000,
            read_header_timeout_milliseconds: 2_000,
            write_timeout_milliseconds: 5_000,
            idle_timeout_milliseconds: 60_000,
            max_header_bytes: 1 << 20,
            open_telemetry_metrics_path: "/metrics/otel".into(),
            prometheus_metrics_path: "/metrics".into(),
            health: Vec::new(),
        }
    }
}

/// One entry of `ingress.httpServer.health[]`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct HealthRuleConfig {
    /// Request path. Normalized with a leading slash at validation time.
    pub path: String,
    /// Instant-query variant, if this rule uses one.
    #[serde(rename = "instantQuery")]
    pub instant_query: Option<InstantQueryConfig>,
    /// Range-query variant, if this rule uses one.
    #[serde(rename = "rangeQuery")]
    pub range_query: Option<RangeQueryConfig>,
    /// Per-rule metric enablement.
    pub metrics: ProbeMetricsConfig,
}

/// `instantQuery` variant of a health rule.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct InstantQueryConfig {
    /// Query deadline, as a duration string (e.g. `"2s"`).
    pub timeout: String,
    /// Offset from "now" at which to evaluate, as a signed duration string.
    #[serde(rename = "relativeInstantTime")]
    pub relative_instant_time: String,
    /// Raw PromQL text.
    pub query: String,
}

/// `rangeQuery` variant of a health rule.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RangeQueryConfig {
    /// Query deadline, as a duration string.
    pub timeout: String,
    /// Offset from "now" marking the start of the range.
    #[serde(rename = "relativeStartTime")]
    pub relative_start_time: String,
    /// Offset from "now" marking the end of the range.
    #[serde(rename = "relativeEndTime")]
    pub relative_end_time: String,
    /// Step between samples within the range.
    pub interval: String,
    /// Raw PromQL text.
    pub query: String,
}

/// `signals` section.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SignalsConfig {
    /// Optional regex matched against process command lines; shutdown
    /// fan-out waits until no process matches before proceeding.
    #[serde(rename = "watchedProcessCommandLineRegEx")]
    pub watched_process_command_line_regex: Option<String>,
}

/// `telemetry` section.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TelemetryConfig {
    /// OpenTelemetry provider configuration.
    #[serde(rename = "openTelemetry")]
    pub open_telemetry: OpenTelemetryConfig,
    /// Embedded TSDB and PromQL engine configuration.
    pub prometheus: PrometheusConfig,
}

/// `telemetry.openTelemetry` section.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct OpenTelemetryConfig {
    /// Enabled exporters.
    pub exporters: Vec<ExporterKind>,
}

/// One OTel exporter choice (spec §4.1).
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ExporterKind {
    /// Metrics to stdout, for local debugging.
    StdoutMetric,
    /// Metrics exposed via the OTel Prometheus-compatibility exporter.
    Prometheus,
    /// Metrics pushed via OTLP/HTTP.
    OtlpMetricHttp,
    /// Metrics pushed via OTLP/gRPC.
    OtlpMetricGrpc,
    /// Traces to stdout, for local debugging.
    StdoutTrace,
    /// Traces pushed via OTLP/HTTP.
    OtlpTraceHttp,
    /// Traces pushed via OTLP/gRPC.
    OtlpTraceGrpc,
}

/// `telemetry.prometheus` section.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct PrometheusConfig {
    /// On-disk path for the embedded TSDB. A fresh temp directory is used if unset.
    #[serde(rename = "tsdbPath")]
    pub tsdb_path: Option<String>,
    /// TSDB retention/block-duration options.
    #[serde(rename = "tsdbOptions")]
    pub tsdb_options: TsdbOptions,
    /// PromQL engine options.
    pub promql: PromqlConfig,
}

/// TSDB retention/block-duration knobs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TsdbOptions {
    /// How long samples are retained before being dropped.
    pub retention_duration: String,
    /// Minimum compaction block duration (accepted, unused by the in-memory store).
    pub min_block_duration: String,
    /// Maximum compaction block duration (accepted, unused by the in-memory store).
    pub max_block_duration: String,
}

impl Default for TsdbOptions {
    fn default() -> Self {
        Self {
            retention_duration: "15d".into(),
            min_block_duration: "2h".into(),
            max_block_duration: "36h".into(),
        }
    }
}

/// `telemetry.prometheus.promql` section.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct PromqlConfig {
    /// Upper bound on concurrently executing queries.
    pub max_concurrent_queries: usize,
    /// PromQL evaluation engine options.
    pub engine_options: EngineOptions,
}

impl Default for PromqlConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 20,
            engine_options: EngineOptions::default(),
        }
    }
}

/// PromQL engine tuning knobs (spec §4.1).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct EngineOptions {
    /// Maximum samples a single query may touch.
    pub max_samples: usize,
    /// Per-query evaluation deadline, as a duration string.
    pub timeout: String,
    /// How far back a vector selector may look for the most recent sample.
    pub lookback_delta: String,
    /// Default resolution used for subqueries without an explicit step.
    pub no_step_subquery_interval: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_samples: 50_000_000,
            timeout: "2m".into(),
            lookback_delta: "5m".into(),
            no_step_subquery_interval: "1m".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let cfg = BunnyConfig::default();
        let yaml = serde_yaml::to_string(&cfg).expect("serialize");
        let parsed: BunnyConfig = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let yaml = "egress:\n  bogusField: 1\n";
        let result: Result<BunnyConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }
}
