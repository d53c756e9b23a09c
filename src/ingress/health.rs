//! Compiled health rules (spec §4.3).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    config::HealthRuleConfig,
    errors::ConfigError,
    telemetry::{CounterMetric, ResponseTimeMetric, TelemetryPlane},
};

/// One compiled `ingress.httpServer.health[]` entry.
pub struct HealthRule {
    /// Normalized request path, leading slash guaranteed.
    pub path: String,
    query: HealthQuery,
    timeout: Duration,
    attempts: Option<CounterMetric>,
    response_time: Option<ResponseTimeMetric>,
}

enum HealthQuery {
    Instant {
        query: String,
        /// Signed offset from "now", milliseconds.
        relative_instant_time_ms: i64,
    },
    Range {
        query: String,
        relative_start_time_ms: i64,
        relative_end_time_ms: i64,
        interval_ms: i64,
    },
}

impl HealthRule {
    /// Compile one config entry: parse all durations, validate exactly one
    /// of instant/range is set, normalize the path.
    pub fn from_config(
        cfg: &HealthRuleConfig,
        telemetry: &TelemetryPlane,
    ) -> Result<Self, ConfigError> {
        let path = if cfg.path.starts_with('/') {
            cfg.path.clone()
        } else {
            format!("/{}", cfg.path)
        };
        let (query, timeout) = match (&cfg.instant_query, &cfg.range_query) {
            (Some(q), None) => (
                HealthQuery::Instant {
                    query: q.query.clone(),
                    relative_instant_time_ms: parse_signed_millis(&q.relative_instant_time)?,
                },
                parse_duration(&q.timeout)?,
            ),
            (None, Some(q)) => (
                HealthQuery::Range {
                    query: q.query.clone(),
                    relative_start_time_ms: parse_signed_millis(&q.relative_start_time)?,
                    relative_end_time_ms: parse_signed_millis(&q.relative_end_time)?,
                    interval_ms: parse_duration(&q.interval)?.as_millis() as i64,
                },
                parse_duration(&q.timeout)?,
            ),
            _ => {
                return Err(ConfigError::Validation(format!(
                    "health rule {path:?} must specify exactly one of instantQuery/rangeQuery"
                )))
            }
        };
        Ok(Self {
            path,
            query,
            timeout,
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
        })
    }

    /// Run the rule's query against `telemetry`, returning the health
    /// boolean (spec §4.3: errors map to `false`/unhealthy).
    pub async fn evaluate(&self, telemetry: &TelemetryPlane) -> bool {
        let start = telemetry.pre_measurable(self.attempts.as_ref(), self.response_time.as_ref());
        let now_ms = now_millis();
        let result = match &self.query {
            HealthQuery::Instant {
                query,
                relative_instant_time_ms,
            } => {
                let at_ms = now_ms + relative_instant_time_ms;
                telemetry.instant_query(self.timeout, query, at_ms).await
            }
            HealthQuery::Range {
                query,
                relative_start_time_ms,
                relative_end_time_ms,
                interval_ms,
            } => {
                let start_ms = now_ms + relative_start_time_ms;
                let end_ms = now_ms + relative_end_time_ms;
                telemetry
                    .range_query(self.timeout, query, start_ms, end_ms, *interval_ms)
                    .await
            }
        };
        let ok = result.unwrap_or(false);
        telemetry.post_measurable(None, self.response_time.as_ref(), start, ok);
        ok
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(s).map_err(|e| ConfigError::Validation(format!("{s:?}: {e}")))
}

/// Parse a duration string allowing a leading `-` (the overwhelmingly
/// common case for `relative*Time` fields, which point into the past).
fn parse_signed_millis(s: &str) -> Result<i64, ConfigError> {
    if let Some(rest) = s.strip_prefix('-') {
        Ok(-(parse_duration(rest)?.as_millis() as i64))
    } else {
        Ok(parse_duration(s)?.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_negative_relative_time() {
        assert_eq!(parse_signed_millis("-30s").unwrap(), -30_000);
        assert_eq!(parse_signed_millis("30s").unwrap(), 30_000);
    }

    #[test]
    fn normalizes_path_without_leading_slash() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
    }
}
