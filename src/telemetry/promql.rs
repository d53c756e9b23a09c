//! PromQL evaluation against the embedded [`Tsdb`](super::tsdb::Tsdb).
//!
//! No repo in this crate's lineage embeds a PromQL engine; this module
//! parses with the `promql-parser` crate (the AST parser used by
//! GreptimeDB) and evaluates a bounded subset directly against the
//! in-memory store: number/string literals, vector selectors with label
//! matchers, scalar/vector comparison binary expressions, `rate`/`irate`
//! over a matrix selector, and ungrouped `sum`/`avg`/`min`/`max`/`count`
//! aggregations. Anything else returns [`QueryError::Unsupported`]. See
//! DESIGN.md for why this subset was chosen.

use std::time::Duration;

use promql_parser::label::{MatchOp, Matchers};
use promql_parser::parser::{self, Expr};

use crate::errors::QueryError;

use super::tsdb::{SeriesKey, Tsdb};

/// Compile a selector's label matchers into the predicate list
/// [`SeriesKey::matches`] expects, handling `=`, `!=`, `=~`, `!~`.
fn compile_matchers(
    matchers: &Matchers,
) -> Result<Vec<(String, Box<dyn Fn(&str) -> bool>)>, QueryError> {
    matchers
        .matchers
        .iter()
        .map(|m| {
            let value = m.value.clone();
            let pred: Box<dyn Fn(&str) -> bool> = match &m.op {
                MatchOp::Equal => Box::new(move |v: &str| v == value),
                MatchOp::NotEqual => Box::new(move |v: &str| v != value),
                MatchOp::Re(pattern) => {
                    let re = regex::Regex::new(pattern)
                        .map_err(|e| QueryError::Unsupported(format!("invalid regex matcher: {e}")))?;
                    Box::new(move |v: &str| re.is_match(v))
                }
                MatchOp::NotRe(pattern) => {
                    let re = regex::Regex::new(pattern)
                        .map_err(|e| QueryError::Unsupported(format!("invalid regex matcher: {e}")))?;
                    Box::new(move |v: &str| !re.is_match(v))
                }
            };
            Ok((m.name.clone(), pred))
        })
        .collect()
}

/// The reduced value of evaluating a PromQL expression at one instant, or
/// across a matrix of steps for a range query.
#[derive(Debug, Clone)]
pub enum QueryValue {
    /// A bare number.
    Scalar(f64),
    /// A set of labeled instantaneous values.
    Vector(Vec<(SeriesKey, f64)>),
    /// A set of labeled value sequences (produced only by range queries in
    /// this implementation; `rate`/`irate` consume matrix selectors
    /// internally without surfacing a `Matrix` value to the caller).
    Matrix(Vec<(SeriesKey, Vec<(i64, f64)>)>),
    /// A literal string, used by the lexed-token truthiness rule.
    String(String),
}

/// Evaluate `query` as an instant query at `at_ms` and reduce it to a boolean
/// per spec's truthiness rules. Mirrors `InstantQuery(timeout, query, at)`.
pub fn instant_query(
    tsdb: &Tsdb,
    query: &str,
    at_ms: i64,
    timeout: Duration,
) -> Result<bool, QueryError> {
    let deadline = std::time::Instant::now() + timeout;
    let expr = parser::parse(query).map_err(QueryError::Parse)?;
    let value = eval(tsdb, &expr, at_ms, deadline)?;
    reduce_truthiness(&value)
}

/// Evaluate `query` as a range query over `[start_ms, end_ms]` stepped by
/// `step_ms`, reducing the resulting matrix to a boolean: true iff every
/// point of every series equals `1.0`.
pub fn range_query(
    tsdb: &Tsdb,
    query: &str,
    start_ms: i64,
    end_ms: i64,
    step_ms: i64,
    timeout: Duration,
) -> Result<bool, QueryError> {
    let deadline = std::time::Instant::now() + timeout;
    let expr = parser::parse(query).map_err(QueryError::Parse)?;
    if step_ms <= 0 {
        return Err(QueryError::Unsupported("non-positive range step".into()));
    }
    let mut series_points: std::collections::BTreeMap<SeriesKey, Vec<(i64, f64)>> =
        std::collections::BTreeMap::new();
    let mut t = start_ms;
    while t <= end_ms {
        if std::time::Instant::now() > deadline {
            return Err(QueryError::DeadlineExceeded);
        }
        let value = eval(tsdb, &expr, t, deadline)?;
        match value {
            QueryValue::Vector(samples) => {
                for (key, v) in samples {
                    series_points.entry(key).or_default().push((t, v));
                }
            }
            QueryValue::Scalar(v) => {
                series_points
                    .entry(SeriesKey::new("", []))
                    .or_default()
                    .push((t, v));
            }
            other => return reduce_truthiness(&other),
        }
        t += step_ms;
    }
    let matrix: Vec<_> = series_points.into_iter().collect();
    reduce_truthiness(&QueryValue::Matrix(matrix))
}

/// Reduce a [`QueryValue`] to a boolean per spec §4.1's truthiness rules.
fn reduce_truthiness(value: &QueryValue) -> Result<bool, QueryError> {
    match value {
        QueryValue::Scalar(v) => Ok(*v == 1.0),
        QueryValue::Vector(samples) => Ok(samples.iter().all(|(_, v)| *v == 1.0)),
        QueryValue::Matrix(series) => {
            Ok(series.iter().all(|(_, points)| points.iter().all(|(_, v)| *v == 1.0)))
        }
        QueryValue::String(s) => {
            let token = s.split_whitespace().next().unwrap_or("");
            match token {
                "1" | "1.0" => Ok(true),
                "0" | "0.0" => Ok(false),
                _ => Err(QueryError::NotBoolean(s.clone())),
            }
        }
    }
}

fn eval(
    tsdb: &Tsdb,
    expr: &Expr,
    at_ms: i64,
    deadline: std::time::Instant,
) -> Result<QueryValue, QueryError> {
    if std::time::Instant::now() > deadline {
        return Err(QueryError::DeadlineExceeded);
    }
    match expr {
        Expr::NumberLiteral(n) => Ok(QueryValue::Scalar(n.val)),
        Expr::StringLiteral(s) => Ok(QueryValue::String(s.val.clone())),
        Expr::VectorSelector(vs) => {
            let name = vs.name.clone().unwrap_or_default();
            let predicates = compile_matchers(&vs.matchers)?;
            let samples = tsdb.instant(&name, at_ms);
            Ok(QueryValue::Vector(
                samples
                    .into_iter()
                    .filter(|(k, _)| k.matches(None, &predicates))
                    .map(|(k, s)| (k, s.value))
                    .collect(),
            ))
        }
        Expr::Paren(p) => eval(tsdb, &p.expr, at_ms, deadline),
        Expr::Unary(u) => eval(tsdb, &u.expr, at_ms, deadline),
        Expr::Binary(b) => eval_binary(tsdb, b, at_ms, deadline),
        Expr::Call(call) => eval_call(tsdb, call, at_ms, deadline),
        Expr::Aggregate(agg) => eval_aggregate(tsdb, agg, at_ms, deadline),
        other => Err(QueryError::Unsupported(format!("{other:?}"))),
    }
}

fn eval_binary(
    tsdb: &Tsdb,
    b: &promql_parser::parser::BinaryExpr,
    at_ms: i64,
    deadline: std::time::Instant,
) -> Result<QueryValue, QueryError> {
    let lhs = eval(tsdb, &b.lhs, at_ms, deadline)?;
    let rhs = eval(tsdb, &b.rhs, at_ms, deadline)?;
    let op = comparison_op(&b.op)?;
    match (lhs, rhs) {
        (QueryValue::Scalar(l), QueryValue::Scalar(r)) => Ok(QueryValue::Scalar(if op(l, r) {
            1.0
        } else {
            0.0
        })),
        (QueryValue::Vector(samples), QueryValue::Scalar(r)) => Ok(QueryValue::Vector(
            samples.into_iter().filter(|(_, v)| op(*v, r)).collect(),
        )),
        (QueryValue::Scalar(l), QueryValue::Vector(samples)) => Ok(QueryValue::Vector(
            samples.into_iter().filter(|(_, v)| op(l, *v)).collect(),
        )),
        (QueryValue::Vector(lhs_samples), QueryValue::Vector(rhs_samples)) => {
            let matched = lhs_samples
                .into_iter()
                .filter(|(key, v)| {
                    rhs_samples
                        .iter()
                        .any(|(rk, rv)| rk == key && op(*v, *rv))
                })
                .collect();
            Ok(QueryValue::Vector(matched))
        }
        _ => Err(QueryError::Unsupported(
            "binary expression operand types".into(),
        )),
    }
}

fn comparison_op(op: &promql_parser::parser::token::TokenType) -> Result<fn(f64, f64) -> bool, QueryError> {
    use promql_parser::parser::token::T_EQLC;
    use promql_parser::parser::token::{T_GTE, T_GTR, T_LSS, T_LTE, T_NEQ};
    let id = op.id();
    if id == T_EQLC {
        Ok(|l, r| l == r)
    } else if id == T_NEQ {
        Ok(|l, r| l != r)
    } else if id == T_GTR {
        Ok(|l, r| l > r)
    } else if id == T_LSS {
        Ok(|l, r| l < r)
    } else if id == T_GTE {
        Ok(|l, r| l >= r)
    } else if id == T_LTE {
        Ok(|l, r| l <= r)
    } else {
        Err(QueryError::Unsupported(format!("binary operator {op:?}")))
    }
}

fn eval_call(
    tsdb: &Tsdb,
    call: &promql_parser::parser::Call,
    at_ms: i64,
    deadline: std::time::Instant,
) -> Result<QueryValue, QueryError> {
    let func_name = call.func.name.as_str();
    if func_name != "rate" && func_name != "irate" {
        return Err(QueryError::Unsupported(format!("function {func_name}")));
    }
    let Some(Expr::MatrixSelector(ms)) = call.args.args.first().map(|e| e.as_ref()) else {
        return Err(QueryError::Unsupported(
            "rate()/irate() requires a matrix selector argument".into(),
        ));
    };
    let range_ms = ms.range.as_millis() as i64;
    let name = ms.vector_selector.name.clone().unwrap_or_default();
    let predicates = compile_matchers(&ms.vector_selector.matchers)?;
    let window = tsdb
        .range(&name, at_ms - range_ms, at_ms)
        .into_iter()
        .filter(|(k, _)| k.matches(None, &predicates));
    let mut out = Vec::new();
    for (key, points) in window {
        if points.len() < 2 {
            continue;
        }
        if std::time::Instant::now() > deadline {
            return Err(QueryError::DeadlineExceeded);
        }
        let rate = if func_name == "irate" {
            let last = points[points.len() - 1];
            let prev = points[points.len() - 2];
            let dt = (last.timestamp_ms - prev.timestamp_ms) as f64 / 1000.0;
            if dt <= 0.0 {
                0.0
            } else {
                (last.value - prev.value) / dt
            }
        } else {
            let first = points[0];
            let last = points[points.len() - 1];
            let dt = (last.timestamp_ms - first.timestamp_ms) as f64 / 1000.0;
            if dt <= 0.0 {
                0.0
            } else {
                (last.value - first.value) / dt
            }
        };
        out.push((key, rate));
    }
    Ok(QueryValue::Vector(out))
}

fn eval_aggregate(
    tsdb: &Tsdb,
    agg: &promql_parser::parser::AggregateExpr,
    at_ms: i64,
    deadline: std::time::Instant,
) -> Result<QueryValue, QueryError> {
    let inner = eval(tsdb, &agg.expr, at_ms, deadline)?;
    let QueryValue::Vector(samples) = inner else {
        return Err(QueryError::Unsupported(
            "aggregation over non-vector expression".into(),
        ));
    };
    let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
    if values.is_empty() {
        return Ok(QueryValue::Scalar(0.0));
    }
    let op_name = agg.op.id_name();
    let result = match op_name.as_str() {
        "sum" => values.iter().sum(),
        "avg" => values.iter().sum::<f64>() / values.len() as f64,
        "min" => values.iter().cloned().fold(f64::INFINITY, f64::min),
        "max" => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        "count" => values.len() as f64,
        other => return Err(QueryError::Unsupported(format!("aggregation {other}"))),
    };
    Ok(QueryValue::Scalar(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::tsdb::now_ms;

    #[test]
    fn number_literal_reduces_to_its_own_value() {
        let tsdb = Tsdb::open(None, Duration::from_secs(60)).unwrap();
        let result = instant_query(&tsdb, "1", now_ms(), Duration::from_secs(1)).unwrap();
        assert!(result);
        let result = instant_query(&tsdb, "0", now_ms(), Duration::from_secs(1)).unwrap();
        assert!(!result);
    }

    #[test]
    fn vector_selector_with_equality_filter() {
        let tsdb = Tsdb::open(None, Duration::from_secs(60)).unwrap();
        tsdb.append_now(SeriesKey::new("up", []), 1.0);
        let ok = instant_query(&tsdb, "up == 1", now_ms(), Duration::from_secs(1)).unwrap();
        assert!(ok);
    }

    #[test]
    fn empty_vector_selector_is_vacuously_true() {
        let tsdb = Tsdb::open(None, Duration::from_secs(60)).unwrap();
        let ok = instant_query(&tsdb, "nonexistent_metric", now_ms(), Duration::from_secs(1)).unwrap();
        assert!(ok);
    }

    #[test]
    fn label_matcher_excludes_non_matching_series() {
        let tsdb = Tsdb::open(None, Duration::from_secs(60)).unwrap();
        tsdb.append_now(SeriesKey::new("up", [("job".to_string(), "a".to_string())]), 1.0);
        tsdb.append_now(SeriesKey::new("up", [("job".to_string(), "b".to_string())]), 0.0);
        let ok = instant_query(&tsdb, r#"up{job="a"} == 1"#, now_ms(), Duration::from_secs(1)).unwrap();
        assert!(ok);
        let ok = instant_query(&tsdb, r#"up{job="b"} == 1"#, now_ms(), Duration::from_secs(1)).unwrap();
        assert!(!ok);
    }
}
