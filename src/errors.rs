//! Crate-wide error taxonomy.
//!
//! Each component owns a narrow error enum; [`BunnyError`] composes them for
//! call sites (mainly the top-level composer) that need to handle any of
//! them uniformly. Propagation policy lives at the call site, not here: a
//! [`ConfigError`] is fatal on first boot but merely logged on a later
//! reload.

use std::io;

use thiserror::Error;

/// Wrapper for [`std::io::Error`] with kind/errno detail in `Display`.
#[derive(Debug)]
#[repr(transparent)]
pub struct IoError(io::Error);

impl From<io::Error> for IoError {
    fn from(value: io::Error) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, kind={:?}", self.0, self.0.kind())?;
        if let Some(raw) = self.0.raw_os_error() {
            write!(f, ", raw={raw}")?;
        }
        Ok(())
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Errors raised while locating, loading, validating or watching the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure reading the config file or its directory.
    #[error("config I/O error: {0}")]
    Io(#[from] IoError),
    /// YAML/deserialization failure.
    #[error("config parse error: {0}")]
    Parse(#[from] config::ConfigError),
    /// A validation rule from spec §3/§4.4 was violated.
    #[error("config validation failed: {0}")]
    Validation(String),
    /// Filesystem watcher could not be established.
    #[error("could not watch config directory: {0}")]
    Watch(#[from] notify::Error),
}

/// Errors produced while a probe action runs. Never propagated out of the
/// probe task; recorded in metrics and span status, logged at debug.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Transport-level failure (connect, read, write).
    #[error("probe transport error: {0}")]
    Transport(String),
    /// The action's deadline elapsed before completion.
    #[error("probe timed out")]
    Timeout,
    /// Non-success result without a transport failure (e.g. non-200, non-SERVING).
    #[error("probe reported failure: {0}")]
    Failed(String),
    /// The TCP expect script mismatched at a send/receive step.
    #[error("expect script failed at step {step}: {reason}")]
    Expect {
        /// Zero-based index of the failing step.
        step: usize,
        /// Human-readable mismatch description.
        reason: String,
    },
}

/// Errors produced while evaluating a PromQL health query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The query text failed to parse.
    #[error("PromQL parse error: {0}")]
    Parse(String),
    /// The query used a construct outside the supported subset.
    #[error("unsupported PromQL construct: {0}")]
    Unsupported(String),
    /// The query's deadline elapsed.
    #[error("query deadline exceeded")]
    DeadlineExceeded,
    /// The result type could not be reduced to a boolean per the truthiness rules.
    #[error("result could not be reduced to boolean: {0}")]
    NotBoolean(String),
}

/// Errors produced while constructing or reconfiguring the telemetry plane.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTel exporter could not be built; that exporter is skipped, not fatal.
    #[error("exporter construction failed: {0}")]
    Exporter(String),
    /// Opening the embedded TSDB failed; this is fatal per spec.
    #[error("TSDB open failed: {0}")]
    TsdbOpen(String),
    /// A Prometheus collector could not be (re)registered.
    #[error("prometheus registration error: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Errors produced by the signal controller.
#[derive(Debug, Error)]
pub enum SignalError {
    /// `signal(2)`/`sigaction(2)` registration failed.
    #[error("unable to register signal handler: {0}")]
    Register(#[from] IoError),
}

/// Umbrella error type for call sites that need to handle any component's
/// failure uniformly (mainly the top-level composer's startup path).
#[derive(Debug, Error)]
pub enum BunnyError {
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// See [`TelemetryError`].
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// See [`QueryError`].
    #[error(transparent)]
    Query(#[from] QueryError),
    /// See [`SignalError`].
    #[error(transparent)]
    Signal(#[from] SignalError),
    /// Generic I/O failure at startup (binding a socket, etc).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
