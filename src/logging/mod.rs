//! Logging setup (spec §6.3: `LOG_HANDLER`, `<PKG>_LOG_LEVEL`).
//!
//! A single `tracing_subscriber::fmt` layer in one of two formats, filtered
//! by an [`tracing_subscriber::EnvFilter`] read from an env var named after
//! the binary. Reduced from `examples/unikmhz-uxum/src/logging/mod.rs`'s
//! arbitrary-subscriber-list design (N independently configured sinks) to
//! the two knobs spec.md actually names: nothing here calls for a
//! declarative multi-sink logging config.

pub(crate) mod span;

use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Text or JSON, selected by the `LOG_HANDLER` environment variable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoggingFormat {
    /// Human-oriented compact text, the default.
    #[default]
    Text,
    /// Newline-delimited JSON objects.
    Json,
}

impl LoggingFormat {
    /// Read `LOG_HANDLER`, defaulting to [`LoggingFormat::Text`] on anything
    /// other than an exact, case-insensitive `"json"`.
    pub fn from_env() -> Self {
        match std::env::var("LOG_HANDLER") {
            Ok(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Build the process-wide `tracing` subscriber and install it as the global
/// default. Must be called once, before any other module logs.
///
/// The env filter variable name is the binary's own name, uppercased with
/// non-alphanumeric characters turned into underscores, suffixed with
/// `_LOG_LEVEL` (e.g. `bunnysidecar` -> `BUNNYSIDECAR_LOG_LEVEL`), falling
/// back to `info` when unset or unparseable.
pub fn init(pkg_name: &str) {
    let env_var = format!("{}_LOG_LEVEL", shout_case(pkg_name));
    let filter = EnvFilter::try_from_env(&env_var).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LoggingFormat::from_env();
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    let layer = match format {
        LoggingFormat::Text => layer.boxed(),
        LoggingFormat::Json => layer.json().flatten_event(true).boxed(),
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();
}

fn shout_case(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shout_case_normalizes_separators() {
        assert_eq!(shout_case("bunny-sidecar"), "BUNNY_SIDECAR");
    }

    #[test]
    fn format_defaults_to_text() {
        std::env::remove_var("LOG_HANDLER");
        assert_eq!(LoggingFormat::from_env(), LoggingFormat::Text);
    }
}
