//! C4 — the config controller (spec §4.4).
//!
//! `LOAD -> VALIDATE -> HASH -> BROADCAST -> WATCH`. The containing
//! directory is watched rather than the file itself so an atomic rename or a
//! templated reload by an external config system is picked up the same way
//! a direct edit is, following `examples/rerun-io-rerun`'s use of `notify`
//! for directory-level watches.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{bus::Topic, config::BunnyConfig, errors::ConfigError};

/// Default config path, overridden by `BUNNY_CONFIG_FILE_PATH`.
const DEFAULT_CONFIG_PATH: &str = "/config/bunny.yaml";

/// Env var overriding [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV_VAR: &str = "BUNNY_CONFIG_FILE_PATH";

/// C4's event loop state.
pub struct ConfigController {
    path: PathBuf,
    config_topic: Topic<Arc<BunnyConfig>>,
    shutdown_rx: mpsc::Receiver<()>,
    last_digest: Option<[u8; 32]>,
    _watcher: RecommendedWatcher,
    events_rx: mpsc::Receiver<notify::Result<notify::Event>>,
}

impl ConfigController {
    /// Resolve the config path from the environment and start watching its
    /// parent directory. Does not load the file yet; call [`Self::run`].
    pub fn new(
        config_topic: Topic<Arc<BunnyConfig>>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let (tx, rx) = mpsc::channel(16);
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.blocking_send(res);
        })?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path,
            config_topic,
            shutdown_rx,
            last_digest: None,
            _watcher: watcher,
            events_rx: rx,
        })
    }

    /// Load once immediately, broadcast, then watch for changes until
    /// shutdown.
    pub async fn run(mut self) {
        info!(path = %self.path.display(), "config controller is go");
        self.load_and_broadcast().await;

        loop {
            tokio::select! {
                biased;
                Some(()) = self.shutdown_rx.recv() => {
                    info!("config controller shutting down");
                    return;
                }
                Some(event) = self.events_rx.recv() => {
                    if self.is_relevant(&event) {
                        // Debounce a burst of events from one atomic rename.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        while self.events_rx.try_recv().is_ok() {}
                        self.load_and_broadcast().await;
                    }
                }
            }
        }
    }

    fn is_relevant(&self, event: &notify::Result<notify::Event>) -> bool {
        match event {
            Ok(event) => !matches!(event.kind, notify::EventKind::Remove(_)),
            Err(e) => {
                warn!(error = %e, "config directory watch error");
                false
            }
        }
    }

    async fn load_and_broadcast(&mut self) {
        match self.load().await {
            Ok(Some(cfg)) => {
                info!("broadcasting new configuration snapshot");
                self.config_topic.publish(Arc::new(cfg)).await;
            }
            Ok(None) => debug_unchanged(&self.path),
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "using default configuration");
                self.config_topic.publish(Arc::new(BunnyConfig::default())).await;
            }
        }
    }

    /// Read, hash, and parse the config file. Returns `Ok(None)` if the
    /// digest is unchanged from the last accepted snapshot.
    async fn load(&mut self) -> Result<Option<BunnyConfig>, ConfigError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ConfigError::Io(e.into()))?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        if self.last_digest == Some(digest) {
            return Ok(None);
        }
        let cfg: BunnyConfig = serde_yaml::from_slice(&bytes)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        validate(&cfg)?;
        self.last_digest = Some(digest);
        Ok(Some(cfg))
    }
}

fn debug_unchanged(path: &Path) {
    tracing::debug!(path = %path.display(), "config digest unchanged, ignoring");
}

/// Cross-field validation the type system doesn't enforce on its own (spec
/// §4.4 Validation): exactly-one-action probes, exactly-one-query health
/// rules, parseable durations.
fn validate(cfg: &BunnyConfig) -> Result<(), ConfigError> {
    for probe in &cfg.egress.probes {
        let count = [
            probe.http_get.is_some(),
            probe.grpc.is_some(),
            probe.tcp_socket.is_some(),
            probe.exec.is_some(),
        ]
        .iter()
        .filter(|x| **x)
        .count();
        if count != 1 {
            return Err(ConfigError::Validation(format!(
                "probe {:?} must specify exactly one action, found {count}",
                probe.name
            )));
        }
    }
    for rule in &cfg.ingress.http_server.health {
        match (&rule.instant_query, &rule.range_query) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "health rule {:?} must specify exactly one of instantQuery/rangeQuery",
                    rule.path
                )))
            }
        }
        if let Some(q) = &rule.instant_query {
            parse_duration(&q.timeout)?;
            parse_signed_duration(&q.relative_instant_time)?;
        }
        if let Some(q) = &rule.range_query {
            parse_duration(&q.timeout)?;
            parse_signed_duration(&q.relative_start_time)?;
            parse_signed_duration(&q.relative_end_time)?;
            parse_duration(&q.interval)?;
        }
    }
    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(s).map_err(|e| ConfigError::Validation(format!("{s:?}: {e}")))
}

fn parse_signed_duration(s: &str) -> Result<Duration, ConfigError> {
    let trimmed = s.strip_prefix('-').unwrap_or(s);
    parse_duration(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        GrpcActionConfig, HttpGetActionConfig, HealthRuleConfig, InstantQueryConfig, ProbeConfig,
    };

    #[test]
    fn rejects_probe_with_two_actions() {
        let mut cfg = BunnyConfig::default();
        cfg.egress.probes.push(ProbeConfig {
            name: "dual".into(),
            http_get: Some(HttpGetActionConfig::default()),
            grpc: Some(GrpcActionConfig::default()),
            ..Default::default()
        });
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_rule_with_no_query() {
        let mut cfg = BunnyConfig::default();
        cfg.ingress.http_server.health.push(HealthRuleConfig {
            path: "/healthz".into(),
            ..Default::default()
        });
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn accepts_well_formed_instant_rule() {
        let mut cfg = BunnyConfig::default();
        cfg.ingress.http_server.health.push(HealthRuleConfig {
            path: "/healthz".into(),
            instant_query: Some(InstantQueryConfig {
                timeout: "2s".into(),
                relative_instant_time: "0s".into(),
                query: "up == 1".into(),
            }),
            ..Default::default()
        });
        assert!(validate(&cfg).is_ok());
    }
}
