//! Engine configuration from the environment.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | unset: in-memory log |
//! | `REDIS_URL` | unset: no outbound publishing |
//! | `STOCKFLOW_TENANT` | unset: wait for the tenant marker |
//! | `STOCKFLOW_PURGE_ON_ATTACH` | `false` |
//! | `STOCKFLOW_TENANT_POLL_SECS` | `5` |
//! | `STOCKFLOW_SWEEP_SECS` | `5` |
//! | `STOCKFLOW_RETRY_POLL_SECS` | `5` |
//! | `STOCKFLOW_SNAPSHOT_EVERY` | `500` (0 disables) |
//! | `STOCKFLOW_FEED_POLL_MS` | `250` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use stockflow_core::TenantId;

use crate::event_log::AttachOptions;
use crate::snapshot::SnapshotPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub tenant: Option<TenantId>,
    pub purge_on_attach: bool,
    pub tenant_poll: Duration,
    pub sweep_interval: Duration,
    pub retry_poll: Duration,
    pub snapshot_every: u64,
    pub feed_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            tenant: None,
            purge_on_attach: false,
            tenant_poll: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            retry_poll: Duration::from_secs(5),
            snapshot_every: 500,
            feed_poll: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable lookup (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set; using in-memory event log");
        }

        Ok(Self {
            database_url,
            redis_url: get("REDIS_URL"),
            tenant: parse(&get, "STOCKFLOW_TENANT")?,
            purge_on_attach: parse(&get, "STOCKFLOW_PURGE_ON_ATTACH")?.unwrap_or(defaults.purge_on_attach),
            tenant_poll: secs(&get, "STOCKFLOW_TENANT_POLL_SECS")?.unwrap_or(defaults.tenant_poll),
            sweep_interval: secs(&get, "STOCKFLOW_SWEEP_SECS")?.unwrap_or(defaults.sweep_interval),
            retry_poll: secs(&get, "STOCKFLOW_RETRY_POLL_SECS")?.unwrap_or(defaults.retry_poll),
            snapshot_every: parse(&get, "STOCKFLOW_SNAPSHOT_EVERY")?.unwrap_or(defaults.snapshot_every),
            feed_poll: parse::<u64>(&get, "STOCKFLOW_FEED_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.feed_poll),
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every;
        self
    }

    pub fn attach_options(&self) -> AttachOptions {
        let options = AttachOptions::default()
            .with_purge(self.purge_on_attach)
            .with_tenant_poll(self.tenant_poll);
        match self.tenant {
            Some(tenant) => options.with_tenant(tenant),
            None => options,
        }
    }

    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            every: self.snapshot_every,
        }
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match get(var) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(None),
    }
}

fn secs(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(get, var)? {
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.attach_options().tenant, None);
    }

    #[test]
    fn values_are_parsed() {
        let tenant = TenantId::new();
        let tenant_str = tenant.as_uuid().to_string();
        let config = EngineConfig::from_lookup(lookup(&[
            ("STOCKFLOW_TENANT", tenant_str.as_str()),
            ("STOCKFLOW_PURGE_ON_ATTACH", "true"),
            ("STOCKFLOW_SWEEP_SECS", "2"),
            ("STOCKFLOW_SNAPSHOT_EVERY", "0"),
            ("STOCKFLOW_FEED_POLL_MS", "50"),
        ]))
        .unwrap();

        assert_eq!(config.tenant, Some(tenant));
        assert!(config.purge_on_attach);
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.feed_poll, Duration::from_millis(50));
        assert_eq!(config.snapshot_policy().every, 0);
        assert!(config.attach_options().purge);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("STOCKFLOW_TENANT", "not-a-uuid")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "STOCKFLOW_TENANT", .. }));

        let err = EngineConfig::from_lookup(lookup(&[("STOCKFLOW_SWEEP_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "STOCKFLOW_SWEEP_SECS", .. }));

        let err = EngineConfig::from_lookup(lookup(&[("STOCKFLOW_PURGE_ON_ATTACH", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "STOCKFLOW_PURGE_ON_ATTACH", .. }));
    }
}
