// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application Configuration
//!
//! Settings are read from the process environment or from a JSON file. Flow
//! topologies default to the four built-in flows unless a flows file is given.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `AMQP_URL` (or legacy `url`) | broker URL | required |
//! | `APP_NAME` | connection name | `amqp-flows` |
//! | `LOG_LEVEL` | tracing filter | `info` |
//! | `MAX_REDELIVERIES` | requeues before a message is discarded | `3` |
//! | `FLOWS_FILE` | JSON array of flow definitions | built-in flows |

use crate::{
    consumer::RedeliveryPolicy,
    errors::ConfigError,
    flow::{builtin_flows, FlowDefinition},
};
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::debug;

pub const ENV_AMQP_URL: &str = "AMQP_URL";
pub const ENV_LEGACY_URL: &str = "url";
pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_MAX_REDELIVERIES: &str = "MAX_REDELIVERIES";
pub const ENV_FLOWS_FILE: &str = "FLOWS_FILE";

fn default_app_name() -> String {
    "amqp-flows".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_max_redeliveries() -> u32 {
    RedeliveryPolicy::default().max_redeliveries
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    pub broker_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default = "builtin_flows")]
    pub flows: Vec<FlowDefinition>,
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads a full configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let cfg: AppConfig = serde_json::from_str(&read(path.as_ref())?)?;
        debug!(flows = cfg.flows.len(), "configuration file loaded");
        Ok(cfg)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<AppConfig, ConfigError> {
        let broker_url = lookup(ENV_AMQP_URL)
            .or_else(|| lookup(ENV_LEGACY_URL))
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingVar(ENV_AMQP_URL))?;

        let max_redeliveries = match lookup(ENV_MAX_REDELIVERIES) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(ENV_MAX_REDELIVERIES, raw))?,
            None => default_max_redeliveries(),
        };

        let flows = match lookup(ENV_FLOWS_FILE) {
            Some(path) => serde_json::from_str(&read(Path::new(&path))?)?,
            None => builtin_flows(),
        };

        Ok(AppConfig {
            app_name: lookup(ENV_APP_NAME).unwrap_or_else(default_app_name),
            broker_url,
            log_level: lookup(ENV_LOG_LEVEL).unwrap_or_else(default_log_level),
            max_redeliveries,
            flows,
        })
    }

    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy::new(self.max_redeliveries)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|err| ConfigError::Io(path.display().to_string(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, io::Write};
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_the_url_is_set() {
        let cfg = AppConfig::from_lookup(env(&[("AMQP_URL", "amqp://localhost:5672")])).unwrap();

        assert_eq!(cfg.broker_url, "amqp://localhost:5672");
        assert_eq!(cfg.app_name, "amqp-flows");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.redelivery_policy(), RedeliveryPolicy::default());
        assert_eq!(cfg.flows, builtin_flows());
    }

    #[test]
    fn legacy_url_variable_is_accepted() {
        let cfg = AppConfig::from_lookup(env(&[("url", "amqp://legacy")])).unwrap();
        assert_eq!(cfg.broker_url, "amqp://legacy");
    }

    #[test]
    fn missing_url_is_an_error() {
        assert!(matches!(
            AppConfig::from_lookup(env(&[("APP_NAME", "x")])),
            Err(ConfigError::MissingVar("AMQP_URL"))
        ));
    }

    #[test]
    fn invalid_redelivery_count_is_reported() {
        let result = AppConfig::from_lookup(env(&[
            ("AMQP_URL", "amqp://localhost"),
            ("MAX_REDELIVERIES", "many"),
        ]));

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue("MAX_REDELIVERIES", raw)) if raw == "many"
        ));
    }

    #[test]
    fn flows_file_replaces_the_builtin_flows() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "only", "exchange": {{"name": "only", "type": "fanout"}}}}]"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let cfg = AppConfig::from_lookup(env(&[
            ("AMQP_URL", "amqp://localhost"),
            ("FLOWS_FILE", path.as_str()),
        ]))
        .unwrap();

        assert_eq!(cfg.flows.len(), 1);
        assert_eq!(cfg.flows[0].name, "only");
    }

    #[test]
    fn unreadable_flows_file_is_an_io_error() {
        let result = AppConfig::from_lookup(env(&[
            ("AMQP_URL", "amqp://localhost"),
            ("FLOWS_FILE", "/definitely/not/here.json"),
        ]));
        assert!(matches!(result, Err(ConfigError::Io(..))));
    }

    #[test]
    fn from_file_reads_a_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"app_name": "svc", "broker_url": "amqp://b", "max_redeliveries": 0}}"#
        )
        .unwrap();

        let cfg = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.app_name, "svc");
        assert_eq!(cfg.redelivery_policy(), RedeliveryPolicy::new(0));
        assert_eq!(cfg.flows.len(), 4);
    }

    #[test]
    fn malformed_config_file_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
