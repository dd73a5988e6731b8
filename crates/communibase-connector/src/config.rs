use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// The default API URL
pub const DEFAULT_SERVICE_URL: &str = "https://api.communibase.nl/0.1/";

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the connector.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "communibase".into(),
        }
    }
}

/// Sizing of the in-memory read-through caches.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached search id lists, per entity type.
    ///
    /// Defaults to `1000`.
    pub ids_capacity: u64,

    /// Maximum number of cached aggregation results, per entity type.
    ///
    /// Defaults to `1000`.
    pub aggregate_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ids_capacity: 1000,
            aggregate_capacity: 1000,
        }
    }
}

/// Configuration of a [`Connector`](crate::Connector).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the Communibase API, including the version segment.
    #[serde(deserialize_with = "deserialize_service_url")]
    pub service_url: Url,

    /// The API key sent as `x-api-key`.
    pub api_key: Option<String>,

    /// An access token sent as `x-access-token`.
    pub access_token: Option<String>,

    /// Overrides the `Host` header of every API request.
    pub host: Option<String>,

    /// The maximum number of API requests in flight at the same time.
    pub concurrency: usize,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for one complete API request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Sizing of the read-through caches, once caching is enabled.
    pub cache: CacheConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("service_url", &self.service_url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("concurrency", &self.concurrency)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("cache", &self.cache)
            .field("logging", &self.logging)
            .field("metrics", &self.metrics)
            .field("sentry_dsn", &self.sentry_dsn)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_url: default_service_url(),
            api_key: None,
            access_token: None,
            host: None,
            concurrency: 8,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
            cache: CacheConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Applies the `COMMUNIBASE_*` environment variables on top of this config.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up by environment variable name.
    ///
    /// * `COMMUNIBASE_KEY` sets the API key.
    /// * `COMMUNIBASE_API_URL` sets the service URL.
    /// * `COMMUNIBASE_API_HOST` sets the `Host` header override.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(key) = lookup("COMMUNIBASE_KEY") {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup("COMMUNIBASE_API_URL") {
            self.service_url = parse_service_url(&url).context("invalid COMMUNIBASE_API_URL")?;
        }
        if let Some(host) = lookup("COMMUNIBASE_API_HOST") {
            self.host = Some(host);
        }
        Ok(())
    }
}

fn default_service_url() -> Url {
    Url::parse(DEFAULT_SERVICE_URL).expect("DEFAULT_SERVICE_URL is a valid URL")
}

/// Parses a service URL, making sure it ends in a slash so that API paths are appended to it.
pub fn parse_service_url(url: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn deserialize_service_url<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Url, D::Error> {
    let url = String::deserialize(deserializer)?;
    parse_service_url(&url).map_err(de::Error::custom)
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.service_url.as_str(), DEFAULT_SERVICE_URL);
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.cache, CacheConfig::default());
        assert!(cfg.api_key.is_none());
    }

    #[test]
    fn test_partial_config() {
        // It should be possible to set individual values without affecting other defaults.
        let yaml = r#"
            service_url: http://localhost:8080/0.1
            concurrency: 2
            request_timeout: 5s
            cache:
              ids_capacity: 10
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.service_url.as_str(), "http://localhost:8080/0.1/");
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.connect_timeout, Config::default().connect_timeout);
        assert_eq!(cfg.cache.ids_capacity, 10);
        assert_eq!(cfg.cache.aggregate_capacity, 1000);
    }

    #[test]
    fn test_logging_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            not_a_setting: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("COMMUNIBASE_KEY", "secret"),
            ("COMMUNIBASE_API_URL", "https://staging.communibase.nl/0.1"),
            ("COMMUNIBASE_API_HOST", ""),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.api_key.as_deref(), Some("secret"));
        assert_eq!(
            cfg.service_url.as_str(),
            "https://staging.communibase.nl/0.1/"
        );
        // empty variables are ignored
        assert_eq!(cfg.host, None);
    }

    #[test]
    fn test_invalid_env_url() {
        let mut cfg = Config::default();
        let result = cfg.apply_overrides(|name| {
            (name == "COMMUNIBASE_API_URL").then(|| "not a url".to_owned())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let cfg = Config {
            api_key: Some("very-secret".into()),
            ..Default::default()
        };
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
