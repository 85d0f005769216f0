use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

use crate::policy::UnknownEventPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    pub access_token: NonEmptyString,
    pub pixel_id: NonEmptyString,

    #[envconfig(default = "https://graph.facebook.com")]
    pub graph_api_url: String,
    #[envconfig(default = "v19.0")]
    pub graph_api_version: String,

    #[envconfig(default = "http://localhost:3000")]
    pub allowed_origins: AllowedOrigins,

    #[envconfig(default = "8000")]
    pub request_timeout_ms: EnvMsDuration,

    #[envconfig(default = "30")]
    pub rate_limit_per_window: usize,
    #[envconfig(default = "60")]
    pub rate_limit_window_secs: u64,
    #[envconfig(default = "1000")]
    pub rate_limit_max_clients: usize,

    #[envconfig(default = "20")]
    pub max_events_per_batch: usize,
    #[envconfig(default = "1048576")] // 1MB
    pub max_body_bytes: usize,
    #[envconfig(default = "2048")]
    pub compression_threshold_bytes: usize,

    pub failed_events_path: Option<String>,
    #[envconfig(default = "5242880")] // 5MB
    pub failed_events_max_bytes: u64,

    pub default_event_source_url: Option<String>,
    #[envconfig(default = "BRL")]
    pub default_currency: String,
    pub test_event_code: Option<String>,
    #[envconfig(default = "reject")]
    pub unknown_event_policy: UnknownEventPolicy,

    #[envconfig(default = "false")]
    pub expose_internal_errors: bool,
    #[envconfig(default = "true")]
    pub export_prometheus: bool,
    #[envconfig(default = "info")]
    pub log_level: Level,
}

impl Config {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

/// Credentials and identifiers must not be silently empty.
#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Comma separated list of origins allowed to call the relay from a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedOrigins(pub Vec<String>);

impl FromStr for AllowedOrigins {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AllowedOrigins(
            s.split(',')
                .map(|origin| origin.trim().trim_end_matches('/'))
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&env(&[
            ("ACCESS_TOKEN", "token"),
            ("PIXEL_ID", "123"),
        ]))
        .unwrap();

        assert_eq!(config.address, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.request_timeout_ms.0, Duration::from_millis(8000));
        assert_eq!(config.rate_limit_per_window, 30);
        assert_eq!(config.rate_limit_window(), Duration::from_secs(60));
        assert_eq!(config.rate_limit_max_clients, 1000);
        assert_eq!(config.max_events_per_batch, 20);
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.compression_threshold_bytes, 2048);
        assert_eq!(config.failed_events_max_bytes, 5 * 1024 * 1024);
        assert_eq!(config.failed_events_path, None);
        assert_eq!(config.default_currency, "BRL");
        assert_eq!(config.unknown_event_policy, UnknownEventPolicy::Reject);
        assert_eq!(config.log_level, Level::INFO);
        assert!(!config.expose_internal_errors);
        assert!(config.export_prometheus);
    }

    #[test]
    fn access_token_is_required() {
        assert!(Config::init_from_hashmap(&env(&[("PIXEL_ID", "123")])).is_err());
        assert!(Config::init_from_hashmap(&env(&[
            ("ACCESS_TOKEN", "  "),
            ("PIXEL_ID", "123")
        ]))
        .is_err());
    }

    #[test]
    fn allowed_origins_are_split_and_trimmed() {
        let origins: AllowedOrigins = "https://www.example.com/, https://shop.example.com,,"
            .parse()
            .unwrap();

        assert_eq!(
            origins.0,
            vec!["https://www.example.com", "https://shop.example.com"]
        );
    }

    #[test]
    fn ms_durations() {
        assert_eq!(
            "250".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(Duration::from_millis(250)))
        );
        assert_eq!("soon".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }
}
