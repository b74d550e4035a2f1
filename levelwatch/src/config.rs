use crate::clock::MarketCalendar;
use chrono::NaiveTime;
use chrono_tz::Tz;
use levelwatch_feed::{backoff::ReconnectionBackoffPolicy, client::FeedConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

/// Complete operator configuration, deserialised from a TOML file.
///
/// Every section and field has a default, so an empty file yields a runnable
/// development configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub feed: FeedSection,
    pub session: SessionSection,
    pub persistence: PersistenceSection,
    pub market: MarketSection,
    pub paper: PaperSection,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }

    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| ConfigError::Read(path.to_path_buf(), error))?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),

    #[error("invalid feed endpoint {0}: {1}")]
    Endpoint(String, url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Downstream heartbeat cadence.
    pub heartbeat_interval_ms: u64,
    /// Bound on each downstream channel's send queue.
    pub channel_send_queue: usize,
    /// Per-frame downstream send deadline; a breach closes the channel.
    pub send_deadline_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8990".parse().unwrap_or_else(|_| {
                SocketAddr::from(([0, 0, 0, 0], 8990))
            }),
            heartbeat_interval_ms: 10_000,
            channel_send_queue: 256,
            send_deadline_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn send_deadline(&self) -> Duration {
        Duration::from_millis(self.send_deadline_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedSection {
    /// Broker streaming endpoint.
    pub endpoint: String,
    pub upstream_read_deadline_secs: u64,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub reconnect_backoff_jitter: f64,
    pub subscription_batch_window_ms: u64,
    pub empty_linger_secs: u64,
    pub decode_error_threshold: u32,
    pub auth_timeout_secs: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            endpoint: "wss://stream.broker.example/quotes".to_string(),
            upstream_read_deadline_secs: 40,
            reconnect_backoff_base_ms: 1_000,
            reconnect_backoff_max_ms: 30_000,
            reconnect_backoff_jitter: 0.2,
            subscription_batch_window_ms: 100,
            empty_linger_secs: 30,
            decode_error_threshold: 5,
            auth_timeout_secs: 10,
        }
    }
}

impl FeedSection {
    pub fn endpoint_url(&self) -> Result<url::Url, ConfigError> {
        url::Url::parse(&self.endpoint)
            .map_err(|error| ConfigError::Endpoint(self.endpoint.clone(), error))
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            read_deadline: Duration::from_secs(self.upstream_read_deadline_secs),
            backoff: ReconnectionBackoffPolicy {
                backoff_ms_initial: self.reconnect_backoff_base_ms,
                backoff_multiplier: 2,
                backoff_ms_max: self.reconnect_backoff_max_ms,
                jitter: self.reconnect_backoff_jitter,
            },
            batch_window: Duration::from_millis(self.subscription_batch_window_ms),
            empty_linger: Duration::from_secs(self.empty_linger_secs),
            decode_error_threshold: self.decode_error_threshold,
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSection {
    /// Bound on each session's command queue.
    pub command_queue: usize,
    /// Idle bound after which an in-memory session is evicted (final flush
    /// included).
    pub ttl_warm_secs: u64,
    /// Age bound after which a durable snapshot is discarded at rehydrate.
    pub ttl_cold_secs: u64,
    /// Alert log ring bound.
    pub alert_log_cap: usize,
    /// Closed paper trades retained in the snapshot.
    pub closed_trade_cap: usize,
    /// Cadence of the registry's TTL sweep.
    pub sweep_interval_secs: u64,
    /// Cadence of the square-off timer injected into silent sessions.
    pub square_off_poll_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            command_queue: 1_024,
            ttl_warm_secs: 8 * 60 * 60,
            ttl_cold_secs: 7 * 24 * 60 * 60,
            alert_log_cap: 500,
            closed_trade_cap: 100,
            sweep_interval_secs: 60,
            square_off_poll_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceSection {
    /// Snapshot directory of the file-backed store.
    pub dir: PathBuf,
    /// Maximum snapshot staleness before the flush worker writes.
    pub flush_interval_ms: u64,
    /// Consecutive flush failures tolerated before a session is flagged.
    pub failure_threshold: u32,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./snapshots"),
            flush_interval_ms: 5_000,
            failure_threshold: 10,
        }
    }
}

impl PersistenceSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MarketSection {
    pub timezone: Tz,
    #[serde(with = "hhmm")]
    pub square_off_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub square_off_end: NaiveTime,
}

impl Default for MarketSection {
    fn default() -> Self {
        let calendar = MarketCalendar::default();
        Self {
            timezone: calendar.timezone,
            square_off_start: calendar.square_off_start,
            square_off_end: calendar.square_off_end,
        }
    }
}

impl MarketSection {
    pub fn calendar(&self) -> MarketCalendar {
        MarketCalendar {
            timezone: self.timezone,
            square_off_start: self.square_off_start,
            square_off_end: self.square_off_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PaperSection {
    /// Fraction of virtual balance a single trade may use.
    pub per_trade_cap: Decimal,
    /// Balance granted to a fresh session.
    pub starting_balance: Decimal,
    /// Permit size-weighted averaging into an existing open trade.
    pub allow_averaging: bool,
    /// Treat HIGH/LOW touches as breakouts instead of mean-reversion.
    pub breakout_entries: bool,
    /// Close open trades inside the square-off window.
    pub auto_square_off: bool,
}

impl Default for PaperSection {
    fn default() -> Self {
        Self {
            per_trade_cap: Decimal::ONE,
            starting_balance: Decimal::from(100_000),
            allow_averaging: false,
            breakout_entries: false,
            auto_square_off: true,
        }
    }
}

/// `"HH:MM"` (de)serialisation for [`NaiveTime`] config fields.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.channel_send_queue, 256);
        assert_eq!(config.session.command_queue, 1_024);
        assert_eq!(config.persistence.flush_interval(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_partial_config_overrides() {
        let raw = r#"
            [server]
            heartbeat_interval_ms = 2000

            [market]
            timezone = "Asia/Kolkata"
            square_off_start = "15:00"
            square_off_end = "15:30"

            [paper]
            per_trade_cap = "0.5"
            allow_averaging = true
        "#;

        let config = Config::from_toml_str(raw).unwrap();
        assert_eq!(config.server.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(
            config.market.square_off_start,
            NaiveTime::from_hms_opt(15, 0, 0).unwrap()
        );
        assert_eq!(config.paper.per_trade_cap, Decimal::new(5, 1));
        assert!(config.paper.allow_averaging);
        // Untouched sections keep their defaults
        assert_eq!(config.feed, FeedSection::default());
    }
}
