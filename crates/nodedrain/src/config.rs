//! Drainer configuration.
//!
//! Loaded from the `[drainer]` table of a TOML file. Every field has a
//! default, so an empty (or absent) table yields [`DrainerConfig::default`].
//! Durations are written as humane strings: `"1s"`, `"500ms"`, `"2m"`.
//!
//! ```toml
//! [drainer]
//! state_queries_per_second = 100.0
//! state_query_burst = 100
//! batch_update_interval = "1s"
//! node_deadline_coalesce_window = "5s"
//! state_read_error_delay = "1s"
//! max_ids_per_txn = 7281
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Raft entries are capped at 256 KiB; each id is a 36-byte UUID.
const DEFAULT_MAX_IDS_PER_TXN: usize = (256 * 1024) / 36;

/// Slowest accepted state query rate: one query every 1000 seconds.
pub const MIN_STATE_QUERY_RATE: f64 = 0.001;

/// Longest accepted value of any duration setting.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainerConfig {
    /// Sustained rate of state-store blocking queries across all watchers.
    pub state_queries_per_second: f64,
    /// Burst allowance of the query rate limiter.
    pub state_query_burst: u32,
    /// How long allocation transitions are accumulated before one commit.
    #[serde(with = "humane_duration")]
    pub batch_update_interval: Duration,
    /// Deadlines within this window of the earliest one fire together.
    #[serde(with = "humane_duration")]
    pub node_deadline_coalesce_window: Duration,
    /// Back-off after a failed state read.
    #[serde(with = "humane_duration")]
    pub state_read_error_delay: Duration,
    /// Upper bound on allocation plus evaluation ids in one log entry.
    pub max_ids_per_txn: usize,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            state_queries_per_second: 100.0,
            state_query_burst: 100,
            batch_update_interval: Duration::from_secs(1),
            node_deadline_coalesce_window: Duration::from_secs(5),
            state_read_error_delay: Duration::from_secs(1),
            max_ids_per_txn: DEFAULT_MAX_IDS_PER_TXN,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    drainer: DrainerConfig,
}

impl DrainerConfig {
    /// Parse the `[drainer]` table out of a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.drainer.validate()?;
        Ok(file.drainer)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.state_queries_per_second;
        if !(rate.is_finite() && rate >= MIN_STATE_QUERY_RATE) {
            return Err(ConfigError::Invalid {
                field: "state_queries_per_second",
                reason: format!("must be a finite rate of at least {MIN_STATE_QUERY_RATE}, got {rate}"),
            });
        }
        if self.state_query_burst == 0 {
            return Err(invalid("state_query_burst", "must be at least 1"));
        }
        if self.batch_update_interval.is_zero() {
            return Err(invalid("batch_update_interval", "must be non-zero"));
        }
        if self.state_read_error_delay.is_zero() {
            return Err(invalid("state_read_error_delay", "must be non-zero"));
        }
        if self.max_ids_per_txn == 0 {
            return Err(invalid("max_ids_per_txn", "must be at least 1"));
        }
        for (field, value) in [
            ("batch_update_interval", self.batch_update_interval),
            ("node_deadline_coalesce_window", self.node_deadline_coalesce_window),
            ("state_read_error_delay", self.state_read_error_delay),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must be at most {}", format_duration(MAX_DURATION)),
                });
            }
        }
        Ok(())
    }

    pub fn with_state_query_rate(mut self, per_second: f64, burst: u32) -> Self {
        self.state_queries_per_second = per_second;
        self.state_query_burst = burst;
        self
    }

    pub fn with_batch_update_interval(mut self, interval: Duration) -> Self {
        self.batch_update_interval = interval;
        self
    }

    pub fn with_node_deadline_coalesce_window(mut self, window: Duration) -> Self {
        self.node_deadline_coalesce_window = window;
        self
    }

    pub fn with_state_read_error_delay(mut self, delay: Duration) -> Self {
        self.state_read_error_delay = delay;
        self
    }

    pub fn with_max_ids_per_txn(mut self, max_ids: usize) -> Self {
        self.max_ids_per_txn = max_ids;
        self
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Parse a duration string like "5s", "500ms", "1m". Plain numbers are seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Serde adapter for durations written as humane strings.
mod humane_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s)
            .ok_or_else(|| de::Error::custom(format!("invalid duration {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_drainer_constants() {
        let config = DrainerConfig::default();
        assert_eq!(config.state_queries_per_second, 100.0);
        assert_eq!(config.state_query_burst, 100);
        assert_eq!(config.batch_update_interval, Duration::from_secs(1));
        assert_eq!(config.node_deadline_coalesce_window, Duration::from_secs(5));
        assert_eq!(config.state_read_error_delay, Duration::from_secs(1));
        assert_eq!(config.max_ids_per_txn, 7281);
        config.validate().unwrap();
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = DrainerConfig::from_toml_str("").unwrap();
        assert_eq!(config, DrainerConfig::default());
    }

    #[test]
    fn parse_partial_drainer_table() {
        let config = DrainerConfig::from_toml_str(
            r#"
[drainer]
batch_update_interval = "250ms"
node_deadline_coalesce_window = "10s"
state_query_burst = 20
"#,
        )
        .unwrap();
        assert_eq!(config.batch_update_interval, Duration::from_millis(250));
        assert_eq!(config.node_deadline_coalesce_window, Duration::from_secs(10));
        assert_eq!(config.state_query_burst, 20);
        assert_eq!(config.state_queries_per_second, 100.0);
    }

    #[test]
    fn rejects_bad_duration_string() {
        let err = DrainerConfig::from_toml_str(
            r#"
[drainer]
batch_update_interval = "soon"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_zero_rate() {
        let err = DrainerConfig::from_toml_str(
            r#"
[drainer]
state_queries_per_second = 0.0
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "state_queries_per_second",
                ..
            }
        ));
    }

    #[test]
    fn rejects_rate_too_small_to_schedule() {
        let err = DrainerConfig::default()
            .with_state_query_rate(1e-12, 1)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "state_queries_per_second",
                ..
            }
        ));
        DrainerConfig::default()
            .with_state_query_rate(MIN_STATE_QUERY_RATE, 1)
            .validate()
            .unwrap();
    }

    #[test]
    fn rejects_durations_beyond_a_day() {
        let err = DrainerConfig::from_toml_str(
            r#"
[drainer]
node_deadline_coalesce_window = "18446744073709551615s"
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "node_deadline_coalesce_window",
                ..
            }
        ));

        let err = DrainerConfig::default()
            .with_batch_update_interval(MAX_DURATION + Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "batch_update_interval",
                ..
            }
        ));
        DrainerConfig::default()
            .with_state_read_error_delay(MAX_DURATION)
            .validate()
            .unwrap();
    }

    #[test]
    fn zero_coalesce_window_is_allowed() {
        let config = DrainerConfig::default().with_node_deadline_coalesce_window(Duration::ZERO);
        config.validate().unwrap();
    }

    #[test]
    fn toml_roundtrip_keeps_humane_durations() {
        let config = DrainerConfig::default().with_batch_update_interval(Duration::from_millis(1500));
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("batch_update_interval = \"1500ms\""));
        assert!(text.contains("node_deadline_coalesce_window = \"5s\""));
        let parsed: DrainerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn from_file_reads_drainer_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drainer.toml");
        std::fs::write(&path, "[drainer]\nmax_ids_per_txn = 10\n").unwrap();
        let config = DrainerConfig::from_file(&path).unwrap();
        assert_eq!(config.max_ids_per_txn, 10);

        let missing = DrainerConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn parse_duration_rejects_overflowing_minutes() {
        assert_eq!(parse_duration("18446744073709551615m"), None);
        assert_eq!(
            parse_duration("307445734561825860m"),
            Some(Duration::from_secs(307_445_734_561_825_860 * 60))
        );
    }
}
