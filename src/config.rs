//! Channel and relay configuration.
//!
//! Configuration is immutable once a channel is built; channels hold it behind
//! an `Arc` and read it without locking.

use crate::compression::Compression;
use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Replica confirmation required before a flush counts as successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum RequiredAcks {
    /// Fire-and-forget.
    None,
    /// The partition leader (or queue broker) confirms.
    Leader,
    /// Every in-sync replica confirms.
    #[default]
    All,
}

impl FromStr for RequiredAcks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(RequiredAcks::None),
            "leader" | "one" | "1" => Ok(RequiredAcks::Leader),
            "all" | "-1" => Ok(RequiredAcks::All),
            other => Err(format!("unknown acks level {}", other)),
        }
    }
}

/// How a consume channel advances its durable cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitStrategy {
    /// Commit synchronously on every `commit` call.
    PerRecord,
    /// Commit the highest contiguous processed position every `commit_interval`.
    #[default]
    Interval,
}

impl FromStr for CommitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "record" | "per-record" | "immediate" => Ok(CommitStrategy::PerRecord),
            "interval" => Ok(CommitStrategy::Interval),
            other => Err(format!("unknown commit strategy {}", other)),
        }
    }
}

/// Where a consumer group starts on a partition with no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
}

impl FromStr for StartOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "first" => Ok(StartOffset::Earliest),
            "latest" | "last" => Ok(StartOffset::Latest),
            other => Err(format!("unknown start offset {}", other)),
        }
    }
}

/// Capability shape of the bus behind a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusKind {
    #[default]
    Log,
    Queue,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" | "kafka" => Ok(BusKind::Log),
            "queue" | "amqp" | "rabbitmq" => Ok(BusKind::Queue),
            other => Err(format!("unknown bus kind {}", other)),
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Log => f.write_str("log"),
            BusKind::Queue => f.write_str("queue"),
        }
    }
}

/// Settings for one publish or consume channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Broker address(es); the first reachable one is used.
    pub brokers: Vec<String>,
    /// Topic (log bus) or queue name (queue bus).
    pub topic: String,
    /// Consumer group id (log bus only).
    pub group_id: String,

    pub batch_size: usize,
    pub batch_bytes: usize,
    pub batch_linger: Duration,
    pub compression: Compression,
    pub required_acks: RequiredAcks,
    /// Return from `send` on enqueue instead of on acknowledgement.
    pub async_send: bool,
    /// Total attempts per batch, first try included.
    pub max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Bound on a single bus request.
    pub io_timeout: Duration,
    /// Records accepted by `send` but not yet batched.
    pub queue_capacity: usize,

    pub fetch_min_bytes: usize,
    pub fetch_max_bytes: usize,
    pub fetch_max_records: usize,
    /// Longest a single poll waits for `fetch_min_bytes`.
    pub max_wait: Duration,
    pub commit_strategy: CommitStrategy,
    pub commit_interval: Duration,
    pub rebalance_timeout: Duration,
    pub start_offset: StartOffset,

    pub drain_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".to_string()],
            topic: "weather-topic".to_string(),
            group_id: "weather-consumer-group".to_string(),
            batch_size: 100,
            batch_bytes: 1024 * 1024,
            batch_linger: Duration::from_millis(200),
            compression: Compression::Lz4,
            required_acks: RequiredAcks::All,
            async_send: false,
            max_attempts: 5,
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            io_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
            fetch_min_bytes: 10_000,
            fetch_max_bytes: 10_000_000,
            fetch_max_records: 500,
            max_wait: Duration::from_secs(1),
            commit_strategy: CommitStrategy::Interval,
            commit_interval: Duration::from_secs(1),
            rebalance_timeout: Duration::from_secs(5),
            start_offset: StartOffset::Latest,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Empty("brokers"));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Empty("topic"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.batch_bytes == 0 {
            return Err(ConfigError::Zero("batch_bytes"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.fetch_max_records == 0 {
            return Err(ConfigError::Zero("fetch_max_records"));
        }
        if self.commit_interval.is_zero() {
            return Err(ConfigError::Zero("commit_interval"));
        }
        if self.backoff_max.is_zero() {
            return Err(ConfigError::Zero("backoff_max"));
        }
        if self.backoff_min > self.backoff_max {
            return Err(ConfigError::BackoffRange {
                min: self.backoff_min,
                max: self.backoff_max,
            });
        }
        Ok(())
    }

    /// Load from `<prefix>_*` environment variables on top of the defaults.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Like [`ChannelConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup { prefix, lookup: &lookup };
        let mut c = Self::default();

        if let Some(raw) = env.get("BROKERS") {
            c.brokers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(topic) = env.get("TOPIC") {
            c.topic = topic;
        }
        if let Some(group) = env.get("GROUP_ID") {
            c.group_id = group;
        }
        env.parse("BATCH_SIZE", &mut c.batch_size)?;
        env.parse("BATCH_BYTES", &mut c.batch_bytes)?;
        env.millis("BATCH_LINGER_MS", &mut c.batch_linger)?;
        env.parse("COMPRESSION", &mut c.compression)?;
        env.parse("REQUIRED_ACKS", &mut c.required_acks)?;
        env.flag("ASYNC", &mut c.async_send)?;
        env.parse("MAX_ATTEMPTS", &mut c.max_attempts)?;
        env.millis("BACKOFF_MIN_MS", &mut c.backoff_min)?;
        env.millis("BACKOFF_MAX_MS", &mut c.backoff_max)?;
        env.millis("IO_TIMEOUT_MS", &mut c.io_timeout)?;
        env.parse("QUEUE_CAPACITY", &mut c.queue_capacity)?;
        env.parse("FETCH_MIN_BYTES", &mut c.fetch_min_bytes)?;
        env.parse("FETCH_MAX_BYTES", &mut c.fetch_max_bytes)?;
        env.parse("FETCH_MAX_RECORDS", &mut c.fetch_max_records)?;
        env.millis("MAX_WAIT_MS", &mut c.max_wait)?;
        env.parse("COMMIT_STRATEGY", &mut c.commit_strategy)?;
        env.millis("COMMIT_INTERVAL_MS", &mut c.commit_interval)?;
        env.millis("REBALANCE_TIMEOUT_MS", &mut c.rebalance_timeout)?;
        env.parse("START_OFFSET", &mut c.start_offset)?;
        env.millis("DRAIN_TIMEOUT_MS", &mut c.drain_timeout)?;

        c.validate()?;
        Ok(c)
    }
}

/// One fan-out destination of the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationConfig {
    pub name: String,
    pub bus: BusKind,
    pub channel: ChannelConfig,
}

/// Process-level relay settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub destinations: Vec<DestinationConfig>,
    /// Bound on the whole shutdown sequence.
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            destinations: vec![DestinationConfig {
                name: "log".to_string(),
                bus: BusKind::Log,
                channel: ChannelConfig::default(),
            }],
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl RelayConfig {
    /// Reads `RELAY_DESTINATIONS`, `RELAY_<NAME>_BUS`, `RELAY_<NAME>_*` and
    /// `RELAY_DRAIN_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let names: Vec<String> = lookup("RELAY_DESTINATIONS")
            .unwrap_or_else(|| "log".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(ConfigError::Empty("RELAY_DESTINATIONS"));
        }

        let mut destinations = Vec::with_capacity(names.len());
        for name in names {
            let prefix = format!("RELAY_{}", name.to_ascii_uppercase().replace('-', "_"));
            let bus_key = format!("{}_BUS", prefix);
            let bus = match lookup(&bus_key) {
                Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: bus_key.clone(),
                    value: raw,
                })?,
                None => name.parse().unwrap_or_default(),
            };
            let channel = ChannelConfig::from_lookup(&prefix, &lookup)?;
            destinations.push(DestinationConfig { name, bus, channel });
        }

        let mut drain_timeout = Duration::from_secs(2);
        Lookup {
            prefix: "RELAY",
            lookup: &lookup,
        }
        .millis("DRAIN_TIMEOUT_MS", &mut drain_timeout)?;

        Ok(Self {
            destinations,
            drain_timeout,
        })
    }
}

struct Lookup<'a, F> {
    prefix: &'a str,
    lookup: &'a F,
}

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&self.key(name)).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(raw) = self.get(name) {
            *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: self.key(name),
                value: raw,
            })?;
        }
        Ok(())
    }

    fn millis(&self, name: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = slot.as_millis() as u64;
        self.parse(name, &mut ms)?;
        *slot = Duration::from_millis(ms);
        Ok(())
    }

    fn flag(&self, name: &str, slot: &mut bool) -> Result<(), ConfigError> {
        if let Some(raw) = self.get(name) {
            *slot = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: self.key(name),
                        value: raw,
                    })
                }
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let c = ChannelConfig::default();
        c.validate().unwrap();
        assert_eq!(c.fetch_min_bytes, 10_000);
        assert_eq!(c.fetch_max_bytes, 10_000_000);
        assert_eq!(c.max_wait, Duration::from_secs(1));
        assert_eq!(c.commit_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_inverted_backoff_and_zero_batch() {
        let c = ChannelConfig {
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::BackoffRange { .. })));

        let c = ChannelConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::Zero("batch_size")));
    }

    #[test]
    fn zero_backoff_ceiling_is_rejected() {
        let env = vars(&[("K_BACKOFF_MIN_MS", "0"), ("K_BACKOFF_MAX_MS", "0")]);
        let err = ChannelConfig::from_lookup("K", |k| env.get(k).cloned()).unwrap_err();
        assert_eq!(err, ConfigError::Zero("backoff_max"));

        // a zero floor is fine: the delay still grows towards the ceiling
        let c = ChannelConfig {
            backoff_min: Duration::ZERO,
            ..Default::default()
        };
        c.validate().unwrap();
    }

    #[test]
    fn reads_prefixed_keys() {
        let env = vars(&[
            ("K_BROKERS", "a:1, b:2"),
            ("K_TOPIC", "t"),
            ("K_BATCH_SIZE", "7"),
            ("K_REQUIRED_ACKS", "leader"),
            ("K_COMPRESSION", "gzip"),
            ("K_ASYNC", "true"),
            ("K_COMMIT_STRATEGY", "record"),
            ("K_BACKOFF_MIN_MS", "5"),
            ("K_BACKOFF_MAX_MS", "50"),
        ]);
        let c = ChannelConfig::from_lookup("K", |k| env.get(k).cloned()).unwrap();
        assert_eq!(c.brokers, vec!["a:1".to_string(), "b:2".to_string()]);
        assert_eq!(c.topic, "t");
        assert_eq!(c.batch_size, 7);
        assert_eq!(c.required_acks, RequiredAcks::Leader);
        assert_eq!(c.compression, Compression::Gzip);
        assert!(c.async_send);
        assert_eq!(c.commit_strategy, CommitStrategy::PerRecord);
        assert_eq!(c.backoff_min, Duration::from_millis(5));
    }

    #[test]
    fn bad_value_names_the_key() {
        let env = vars(&[("K_MAX_ATTEMPTS", "many")]);
        let err = ChannelConfig::from_lookup("K", |k| env.get(k).cloned()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "K_MAX_ATTEMPTS".into(),
                value: "many".into()
            }
        );
    }

    #[test]
    fn relay_destinations_from_env() {
        let env = vars(&[
            ("RELAY_DESTINATIONS", "kafka,rabbit"),
            ("RELAY_RABBIT_BUS", "queue"),
            ("RELAY_RABBIT_TOPIC", "weather_queue"),
            ("RELAY_DRAIN_TIMEOUT_MS", "750"),
        ]);
        let c = RelayConfig::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(c.destinations.len(), 2);
        assert_eq!(c.destinations[0].bus, BusKind::Log);
        assert_eq!(c.destinations[1].bus, BusKind::Queue);
        assert_eq!(c.destinations[1].channel.topic, "weather_queue");
        assert_eq!(c.drain_timeout, Duration::from_millis(750));
    }

    #[test]
    fn acks_aliases() {
        assert_eq!("-1".parse::<RequiredAcks>().unwrap(), RequiredAcks::All);
        assert_eq!("0".parse::<RequiredAcks>().unwrap(), RequiredAcks::None);
        assert!("most".parse::<RequiredAcks>().is_err());
    }
}
