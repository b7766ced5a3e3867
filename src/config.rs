//! Gateway configuration.
//!
//! Values come from, in increasing precedence:
//! 1. built-in defaults
//! 2. `METER_GATEWAY_*` environment variables
//! 3. a JSON file named by `METER_GATEWAY_CONFIG`
//!
//! Numeric environment values that fail to parse (or are zero) fall back to
//! the default. An unparsable bind address is an error.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backpressure::DEFAULT_MAX_PENDING;
use crate::dispatch::{DispatchConfig, DEFAULT_COMMAND_TIMEOUT};
use crate::error::{GatewayError, Result};
use crate::liveness::{DEFAULT_IDLE_PERIOD, DEFAULT_MAX_MISSED_HEARTBEATS};
use crate::protocol::{DEFAULT_BUFFER_CAPACITY, MAX_PAYLOAD_LEN};
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY};

/// Environment variable naming the JSON override file.
pub const CONFIG_PATH_ENV: &str = "METER_GATEWAY_CONFIG";

const DEFAULT_ACCEPTOR_THREADS: usize = 1;

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP listen address.
    pub bind: SocketAddr,
    /// Number of accept loops on the listener.
    pub acceptor_threads: usize,
    /// Runtime worker threads driving connection I/O.
    pub worker_threads: usize,
    /// Time a command waits for its reply.
    pub command_timeout: Duration,
    /// Global in-flight command budget.
    pub max_pending_commands: usize,
    /// Read-idle period counted by the liveness monitor.
    pub idle_period: Duration,
    /// Idle periods tolerated without a heartbeat.
    pub max_missed_heartbeats: u32,
    /// Largest accepted inbound payload.
    pub max_payload_len: usize,
    /// Per-connection writer queue depth.
    pub writer_channel_capacity: usize,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
            acceptor_threads: DEFAULT_ACCEPTOR_THREADS,
            worker_threads: default_worker_threads(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_pending_commands: DEFAULT_MAX_PENDING,
            idle_period: DEFAULT_IDLE_PERIOD,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            max_payload_len: MAX_PAYLOAD_LEN,
            writer_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_buffer_size: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GatewayConfigOverride {
    bind: Option<String>,
    acceptor_threads: Option<usize>,
    worker_threads: Option<usize>,
    command_timeout_ms: Option<u64>,
    max_pending_commands: Option<usize>,
    idle_period_ms: Option<u64>,
    max_missed_heartbeats: Option<u32>,
    max_payload_len: Option<usize>,
    writer_channel_capacity: Option<usize>,
    read_buffer_size: Option<usize>,
}

impl GatewayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from the environment, then apply the JSON file named by
    /// `METER_GATEWAY_CONFIG` if set.
    pub fn from_env_or_file() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            config.apply_file(&path)?;
        }
        Ok(config)
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |key: &str| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
        };

        let bind = match lookup("METER_GATEWAY_BIND") {
            Some(value) => parse_bind(&value)?,
            None => defaults.bind,
        };

        Ok(Self {
            bind,
            acceptor_threads: number("METER_GATEWAY_ACCEPTOR_THREADS")
                .map_or(defaults.acceptor_threads, |v| v as usize),
            worker_threads: number("METER_GATEWAY_WORKER_THREADS")
                .map_or(defaults.worker_threads, |v| v as usize),
            command_timeout: number("METER_GATEWAY_COMMAND_TIMEOUT_MS")
                .map_or(defaults.command_timeout, Duration::from_millis),
            max_pending_commands: number("METER_GATEWAY_MAX_PENDING_COMMANDS")
                .map_or(defaults.max_pending_commands, |v| v as usize),
            idle_period: number("METER_GATEWAY_IDLE_PERIOD_MS")
                .map_or(defaults.idle_period, Duration::from_millis),
            max_missed_heartbeats: lookup("METER_GATEWAY_MAX_MISSED_HEARTBEATS")
                .and_then(|value| value.trim().parse::<u32>().ok())
                .unwrap_or(defaults.max_missed_heartbeats),
            max_payload_len: number("METER_GATEWAY_MAX_PAYLOAD_LEN")
                .map_or(defaults.max_payload_len, |v| {
                    (v as usize).min(MAX_PAYLOAD_LEN)
                }),
            writer_channel_capacity: number("METER_GATEWAY_WRITER_CHANNEL_CAPACITY")
                .map_or(defaults.writer_channel_capacity, |v| v as usize),
            read_buffer_size: number("METER_GATEWAY_READ_BUFFER_SIZE")
                .map_or(defaults.read_buffer_size, |v| v as usize),
        })
    }

    /// Apply a JSON override file.
    pub fn apply_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("read {}: {}", path.display(), e))
        })?;
        self.apply_json(&contents)
    }

    /// Apply overrides from a JSON document.
    pub fn apply_json(&mut self, json: &str) -> Result<()> {
        let overrides: GatewayConfigOverride = serde_json::from_str(json)?;

        if let Some(value) = overrides.bind {
            self.bind = parse_bind(&value)?;
        }
        if let Some(value) = overrides.acceptor_threads {
            self.acceptor_threads = value;
        }
        if let Some(value) = overrides.worker_threads {
            self.worker_threads = value;
        }
        if let Some(value) = overrides.command_timeout_ms {
            self.command_timeout = Duration::from_millis(value);
        }
        if let Some(value) = overrides.max_pending_commands {
            self.max_pending_commands = value;
        }
        if let Some(value) = overrides.idle_period_ms {
            self.idle_period = Duration::from_millis(value);
        }
        if let Some(value) = overrides.max_missed_heartbeats {
            self.max_missed_heartbeats = value;
        }
        if let Some(value) = overrides.max_payload_len {
            self.max_payload_len = value;
        }
        if let Some(value) = overrides.writer_channel_capacity {
            self.writer_channel_capacity = value;
        }
        if let Some(value) = overrides.read_buffer_size {
            self.read_buffer_size = value;
        }
        self.validate()
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("acceptor_threads", self.acceptor_threads),
            ("worker_threads", self.worker_threads),
            ("writer_channel_capacity", self.writer_channel_capacity),
            ("read_buffer_size", self.read_buffer_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(GatewayError::Config(format!("{} must be positive", name)));
        }
        if self.idle_period.is_zero() {
            return Err(GatewayError::Config("idle_period must be positive".into()));
        }
        if self.command_timeout.is_zero() {
            return Err(GatewayError::Config(
                "command_timeout must be positive".into(),
            ));
        }
        if self.max_payload_len > MAX_PAYLOAD_LEN {
            return Err(GatewayError::Config(format!(
                "max_payload_len {} exceeds {}",
                self.max_payload_len, MAX_PAYLOAD_LEN
            )));
        }
        Ok(())
    }

    /// Settings for the command dispatcher.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            timeout: self.command_timeout,
            max_pending: self.max_pending_commands,
        }
    }

    /// Settings for per-connection writer tasks.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            channel_capacity: self.writer_channel_capacity,
        }
    }
}

fn parse_bind(value: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| GatewayError::Config(format!("parse bind address {:?}: {}", value, e)))
}
