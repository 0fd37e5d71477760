//! Pipeline configuration.
//!
//! A [`FlowConfig`] is loaded once from TOML and then handed to the
//! [`PipelineContext`](crate::stage::PipelineContext). Every section has
//! defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! pipeline = "station-feed"
//!
//! [parameters]
//! observation.id = 4711
//! subbands = 8
//!
//! [[links]]
//! name = "beams"
//! [links.channel]
//! backend = "memory"
//! name = "beams"
//! capacity = 4
//!
//! [ring]
//! mode = "wall_clock"
//! capacity = 65536
//! block_len = 4096
//!
//! [sink]
//! buffers = 3
//! max_wait_ms = 50
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FlowError, FlowResult};

/// Default number of frames a memory link queues per direction.
pub const DEFAULT_MEMORY_CAPACITY: usize = 8;

/// Default size of a shared-memory segment that has to be attached.
pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// What the reader of a wall-clock gated ring does with data that never
/// arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    /// Report the missing window and carry on.
    #[default]
    Tolerate,
    /// Turn a missing window into [`FlowError::MissingData`].
    Fatal,
}

/// Backend selection for one link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// In-process pair, rendezvous by name.
    Memory {
        name: String,
        #[serde(default = "default_memory_capacity")]
        capacity: usize,
        #[serde(default)]
        blocking: bool,
    },
    /// Bands of a named shared-memory segment.
    Shm {
        segment: String,
        #[serde(default = "default_segment_size")]
        segment_size: usize,
        #[serde(default)]
        tx_band: Option<u32>,
        #[serde(default)]
        rx_band: Option<u32>,
        #[serde(default)]
        blocking: bool,
    },
    /// TCP; `listen` accepts one inbound connection instead of connecting.
    Socket {
        address: String,
        #[serde(default)]
        listen: bool,
        #[serde(default)]
        blocking: bool,
    },
    /// Point-to-point view onto the cluster fabric.
    Cluster {
        peer: usize,
        #[serde(default)]
        tag: u32,
        #[serde(default)]
        blocking: bool,
    },
}

impl ChannelConfig {
    pub fn is_blocking(&self) -> bool {
        match self {
            ChannelConfig::Memory { blocking, .. }
            | ChannelConfig::Shm { blocking, .. }
            | ChannelConfig::Socket { blocking, .. }
            | ChannelConfig::Cluster { blocking, .. } => *blocking,
        }
    }
}

fn default_memory_capacity() -> usize {
    DEFAULT_MEMORY_CAPACITY
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// The writer waits for room; nothing is ever dropped.
    #[default]
    Bounded,
    /// The reader is paced by the wall clock; late data is dropped.
    WallClock,
}

/// Real-time ring parameters. Times are in stream units (samples).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub mode: SyncMode,
    /// Span of time the ring holds.
    pub capacity: i64,
    /// Span of time per slot.
    pub block_len: i64,
    /// Stream units per wall-clock second, used by the wall-clock mode.
    pub units_per_second: f64,
    /// Allowance added to a window's end before the reader stops waiting.
    pub max_network_delay_ms: u64,
    pub missing_data: MissingDataPolicy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Bounded,
            capacity: 16 * 1024,
            block_len: 1024,
            units_per_second: 195_312.5,
            max_network_delay_ms: 250,
            missing_data: MissingDataPolicy::Tolerate,
        }
    }
}

impl RingConfig {
    pub fn max_network_delay(&self) -> Duration {
        Duration::from_millis(self.max_network_delay_ms)
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.block_len <= 0 || self.capacity <= 0 {
            return Err(FlowError::Config("ring capacity and block_len must be positive".into()));
        }
        if self.capacity % self.block_len != 0 {
            return Err(FlowError::Config(format!(
                "ring capacity {} is not a multiple of block_len {}",
                self.capacity, self.block_len
            )));
        }
        if self.mode == SyncMode::WallClock && (self.units_per_second.is_nan() || self.units_per_second <= 0.0) {
            return Err(FlowError::Config("wall-clock mode needs units_per_second > 0".into()));
        }
        Ok(())
    }
}

/// Double-buffered output sink parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Preallocated buffers shared by producer and worker.
    pub buffers: usize,
    /// Longest a producer waits for a free buffer before dropping.
    pub max_wait_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffers: 2,
            max_wait_ms: 100,
        }
    }
}

impl SinkConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub pipeline: String,
    /// `tracing` filter directive, e.g. `"rtflow=debug"`.
    pub log_filter: Option<String>,
    pub parameters: toml::Table,
    pub links: Vec<LinkConfig>,
    pub ring: RingConfig,
    pub sink: SinkConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pipeline: "pipeline".to_string(),
            log_filter: None,
            parameters: toml::Table::new(),
            links: Vec::new(),
            ring: RingConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

impl FlowConfig {
    pub fn from_toml_str(text: &str) -> FlowResult<Self> {
        let config: FlowConfig =
            toml::from_str(text).map_err(|e| FlowError::Config(format!("invalid configuration: {e}")))?;
        config.ring.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn link(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn parameter_set(&self) -> ParameterSet {
        ParameterSet::from_table(&self.parameters)
    }
}

/// Flat key→value parameters with typed getters. Nested TOML tables become
/// dotted keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    values: BTreeMap<String, String>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &toml::Table) -> Self {
        let mut set = Self::new();
        set.flatten("", table);
        set
    }

    fn flatten(&mut self, prefix: &str, table: &toml::Table) {
        for (key, value) in table {
            let full = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match value {
                toml::Value::Table(inner) => self.flatten(&full, inner),
                toml::Value::String(s) => {
                    self.values.insert(full, s.clone());
                }
                other => {
                    self.values.insert(full, other.to_string());
                }
            }
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Typed lookup; a missing key or unparsable value is a config error.
    pub fn get<T: FromStr>(&self, key: &str) -> FlowResult<T>
    where
        T::Err: std::fmt::Display,
    {
        let raw = self
            .raw(key)
            .ok_or_else(|| FlowError::Config(format!("missing parameter '{key}'")))?;
        raw.parse()
            .map_err(|e| FlowError::Config(format!("parameter '{key}' = '{raw}': {e}")))
    }

    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.raw(key).and_then(|raw| raw.parse().ok()).unwrap_or(default)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
