//! Configuration structures for the clock.
//!
//! Supports TOML deserialization with defaults that work for tests and
//! interactive use, and explicit tuning for the spinning strategies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level clock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Synchronization strategy used to advance components.
    pub strategy: StrategyKind,

    /// How long the driver waits for one cycle of component work before
    /// declaring a stall. `None` waits forever.
    #[serde(with = "humantime_serde_opt")]
    pub stall_timeout: Option<Duration>,

    /// What to do when a component faults.
    pub fault_policy: FaultPolicy,

    /// Maximum number of fault records retained.
    pub fault_history: usize,

    /// Worker thread configuration.
    pub threads: ThreadConfig,

    /// Spin and hybrid strategy tuning.
    pub spin: SpinConfig,

    /// Fiber strategy configuration.
    pub fiber: FiberConfig,

    /// Cycle latency metrics configuration.
    pub metrics: MetricsConfig,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            stall_timeout: None,
            fault_policy: FaultPolicy::default(),
            fault_history: 64,
            threads: ThreadConfig::default(),
            spin: SpinConfig::default(),
            fiber: FiberConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Available synchronization strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Token passed between threads through a mutex and per-component condvars.
    #[default]
    Handoff,
    /// Token passed through an atomic turn word with park/unpark wakeups.
    Parked,
    /// All components run in parallel, gated by a reusable barrier.
    Barrier,
    /// Token passing with busy-wait spinning.
    Spin,
    /// Token passing with cooperative `yield_now` between checks.
    Yield,
    /// Spin for a bounded number of iterations, then park.
    Hybrid,
    /// All components run as stackful coroutines on the driver thread.
    Fiber,
}

impl StrategyKind {
    /// Every selectable strategy, in declaration order.
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::Handoff,
        StrategyKind::Parked,
        StrategyKind::Barrier,
        StrategyKind::Spin,
        StrategyKind::Yield,
        StrategyKind::Hybrid,
        StrategyKind::Fiber,
    ];

    /// Configuration name of the strategy.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handoff => "handoff",
            Self::Parked => "parked",
            Self::Barrier => "barrier",
            Self::Spin => "spin",
            Self::Yield => "yield",
            Self::Hybrid => "hybrid",
            Self::Fiber => "fiber",
        }
    }

    /// Whether components of this strategy run truly in parallel.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Barrier)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownStrategy(s.to_string()))
    }
}

/// Policy for handling component faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Retire the faulted component and keep the clock running.
    #[default]
    Isolate,
    /// Finish the current cycle, then fail the run with the fault.
    Abort,
}

/// Worker thread configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Prefix for worker thread names.
    pub name_prefix: String,

    /// Stack size for worker threads in bytes.
    pub stack_size: usize,

    /// CPU affinity for worker threads.
    pub cpu_affinity: CpuAffinity,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name_prefix: String::from("lockstep"),
            stack_size: 2 * 1024 * 1024, // 2 MiB
            cpu_affinity: CpuAffinity::None,
        }
    }
}

/// Spin strategy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    /// Hybrid strategy: spin iterations before falling back to parking.
    pub spin_limit: u32,

    /// Spin iterations between reads of the stall clock.
    pub stall_check_interval: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            spin_limit: 128,
            stall_check_interval: 4096,
        }
    }
}

/// Fiber strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Stack size for each fiber in bytes.
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: 256 * 1024, // 256 KiB
        }
    }
}

/// CPU affinity specification for worker threads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin every worker to a single CPU core.
    Single(usize),
    /// Distribute workers round-robin over a set of cores.
    Set(Vec<usize>),
}

impl CpuAffinity {
    /// CPU assigned to the `index`-th worker, if any.
    #[must_use]
    pub fn cpu_for(&self, index: usize) -> Option<usize> {
        match self {
            CpuAffinity::None => None,
            CpuAffinity::Single(cpu) => Some(*cpu),
            CpuAffinity::Set(cpus) if cpus.is_empty() => None,
            CpuAffinity::Set(cpus) => Some(cpus[index % cpus.len()]),
        }
    }
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("\"none\", an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value.eq_ignore_ascii_case("none") {
                    Ok(CpuAffinity::None)
                } else {
                    Err(de::Error::custom(format!("unknown affinity '{value}'")))
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

/// Per-cycle metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable per-cycle latency collection.
    pub enabled: bool,

    /// Most recent cycles kept for latency percentiles.
    pub window: usize,

    /// Wall-clock time above which a cycle counts as slow.
    #[serde(with = "humantime_serde")]
    pub slow_cycle: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 10_000,
            slow_cycle: Duration::from_millis(1),
        }
    }
}

impl ClockConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Strategy name not recognised.
    #[error("unknown strategy '{0}' (expected one of handoff, parked, barrier, spin, yield, hybrid, fiber)")]
    UnknownStrategy(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Optional humantime durations; `"none"` and a missing key both mean `None`.
mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_str("none"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        humantime::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
