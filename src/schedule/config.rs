//! Cycle configuration
//!
//! `CycleConfig` is built once at startup, from defaults, an optional TOML
//! file, and command-line overrides, and validated before the scheduler
//! starts. Durations in the file are humantime strings (`"1m"`, `"600ms"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::CyclePhase;

/// Invalid or unusable configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        /// File that was requested
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// `subdivisions` was zero
    #[error("subdivisions must be at least 1")]
    ZeroSubdivisions,

    /// `period / subdivisions` rounds down to nothing
    #[error("period {period:?} split into {subdivisions} sub-ticks leaves no time per sub-tick")]
    ZeroSubTick {
        /// Configured period
        period: Duration,
        /// Configured subdivisions
        subdivisions: u32,
    },

    /// The interface name was blank
    #[error("interface name cannot be empty")]
    EmptyInterface,

    /// A latency value was blank
    #[error("{0} latency cannot be empty")]
    EmptyLatency(CyclePhase),

    /// A script file does not exist on disk
    #[error("script file doesn't exist: {}", .0.display())]
    MissingScript(PathBuf),

    /// A script exists but cannot be run
    #[error("script {} cannot be resolved to an executable: {reason}", .path.display())]
    Unresolvable {
        /// Script as configured
        path: PathBuf,
        /// Why resolution failed
        reason: String,
    },
}

/// The three external scripts the agent drives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptPaths {
    /// Applies a latency profile: `apply <interface> <latency>`
    pub apply: String,
    /// Removes the current profile: `teardown <interface>`
    pub teardown: String,
    /// Prints the interface's current configuration: `inspect <interface>`
    pub inspect: String,
}

impl Default for ScriptPaths {
    fn default() -> Self {
        Self {
            apply: "./configure_tc_qdisc_netem.bash".to_string(),
            teardown: "./stop.bash".to_string(),
            inspect: "./show.bash".to_string(),
        }
    }
}

impl ScriptPaths {
    /// Apply, teardown and inspect, in that order
    #[must_use]
    pub fn all(&self) -> [&str; 3] {
        [&self.apply, &self.teardown, &self.inspect]
    }
}

/// Everything the scheduler needs, fixed for the life of the process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CycleConfig {
    /// Duration of one full flip+flop period
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Number of sub-ticks each period is split into
    pub subdivisions: u32,
    /// Interface passed to every script
    pub interface: String,
    /// Latency applied in the flip phase
    pub flip_latency: String,
    /// Latency applied in the flop phase
    pub flop_latency: String,
    /// Hard deadline for each script invocation
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Pause after teardown before the next profile is applied
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Run the inspect script around transitions and log every sub-tick.
    /// On unless turned off.
    pub diagnostics: bool,
    /// Tag prefixed to progress lines, to tell instances apart in logs
    pub tag: String,
    /// Script locations
    pub scripts: ScriptPaths,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            subdivisions: 6,
            interface: "eth0".to_string(),
            flip_latency: "100ms".to_string(),
            flop_latency: "600ms".to_string(),
            command_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_secs(10),
            diagnostics: true,
            tag: "flipper".to_string(),
            scripts: ScriptPaths::default(),
        }
    }
}

impl CycleConfig {
    /// Parse a TOML config file from a path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse TOML content; missing keys take their defaults
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the scheduler relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subdivisions == 0 {
            return Err(ConfigError::ZeroSubdivisions);
        }
        if self.sub_tick_duration().is_zero() {
            return Err(ConfigError::ZeroSubTick {
                period: self.period,
                subdivisions: self.subdivisions,
            });
        }
        if self.interface.trim().is_empty() {
            return Err(ConfigError::EmptyInterface);
        }
        for phase in [CyclePhase::Flip, CyclePhase::Flop] {
            if self.latency_for(phase).trim().is_empty() {
                return Err(ConfigError::EmptyLatency(phase));
            }
        }
        Ok(())
    }

    /// Length of one sub-tick. Zero only if `validate` would fail.
    #[must_use]
    pub fn sub_tick_duration(&self) -> Duration {
        if self.subdivisions == 0 {
            return Duration::ZERO;
        }
        self.period / self.subdivisions
    }

    /// Latency value associated with `phase`
    #[must_use]
    pub fn latency_for(&self, phase: CyclePhase) -> &str {
        match phase {
            CyclePhase::Flip => &self.flip_latency,
            CyclePhase::Flop => &self.flop_latency,
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"
period = "2m"
subdivisions = 4
interface = "enp3s0"
flip_latency = "50ms"
flop_latency = "900ms"
command_timeout = "3s"
settle_delay = "5s"
diagnostics = false
tag = "lab-a"

[scripts]
apply = "/opt/netem/apply.sh"
teardown = "/opt/netem/stop.sh"
inspect = "/opt/netem/show.sh"
"#;

    #[test]
    fn test_defaults_match_shipped_values() {
        let config = CycleConfig::default();
        assert_eq!(config.period, Duration::from_secs(60));
        assert_eq!(config.subdivisions, 6);
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.flip_latency, "100ms");
        assert_eq!(config.flop_latency, "600ms");
        assert_eq!(config.command_timeout, Duration::from_secs(2));
        assert_eq!(config.settle_delay, Duration::from_secs(10));
        assert_eq!(config.scripts.teardown, "./stop.bash");
        assert!(config.diagnostics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = CycleConfig::parse(FULL_CONFIG).unwrap();
        assert_eq!(config.period, Duration::from_secs(120));
        assert_eq!(config.subdivisions, 4);
        assert_eq!(config.interface, "enp3s0");
        assert_eq!(config.command_timeout, Duration::from_secs(3));
        assert_eq!(config.settle_delay, Duration::from_secs(5));
        assert_eq!(config.scripts.apply, "/opt/netem/apply.sh");
        assert!(!config.diagnostics);
        assert_eq!(config.tag, "lab-a");
    }

    #[test]
    fn test_parse_partial_config_keeps_defaults() {
        let config = CycleConfig::parse("interface = \"wlan0\"\n[scripts]\napply = \"a.sh\"\n").unwrap();
        assert_eq!(config.interface, "wlan0");
        assert_eq!(config.scripts.apply, "a.sh");
        assert_eq!(config.scripts.teardown, "./stop.bash");
        assert_eq!(config.period, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_rejects_bad_duration() {
        let err = CycleConfig::parse("period = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        assert!(CycleConfig::parse("frequency = \"1m\"").is_err());
    }

    #[test]
    fn test_reject_zero_subdivisions() {
        let err = CycleConfig::parse("subdivisions = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroSubdivisions));
    }

    #[test]
    fn test_reject_zero_sub_tick() {
        let config = CycleConfig {
            period: Duration::from_nanos(3),
            subdivisions: 6,
            ..CycleConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroSubTick { subdivisions: 6, .. })
        ));
    }

    #[test]
    fn test_reject_empty_interface() {
        let config = CycleConfig {
            interface: "  ".to_string(),
            ..CycleConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyInterface)));
    }

    #[test]
    fn test_reject_empty_latency() {
        let config = CycleConfig {
            flop_latency: String::new(),
            ..CycleConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyLatency(CyclePhase::Flop))
        ));
    }

    #[test]
    fn test_sub_tick_duration() {
        let config = CycleConfig::default();
        assert_eq!(config.sub_tick_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_single_subdivision_uses_whole_period() {
        let config = CycleConfig {
            subdivisions: 1,
            ..CycleConfig::default()
        };
        assert_eq!(config.sub_tick_duration(), config.period);
    }

    #[test]
    fn test_latency_for_phase() {
        let config = CycleConfig::default();
        assert_eq!(config.latency_for(CyclePhase::Flip), "100ms");
        assert_eq!(config.latency_for(CyclePhase::Flop), "600ms");
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = CycleConfig::from_path(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flipflop.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();
        let config = CycleConfig::from_path(&path).unwrap();
        assert_eq!(config.interface, "enp3s0");
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let config = CycleConfig::parse(FULL_CONFIG).unwrap();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(CycleConfig::parse(&text).unwrap(), config);
    }
}
