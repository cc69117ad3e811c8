//! Device configuration: consumed by the handler, produced by the (external)
//! topology builder. Mirrors the launcher contract of the reference stack:
//! a JSON document naming the device model, its typed parameters, its fixed
//! upstream/downstream topology with resolved endpoints, and the protocol
//! adapters to start.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::simproto::Guid;

const DEFAULT_TICK_MS: u64 = 1000;
const DEFAULT_FRESHNESS_WINDOW: u32 = 3;
const DEFAULT_GRACE_MS: u64 = 5000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 15_000;

/// One typed device parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    FloatList(Vec<f64>),
}

/// Typed key/value parameter set handed to a model factory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Parameters(pub BTreeMap<String, ParamValue>);

impl Parameters {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn float(&self, name: &'static str) -> Result<f64, ConfigError> {
        match self.get(name) {
            Some(ParamValue::Float(f)) => Ok(*f),
            Some(ParamValue::Int(i)) => Ok(*i as f64),
            Some(_) => Err(ConfigError::InvalidParameter {
                name,
                reason: "expected a number".into(),
            }),
            None => Err(ConfigError::MissingParameter(name)),
        }
    }

    pub fn float_or(&self, name: &'static str, default: f64) -> Result<f64, ConfigError> {
        if self.get(name).is_none() {
            return Ok(default);
        }
        self.float(name)
    }

    pub fn int(&self, name: &'static str) -> Result<i64, ConfigError> {
        match self.get(name) {
            Some(ParamValue::Int(i)) => Ok(*i),
            Some(_) => Err(ConfigError::InvalidParameter {
                name,
                reason: "expected an integer".into(),
            }),
            None => Err(ConfigError::MissingParameter(name)),
        }
    }

    pub fn float_list(&self, name: &'static str) -> Result<Vec<f64>, ConfigError> {
        match self.get(name) {
            Some(ParamValue::FloatList(list)) => Ok(list.clone()),
            // A single number is accepted as a one-element list.
            Some(ParamValue::Float(f)) => Ok(vec![*f]),
            Some(ParamValue::Int(i)) => Ok(vec![*i as f64]),
            Some(_) => Err(ConfigError::InvalidParameter {
                name,
                reason: "expected a list of numbers".into(),
            }),
            None => Err(ConfigError::MissingParameter(name)),
        }
    }
}

/// An upstream neighbor: we dial its simproto endpoint and consume its state.
#[derive(Debug, Clone, Deserialize)]
pub struct Upstream {
    pub guid: Guid,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Scada,
    Status,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub guid: Guid,
    /// Device model tag, resolved against the static model registry.
    pub device: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub upstream: Vec<Upstream>,
    /// Downstream neighbors dial us; only their guids are needed.
    #[serde(default)]
    pub downstream: Vec<Guid>,
    /// simproto listener address for this device.
    pub sim_bind: SocketAddr,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Ticks of peer silence before a PeerState is flagged stale.
    #[serde(default = "default_freshness_window")]
    pub freshness_window: u32,
    /// Shutdown grace period for all owned components.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Upper bound for the peer-dial exponential backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_freshness_window() -> u32 {
    DEFAULT_FRESHNESS_WINDOW
}

fn default_grace_ms() -> u64 {
    DEFAULT_GRACE_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

impl DeviceConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Topology and wiring checks that can be decided from a single device's
    /// configuration. Transitive cycles across the whole graph are only
    /// visible to the topology builder; locally visible ones are rejected
    /// here rather than given simulation semantics.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "tick_ms",
                reason: "tick interval must be at least 1ms".into(),
            });
        }
        if self.freshness_window == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "freshness_window",
                reason: "freshness window must be at least one tick".into(),
            });
        }
        if self.max_backoff_ms == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "max_backoff_ms",
                reason: "reconnect backoff cap must be at least 1ms".into(),
            });
        }
        for guid in self
            .upstream
            .iter()
            .map(|u| u.guid)
            .chain(self.downstream.iter().copied())
        {
            if guid == self.guid {
                return Err(ConfigError::SelfReference { guid });
            }
        }
        for up in &self.upstream {
            if self.downstream.contains(&up.guid) {
                return Err(ConfigError::UpstreamDownstreamOverlap { guid: up.guid });
            }
        }
        let mut seen: HashSet<Guid> = HashSet::new();
        for guid in self
            .upstream
            .iter()
            .map(|u| u.guid)
            .chain(self.downstream.iter().copied())
        {
            if !seen.insert(guid) {
                return Err(ConfigError::DuplicateNeighbor { guid });
            }
        }
        let mut binds: HashSet<SocketAddr> = HashSet::new();
        binds.insert(self.sim_bind);
        for adapter in &self.adapters {
            if !binds.insert(adapter.bind) {
                return Err(ConfigError::DuplicateBind(adapter.bind));
            }
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Wall-clock freshness window: `freshness_window` ticks.
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.tick_ms.saturating_mul(u64::from(self.freshness_window)))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json() -> String {
        r#"{
            "guid": 2,
            "device": "transmission",
            "parameters": {
                "loads": [0.394737, 0.394737, 0.394737],
                "state": 7
            },
            "upstream": [{"guid": 1, "addr": "127.0.0.1:20201"}],
            "downstream": [3],
            "sim_bind": "127.0.0.1:20202",
            "adapters": [
                {"kind": "scada", "bind": "127.0.0.1:8080"},
                {"kind": "status", "bind": "127.0.0.1:8081"}
            ]
        }"#
        .to_string()
    }

    #[test]
    fn parses_full_config_with_defaults() {
        let config = DeviceConfig::from_json(&base_json()).unwrap();
        assert_eq!(config.guid, Guid(2));
        assert_eq!(config.device, "transmission");
        assert_eq!(config.upstream.len(), 1);
        assert_eq!(config.downstream, vec![Guid(3)]);
        assert_eq!(config.tick_ms, 1000);
        assert_eq!(config.freshness_window, 3);
        assert_eq!(config.freshness(), Duration::from_secs(3));
        assert_eq!(config.adapters[0].kind, AdapterKind::Scada);
        assert_eq!(
            config.parameters.float_list("loads").unwrap(),
            vec![0.394737, 0.394737, 0.394737]
        );
        assert_eq!(config.parameters.int("state").unwrap(), 7);
    }

    #[test]
    fn rejects_self_reference() {
        let json = base_json().replace("\"downstream\": [3]", "\"downstream\": [2]");
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::SelfReference { .. })
        ));
    }

    #[test]
    fn rejects_upstream_downstream_overlap() {
        let json = base_json().replace("\"downstream\": [3]", "\"downstream\": [1]");
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::UpstreamDownstreamOverlap { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_adapter_bind() {
        let json = base_json().replace("127.0.0.1:8081", "127.0.0.1:8080");
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::DuplicateBind(_))
        ));
    }

    #[test]
    fn rejects_zero_tick_interval() {
        let json = base_json().replace("\"guid\": 2", "\"guid\": 2, \"tick_ms\": 0");
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::InvalidParameter { name: "tick_ms", .. })
        ));
    }

    #[test]
    fn rejects_zero_timing_windows() {
        let json = base_json().replace("\"guid\": 2", "\"guid\": 2, \"freshness_window\": 0");
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::InvalidParameter {
                name: "freshness_window",
                ..
            })
        ));
        let json = base_json().replace("\"guid\": 2", "\"guid\": 2, \"max_backoff_ms\": 0");
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::InvalidParameter {
                name: "max_backoff_ms",
                ..
            })
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            DeviceConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn parameter_type_errors_are_reported() {
        let params: Parameters =
            serde_json::from_str(r#"{"voltage": "high", "state": 1.5}"#).unwrap();
        assert!(matches!(
            params.float("voltage"),
            Err(ConfigError::InvalidParameter { .. })
        ));
        assert!(matches!(
            params.int("state"),
            Err(ConfigError::InvalidParameter { .. })
        ));
        assert!(matches!(
            params.float("missing"),
            Err(ConfigError::MissingParameter("missing"))
        ));
    }
}
