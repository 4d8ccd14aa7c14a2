//! Topology configuration. Squale's original config format is an XML file
//! parsed by a hand-rolled SAX state machine (`squalexml.c`); the Rust
//! port keeps the same *shape* (global settings, then a list of pools
//! each owning a backend tag, admission thresholds, and a list of
//! workers) but expresses it as YAML via `serde`/`serde_yaml`.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Topology {
    /// Defaults to `/tmp/squale.sock` if omitted, matching
    /// `squale->socket_name`'s default in `squale.c`.
    #[serde(default)]
    pub socket_name: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Tag identifying which `Backend` implementation to instantiate for
    /// every worker in this pool (e.g. "stub"). Real driver tags
    /// (postgresql/mysql/oracle) are reserved names the crate does not
    /// yet implement.
    pub backend: String,
    #[serde(default)]
    pub max_pending_warn: u64,
    #[serde(default)]
    pub max_pending_block: u64,
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Reconnect every N processed jobs; 0 disables the cycle.
    #[serde(default)]
    pub cycle_after: u64,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
    NoPools,
    DuplicatePoolName(String),
    UnknownBackend(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "reading config file: {e}"),
            ConfigError::Parse(e) => write!(f, "parsing config file: {e}"),
            ConfigError::NoPools => write!(f, "configuration defines no pools"),
            ConfigError::DuplicatePoolName(name) => write!(f, "duplicate pool name '{name}'"),
            ConfigError::UnknownBackend(tag) => write!(f, "unknown backend '{tag}'"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Topology {
    pub fn load(path: &Path) -> Result<Topology, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Topology::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Topology, ConfigError> {
        let topology: Topology = serde_yaml::from_str(text).map_err(ConfigError::Parse)?;
        topology.validate()?;
        Ok(topology)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.name.clone()) {
                return Err(ConfigError::DuplicatePoolName(pool.name.clone()));
            }
            if pool.backend.is_empty() {
                return Err(ConfigError::UnknownBackend(pool.backend.clone()));
            }
        }
        Ok(())
    }

    pub fn socket_name(&self) -> &str {
        self.socket_name.as_deref().unwrap_or("/tmp/squale.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_topology() {
        let yaml = r#"
pools:
  - name: main
    backend: stub
    max_pending_warn: 10
    max_pending_block: 20
    workers:
      - cycle_after: 0
      - cycle_after: 100
"#;
        let topology = Topology::parse(yaml).unwrap();
        assert_eq!(topology.pools.len(), 1);
        assert_eq!(topology.pools[0].workers.len(), 2);
        assert_eq!(topology.socket_name(), "/tmp/squale.sock");
    }

    #[test]
    fn rejects_empty_pool_list() {
        let yaml = "pools: []\n";
        assert!(matches!(Topology::parse(yaml), Err(ConfigError::NoPools)));
    }

    #[test]
    fn rejects_duplicate_pool_names() {
        let yaml = r#"
pools:
  - name: main
    backend: stub
    workers: [{cycle_after: 0}]
  - name: main
    backend: stub
    workers: [{cycle_after: 0}]
"#;
        assert!(matches!(Topology::parse(yaml), Err(ConfigError::DuplicatePoolName(_))));
    }
}
