use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use archivist_swarm::SwarmConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivistConfig {
    pub bind_addr: SocketAddr,
    pub storage_root: PathBuf,
    pub swarm: SwarmConfig,
}

impl Default for ArchivistConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            storage_root: PathBuf::from("archives"),
            swarm: SwarmConfig::default(),
        }
    }
}

impl ArchivistConfig {
    /// Read a TOML config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> ServerResult<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_swarm::HANDSHAKE_TIMEOUT;

    #[test]
    fn default_config() {
        let c = ArchivistConfig::default();
        assert_eq!(c.bind_addr, DEFAULT_BIND_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(c.storage_root, PathBuf::from("archives"));
        assert!(c.swarm.enabled);
        assert_eq!(c.swarm.handshake_timeout(), HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = ArchivistConfig::from_toml(
            r#"
            storage_root = "/srv/archives"

            [swarm]
            bootstrap = ["10.0.0.2:3282"]
            handshake_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(c.storage_root, PathBuf::from("/srv/archives"));
        assert_eq!(c.bind_addr, ArchivistConfig::default().bind_addr);
        assert_eq!(c.swarm.bootstrap, vec!["10.0.0.2:3282".parse::<SocketAddr>().unwrap()]);
        assert_eq!(c.swarm.handshake_timeout_ms, 250);
        assert!(c.swarm.enabled);
    }

    #[test]
    fn toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archivist.toml");
        let mut config = ArchivistConfig::default();
        config.swarm.enabled = false;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(ArchivistConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn bad_file_is_config_error() {
        assert!(matches!(
            ArchivistConfig::from_toml("bind_addr = 7"),
            Err(ServerError::Config(_))
        ));
        assert!(matches!(
            ArchivistConfig::load(Path::new("/nonexistent/archivist.toml")),
            Err(ServerError::Config(_))
        ));
    }
}
