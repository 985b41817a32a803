// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file handling shared by the IMA agent binaries.

use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// A configuration object that can be read from and written to disk.
///
/// Files ending in `.yaml`/`.yml` are parsed as YAML, anything else as JSON.
pub trait Config: Serialize + DeserializeOwned {
    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse YAML config {:?}: {}", path, e))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse JSON config {:?}: {}", path, e))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

pub struct PersistedConfig<C> {
    inner: C,
    path: PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn read(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

pub mod local_ip_utils {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

    // Bind to port 0 and let the OS pick. Test helper only, panics if nothing is free.
    pub fn get_available_port(host: &IpAddr) -> u16 {
        let socket_addr = SocketAddr::new(*host, 0);
        let listener = TcpListener::bind(socket_addr).expect("Failed to bind to random port");
        listener
            .local_addr()
            .expect("Failed to get local address")
            .port()
    }

    pub fn get_available_ports(host: &IpAddr, count: usize) -> Vec<u16> {
        (0..count).map(|_| get_available_port(host)).collect()
    }

    pub fn localhost_for_testing() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct SampleConfig {
        listen_port: u16,
        chain_name: String,
    }

    impl Config for SampleConfig {}

    #[test]
    fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("agent.yaml");
        std::fs::write(&yaml_path, "listen-port: 9000\nchain-name: Bob\n").unwrap();
        let yaml = SampleConfig::load(&yaml_path).unwrap();
        assert_eq!(yaml.listen_port, 9000);
        assert_eq!(yaml.chain_name, "Bob");

        let json_path = dir.path().join("agent.json");
        std::fs::write(&json_path, r#"{"listen-port": 9001, "chain-name": "Alice"}"#).unwrap();
        let json = SampleConfig::load(&json_path).unwrap();
        assert_eq!(json.listen_port, 9001);
    }

    #[test]
    fn test_persisted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persisted.yml");
        let config = SampleConfig {
            listen_port: 1234,
            chain_name: "Mainnet".to_string(),
        };
        let persisted = config.persisted(&path);
        persisted.save().unwrap();
        assert_eq!(&persisted.read().unwrap(), persisted.inner());
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = SampleConfig::load("/nonexistent/agent.yaml").unwrap_err();
        assert!(err.to_string().contains("agent.yaml"));
    }
}
