//! Configuration file support for the issuer node.
//!
//! Loads `issuer.toml`. Every section is optional and falls back to its
//! defaults; secrets have no defaults and are checked when the component
//! that needs them is built.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::merkle::DEFAULT_MAX_LEVELS;
use crate::publisher::PublisherConfig;

/// Default name of the configuration file.
pub const CONFIG_FILE: &str = "issuer.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("missing configuration value: {0}")]
    Missing(&'static str),
    #[error("invalid configuration value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    pub data_dir: PathBuf,
    pub identity: IdentityConfig,
    pub ethereum: EthereumConfig,
    pub state_publisher: StatePublisherConfig,
    pub prover: ProverConfig,
    pub rpc: RpcConfig,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        IssuerConfig {
            data_dir: PathBuf::from("./issuer-data"),
            identity: IdentityConfig::default(),
            ethereum: EthereumConfig::default(),
            state_publisher: StatePublisherConfig::default(),
            prover: ProverConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub circuits_path: PathBuf,
    pub tree_depth: usize,
    /// Hex BabyJubJub private key. Generated on `init` when absent.
    pub babyjubjub_private_key: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            circuits_path: PathBuf::from("./circuits"),
            tree_depth: DEFAULT_MAX_LEVELS,
            babyjubjub_private_key: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EthereumConfig {
    pub rpc_url: Option<String>,
    pub state_contract: Option<String>,
    pub private_key: Option<String>,
}

/// Connection parameters, once all three are present.
pub struct EthereumEndpoint<'a> {
    pub rpc_url: &'a str,
    pub state_contract: &'a str,
    pub private_key: &'a str,
}

impl EthereumConfig {
    pub fn endpoint(&self) -> Result<EthereumEndpoint<'_>, ConfigError> {
        Ok(EthereumEndpoint {
            rpc_url: self
                .rpc_url
                .as_deref()
                .ok_or(ConfigError::Missing("ethereum.rpc_url"))?,
            state_contract: self
                .state_contract
                .as_deref()
                .ok_or(ConfigError::Missing("ethereum.state_contract"))?,
            private_key: self
                .private_key
                .as_deref()
                .ok_or(ConfigError::Missing("ethereum.private_key"))?,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StatePublisherConfig {
    pub publish_period_secs: u64,
    pub retry_period_secs: u64,
    pub max_retries: u32,
}

impl Default for StatePublisherConfig {
    fn default() -> Self {
        StatePublisherConfig {
            publish_period_secs: 60,
            retry_period_secs: 10,
            max_retries: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProverConfig {
    pub witness_calculator: PathBuf,
    pub prover: PathBuf,
    pub circuit_levels: usize,
}

impl Default for ProverConfig {
    fn default() -> Self {
        ProverConfig {
            witness_calculator: PathBuf::from("witness-calculator"),
            prover: PathBuf::from("prover"),
            circuit_levels: DEFAULT_MAX_LEVELS,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub listen_addr: String,
    /// Base URL holders use to reach this node, for offer callbacks.
    pub public_url: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            listen_addr: "127.0.0.1:8000".into(),
            public_url: "http://127.0.0.1:8000".into(),
        }
    }
}

impl IssuerConfig {
    /// Load configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: IssuerConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values the publisher and the prover cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_publisher.publish_period_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "state_publisher.publish_period_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.state_publisher.retry_period_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "state_publisher.retry_period_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.identity.tree_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "identity.tree_depth",
                reason: "must be at least 1".into(),
            });
        }
        if self.identity.tree_depth > self.prover.circuit_levels {
            return Err(ConfigError::Invalid {
                field: "identity.tree_depth",
                reason: format!(
                    "{} exceeds prover.circuit_levels ({})",
                    self.identity.tree_depth, self.prover.circuit_levels
                ),
            });
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn rpc_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.rpc
            .listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                field: "rpc.listen_addr",
                reason: e.to_string(),
            })
    }

    pub fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            publish_period: Duration::from_secs(self.state_publisher.publish_period_secs),
            retry_period: Duration::from_secs(self.state_publisher.retry_period_secs),
            max_retries: self.state_publisher.max_retries,
            circuit_levels: self.prover.circuit_levels,
        }
    }
}
