// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vrsc_rewards::{
    ExtractionParams, TrackedAddresses, DEFAULT_ACTIVATION_HEIGHT, DEFAULT_MAX_REWARD_SATS,
};

use crate::{
    rpc::{ChainRpc, RpcError},
    scanner::ScanConfig,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to resolve identity {name}: {source}")]
    Resolve { name: String, source: RpcError },
}

/// Indexer settings loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexerConfig {
    /// VerusID names (`alice@`) or addresses to track
    pub identities: Vec<String>,
    /// Protocol-level accounts never credited with rewards
    pub excluded_addresses: Vec<String>,
    pub max_reward_sats: i64,
    pub activation_height: u64,
    pub scan: ScanConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            excluded_addresses: Vec::new(),
            max_reward_sats: DEFAULT_MAX_REWARD_SATS,
            activation_height: DEFAULT_ACTIVATION_HEIGHT,
            scan: ScanConfig::default(),
        }
    }
}

impl IndexerConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = tokio::fs::read_to_string(path).await?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let config: IndexerConfig = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identities.is_empty() {
            return Err(ConfigError::Invalid("at least one identity must be tracked".into()));
        }
        if self.max_reward_sats <= 0 {
            return Err(ConfigError::Invalid("maxRewardSats must be positive".into()));
        }
        self.scan.validate().map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn extraction_params(&self) -> ExtractionParams {
        ExtractionParams {
            excluded_addresses: self.excluded_addresses.iter().cloned().collect(),
            max_reward_sats: self.max_reward_sats,
            activation_height: self.activation_height,
        }
    }

    /// Turn configured identities into addresses. Names ending in `@` are looked up with
    /// `getidentity`; anything else is already an address.
    pub async fn resolve_identities(
        &self,
        rpc: &(dyn ChainRpc + Send + Sync),
    ) -> Result<TrackedAddresses, ConfigError> {
        let mut addresses = Vec::with_capacity(self.identities.len());
        for entry in &self.identities {
            if !entry.ends_with('@') {
                addresses.push(entry.clone());
                continue;
            }
            let response = rpc
                .get_identity(entry)
                .await
                .map_err(|source| ConfigError::Resolve { name: entry.clone(), source })?;
            let address = response.identity.identityaddress;
            if address.is_empty() {
                return Err(ConfigError::Invalid(format!("identity {entry} has no address")));
            }
            tracing::info!("Resolved {} to {}", entry, address);
            addresses.push(address);
        }
        Ok(TrackedAddresses::new(addresses))
    }
}
