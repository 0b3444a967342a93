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

//! Access to a Verus node's JSON-RPC interface.

pub mod client;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vrsc_rewards::{Block, Transaction};

pub use client::RpcClient;

/// Daemon error code returned while the node is still loading its block index.
const RPC_IN_WARMUP: i64 = -28;

#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC HTTP status {0}")]
    HttpStatus(u16),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("RPC decode error: {0}")]
    Decode(String),

    #[error("RPC returned no result for {0}")]
    EmptyResponse(String),
}

impl RpcError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::HttpStatus(status) => *status == 429 || *status >= 500,
            RpcError::Rpc { code, .. } => *code == RPC_IN_WARMUP,
            RpcError::Decode(_) | RpcError::EmptyResponse(_) => false,
        }
    }

    /// Whether the node answered but the payload did not match the expected shape.
    pub fn is_malformed(&self) -> bool {
        matches!(self, RpcError::Decode(_))
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RpcError::Decode(err.to_string())
        } else {
            RpcError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Decode(err.to_string())
    }
}

/// The part of a `getidentity` response the indexer reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResponse {
    #[serde(default)]
    pub identity: IdentityDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub identityaddress: String,
}

pub type ChainRpcObj = Arc<dyn ChainRpc + Send + Sync>;

/// Read-only chain queries used by the scanner. Every call may fail transiently.
#[async_trait]
pub trait ChainRpc {
    async fn get_block_count(&self) -> Result<u64, RpcError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError>;

    /// Fetch a block with fully decoded transactions (verbosity 2).
    async fn get_block(&self, hash: &str) -> Result<Block, RpcError>;

    /// Fetch a decoded transaction.
    async fn get_raw_transaction(&self, txid: &str) -> Result<Transaction, RpcError>;

    /// Look up a VerusID by name (`alice@`) or i-address.
    async fn get_identity(&self, name: &str) -> Result<IdentityResponse, RpcError>;
}
