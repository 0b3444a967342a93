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

//! Bounded LRU caches in front of the node.
//!
//! Nothing depends on cache contents for correctness. A miss falls through to the node and
//! returns exactly what an uncached fetch would.

use std::sync::Arc;

use moka::{future::Cache, policy::EvictionPolicy};
use vrsc_rewards::{Block, Transaction};

use crate::rpc::{ChainRpcObj, RpcError};

/// Blocks keyed by height and decoded transactions keyed by txid.
#[derive(Clone)]
pub struct BlockCache {
    blocks: Cache<u64, Arc<Block>>,
    transactions: Cache<String, Arc<Transaction>>,
}

impl BlockCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            blocks: Cache::builder()
                .max_capacity(max_entries)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            transactions: Cache::builder()
                .max_capacity(max_entries)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        }
    }

    pub async fn get(&self, height: u64) -> Option<Arc<Block>> {
        self.blocks.get(&height).await
    }

    pub async fn put(&self, height: u64, block: Arc<Block>) {
        self.blocks.insert(height, block).await;
    }

    pub async fn get_transaction(&self, txid: &str) -> Option<Arc<Transaction>> {
        self.transactions.get(txid).await
    }

    pub async fn put_transaction(&self, tx: Arc<Transaction>) {
        self.transactions.insert(tx.txid.clone(), tx).await;
    }

    /// Number of cached blocks. Approximate until pending maintenance has run.
    pub fn block_count(&self) -> u64 {
        self.blocks.entry_count()
    }

    pub fn transaction_count(&self) -> u64 {
        self.transactions.entry_count()
    }

    /// Apply pending inserts and evictions.
    pub async fn sync(&self) {
        self.blocks.run_pending_tasks().await;
        self.transactions.run_pending_tasks().await;
    }
}

/// Node access with an optional cache in front of block and transaction fetches.
#[derive(Clone)]
pub struct CachedChain {
    rpc: ChainRpcObj,
    cache: Option<BlockCache>,
}

impl CachedChain {
    pub fn new(rpc: ChainRpcObj, cache: Option<BlockCache>) -> Self {
        Self { rpc, cache }
    }

    pub fn rpc(&self) -> &ChainRpcObj {
        &self.rpc
    }

    pub fn cache(&self) -> Option<&BlockCache> {
        self.cache.as_ref()
    }

    /// Fetch the block at `height`, resolving its hash first on a miss.
    pub async fn block_at(&self, height: u64) -> Result<Arc<Block>, RpcError> {
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(height).await {
                tracing::trace!("Block cache hit for height {}", height);
                return Ok(block);
            }
        }

        let hash = self.rpc.get_block_hash(height).await?;
        let block = Arc::new(self.rpc.get_block(&hash).await?);

        if let Some(cache) = &self.cache {
            cache.put(height, block.clone()).await;
        }
        Ok(block)
    }

    pub async fn transaction(&self, txid: &str) -> Result<Arc<Transaction>, RpcError> {
        if let Some(cache) = &self.cache {
            if let Some(tx) = cache.get_transaction(txid).await {
                return Ok(tx);
            }
        }

        let tx = Arc::new(self.rpc.get_raw_transaction(txid).await?);

        if let Some(cache) = &self.cache {
            cache.put_transaction(tx.clone()).await;
        }
        Ok(tx)
    }
}
