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

//! Verus stake reward indexer: scans the chain for stake rewards paid to tracked identities,
//! keeps them in an append-only ledger, and derives staking statistics from it.

pub mod backfill;
pub mod cache;
pub mod config;
pub mod db;
pub mod rpc;
pub mod scanner;
pub mod stats;

pub use backfill::{backfill_stake_amounts, BackfillSummary};
pub use cache::{BlockCache, CachedChain};
pub use config::{ConfigError, IndexerConfig};
pub use db::{DbError, LedgerDb, LedgerDbObj, StakeLedgerDb};
pub use rpc::{ChainRpc, ChainRpcObj, RpcClient, RpcError};
pub use scanner::{
    RetryPolicy, ScanConfig, ScanCoordinator, ScanError, ScanManager, ScanState, ScanStatus,
    ScanSummary, ScanType,
};
pub use stats::StatisticsAggregator;
