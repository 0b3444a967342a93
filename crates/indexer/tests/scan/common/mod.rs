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

use std::{sync::Arc, time::Duration};

use tempfile::NamedTempFile;
use url::Url;
use vrsc_indexer::{
    ChainRpcObj, LedgerDb, LedgerDbObj, RpcClient, ScanConfig, ScanManager,
};
use vrsc_rewards::{ExtractionParams, Transaction, TrackedAddresses};
use vrsc_test_utils::{
    builders::{stake_block, staking_pair},
    MockVerusNode,
};

pub const ALICE: &str = "iAliceIdentityAddressxxxxxxxxxxxxx";
pub const BOB: &str = "iBobIdentityAddressxxxxxxxxxxxxxxx";
pub const DELEGATE: &str = "RDelegateTransparentAddressxxxxxxx";

/// Chain tip used by most scenarios
pub const TIP: u64 = 50;

pub struct TestEnv {
    pub node: MockVerusNode,
    pub rpc: ChainRpcObj,
    pub db: LedgerDbObj,
    _temp_file: NamedTempFile,
}

impl TestEnv {
    /// Mock node with proof-of-work blocks `1..=TIP` and an empty ledger
    pub async fn new() -> Self {
        let node = MockVerusNode::new().await;
        node.add_work_blocks(1, TIP);

        let url = Url::parse(&node.url()).unwrap();
        let rpc: ChainRpcObj = Arc::new(RpcClient::new(url, None, Duration::from_secs(5)).unwrap());

        let temp_file = NamedTempFile::new().unwrap();
        let db_url = format!("sqlite:{}", temp_file.path().to_str().unwrap());
        let db: LedgerDbObj = Arc::new(LedgerDb::new(&db_url).await.unwrap());

        Self { node, rpc, db, _temp_file: temp_file }
    }

    pub fn manager(&self) -> ScanManager {
        ScanManager::new(
            self.rpc.clone(),
            self.db.clone(),
            TrackedAddresses::new([ALICE, BOB]),
            ExtractionParams::default(),
            1_000,
        )
    }

    /// Put a stake block at `height` whose stake transaction spends `staked` coins from
    /// `source` and pays `staked + reward` to `recipient`. Returns the funding transaction.
    pub fn add_stake(
        &self,
        height: u64,
        source: &str,
        recipient: &str,
        staked: f64,
        reward: f64,
    ) -> Transaction {
        let (funding, stake) = staking_pair(height * 10, source, recipient, staked, reward);
        self.node.add_transaction(funding.clone());
        self.node.add_block(stake_block(height, stake));
        funding
    }
}

/// Config with tiny backoffs and no inter-batch delay
pub fn fast_config() -> ScanConfig {
    ScanConfig {
        max_concurrent_requests: 4,
        delay_between_batches_ms: 0,
        block_batch_size: 10,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        error_rate_min_blocks: 1_000,
        ..Default::default()
    }
}
