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

use serde_json::json;
use tracing_test::traced_test;
use vrsc_indexer::{db::FailedBlock, ScanConfig, ScanError, ScanState, ScanType};

use super::common::{fast_config, TestEnv, ALICE, TIP};

#[tokio::test]
#[traced_test]
async fn test_block_recovers_on_final_attempt() {
    let env = TestEnv::new().await;
    env.add_stake(10, ALICE, ALICE, 1_000.0, 12.0);
    env.node.fail_block(10, 3);

    let config = ScanConfig { max_retries: 3, ..fast_config() };
    let summary = env.manager().run(ScanType::Historical, config).await.unwrap();
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.events_inserted, 1);
    assert!(env.db.get_failed_blocks("historical").await.unwrap().is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_block_skipped_after_retries_exhausted() {
    let env = TestEnv::new().await;
    env.add_stake(10, ALICE, ALICE, 1_000.0, 12.0);
    env.node.fail_block(10, 4);

    let manager = env.manager();
    let config = ScanConfig { max_retries: 3, ..fast_config() };
    let summary = manager.run(ScanType::Historical, config.clone()).await.unwrap();
    assert_eq!(summary.state, ScanState::Complete);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.last_scanned_block, Some(TIP));
    assert_eq!(env.db.count_events().await.unwrap(), 0);
    // One call per attempt, never more
    assert_eq!(env.node.calls("getblockhash"), TIP + 3);

    let failed = env.db.get_failed_blocks("historical").await.unwrap();
    assert_eq!(failed.iter().map(|f| f.block_height).collect::<Vec<_>>(), vec![10]);

    let status = manager.status(&ScanType::Historical).await.unwrap();
    assert_eq!(status.errors, 1);
    assert!(status.last_error.unwrap().contains("block 10"));

    // A gap-fill over the failed block recovers the event and clears the failure
    let summary = manager.run(ScanType::GapFill { from: 10, to: 10 }, config).await.unwrap();
    assert_eq!(summary.events_inserted, 1);
    assert_eq!(env.db.get_failed_blocks("historical").await.unwrap(), Vec::<FailedBlock>::new());
}

#[tokio::test]
#[traced_test]
async fn test_malformed_block_is_rejected_not_failed() {
    let env = TestEnv::new().await;
    env.add_stake(10, ALICE, ALICE, 1_000.0, 12.0);
    env.node.set_raw_block(1, json!({"height": 1, "validationtype": "stake", "tx": [{"txid": 5}]}));

    let summary = env.manager().run(ScanType::Historical, fast_config()).await.unwrap();
    assert_eq!(summary.state, ScanState::Complete);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.blocks_scanned, TIP);
    assert_eq!(summary.events_inserted, 1);
    assert!(env.db.get_failed_blocks("historical").await.unwrap().is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_failed_input_lookup_recorded_pending_then_backfilled() {
    let env = TestEnv::new().await;
    let funding = env.add_stake(10, ALICE, ALICE, 500.0, 12.0);
    env.node.fail_transaction(&funding.txid, 4);

    let manager = env.manager();
    let config = ScanConfig { max_retries: 3, cache_block_data: false, ..fast_config() };
    manager.run(ScanType::Historical, config.clone()).await.unwrap();

    let events = env.db.get_events_by_identity(ALICE).await.unwrap();
    assert_eq!(events.len(), 1);
    let pending = &events[0];
    assert!(pending.stake_amount_pending);
    assert_eq!(pending.amount_sats, 51_200_000_000);
    assert_eq!(pending.source_address, None);
    assert_eq!(pending.stake_amount_sats, None);

    let summary = manager.backfill_stake_amounts(&config, 100).await.unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.resolved, 1);

    let events = env.db.get_events_by_identity(ALICE).await.unwrap();
    let resolved = &events[0];
    assert!(!resolved.stake_amount_pending);
    assert_eq!(resolved.amount_sats, 1_200_000_000);
    assert_eq!(resolved.stake_amount_sats, Some(50_000_000_000));
    assert_eq!(resolved.source_address.as_deref(), Some(ALICE));

    // Nothing left to backfill
    let summary = manager.backfill_stake_amounts(&config, 100).await.unwrap();
    assert_eq!(summary.examined, 0);
}

#[tokio::test]
#[traced_test]
async fn test_unresolvable_input_does_not_block_backfill() {
    let env = TestEnv::new().await;
    let lost = env.add_stake(5, ALICE, ALICE, 500.0, 12.0);
    let flaky = env.add_stake(10, ALICE, ALICE, 500.0, 12.0);
    env.node.fail_transaction(&lost.txid, u32::MAX);
    env.node.fail_transaction(&flaky.txid, 4);

    let manager = env.manager();
    let config = ScanConfig { max_retries: 3, cache_block_data: false, ..fast_config() };
    manager.run(ScanType::Historical, config.clone()).await.unwrap();
    assert_eq!(env.db.get_pending_stake_events(10).await.unwrap().len(), 2);

    // The oldest event still cannot be resolved
    let summary = manager.backfill_stake_amounts(&config, 1).await.unwrap();
    assert_eq!((summary.examined, summary.resolved, summary.still_pending), (1, 0, 1));

    // The next pass moves on to the newer event
    let summary = manager.backfill_stake_amounts(&config, 1).await.unwrap();
    assert_eq!((summary.examined, summary.resolved, summary.still_pending), (1, 1, 0));

    let pending = env.db.get_pending_stake_events(10).await.unwrap();
    assert_eq!(pending.iter().map(|e| e.block_height).collect::<Vec<_>>(), vec![5]);
}

#[tokio::test]
#[traced_test]
async fn test_error_rate_stops_scan() {
    let env = TestEnv::new().await;
    for height in 1..=TIP {
        env.node.fail_block(height, u32::MAX);
    }

    let manager = env.manager();
    let config = ScanConfig {
        max_retries: 0,
        error_rate_min_blocks: 10,
        max_error_rate: 0.5,
        ..fast_config()
    };
    let err = manager.run(ScanType::Historical, config).await.unwrap_err();
    assert!(matches!(err, ScanError::ErrorRateExceeded { errors: 10, blocks: 10 }));

    let status = manager.status(&ScanType::Historical).await.unwrap();
    assert_eq!(status.state, ScanState::Errored);
    assert!(!status.is_running);
    assert!(status.last_error.is_some());
    // The failed batch is still checkpointed so the failures can be gap-filled
    assert_eq!(status.last_scanned_block, Some(10));
}
