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

use std::time::Duration;

use tracing_test::traced_test;
use vrsc_indexer::{ScanConfig, ScanError, ScanState, ScanType, StatisticsAggregator};

use super::common::{fast_config, TestEnv, ALICE, BOB, DELEGATE, TIP};

#[tokio::test]
#[traced_test]
async fn test_scan_single_self_stake_block() {
    let env = TestEnv::new().await;
    env.add_stake(5, ALICE, ALICE, 1_000.0, 12.0);

    let manager = env.manager();
    let summary = manager.run(ScanType::Historical, fast_config()).await.unwrap();
    assert_eq!(summary.state, ScanState::Complete);
    assert_eq!(summary.range, Some((1, TIP)));
    assert_eq!(summary.events_inserted, 1);

    let events = env.db.get_events_by_identity(ALICE).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.block_height, 5);
    assert_eq!(event.amount_sats, 1_200_000_000);
    assert_eq!(event.stake_amount_sats, Some(100_000_000_000));
    assert_eq!(event.source_address.as_deref(), Some(ALICE));
    assert!(!event.stake_amount_pending);

    // Scanning the block again adds nothing
    let summary = manager
        .run(ScanType::GapFill { from: 5, to: 5 }, fast_config())
        .await
        .unwrap();
    assert_eq!(summary.blocks_scanned, 1);
    assert_eq!(summary.events_inserted, 0);
    assert_eq!(env.db.count_events().await.unwrap(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_delegated_stake_stored_but_excluded() {
    let env = TestEnv::new().await;
    env.add_stake(5, ALICE, ALICE, 1_000.0, 12.0);
    env.add_stake(6, DELEGATE, ALICE, 0.0, 12.0);

    let manager = env.manager();
    manager.run(ScanType::Historical, fast_config()).await.unwrap();

    let events = env.db.get_events_by_identity(ALICE).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].source_address.as_deref(), Some(DELEGATE));

    let snapshot = StatisticsAggregator::new(env.db.clone()).recompute(ALICE).await.unwrap();
    assert_eq!(snapshot.total_stakes, 1);
    assert_eq!(snapshot.total_reward_sats, 1_200_000_000);
    assert_eq!(snapshot.delegated_stakes, 1);
}

#[tokio::test]
#[traced_test]
async fn test_overlapping_scans_yield_same_rows() {
    let env = TestEnv::new().await;
    for height in [10, 20, 30] {
        env.add_stake(height, ALICE, ALICE, 1_000.0, 12.0);
    }
    env.add_stake(25, BOB, BOB, 2_000.0, 12.0);

    let manager = env.manager();
    manager.run(ScanType::Historical, fast_config()).await.unwrap();
    let first = env.db.get_events_in_range(1, TIP).await.unwrap();
    assert_eq!(first.len(), 4);

    let summary = manager
        .run(ScanType::GapFill { from: 1, to: TIP }, fast_config())
        .await
        .unwrap();
    assert_eq!(summary.blocks_scanned, TIP);
    assert_eq!(summary.events_inserted, 0);
    assert_eq!(env.db.get_events_in_range(1, TIP).await.unwrap(), first);
}

#[tokio::test]
#[traced_test]
async fn test_rescan_replays_range_from_cache() {
    let env = TestEnv::new().await;
    env.add_stake(10, ALICE, ALICE, 1_000.0, 12.0);
    env.add_stake(30, ALICE, ALICE, 1_000.0, 12.0);

    let manager = env.manager();
    let config = ScanConfig { cache_block_data: true, ..fast_config() };
    manager.run(ScanType::Historical, config.clone()).await.unwrap();
    env.node.reset_calls();

    manager.rescan(1, 20, config).await.unwrap();
    let summary = manager.wait(&ScanType::GapFill { from: 1, to: 20 }).await.unwrap();
    assert_eq!(summary.events_inserted, 1);
    assert_eq!(env.db.count_events().await.unwrap(), 2);

    // Every block and input came from the cache
    assert_eq!(env.node.calls("getblockhash"), 0);
    assert_eq!(env.node.calls("getblock"), 0);
    assert_eq!(env.node.calls("getrawtransaction"), 0);
}

#[tokio::test]
#[traced_test]
async fn test_rescan_refused_while_range_is_locked() {
    let env = TestEnv::new().await;
    env.add_stake(5, ALICE, ALICE, 1_000.0, 12.0);
    env.node.set_delay(Duration::from_millis(20));

    let first = env.manager();
    let config = ScanConfig { cache_block_data: false, ..fast_config() };
    first.rescan(1, TIP, config.clone()).await.unwrap();

    // Let the running re-scan commit the stake at block 5
    for _ in 0..250 {
        if env.db.count_events().await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(env.db.count_events().await.unwrap(), 1);

    // A second process asking for the same re-scan is refused before touching the ledger
    let second = env.manager();
    let err = second.rescan(1, TIP, config).await.unwrap_err();
    assert!(matches!(err, ScanError::AlreadyRunning(ref key) if key == "gap-fill:1-50"));
    assert_eq!(env.db.count_events().await.unwrap(), 1);

    let summary = first.wait(&ScanType::GapFill { from: 1, to: TIP }).await.unwrap();
    assert_eq!(summary.state, ScanState::Complete);
    assert_eq!(env.db.count_events().await.unwrap(), 1);
    assert_eq!(env.db.get_events_by_identity(ALICE).await.unwrap()[0].block_height, 5);
}
