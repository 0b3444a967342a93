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
use vrsc_indexer::{ScanConfig, ScanState, ScanType};

use super::common::{fast_config, TestEnv, ALICE, TIP};

#[tokio::test]
#[traced_test]
async fn test_restart_continues_after_checkpoint() {
    let env = TestEnv::new().await;
    env.add_stake(10, ALICE, ALICE, 1_000.0, 12.0);
    env.add_stake(40, ALICE, ALICE, 1_000.0, 12.0);

    let manager = env.manager();
    let config = ScanConfig { cache_block_data: false, ..fast_config() };
    let bounded = ScanConfig { end_at_height: Some(25), ..config.clone() };
    let summary = manager.run(ScanType::Historical, bounded).await.unwrap();
    assert_eq!(summary.last_scanned_block, Some(25));
    assert_eq!(env.db.count_events().await.unwrap(), 1);

    env.node.reset_calls();
    let summary = manager.run(ScanType::Historical, config).await.unwrap();
    assert_eq!(summary.range, Some((26, TIP)));
    assert_eq!(summary.blocks_scanned, TIP - 25);
    // No block at or below the checkpoint was fetched again
    assert_eq!(env.node.calls("getblockhash"), TIP - 25);
    assert_eq!(env.db.count_events().await.unwrap(), 2);

    let checkpoint = env.db.get_checkpoint("historical").await.unwrap().unwrap();
    assert_eq!(checkpoint.last_scanned_block, TIP);
    assert_eq!(checkpoint.blocks_scanned, TIP);
    assert_eq!(checkpoint.events_found, 2);
}

#[tokio::test]
#[traced_test]
async fn test_up_to_date_scan_completes_immediately() {
    let env = TestEnv::new().await;
    let manager = env.manager();
    manager.run(ScanType::Historical, fast_config()).await.unwrap();

    env.node.reset_calls();
    let summary = manager.run(ScanType::Historical, fast_config()).await.unwrap();
    assert_eq!(summary.state, ScanState::Complete);
    assert_eq!(summary.range, None);
    assert_eq!(summary.blocks_scanned, 0);
    assert_eq!(env.node.calls("getblock"), 0);
}

#[tokio::test]
#[traced_test]
async fn test_stop_then_resume_scans_each_block_once() {
    let env = TestEnv::new().await;
    for height in [3, 17, 33, 48] {
        env.add_stake(height, ALICE, ALICE, 1_000.0, 12.0);
    }
    env.node.set_delay(Duration::from_millis(20));

    let manager = env.manager();
    let config = ScanConfig {
        max_concurrent_requests: 2,
        block_batch_size: 5,
        cache_block_data: false,
        ..fast_config()
    };
    manager.start(ScanType::Historical, config.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stopped = manager.stop(&ScanType::Historical).await.unwrap();
    assert_eq!(stopped.state, ScanState::Stopped);
    let checkpoint = env.db.get_checkpoint("historical").await.unwrap();
    assert_eq!(checkpoint.map(|c| c.last_scanned_block), stopped.last_scanned_block);
    assert!(stopped.last_scanned_block.unwrap_or(0) < TIP);

    let status = manager.status(&ScanType::Historical).await.unwrap();
    assert_eq!(status.state, ScanState::Stopped);
    assert!(!status.is_running);

    env.node.set_delay(Duration::ZERO);
    let resumed = manager.run(ScanType::Historical, config).await.unwrap();
    assert_eq!(resumed.state, ScanState::Complete);
    assert_eq!(resumed.range.map(|r| r.0), Some(stopped.last_scanned_block.unwrap_or(0) + 1));

    let checkpoint = env.db.get_checkpoint("historical").await.unwrap().unwrap();
    assert_eq!(checkpoint.last_scanned_block, TIP);
    // Committed block counts add up exactly, so no block was committed twice
    assert_eq!(checkpoint.blocks_scanned, TIP);
    assert_eq!(env.db.count_events().await.unwrap(), 4);
}

#[tokio::test]
#[traced_test]
async fn test_incremental_follows_the_tip() {
    let env = TestEnv::new().await;
    env.add_stake(TIP + 1, ALICE, ALICE, 1_000.0, 12.0);
    env.node.set_tip(TIP);

    let manager = env.manager();
    let summary = manager.run(ScanType::Incremental, fast_config()).await.unwrap();
    assert_eq!(summary.range, Some((TIP, TIP)));
    assert_eq!(summary.events_inserted, 0);

    env.node.set_tip(TIP + 1);
    manager.notify_new_block();
    assert!(manager.wait_for_new_block(Duration::from_secs(1)).await);

    let summary = manager.run(ScanType::Incremental, fast_config()).await.unwrap();
    assert_eq!(summary.range, Some((TIP + 1, TIP + 1)));
    assert_eq!(summary.events_inserted, 1);

    // Historical has its own checkpoint and still starts from the beginning
    let summary = manager.run(ScanType::Historical, fast_config()).await.unwrap();
    assert_eq!(summary.range, Some((1, TIP + 1)));
    assert_eq!(summary.events_inserted, 0);
}
