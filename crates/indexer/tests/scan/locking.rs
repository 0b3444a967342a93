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
use vrsc_indexer::{IndexerConfig, ScanError, ScanState, ScanType};

use super::common::{fast_config, TestEnv, ALICE, TIP};

#[tokio::test]
#[traced_test]
async fn test_second_start_fails_fast() {
    let env = TestEnv::new().await;
    env.node.set_delay(Duration::from_millis(20));

    let manager = env.manager();
    manager.start(ScanType::Historical, fast_config()).await.unwrap();

    let err = manager.start(ScanType::Historical, fast_config()).await.unwrap_err();
    assert!(matches!(err, ScanError::AlreadyRunning(ref key) if key == "historical"));

    // Another process sharing the ledger is refused by the advancing lock
    let other = env.manager();
    let err = other.start(ScanType::Historical, fast_config()).await.unwrap_err();
    assert!(matches!(err, ScanError::AlreadyRunning(_)));

    // Other scan types are independent
    other.start(ScanType::Incremental, fast_config()).await.unwrap();

    assert_eq!(manager.stop(&ScanType::Historical).await.unwrap().state, ScanState::Stopped);
    other.wait(&ScanType::Incremental).await.unwrap();

    // Once released the lock can be taken again
    env.node.set_delay(Duration::ZERO);
    let summary = other.run(ScanType::Historical, fast_config()).await.unwrap();
    assert_eq!(summary.state, ScanState::Complete);
}

#[tokio::test]
#[traced_test]
async fn test_shutdown_completes_after_interrupted_start() {
    let env = TestEnv::new().await;
    env.node.set_delay(Duration::from_millis(20));
    let manager = env.manager();

    // The caller gives up on a start before it reports back
    let _ = tokio::time::timeout(
        Duration::from_millis(1),
        manager.start(ScanType::Historical, fast_config()),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(10), manager.shutdown())
        .await
        .expect("shutdown did not complete");

    // Whatever was started has let go of the advancing lock
    env.node.set_delay(Duration::ZERO);
    let summary = env.manager().run(ScanType::Historical, fast_config()).await.unwrap();
    assert_eq!(summary.state, ScanState::Complete);
}

#[tokio::test]
#[traced_test]
async fn test_stop_when_idle_is_rejected() {
    let env = TestEnv::new().await;
    let err = env.manager().stop(&ScanType::Historical).await.unwrap_err();
    assert!(matches!(err, ScanError::NotRunning(_)));
}

#[tokio::test]
#[traced_test]
async fn test_status_after_completion() {
    let env = TestEnv::new().await;
    env.add_stake(10, ALICE, ALICE, 1_000.0, 12.0);
    env.add_stake(20, ALICE, ALICE, 1_000.0, 12.0);

    let manager = env.manager();
    manager.run(ScanType::Historical, fast_config()).await.unwrap();

    let status = manager.status(&ScanType::Historical).await.unwrap();
    assert_eq!(status.state, ScanState::Complete);
    assert!(!status.is_running);
    assert_eq!(status.last_scanned_block, Some(TIP));
    assert_eq!(status.current_height, Some(TIP));
    assert_eq!(status.blocks_scanned, TIP);
    assert_eq!(status.events_found, 2);
    assert_eq!(status.errors, 0);

    // A fresh manager reports the persisted checkpoint
    let status = env.manager().status(&ScanType::Historical).await.unwrap();
    assert_eq!(status.state, ScanState::Idle);
    assert_eq!(status.last_scanned_block, Some(TIP));
    assert_eq!(status.events_found, 2);
    assert_eq!(status.current_height, Some(TIP));
}

#[tokio::test]
#[traced_test]
async fn test_identities_resolved_by_name() {
    let env = TestEnv::new().await;
    env.node.add_identity("alice@", ALICE);

    let config = IndexerConfig {
        identities: vec!["alice@".into(), "RPlainAddress".into()],
        ..Default::default()
    };
    let tracked = config.resolve_identities(env.rpc.as_ref()).await.unwrap();
    assert!(tracked.contains(ALICE));
    assert!(tracked.contains("RPlainAddress"));
}

#[tokio::test]
async fn test_new_block_notification() {
    let env = TestEnv::new().await;
    let manager = env.manager();

    assert!(!manager.wait_for_new_block(Duration::from_millis(10)).await);
    manager.notify_new_block();
    assert!(manager.wait_for_new_block(Duration::from_secs(1)).await);
}
