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

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{oneshot, Mutex, Notify, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vrsc_rewards::{ExtractionParams, TrackedAddresses};

use super::{
    RetryPolicy, ScanConfig, ScanCoordinator, ScanError, ScanStatus, ScanSummary, ScanType,
};
use crate::{
    backfill::{backfill_stake_amounts, BackfillSummary},
    cache::{BlockCache, CachedChain},
    db::LedgerDbObj,
    rpc::ChainRpcObj,
};

struct RunningScan {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<Result<ScanSummary, ScanError>>,
}

/// Administrative control surface over scan types: start, stop, status and re-scan.
pub struct ScanManager {
    rpc: ChainRpcObj,
    cache: BlockCache,
    db: LedgerDbObj,
    tracked: Arc<TrackedAddresses>,
    params: Arc<ExtractionParams>,
    owner: String,
    /// Never held across an await
    running: Mutex<HashMap<String, RunningScan>>,
    next_id: AtomicU64,
    statuses: RwLock<HashMap<String, Arc<RwLock<ScanStatus>>>>,
    new_block: Notify,
    shutdown: CancellationToken,
}

impl ScanManager {
    pub fn new(
        rpc: ChainRpcObj,
        db: LedgerDbObj,
        tracked: TrackedAddresses,
        params: ExtractionParams,
        cache_max_entries: u64,
    ) -> Self {
        Self {
            rpc,
            cache: BlockCache::new(cache_max_entries),
            db,
            tracked: Arc::new(tracked),
            params: Arc::new(params),
            owner: format!("stake-indexer-{}", Uuid::new_v4()),
            running: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            statuses: RwLock::new(HashMap::new()),
            new_block: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn tracked(&self) -> &TrackedAddresses {
        &self.tracked
    }

    async fn status_handle(&self, scan_type: &ScanType) -> Arc<RwLock<ScanStatus>> {
        let key = scan_type.key();
        if let Some(status) = self.statuses.read().await.get(&key) {
            return status.clone();
        }
        self.statuses
            .write()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ScanStatus::idle(scan_type))))
            .clone()
    }

    fn coordinator(
        &self,
        scan_type: ScanType,
        config: ScanConfig,
        status: Arc<RwLock<ScanStatus>>,
    ) -> ScanCoordinator {
        let cache = config.cache_block_data.then(|| self.cache.clone());
        let chain = CachedChain::new(self.rpc.clone(), cache);
        ScanCoordinator::new(
            chain,
            self.db.clone(),
            self.tracked.clone(),
            self.params.clone(),
            scan_type,
            config,
        )
        .with_owner(self.owner.clone())
        .with_cancellation(self.shutdown.child_token())
        .with_status(status)
    }

    /// Start a scan in the background. Fails fast if the scan type is already running here or
    /// in another process.
    pub async fn start(&self, scan_type: ScanType, config: ScanConfig) -> Result<(), ScanError> {
        self.launch(scan_type, config, None).await
    }

    /// Spawn a run that takes the advancing lock, deletes the ledger rows in `reset` if given,
    /// then scans. Returns once the run holds the lock or has failed to start.
    async fn launch(
        &self,
        scan_type: ScanType,
        config: ScanConfig,
        reset: Option<(u64, u64)>,
    ) -> Result<(), ScanError> {
        let key = scan_type.key();
        let status = self.status_handle(&scan_type).await;
        let coordinator = self.coordinator(scan_type, config, status);
        let cancel = coordinator.cancellation_token();
        let db = self.db.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (started_tx, started_rx) = oneshot::channel();

        {
            let mut running = self.running.lock().await;
            if running.get(&key).is_some_and(|scan| !scan.handle.is_finished()) {
                return Err(ScanError::AlreadyRunning(key));
            }
            let handle = tokio::spawn(async move {
                match prepare(&coordinator, &db, reset).await {
                    Ok(()) => {
                        let _ = started_tx.send(Ok(()));
                        coordinator.run_acquired().await
                    }
                    Err(err) => {
                        let message = err.to_string();
                        let _ = started_tx.send(Err(err));
                        Err(ScanError::TaskFailed(message))
                    }
                }
            });
            running.insert(key.clone(), RunningScan { id, cancel, handle });
        }

        let started = started_rx
            .await
            .unwrap_or_else(|_| Err(ScanError::TaskFailed("scan task ended before starting".into())));
        if let Err(err) = started {
            let mut running = self.running.lock().await;
            if running.get(&key).is_some_and(|scan| scan.id == id) {
                running.remove(&key);
            }
            return Err(err);
        }
        tracing::info!("Started scan {}", key);
        Ok(())
    }

    /// Wait for a started scan to finish and return its summary.
    pub async fn wait(&self, scan_type: &ScanType) -> Result<ScanSummary, ScanError> {
        let key = scan_type.key();
        let scan = self.running.lock().await.remove(&key);
        let Some(scan) = scan else {
            return Err(ScanError::NotRunning(key));
        };
        scan.handle.await.map_err(|err| ScanError::TaskFailed(err.to_string()))?
    }

    /// Run a scan to completion in the caller's task.
    pub async fn run(
        &self,
        scan_type: ScanType,
        config: ScanConfig,
    ) -> Result<ScanSummary, ScanError> {
        self.start(scan_type, config).await?;
        self.wait(&scan_type).await
    }

    /// Cancel a running scan. The in-flight batch's finished prefix is checkpointed before the
    /// scan reports `Stopped`.
    pub async fn stop(&self, scan_type: &ScanType) -> Result<ScanSummary, ScanError> {
        let key = scan_type.key();
        {
            let running = self.running.lock().await;
            match running.get(&key) {
                Some(scan) if !scan.handle.is_finished() => scan.cancel.cancel(),
                _ => return Err(ScanError::NotRunning(key)),
            }
        }
        tracing::info!("Stopping scan {}", key);
        self.wait(scan_type).await
    }

    /// Current status of a scan type, falling back to its stored checkpoint when it has not run
    /// in this process.
    pub async fn status(&self, scan_type: &ScanType) -> Result<ScanStatus, ScanError> {
        let key = scan_type.key();
        let live = self.statuses.read().await.get(&key).cloned();
        if let Some(status) = live {
            return Ok(status.read().await.clone());
        }

        let mut status = ScanStatus::idle(scan_type);
        if let Some(checkpoint) = self.db.get_checkpoint(&key).await? {
            status.last_scanned_block = Some(checkpoint.last_scanned_block);
            status.blocks_scanned = checkpoint.blocks_scanned;
            status.events_found = checkpoint.events_found;
            status.errors = checkpoint.errors;
        }
        match self.rpc.get_block_count().await {
            Ok(height) => status.current_height = Some(height),
            Err(err) => tracing::debug!("Could not fetch chain height for status: {}", err),
        }
        Ok(status)
    }

    /// Delete the ledger rows in `[from, to]` and scan the range again as a gap-fill. Nothing is
    /// deleted unless this run holds the gap-fill's advancing lock.
    pub async fn rescan(&self, from: u64, to: u64, config: ScanConfig) -> Result<(), ScanError> {
        if from > to {
            return Err(ScanError::InvalidRange { from, to });
        }
        self.launch(ScanType::GapFill { from, to }, config, Some((from, to))).await
    }

    /// Resolve stake amounts for up to `limit` events recorded with an unknown stake amount.
    pub async fn backfill_stake_amounts(
        &self,
        config: &ScanConfig,
        limit: u64,
    ) -> Result<BackfillSummary, ScanError> {
        let cache = config.cache_block_data.then(|| self.cache.clone());
        let chain = CachedChain::new(self.rpc.clone(), cache);
        let policy = RetryPolicy::from_config(config);
        backfill_stake_amounts(&chain, &self.db, &self.tracked, &self.params, &policy, limit).await
    }

    /// Signal that the chain has a new tip. Wakes a follower waiting in
    /// [ScanManager::wait_for_new_block].
    pub fn notify_new_block(&self) {
        self.new_block.notify_one();
    }

    /// Wait until [ScanManager::notify_new_block] is called or `timeout` elapses. Returns true
    /// when woken by a notification.
    pub async fn wait_for_new_block(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.new_block.notified()).await.is_ok()
    }

    /// Cancel every running scan, including ones a caller is waiting on, and wait for the rest
    /// to checkpoint. Scans started afterwards are cancelled immediately.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let scans: Vec<(String, RunningScan)> = self.running.lock().await.drain().collect();
        for (key, scan) in scans {
            scan.cancel.cancel();
            match scan.handle.await {
                Ok(Ok(summary)) => tracing::info!("Scan {} ended as {}", key, summary.state),
                Ok(Err(err)) => tracing::warn!("Scan {} ended with error: {}", key, err),
                Err(err) => tracing::warn!("Scan {} task failed: {}", key, err),
            }
        }
    }
}

/// Take the advancing lock, then apply a pending reset. The lock is given back if the reset
/// fails.
async fn prepare(
    coordinator: &ScanCoordinator,
    db: &LedgerDbObj,
    reset: Option<(u64, u64)>,
) -> Result<(), ScanError> {
    coordinator.acquire().await?;
    if let Some((from, to)) = reset {
        if let Err(err) = reset_range(db, &coordinator.scan_type().key(), from, to).await {
            coordinator.release().await;
            return Err(err);
        }
    }
    coordinator.status_handle().write().await.is_running = true;
    Ok(())
}

async fn reset_range(db: &LedgerDbObj, key: &str, from: u64, to: u64) -> Result<(), ScanError> {
    let deleted = db.truncate_range(from, to).await?;
    db.delete_checkpoint(key).await?;
    tracing::info!("Truncated {} events in blocks {}-{} for re-scan", deleted, from, to);
    Ok(())
}
