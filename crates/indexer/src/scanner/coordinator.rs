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

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::Utc;
use futures_util::{stream, StreamExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vrsc_rewards::{
    classify, extract_stake_events, is_block_time_plausible, required_prevouts, Block,
    ExtractionParams, PrevOutput, PrevOutputs, StakeEvent, Transaction, TrackedAddresses,
};

use super::{RetryPolicy, ScanConfig, ScanError, ScanState, ScanStatus, ScanType};
use crate::{
    cache::CachedChain,
    db::{BatchCommit, FailedBlock, LedgerDbObj},
};

/// Result of one coordinator run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub scan_type: String,
    pub state: ScanState,
    pub range: Option<(u64, u64)>,
    pub last_scanned_block: Option<u64>,
    pub blocks_scanned: u64,
    pub events_inserted: u64,
    pub errors: u64,
}

#[derive(Debug)]
enum BlockOutcome {
    Scanned { height: u64, events: Vec<StakeEvent> },
    Failed { height: u64, error: String },
}

impl BlockOutcome {
    fn height(&self) -> u64 {
        match self {
            BlockOutcome::Scanned { height, .. } | BlockOutcome::Failed { height, .. } => *height,
        }
    }
}

/// Outcomes that may be checkpointed: the run of consecutive heights starting at `from`.
fn contiguous_prefix(from: u64, completed: BTreeMap<u64, BlockOutcome>) -> Vec<BlockOutcome> {
    let mut prefix = Vec::new();
    let mut expected = from;
    for (height, outcome) in completed {
        if height != expected {
            break;
        }
        prefix.push(outcome);
        expected += 1;
    }
    prefix
}

/// Look up the previous outputs a reward transaction spends. Lookups that fail after retries
/// are recorded as `None`.
pub(crate) async fn resolve_prevouts(
    chain: &CachedChain,
    policy: &RetryPolicy,
    reward_tx: &Transaction,
    tracked: &TrackedAddresses,
    params: &ExtractionParams,
) -> PrevOutputs {
    let mut prevouts = PrevOutputs::new();
    for outpoint in required_prevouts(reward_tx, tracked, params) {
        let resolved =
            match policy.retry("getrawtransaction", || chain.transaction(&outpoint.txid)).await {
                Ok(tx) => tx.output(outpoint.vout).map(PrevOutput::from),
                Err(err) => {
                    tracing::warn!(
                        "Failed to resolve input {}:{} of {}: {}",
                        outpoint.txid,
                        outpoint.vout,
                        reward_tx.txid,
                        err
                    );
                    None
                }
            };
        prevouts.insert(outpoint, resolved);
    }
    prevouts
}

/// Drives one scan type through `Idle → RangeDetermined → Scanning → Checkpointing` until the
/// range is done, the run is cancelled, or the error rate is exceeded.
pub struct ScanCoordinator {
    chain: CachedChain,
    db: LedgerDbObj,
    tracked: Arc<TrackedAddresses>,
    params: Arc<ExtractionParams>,
    scan_type: ScanType,
    config: ScanConfig,
    owner: String,
    cancel: CancellationToken,
    status: Arc<RwLock<ScanStatus>>,
}

impl ScanCoordinator {
    pub fn new(
        chain: CachedChain,
        db: LedgerDbObj,
        tracked: Arc<TrackedAddresses>,
        params: Arc<ExtractionParams>,
        scan_type: ScanType,
        config: ScanConfig,
    ) -> Self {
        Self {
            chain,
            db,
            tracked,
            params,
            status: Arc::new(RwLock::new(ScanStatus::idle(&scan_type))),
            scan_type,
            config,
            owner: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Identity recorded as the holder of the advancing lock
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_status(mut self, status: Arc<RwLock<ScanStatus>>) -> Self {
        self.status = status;
        self
    }

    pub fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status_handle(&self) -> Arc<RwLock<ScanStatus>> {
        self.status.clone()
    }

    /// Acquire the advancing lock and scan to completion.
    pub async fn run(&self) -> Result<ScanSummary, ScanError> {
        self.acquire().await?;
        self.run_acquired().await
    }

    /// Take the advancing lock, failing fast if another run holds it.
    pub async fn acquire(&self) -> Result<(), ScanError> {
        self.config.validate()?;
        let key = self.scan_type.key();
        let acquired = self
            .db
            .try_acquire_scan_lock(&key, &self.owner, self.config.lock_stale_after_secs)
            .await?;
        if !acquired {
            return Err(ScanError::AlreadyRunning(key));
        }
        Ok(())
    }

    /// Give up the advancing lock taken by [ScanCoordinator::acquire]
    pub async fn release(&self) {
        let key = self.scan_type.key();
        if let Err(err) = self.db.release_scan_lock(&key, &self.owner).await {
            tracing::warn!("Failed to release scan lock for {}: {}", key, err);
        }
    }

    /// Scan with the lock already held by [ScanCoordinator::acquire]. Releases it on return.
    pub async fn run_acquired(&self) -> Result<ScanSummary, ScanError> {
        let key = self.scan_type.key();
        let result = self.scan().await;
        self.release().await;

        let mut status = self.status.write().await;
        status.is_running = false;
        status.estimated_completion = None;
        match &result {
            Ok(summary) => {
                status.state = summary.state;
                tracing::info!(
                    "Scan {} finished as {}: {} blocks, {} new events, {} errors",
                    key,
                    summary.state,
                    summary.blocks_scanned,
                    summary.events_inserted,
                    summary.errors
                );
            }
            Err(err) => {
                status.state = ScanState::Errored;
                status.last_error = Some(err.to_string());
                tracing::error!("Scan {} errored: {}", key, err);
            }
        }
        result
    }

    async fn set_state(&self, state: ScanState) {
        self.status.write().await.state = state;
    }

    async fn scan(&self) -> Result<ScanSummary, ScanError> {
        let key = self.scan_type.key();
        let policy = RetryPolicy::from_config(&self.config);
        let checkpoint = self.db.get_checkpoint(&key).await?;
        let last_scanned = checkpoint.as_ref().map(|c| c.last_scanned_block);

        {
            let mut status = self.status.write().await;
            *status = ScanStatus::idle(&self.scan_type);
            status.is_running = true;
            status.last_scanned_block = last_scanned;
            if let Some(checkpoint) = &checkpoint {
                status.blocks_scanned = checkpoint.blocks_scanned;
                status.events_found = checkpoint.events_found;
                status.errors = checkpoint.errors;
            }
        }

        let chain_height =
            policy.retry("getblockcount", || self.chain.rpc().get_block_count()).await?;
        let range = self.scan_type.determine_range(
            last_scanned,
            chain_height,
            &self.config,
            self.params.activation_height,
        );

        let mut summary = ScanSummary {
            scan_type: key.clone(),
            state: ScanState::Complete,
            range,
            last_scanned_block: last_scanned,
            blocks_scanned: 0,
            events_inserted: 0,
            errors: 0,
        };

        {
            let mut status = self.status.write().await;
            status.current_height = Some(chain_height);
            status.range = range;
        }

        let Some((start, end)) = range else {
            tracing::info!("Scan {} is up to date at block {}", key, chain_height);
            return Ok(summary);
        };

        self.set_state(ScanState::RangeDetermined).await;
        let config = self.config.profiled(end - start + 1);
        tracing::info!(
            "Scan {} covering blocks {}-{} (batch size {}, concurrency {})",
            key,
            start,
            end,
            config.block_batch_size,
            config.max_concurrent_requests
        );

        let started = Instant::now();
        let mut next = start;
        while next <= end {
            if self.cancel.is_cancelled() {
                summary.state = ScanState::Stopped;
                break;
            }

            let batch_end = next.saturating_add(config.block_batch_size - 1).min(end);
            self.set_state(ScanState::Scanning).await;
            let (outcomes, interrupted) = self.scan_batch(next, batch_end, &config, &policy).await;

            if !outcomes.is_empty() {
                self.set_state(ScanState::Checkpointing).await;
                let committed_to = self.checkpoint(next, outcomes, &mut summary).await?;
                next = committed_to + 1;

                let elapsed = started.elapsed().as_secs_f64();
                if summary.blocks_scanned > 0 && elapsed > 0.0 {
                    let per_block = elapsed / summary.blocks_scanned as f64;
                    let remaining = end.saturating_sub(committed_to) as f64;
                    self.status.write().await.estimated_completion =
                        Some(Utc::now().timestamp() + (per_block * remaining) as i64);
                }
            }

            if interrupted {
                summary.state = ScanState::Stopped;
                break;
            }

            if summary.blocks_scanned >= config.error_rate_min_blocks
                && summary.errors as f64 / summary.blocks_scanned as f64 > config.max_error_rate
            {
                return Err(ScanError::ErrorRateExceeded {
                    errors: summary.errors,
                    blocks: summary.blocks_scanned,
                });
            }

            if next <= end && config.delay_between_batches_ms > 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(config.delay_between_batches()) => {}
                }
            }
        }

        if summary.state == ScanState::Stopped {
            tracing::info!("Scan {} stopped at block {:?}", key, summary.last_scanned_block);
        }
        Ok(summary)
    }

    /// Fetch and extract a batch with bounded concurrency. Returns the contiguous prefix of
    /// finished blocks and whether the batch was cut short by cancellation.
    async fn scan_batch(
        &self,
        from: u64,
        to: u64,
        config: &ScanConfig,
        policy: &RetryPolicy,
    ) -> (Vec<BlockOutcome>, bool) {
        let mut completed = BTreeMap::new();
        let mut interrupted = false;

        let mut blocks = stream::iter(from..=to)
            .map(|height| self.scan_block(height, policy))
            .buffer_unordered(config.max_concurrent_requests);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                outcome = blocks.next() => match outcome {
                    Some(outcome) => {
                        completed.insert(outcome.height(), outcome);
                    }
                    None => break,
                },
            }
        }

        (contiguous_prefix(from, completed), interrupted)
    }

    async fn scan_block(&self, height: u64, policy: &RetryPolicy) -> BlockOutcome {
        match policy.retry("getblock", || self.chain.block_at(height)).await {
            Ok(block) => {
                let events = self.extract_block(&block, policy).await;
                BlockOutcome::Scanned { height, events }
            }
            Err(err) if err.is_malformed() => {
                tracing::warn!("Rejecting block {} with malformed data: {}", height, err);
                BlockOutcome::Scanned { height, events: Vec::new() }
            }
            Err(err) => {
                tracing::warn!("Skipping block {} after retries: {}", height, err);
                BlockOutcome::Failed { height, error: err.to_string() }
            }
        }
    }

    async fn extract_block(&self, block: &Block, policy: &RetryPolicy) -> Vec<StakeEvent> {
        let classification = classify(block);
        let Some(reward_tx) = classification.reward_tx.filter(|_| classification.is_stake_block)
        else {
            tracing::trace!("Block {} is not a stake block", block.height);
            return Vec::new();
        };
        if !is_block_time_plausible(block, Utc::now().timestamp()) {
            tracing::warn!("Rejecting block {} with implausible time {}", block.height, block.time);
            return Vec::new();
        }

        let prevouts =
            resolve_prevouts(&self.chain, policy, reward_tx, &self.tracked, &self.params).await;
        let events =
            extract_stake_events(block, reward_tx, &self.tracked, &prevouts, &self.params);
        for event in &events {
            tracing::debug!(
                "Stake event at block {}: {} earned {} sats (source {:?})",
                event.block_height,
                event.identity_address,
                event.amount_sats,
                event.source_address
            );
        }
        events
    }

    /// Persist a batch prefix together with its checkpoint. Returns the new checkpoint height.
    async fn checkpoint(
        &self,
        first_block: u64,
        outcomes: Vec<BlockOutcome>,
        summary: &mut ScanSummary,
    ) -> Result<u64, ScanError> {
        let key = self.scan_type.key();
        if !self.db.refresh_scan_lock(&key, &self.owner).await? {
            return Err(ScanError::LockLost(key));
        }

        let blocks = outcomes.len() as u64;
        let last_block = first_block + blocks - 1;
        let mut events = Vec::new();
        let mut failed_blocks = Vec::new();
        for outcome in outcomes {
            match outcome {
                BlockOutcome::Scanned { events: block_events, .. } => events.extend(block_events),
                BlockOutcome::Failed { height, error } => {
                    failed_blocks.push(FailedBlock { block_height: height, error })
                }
            }
        }
        let errors = failed_blocks.len() as u64;
        let last_error =
            failed_blocks.last().map(|f| format!("block {}: {}", f.block_height, f.error));

        let inserted = self
            .db
            .commit_batch(BatchCommit {
                scan_type: key.clone(),
                first_block,
                last_scanned_block: last_block,
                events,
                failed_blocks,
                blocks_scanned: blocks,
            })
            .await?;

        summary.last_scanned_block = Some(last_block);
        summary.blocks_scanned += blocks;
        summary.events_inserted += inserted;
        summary.errors += errors;

        {
            let mut status = self.status.write().await;
            status.last_scanned_block = Some(last_block);
            status.blocks_scanned += blocks;
            status.events_found += inserted;
            status.errors += errors;
            if last_error.is_some() {
                status.last_error = last_error;
            }
        }

        tracing::info!(
            "Scan {} checkpointed blocks {}-{}: {} new events, {} errors",
            key,
            first_block,
            last_block,
            inserted,
            errors
        );
        Ok(last_block)
    }
}
