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

//! One-time resolution of stake amounts for events recorded while an input lookup was failing.

use std::collections::BTreeMap;

use vrsc_rewards::{classify, extract_stake_events, ExtractionParams, StakeEvent, TrackedAddresses};

use crate::{
    cache::CachedChain,
    db::LedgerDbObj,
    scanner::{coordinator::resolve_prevouts, RetryPolicy, ScanError},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Pending events looked at
    pub examined: u64,
    /// Events whose stake amount, net reward and source are now known
    pub resolved: u64,
    /// Events left pending because a lookup still fails or the block no longer yields them
    pub still_pending: u64,
}

/// Push unresolved events behind the ones not yet tried.
async fn record_attempts(db: &LedgerDbObj, events: &[StakeEvent]) -> Result<(), ScanError> {
    for event in events {
        db.record_backfill_attempt(&event.txid, event.vout).await?;
    }
    Ok(())
}

/// Re-resolve up to `limit` pending events. Events that failed before are tried after the rest,
/// so a few permanently unresolvable events cannot starve newer ones.
pub async fn backfill_stake_amounts(
    chain: &CachedChain,
    db: &LedgerDbObj,
    tracked: &TrackedAddresses,
    params: &ExtractionParams,
    policy: &RetryPolicy,
    limit: u64,
) -> Result<BackfillSummary, ScanError> {
    let pending = db.get_pending_stake_events(limit).await?;
    let mut summary = BackfillSummary { examined: pending.len() as u64, ..Default::default() };

    let mut by_height: BTreeMap<u64, Vec<StakeEvent>> = BTreeMap::new();
    for event in pending {
        by_height.entry(event.block_height).or_default().push(event);
    }

    for (height, events) in by_height {
        let pending_count = events.len() as u64;
        let block = match policy.retry("getblock", || chain.block_at(height)).await {
            Ok(block) => block,
            Err(err) => {
                tracing::warn!("Backfill could not fetch block {}: {}", height, err);
                summary.still_pending += pending_count;
                record_attempts(db, &events).await?;
                continue;
            }
        };
        let Some(reward_tx) = classify(&block).reward_tx else {
            tracing::warn!("Backfill: block {} no longer classifies as a stake block", height);
            summary.still_pending += pending_count;
            record_attempts(db, &events).await?;
            continue;
        };

        let prevouts = resolve_prevouts(chain, policy, reward_tx, tracked, params).await;
        let recomputed = extract_stake_events(&block, reward_tx, tracked, &prevouts, params);

        for event in events {
            let resolved = recomputed.iter().find(|candidate| {
                candidate.txid == event.txid
                    && candidate.vout == event.vout
                    && candidate.identity_address == event.identity_address
                    && !candidate.stake_amount_pending
            });
            let Some(resolved) = resolved else {
                summary.still_pending += 1;
                db.record_backfill_attempt(&event.txid, event.vout).await?;
                continue;
            };
            if db.backfill_stake_event(resolved).await? {
                tracing::debug!(
                    "Backfilled {}:{} stake amount {:?}",
                    resolved.txid,
                    resolved.vout,
                    resolved.stake_amount_sats
                );
                summary.resolved += 1;
            } else {
                summary.still_pending += 1;
            }
        }
    }

    tracing::info!(
        "Stake amount backfill: {} examined, {} resolved, {} still pending",
        summary.examined,
        summary.resolved,
        summary.still_pending
    );
    Ok(summary)
}
