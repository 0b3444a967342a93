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

use chrono::Utc;
use vrsc_rewards::{compute_identity_snapshot, rank_identities, IdentitySnapshot, RankedIdentity};

use crate::db::{DbError, LedgerDbObj, NetworkSummary};

/// Read-only projection of the ledger into per-identity snapshots. Takes no locks, so it can
/// run while scans are writing.
#[derive(Clone)]
pub struct StatisticsAggregator {
    db: LedgerDbObj,
}

impl StatisticsAggregator {
    pub fn new(db: LedgerDbObj) -> Self {
        Self { db }
    }

    /// Replay an identity's events into a fresh snapshot and store it.
    pub async fn recompute(&self, identity_address: &str) -> Result<IdentitySnapshot, DbError> {
        self.recompute_at(identity_address, Utc::now().timestamp()).await
    }

    /// [StatisticsAggregator::recompute] as of `now` (unix seconds).
    pub async fn recompute_at(
        &self,
        identity_address: &str,
        now: i64,
    ) -> Result<IdentitySnapshot, DbError> {
        let events = self.db.get_events_by_identity(identity_address).await?;
        let snapshot = compute_identity_snapshot(identity_address, &events, now);
        self.db.upsert_identity_snapshot(&snapshot).await?;
        tracing::debug!(
            "Recomputed {}: {} stakes, {} sats, confidence {}",
            identity_address,
            snapshot.total_stakes,
            snapshot.total_reward_sats,
            snapshot.confidence
        );
        Ok(snapshot)
    }

    /// Recompute every identity with at least one event.
    pub async fn recompute_all(&self) -> Result<Vec<IdentitySnapshot>, DbError> {
        let now = Utc::now().timestamp();
        let identities = self.db.list_identity_addresses().await?;
        let mut snapshots = Vec::with_capacity(identities.len());
        for identity in identities {
            snapshots.push(self.recompute_at(&identity, now).await?);
        }
        tracing::info!("Recomputed statistics for {} identities", snapshots.len());
        Ok(snapshots)
    }

    pub async fn snapshot(&self, identity_address: &str) -> Result<Option<IdentitySnapshot>, DbError> {
        self.db.get_identity_snapshot(identity_address).await
    }

    /// Leaderboard page from stored snapshots. Ranks continue across pages.
    pub async fn rankings(&self, offset: u64, limit: u64) -> Result<Vec<RankedIdentity>, DbError> {
        let snapshots = self.db.get_identity_snapshots(offset, limit).await?;
        let mut ranked = rank_identities(&snapshots);
        for entry in &mut ranked {
            entry.rank += offset;
        }
        Ok(ranked)
    }

    pub async fn network_summary(&self) -> Result<NetworkSummary, DbError> {
        self.db.get_network_summary().await
    }
}
