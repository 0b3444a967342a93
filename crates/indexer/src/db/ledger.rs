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

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyPool, Row,
};
use vrsc_rewards::{IdentitySnapshot, StakeEvent};

use super::DbError;

pub type LedgerDbObj = Arc<dyn StakeLedgerDb + Send + Sync>;

/// Resumability marker for one scan type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCheckpoint {
    pub scan_type: String,
    pub last_scanned_block: u64,
    pub blocks_scanned: u64,
    pub events_found: u64,
    pub errors: u64,
    pub updated_at: i64,
}

/// A block skipped after exhausting its retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBlock {
    pub block_height: u64,
    pub error: String,
}

/// Everything a scan batch makes durable, written in one transaction.
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub scan_type: String,
    /// Lowest height covered by the batch
    pub first_block: u64,
    /// New checkpoint; every height in `first_block..=last_scanned_block` was processed or failed
    pub last_scanned_block: u64,
    pub events: Vec<StakeEvent>,
    pub failed_blocks: Vec<FailedBlock>,
    pub blocks_scanned: u64,
}

/// Network-wide ledger totals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    pub total_events: u64,
    /// Sum of net rewards. Flagged events and pending events, which still hold a gross output
    /// amount, are left out.
    pub total_reward_sats: i64,
    pub flagged_events: u64,
    pub pending_events: u64,
    pub unique_identities: u64,
}

#[async_trait]
pub trait StakeLedgerDb {
    /// Persist a batch's events, failed blocks and checkpoint atomically. Events already in the
    /// ledger are ignored. Returns the number of newly inserted events.
    async fn commit_batch(&self, batch: BatchCommit) -> Result<u64, DbError>;

    /// Get the checkpoint for a scan type
    async fn get_checkpoint(&self, scan_type: &str) -> Result<Option<ScanCheckpoint>, DbError>;

    /// Forget a scan type's checkpoint so its next run starts from the beginning of its range
    async fn delete_checkpoint(&self, scan_type: &str) -> Result<(), DbError>;

    /// Take the advancing lock for a scan type. Succeeds if free, already held by `owner`, or
    /// held by someone whose heartbeat is older than `stale_after_secs`.
    async fn try_acquire_scan_lock(
        &self,
        scan_type: &str,
        owner: &str,
        stale_after_secs: u64,
    ) -> Result<bool, DbError>;

    /// Refresh the heartbeat of a held lock. Returns false if `owner` no longer holds it.
    async fn refresh_scan_lock(&self, scan_type: &str, owner: &str) -> Result<bool, DbError>;

    /// Release a lock held by `owner`
    async fn release_scan_lock(&self, scan_type: &str, owner: &str) -> Result<(), DbError>;

    /// Get all events credited to an address, oldest first
    async fn get_events_by_identity(&self, identity: &str) -> Result<Vec<StakeEvent>, DbError>;

    /// Get all events in an inclusive height range, ordered by height
    async fn get_events_in_range(&self, from: u64, to: u64) -> Result<Vec<StakeEvent>, DbError>;

    /// Total number of events in the ledger
    async fn count_events(&self) -> Result<u64, DbError>;

    /// Get events still waiting for their staked amount, fewest failed backfill attempts first,
    /// then oldest first
    async fn get_pending_stake_events(&self, limit: u64) -> Result<Vec<StakeEvent>, DbError>;

    /// Count a backfill attempt that left a pending event unresolved
    async fn record_backfill_attempt(&self, txid: &str, vout: u32) -> Result<(), DbError>;

    /// Apply the one-time stake amount backfill to a pending event. Returns false if the event
    /// was not pending.
    async fn backfill_stake_event(&self, event: &StakeEvent) -> Result<bool, DbError>;

    /// Delete events in an inclusive height range ahead of an administrative re-scan
    async fn truncate_range(&self, from: u64, to: u64) -> Result<u64, DbError>;

    /// Get blocks a scan type skipped, by height
    async fn get_failed_blocks(&self, scan_type: &str) -> Result<Vec<FailedBlock>, DbError>;

    /// Distinct addresses with at least one event
    async fn list_identity_addresses(&self) -> Result<Vec<String>, DbError>;

    /// Upsert a derived identity snapshot
    async fn upsert_identity_snapshot(&self, snapshot: &IdentitySnapshot) -> Result<(), DbError>;

    /// Get the stored snapshot for an address
    async fn get_identity_snapshot(
        &self,
        identity: &str,
    ) -> Result<Option<IdentitySnapshot>, DbError>;

    /// Get stored snapshots with pagination, sorted by total reward
    async fn get_identity_snapshots(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<IdentitySnapshot>, DbError>;

    /// Network-wide totals
    async fn get_network_summary(&self) -> Result<NetworkSummary, DbError>;
}

// Batch insert chunk size to avoid parameter limits
// 12 columns per event keeps a chunk under SQLite's default 999 parameters
const BATCH_INSERT_CHUNK_SIZE: usize = 75;

const EVENT_COLUMNS: &str = "identity_address, txid, vout, block_height, block_hash, block_time, \
     amount_sats, stake_amount_sats, source_address, stake_amount_pending, exceeds_ceiling";

const SNAPSHOT_COLUMNS: &str = "identity_address, total_stakes, total_reward_sats, apy_all_time, \
     apy_yearly, apy_90d, apy_30d, apy_7d, calculation_method, confidence, \
     stakes_with_real_amounts, avg_stake_amount_sats, delegated_stakes, excluded_outliers, \
     first_stake_time, last_stake_time, computed_at";

fn to_u64(value: i64, column: &str) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::BadRow(format!("negative {column}: {value}")))
}

fn event_from_row(row: &AnyRow) -> Result<StakeEvent, DbError> {
    let vout: i64 = row.try_get("vout")?;
    Ok(StakeEvent {
        identity_address: row.try_get("identity_address")?,
        txid: row.try_get("txid")?,
        vout: u32::try_from(vout).map_err(|_| DbError::BadRow(format!("invalid vout: {vout}")))?,
        block_height: to_u64(row.try_get("block_height")?, "block_height")?,
        block_hash: row.try_get("block_hash")?,
        block_time: row.try_get("block_time")?,
        amount_sats: row.try_get("amount_sats")?,
        stake_amount_sats: row.try_get("stake_amount_sats")?,
        source_address: row.try_get("source_address")?,
        stake_amount_pending: row.try_get::<i64, _>("stake_amount_pending")? != 0,
        exceeds_ceiling: row.try_get::<i64, _>("exceeds_ceiling")? != 0,
    })
}

fn snapshot_from_row(row: &AnyRow) -> Result<IdentitySnapshot, DbError> {
    let method: String = row.try_get("calculation_method")?;
    let confidence: String = row.try_get("confidence")?;
    Ok(IdentitySnapshot {
        identity_address: row.try_get("identity_address")?,
        total_stakes: to_u64(row.try_get("total_stakes")?, "total_stakes")?,
        total_reward_sats: row.try_get("total_reward_sats")?,
        apy_all_time: row.try_get("apy_all_time")?,
        apy_yearly: row.try_get("apy_yearly")?,
        apy_90d: row.try_get("apy_90d")?,
        apy_30d: row.try_get("apy_30d")?,
        apy_7d: row.try_get("apy_7d")?,
        calculation_method: method.parse().map_err(DbError::BadRow)?,
        confidence: confidence.parse().map_err(DbError::BadRow)?,
        stakes_with_real_amounts: to_u64(
            row.try_get("stakes_with_real_amounts")?,
            "stakes_with_real_amounts",
        )?,
        avg_stake_amount_sats: row.try_get("avg_stake_amount_sats")?,
        delegated_stakes: to_u64(row.try_get("delegated_stakes")?, "delegated_stakes")?,
        excluded_outliers: to_u64(row.try_get("excluded_outliers")?, "excluded_outliers")?,
        first_stake_time: row.try_get("first_stake_time")?,
        last_stake_time: row.try_get("last_stake_time")?,
        computed_at: row.try_get("computed_at")?,
    })
}

/// Stake ledger on any sqlx-supported database (SQLite for tests, Postgres in production).
pub struct LedgerDb {
    pool: AnyPool,
}

impl LedgerDb {
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(20).connect(database_url).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StakeLedgerDb for LedgerDb {
    async fn commit_batch(&self, batch: BatchCommit) -> Result<u64, DbError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        // Process in chunks to avoid parameter limits
        for chunk in batch.events.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let mut values_clauses = Vec::new();
            let mut param_idx = 1;

            for _ in chunk {
                let params: Vec<String> =
                    (param_idx..param_idx + 12).map(|i| format!("${}", i)).collect();
                values_clauses.push(format!("({})", params.join(",")));
                param_idx += 12;
            }

            let query = format!(
                r#"INSERT INTO stake_events
                ({}, created_at)
                VALUES {}
                ON CONFLICT (txid, vout) DO NOTHING"#,
                EVENT_COLUMNS,
                values_clauses.join(",")
            );

            let mut q = sqlx::query(&query);
            for event in chunk {
                q = q
                    .bind(event.identity_address.clone())
                    .bind(event.txid.clone())
                    .bind(event.vout as i64)
                    .bind(event.block_height as i64)
                    .bind(event.block_hash.clone())
                    .bind(event.block_time)
                    .bind(event.amount_sats)
                    .bind(event.stake_amount_sats)
                    .bind(event.source_address.clone())
                    .bind(event.stake_amount_pending as i64)
                    .bind(event.exceeds_ceiling as i64)
                    .bind(now);
            }
            inserted += q.execute(&mut *tx).await?.rows_affected();
        }

        // Failures recorded earlier for heights this batch covered are superseded
        sqlx::query("DELETE FROM scan_failures WHERE block_height >= $1 AND block_height <= $2")
            .bind(batch.first_block as i64)
            .bind(batch.last_scanned_block as i64)
            .execute(&mut *tx)
            .await?;

        for failed in &batch.failed_blocks {
            sqlx::query(
                r#"INSERT INTO scan_failures (scan_type, block_height, error, failed_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (scan_type, block_height)
                DO UPDATE SET error = EXCLUDED.error, failed_at = EXCLUDED.failed_at"#,
            )
            .bind(batch.scan_type.clone())
            .bind(failed.block_height as i64)
            .bind(failed.error.clone())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let query = r#"
            INSERT INTO scan_checkpoints
            (scan_type, last_scanned_block, blocks_scanned, events_found, errors, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (scan_type)
            DO UPDATE SET
                last_scanned_block = EXCLUDED.last_scanned_block,
                blocks_scanned = scan_checkpoints.blocks_scanned + EXCLUDED.blocks_scanned,
                events_found = scan_checkpoints.events_found + EXCLUDED.events_found,
                errors = scan_checkpoints.errors + EXCLUDED.errors,
                updated_at = EXCLUDED.updated_at
            WHERE scan_checkpoints.last_scanned_block <= EXCLUDED.last_scanned_block
        "#;

        let updated = sqlx::query(query)
            .bind(batch.scan_type.clone())
            .bind(batch.last_scanned_block as i64)
            .bind(batch.blocks_scanned as i64)
            .bind(inserted as i64)
            .bind(batch.failed_blocks.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            // Dropping the transaction rolls back the events written above
            return Err(DbError::CheckpointRegression(batch.scan_type));
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_checkpoint(&self, scan_type: &str) -> Result<Option<ScanCheckpoint>, DbError> {
        let query = r#"
            SELECT scan_type, last_scanned_block, blocks_scanned, events_found, errors, updated_at
            FROM scan_checkpoints
            WHERE scan_type = $1
        "#;
        let row = sqlx::query(query).bind(scan_type).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(Some(ScanCheckpoint {
                scan_type: row.try_get("scan_type")?,
                last_scanned_block: to_u64(
                    row.try_get("last_scanned_block")?,
                    "last_scanned_block",
                )?,
                blocks_scanned: to_u64(row.try_get("blocks_scanned")?, "blocks_scanned")?,
                events_found: to_u64(row.try_get("events_found")?, "events_found")?,
                errors: to_u64(row.try_get("errors")?, "errors")?,
                updated_at: row.try_get("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn delete_checkpoint(&self, scan_type: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM scan_checkpoints WHERE scan_type = $1")
            .bind(scan_type)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn try_acquire_scan_lock(
        &self,
        scan_type: &str,
        owner: &str,
        stale_after_secs: u64,
    ) -> Result<bool, DbError> {
        let now = Utc::now().timestamp();
        let stale_before = now - stale_after_secs as i64;
        let query = r#"
            INSERT INTO scan_locks (scan_type, owner, heartbeat_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (scan_type)
            DO UPDATE SET owner = EXCLUDED.owner, heartbeat_at = EXCLUDED.heartbeat_at
            WHERE scan_locks.owner = EXCLUDED.owner OR scan_locks.heartbeat_at < $4
        "#;

        let acquired = sqlx::query(query)
            .bind(scan_type)
            .bind(owner)
            .bind(now)
            .bind(stale_before)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(acquired == 1)
    }

    async fn refresh_scan_lock(&self, scan_type: &str, owner: &str) -> Result<bool, DbError> {
        let refreshed = sqlx::query(
            "UPDATE scan_locks SET heartbeat_at = $1 WHERE scan_type = $2 AND owner = $3",
        )
        .bind(Utc::now().timestamp())
        .bind(scan_type)
        .bind(owner)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(refreshed == 1)
    }

    async fn release_scan_lock(&self, scan_type: &str, owner: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM scan_locks WHERE scan_type = $1 AND owner = $2")
            .bind(scan_type)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_events_by_identity(&self, identity: &str) -> Result<Vec<StakeEvent>, DbError> {
        let query = format!(
            "SELECT {} FROM stake_events WHERE identity_address = $1 ORDER BY block_height ASC, vout ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&query).bind(identity).fetch_all(&self.pool).await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> Result<Vec<StakeEvent>, DbError> {
        let query = format!(
            "SELECT {} FROM stake_events
             WHERE block_height >= $1 AND block_height <= $2
             ORDER BY block_height ASC, txid ASC, vout ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(from as i64)
            .bind(to as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn count_events(&self) -> Result<u64, DbError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stake_events")
            .fetch_one(&self.pool)
            .await?;

        to_u64(row.try_get("n")?, "count")
    }

    async fn get_pending_stake_events(&self, limit: u64) -> Result<Vec<StakeEvent>, DbError> {
        let query = format!(
            "SELECT {} FROM stake_events
             WHERE stake_amount_pending = 1
             ORDER BY backfill_attempts ASC, block_height ASC, txid ASC, vout ASC
             LIMIT $1",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&query).bind(limit as i64).fetch_all(&self.pool).await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn record_backfill_attempt(&self, txid: &str, vout: u32) -> Result<(), DbError> {
        sqlx::query(
            r#"UPDATE stake_events
            SET backfill_attempts = backfill_attempts + 1
            WHERE txid = $1 AND vout = $2 AND stake_amount_pending = 1"#,
        )
        .bind(txid)
        .bind(vout as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn backfill_stake_event(&self, event: &StakeEvent) -> Result<bool, DbError> {
        let query = r#"
            UPDATE stake_events
            SET amount_sats = $1,
                stake_amount_sats = $2,
                source_address = $3,
                exceeds_ceiling = $4,
                stake_amount_pending = 0
            WHERE txid = $5 AND vout = $6 AND stake_amount_pending = 1
        "#;

        let updated = sqlx::query(query)
            .bind(event.amount_sats)
            .bind(event.stake_amount_sats)
            .bind(event.source_address.clone())
            .bind(event.exceeds_ceiling as i64)
            .bind(event.txid.clone())
            .bind(event.vout as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(updated == 1)
    }

    async fn truncate_range(&self, from: u64, to: u64) -> Result<u64, DbError> {
        let deleted =
            sqlx::query("DELETE FROM stake_events WHERE block_height >= $1 AND block_height <= $2")
                .bind(from as i64)
                .bind(to as i64)
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(deleted)
    }

    async fn get_failed_blocks(&self, scan_type: &str) -> Result<Vec<FailedBlock>, DbError> {
        let rows = sqlx::query(
            "SELECT block_height, error FROM scan_failures WHERE scan_type = $1 ORDER BY block_height ASC",
        )
        .bind(scan_type)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for row in rows {
            results.push(FailedBlock {
                block_height: to_u64(row.try_get("block_height")?, "block_height")?,
                error: row.try_get("error")?,
            });
        }

        Ok(results)
    }

    async fn list_identity_addresses(&self) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query(
            "SELECT DISTINCT identity_address FROM stake_events ORDER BY identity_address ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.try_get("identity_address")?);
        }

        Ok(results)
    }

    async fn upsert_identity_snapshot(&self, snapshot: &IdentitySnapshot) -> Result<(), DbError> {
        let params: Vec<String> = (1..=17).map(|i| format!("${}", i)).collect();
        let query = format!(
            r#"INSERT INTO identity_snapshots
            ({})
            VALUES ({})
            ON CONFLICT (identity_address)
            DO UPDATE SET
                total_stakes = EXCLUDED.total_stakes,
                total_reward_sats = EXCLUDED.total_reward_sats,
                apy_all_time = EXCLUDED.apy_all_time,
                apy_yearly = EXCLUDED.apy_yearly,
                apy_90d = EXCLUDED.apy_90d,
                apy_30d = EXCLUDED.apy_30d,
                apy_7d = EXCLUDED.apy_7d,
                calculation_method = EXCLUDED.calculation_method,
                confidence = EXCLUDED.confidence,
                stakes_with_real_amounts = EXCLUDED.stakes_with_real_amounts,
                avg_stake_amount_sats = EXCLUDED.avg_stake_amount_sats,
                delegated_stakes = EXCLUDED.delegated_stakes,
                excluded_outliers = EXCLUDED.excluded_outliers,
                first_stake_time = EXCLUDED.first_stake_time,
                last_stake_time = EXCLUDED.last_stake_time,
                computed_at = EXCLUDED.computed_at"#,
            SNAPSHOT_COLUMNS,
            params.join(",")
        );

        sqlx::query(&query)
            .bind(snapshot.identity_address.clone())
            .bind(snapshot.total_stakes as i64)
            .bind(snapshot.total_reward_sats)
            .bind(snapshot.apy_all_time)
            .bind(snapshot.apy_yearly)
            .bind(snapshot.apy_90d)
            .bind(snapshot.apy_30d)
            .bind(snapshot.apy_7d)
            .bind(snapshot.calculation_method.as_str())
            .bind(snapshot.confidence.as_str())
            .bind(snapshot.stakes_with_real_amounts as i64)
            .bind(snapshot.avg_stake_amount_sats)
            .bind(snapshot.delegated_stakes as i64)
            .bind(snapshot.excluded_outliers as i64)
            .bind(snapshot.first_stake_time)
            .bind(snapshot.last_stake_time)
            .bind(snapshot.computed_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_identity_snapshot(
        &self,
        identity: &str,
    ) -> Result<Option<IdentitySnapshot>, DbError> {
        let query = format!(
            "SELECT {} FROM identity_snapshots WHERE identity_address = $1",
            SNAPSHOT_COLUMNS
        );
        let row = sqlx::query(&query).bind(identity).fetch_optional(&self.pool).await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_identity_snapshots(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<IdentitySnapshot>, DbError> {
        let query = format!(
            "SELECT {} FROM identity_snapshots
             ORDER BY total_reward_sats DESC, identity_address ASC
             LIMIT $1 OFFSET $2",
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn get_network_summary(&self) -> Result<NetworkSummary, DbError> {
        let query = r#"
            SELECT
                COUNT(*) AS total_events,
                CAST(COALESCE(SUM(CASE WHEN exceeds_ceiling = 0 AND stake_amount_pending = 0 THEN amount_sats ELSE 0 END), 0) AS BIGINT) AS total_reward_sats,
                CAST(COALESCE(SUM(exceeds_ceiling), 0) AS BIGINT) AS flagged_events,
                CAST(COALESCE(SUM(stake_amount_pending), 0) AS BIGINT) AS pending_events,
                COUNT(DISTINCT identity_address) AS unique_identities
            FROM stake_events
        "#;
        let row = sqlx::query(query).fetch_one(&self.pool).await?;

        Ok(NetworkSummary {
            total_events: to_u64(row.try_get("total_events")?, "total_events")?,
            total_reward_sats: row.try_get("total_reward_sats")?,
            flagged_events: to_u64(row.try_get("flagged_events")?, "flagged_events")?,
            pending_events: to_u64(row.try_get("pending_events")?, "pending_events")?,
            unique_identities: to_u64(row.try_get("unique_identities")?, "unique_identities")?,
        })
    }
}
