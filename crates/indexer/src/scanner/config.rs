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

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use super::ScanError;

/// Tuning for one scan run. Every field has a default so a partial `[scan]` table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanConfig {
    pub max_concurrent_requests: usize,
    pub delay_between_batches_ms: u64,
    pub block_batch_size: u64,
    /// Retries after the first attempt of a single RPC call
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub cache_block_data: bool,
    pub cache_max_entries: u64,
    pub start_from_height: Option<u64>,
    pub end_at_height: Option<u64>,
    /// Let the remaining range size pick concurrency, delay and batch size
    pub auto_profile: bool,
    /// Fraction of failed blocks above which a run stops itself
    pub max_error_rate: f64,
    /// Blocks a run must have attempted before the error rate is checked
    pub error_rate_min_blocks: u64,
    pub lock_stale_after_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            delay_between_batches_ms: 100,
            block_batch_size: 100,
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            cache_block_data: true,
            cache_max_entries: 10_000,
            start_from_height: None,
            end_at_height: None,
            auto_profile: false,
            max_error_rate: 0.1,
            error_rate_min_blocks: 100,
            lock_stale_after_secs: 300,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.max_concurrent_requests == 0 {
            return Err(ScanError::InvalidConfig("maxConcurrentRequests must be > 0".into()));
        }
        if self.block_batch_size == 0 {
            return Err(ScanError::InvalidConfig("blockBatchSize must be > 0".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ScanError::InvalidConfig("backoffMultiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(ScanError::InvalidConfig("maxErrorRate must be within [0, 1]".into()));
        }
        if let (Some(start), Some(end)) = (self.start_from_height, self.end_at_height) {
            if start > end {
                return Err(ScanError::InvalidRange { from: start, to: end });
            }
        }
        Ok(())
    }

    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    /// Copy of this config with the profile for `remaining_blocks` applied, when auto profiling
    /// is on.
    pub fn profiled(&self, remaining_blocks: u64) -> ScanConfig {
        if !self.auto_profile {
            return self.clone();
        }
        let profile = ScanProfile::for_range(remaining_blocks);
        ScanConfig {
            max_concurrent_requests: profile.max_concurrent_requests,
            delay_between_batches_ms: profile.delay_between_batches_ms,
            block_batch_size: profile.block_batch_size,
            ..self.clone()
        }
    }
}

/// Load shape for a scan, chosen by how many blocks remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProfile {
    pub name: &'static str,
    pub max_concurrent_requests: usize,
    pub delay_between_batches_ms: u64,
    pub block_batch_size: u64,
}

const PROFILES: [(u64, ScanProfile); 4] = [
    (
        1_000,
        ScanProfile {
            name: "catch-up",
            max_concurrent_requests: 16,
            delay_between_batches_ms: 0,
            block_batch_size: 50,
        },
    ),
    (
        100_000,
        ScanProfile {
            name: "standard",
            max_concurrent_requests: 8,
            delay_between_batches_ms: 100,
            block_batch_size: 100,
        },
    ),
    (
        1_000_000,
        ScanProfile {
            name: "conservative",
            max_concurrent_requests: 4,
            delay_between_batches_ms: 250,
            block_batch_size: 200,
        },
    ),
    (
        u64::MAX,
        ScanProfile {
            name: "bulk",
            max_concurrent_requests: 2,
            delay_between_batches_ms: 500,
            block_batch_size: 250,
        },
    ),
];

impl ScanProfile {
    /// Larger ranges get lower concurrency and longer pauses.
    pub fn for_range(remaining_blocks: u64) -> ScanProfile {
        PROFILES
            .iter()
            .find(|(limit, _)| remaining_blocks <= *limit)
            .map(|(_, profile)| *profile)
            .unwrap_or(PROFILES[PROFILES.len() - 1].1)
    }
}

/// A named strategy for deriving the `[start, end]` range of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanType {
    /// Walk from the activation height (or `startFromHeight`) to the tip
    Historical,
    /// Follow the tip; without a checkpoint it starts at the current tip
    Incremental,
    /// Re-walk a fixed inclusive range
    GapFill { from: u64, to: u64 },
}

impl ScanType {
    /// Checkpoint and lock key
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Inclusive range still to scan, or `None` when there is nothing left.
    pub fn determine_range(
        &self,
        last_scanned: Option<u64>,
        chain_height: u64,
        config: &ScanConfig,
        activation_height: u64,
    ) -> Option<(u64, u64)> {
        let mut end = match config.end_at_height {
            Some(end_at) => end_at.min(chain_height),
            None => chain_height,
        };
        let start = match (self, last_scanned) {
            (_, Some(last)) => last.saturating_add(1),
            (ScanType::Historical, None) => {
                config.start_from_height.unwrap_or(activation_height).max(activation_height)
            }
            (ScanType::Incremental, None) => config.start_from_height.unwrap_or(chain_height),
            (ScanType::GapFill { from, .. }, None) => *from,
        };
        if let ScanType::GapFill { to, .. } = self {
            end = end.min(*to);
        }

        (start <= end).then_some((start, end))
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanType::Historical => write!(f, "historical"),
            ScanType::Incremental => write!(f, "incremental"),
            ScanType::GapFill { from, to } => write!(f, "gap-fill:{}-{}", from, to),
        }
    }
}

impl FromStr for ScanType {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "historical" => Ok(ScanType::Historical),
            "incremental" => Ok(ScanType::Incremental),
            other => {
                let range = other
                    .strip_prefix("gap-fill:")
                    .ok_or_else(|| ScanError::InvalidConfig(format!("unknown scan type {other}")))?;
                let (from, to) = range
                    .split_once('-')
                    .ok_or_else(|| ScanError::InvalidConfig(format!("bad gap-fill range {range}")))?;
                let parse = |v: &str| {
                    v.parse::<u64>()
                        .map_err(|_| ScanError::InvalidConfig(format!("bad gap-fill height {v}")))
                };
                let (from, to) = (parse(from)?, parse(to)?);
                if from > to {
                    return Err(ScanError::InvalidRange { from, to });
                }
                Ok(ScanType::GapFill { from, to })
            }
        }
    }
}
