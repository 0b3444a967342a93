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

//! Per-identity staking statistics derived from stake events.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::StakeEvent;

const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_YEAR: i64 = 365 * SECS_PER_DAY;

/// Minimum number of events with a known staked amount before a window's APY is computed from
/// real amounts instead of the estimate.
pub const MIN_REAL_AMOUNT_EVENTS: u64 = 30;

/// Without real staked amounts, the average staked balance is estimated as the average reward
/// times this multiplier. The resulting APY reduces to `stakes_per_year / multiplier`.
pub const ESTIMATED_STAKE_MULTIPLIER: f64 = 150.0;

/// Confidence thresholds, highest first: (tier, minimum events, minimum real-amount coverage).
const CONFIDENCE_THRESHOLDS: [(ConfidenceTier, u64, f64); 4] = [
    (ConfidenceTier::VeryHigh, 100, 0.8),
    (ConfidenceTier::High, 50, 0.6),
    (ConfidenceTier::Medium, 30, 0.4),
    (ConfidenceTier::Low, 10, 0.2),
];

/// Time windows APY is reported for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApyWindow {
    AllTime,
    Yearly,
    Days90,
    Days30,
    Days7,
}

impl ApyWindow {
    pub const ALL: [ApyWindow; 5] = [
        ApyWindow::AllTime,
        ApyWindow::Yearly,
        ApyWindow::Days90,
        ApyWindow::Days30,
        ApyWindow::Days7,
    ];

    /// Window length in seconds, `None` for all-time.
    pub fn duration_secs(self) -> Option<i64> {
        match self {
            ApyWindow::AllTime => None,
            ApyWindow::Yearly => Some(SECS_PER_YEAR),
            ApyWindow::Days90 => Some(90 * SECS_PER_DAY),
            ApyWindow::Days30 => Some(30 * SECS_PER_DAY),
            ApyWindow::Days7 => Some(7 * SECS_PER_DAY),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationMethod {
    Estimated,
    Hybrid,
    Actual,
}

impl CalculationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationMethod::Estimated => "estimated",
            CalculationMethod::Hybrid => "hybrid",
            CalculationMethod::Actual => "actual",
        }
    }
}

impl fmt::Display for CalculationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalculationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "estimated" => Ok(CalculationMethod::Estimated),
            "hybrid" => Ok(CalculationMethod::Hybrid),
            "actual" => Ok(CalculationMethod::Actual),
            other => Err(format!("unknown calculation method: {other}")),
        }
    }
}

/// Data-completeness classification of an identity's statistics, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfidenceTier {
    Estimated,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::Estimated => "estimated",
            ConfidenceTier::Low => "low",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::High => "high",
            ConfidenceTier::VeryHigh => "very-high",
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidenceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "estimated" => Ok(ConfidenceTier::Estimated),
            "low" => Ok(ConfidenceTier::Low),
            "medium" => Ok(ConfidenceTier::Medium),
            "high" => Ok(ConfidenceTier::High),
            "very-high" => Ok(ConfidenceTier::VeryHigh),
            other => Err(format!("unknown confidence tier: {other}")),
        }
    }
}

/// Classify data completeness from the number of events and how many carry a real staked
/// amount.
pub fn confidence_tier(stakes_with_real_amounts: u64, total_stakes: u64) -> ConfidenceTier {
    if total_stakes == 0 {
        return ConfidenceTier::Estimated;
    }
    let coverage = stakes_with_real_amounts.min(total_stakes) as f64 / total_stakes as f64;
    CONFIDENCE_THRESHOLDS
        .iter()
        .find(|(_, min_count, min_coverage)| total_stakes >= *min_count && coverage >= *min_coverage)
        .map(|(tier, _, _)| *tier)
        .unwrap_or(ConfidenceTier::Estimated)
}

/// Aggregate staking statistics for one identity. Rebuildable from the ledger at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub identity_address: String,
    /// Self-stake events counted toward the identity
    pub total_stakes: u64,
    pub total_reward_sats: i64,
    pub apy_all_time: Option<f64>,
    pub apy_yearly: Option<f64>,
    pub apy_90d: Option<f64>,
    pub apy_30d: Option<f64>,
    pub apy_7d: Option<f64>,
    pub calculation_method: CalculationMethod,
    pub confidence: ConfidenceTier,
    pub stakes_with_real_amounts: u64,
    pub avg_stake_amount_sats: Option<i64>,
    /// Stored events staked by another address, or whose source is not yet resolved
    pub delegated_stakes: u64,
    /// Self-stake events excluded because their amount exceeded the reward ceiling
    pub excluded_outliers: u64,
    pub first_stake_time: Option<i64>,
    pub last_stake_time: Option<i64>,
    /// Unix seconds the snapshot was computed at
    pub computed_at: i64,
}

impl IdentitySnapshot {
    pub fn apy(&self, window: ApyWindow) -> Option<f64> {
        match window {
            ApyWindow::AllTime => self.apy_all_time,
            ApyWindow::Yearly => self.apy_yearly,
            ApyWindow::Days90 => self.apy_90d,
            ApyWindow::Days30 => self.apy_30d,
            ApyWindow::Days7 => self.apy_7d,
        }
    }

    fn set_apy(&mut self, window: ApyWindow, value: Option<f64>) {
        let slot = match window {
            ApyWindow::AllTime => &mut self.apy_all_time,
            ApyWindow::Yearly => &mut self.apy_yearly,
            ApyWindow::Days90 => &mut self.apy_90d,
            ApyWindow::Days30 => &mut self.apy_30d,
            ApyWindow::Days7 => &mut self.apy_7d,
        };
        *slot = value;
    }
}

struct WindowApy {
    apy: Option<f64>,
    method: CalculationMethod,
}

fn window_apy(
    events: &[&StakeEvent],
    window: ApyWindow,
    first_stake_time: i64,
    now: i64,
) -> WindowApy {
    let window_start = window.duration_secs().map(|d| now - d);
    let in_window: Vec<&StakeEvent> = events
        .iter()
        .copied()
        .filter(|e| window_start.map_or(true, |start| e.block_time > start))
        .collect();
    if in_window.is_empty() {
        return WindowApy { apy: None, method: CalculationMethod::Estimated };
    }

    let reward_sats: i64 = in_window.iter().map(|e| e.amount_sats).sum();
    let real_amounts: Vec<i64> = in_window.iter().filter_map(|e| e.stake_amount_sats).collect();

    let (avg_staked, method) = if real_amounts.len() as u64 >= MIN_REAL_AMOUNT_EVENTS {
        let avg = real_amounts.iter().map(|&a| a as f64).sum::<f64>() / real_amounts.len() as f64;
        let method = if real_amounts.len() == in_window.len() {
            CalculationMethod::Actual
        } else {
            CalculationMethod::Hybrid
        };
        (avg, method)
    } else {
        let avg_reward = reward_sats as f64 / in_window.len() as f64;
        (avg_reward * ESTIMATED_STAKE_MULTIPLIER, CalculationMethod::Estimated)
    };
    if avg_staked <= 0.0 {
        return WindowApy { apy: None, method };
    }

    // A window is never longer than the identity has been staking, nor shorter than a day
    let span = match window.duration_secs() {
        Some(d) => d.min(now - first_stake_time),
        None => now - first_stake_time,
    }
    .max(SECS_PER_DAY);
    let year_fraction = span as f64 / SECS_PER_YEAR as f64;

    WindowApy { apy: Some(reward_sats as f64 / avg_staked / year_fraction * 100.0), method }
}

/// Compute the snapshot for `identity_address` from its stake events.
///
/// Only direct self-stakes below the reward ceiling are counted; everything else is tallied
/// but excluded. `now` is in unix seconds; events stamped after it are ignored.
pub fn compute_identity_snapshot(
    identity_address: &str,
    events: &[StakeEvent],
    now: i64,
) -> IdentitySnapshot {
    let mut delegated_stakes = 0u64;
    let mut excluded_outliers = 0u64;
    let mut counted: Vec<&StakeEvent> = Vec::new();
    for event in events.iter().filter(|e| e.identity_address == identity_address) {
        if !event.is_self_stake() {
            delegated_stakes += 1;
        } else if event.exceeds_ceiling {
            excluded_outliers += 1;
        } else if event.block_time <= now {
            counted.push(event);
        }
    }

    let total_stakes = counted.len() as u64;
    let total_reward_sats = counted.iter().map(|e| e.amount_sats).sum();
    let real_amounts: Vec<i64> = counted.iter().filter_map(|e| e.stake_amount_sats).collect();
    let stakes_with_real_amounts = real_amounts.len() as u64;
    let avg_stake_amount_sats = if real_amounts.is_empty() {
        None
    } else {
        Some(real_amounts.iter().sum::<i64>() / real_amounts.len() as i64)
    };
    let first_stake_time = counted.iter().map(|e| e.block_time).min();
    let last_stake_time = counted.iter().map(|e| e.block_time).max();

    let mut snapshot = IdentitySnapshot {
        identity_address: identity_address.to_string(),
        total_stakes,
        total_reward_sats,
        apy_all_time: None,
        apy_yearly: None,
        apy_90d: None,
        apy_30d: None,
        apy_7d: None,
        calculation_method: CalculationMethod::Estimated,
        confidence: confidence_tier(stakes_with_real_amounts, total_stakes),
        stakes_with_real_amounts,
        avg_stake_amount_sats,
        delegated_stakes,
        excluded_outliers,
        first_stake_time,
        last_stake_time,
        computed_at: now,
    };

    if let Some(first) = first_stake_time {
        for window in ApyWindow::ALL {
            let result = window_apy(&counted, window, first, now);
            snapshot.set_apy(window, result.apy);
            if window == ApyWindow::AllTime {
                snapshot.calculation_method = result.method;
            }
        }
    }

    snapshot
}

/// Position of an identity in the reward leaderboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedIdentity {
    pub rank: u64,
    pub identity_address: String,
    pub total_reward_sats: i64,
    pub total_stakes: u64,
    pub apy_all_time: Option<f64>,
    pub confidence: ConfidenceTier,
}

/// Rank identities by total counted reward, highest first. Ties keep address order.
pub fn rank_identities(snapshots: &[IdentitySnapshot]) -> Vec<RankedIdentity> {
    let mut sorted: Vec<&IdentitySnapshot> = snapshots.iter().collect();
    sorted.sort_by(|a, b| {
        b.total_reward_sats
            .cmp(&a.total_reward_sats)
            .then_with(|| a.identity_address.cmp(&b.identity_address))
    });
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, s)| RankedIdentity {
            rank: i as u64 + 1,
            identity_address: s.identity_address.clone(),
            total_reward_sats: s.total_reward_sats,
            total_stakes: s.total_stakes,
            apy_all_time: s.apy_all_time,
            confidence: s.confidence,
        })
        .collect()
}
