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

//! Stake block classification, reward extraction and staking statistics for the Verus chain.
//!
//! Everything in this crate is pure: callers fetch blocks and previous outputs, this crate
//! decides what they mean.

// Declare modules
pub mod block;
pub mod classifier;
pub mod extractor;
pub mod stats;

// Re-export commonly used types
pub use block::{coins_to_sats, Block, OutPoint, ScriptPubKey, Transaction, TxInput, TxOutput};

pub use classifier::{classify, is_block_time_plausible, Classification, StakeTxPosition};

pub use extractor::{
    extract_stake_events, required_prevouts, ExtractionParams, PrevOutput, PrevOutputs,
    StakeEvent, TrackedAddresses,
};

pub use stats::{
    compute_identity_snapshot, confidence_tier, rank_identities, ApyWindow,
    CalculationMethod, ConfidenceTier, IdentitySnapshot, RankedIdentity,
};

/// Satoshis per VRSC.
pub const SATS_PER_COIN: i64 = 100_000_000;

/// Value reported in `getblock` `validationtype` for proof-of-stake blocks.
pub const STAKE_VALIDATION_TYPE: &str = "stake";

/// Which transaction of a stake block carries the staking reward.
///
/// Verus places the stake transaction at the end of a proof-of-stake block. This is the only
/// place the position is decided; the classifier reads it and nothing else indexes `tx[]`
/// directly.
pub const REWARD_TX_POSITION: StakeTxPosition = StakeTxPosition::Last;

/// Default per-block reward ceiling (1,000 VRSC). No Verus era paid a block subsidy near this.
pub const DEFAULT_MAX_REWARD_SATS: i64 = 1_000 * SATS_PER_COIN;

/// First block height at which stake rewards are tracked.
pub const DEFAULT_ACTIVATION_HEIGHT: u64 = 1;
