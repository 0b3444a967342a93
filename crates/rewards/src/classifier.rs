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

//! Stake block classification.

use crate::{Block, Transaction, REWARD_TX_POSITION, STAKE_VALIDATION_TYPE};

/// Blocks stamped further than this into the future are treated as malformed.
pub const MAX_FUTURE_BLOCK_TIME_SECS: i64 = 2 * 60 * 60;

/// Position of the stake transaction within a proof-of-stake block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeTxPosition {
    First,
    Last,
}

impl StakeTxPosition {
    fn select(self, txs: &[Transaction]) -> Option<&Transaction> {
        match self {
            StakeTxPosition::First => txs.first(),
            StakeTxPosition::Last => txs.last(),
        }
    }
}

/// Result of classifying a fetched block
#[derive(Debug, Clone, Copy)]
pub struct Classification<'a> {
    pub is_stake_block: bool,
    pub reward_tx: Option<&'a Transaction>,
}

impl Classification<'_> {
    const fn rejected() -> Self {
        Self { is_stake_block: false, reward_tx: None }
    }
}

/// Decide whether `block` is a stake block and locate its reward transaction.
///
/// Only the consensus-reported `validationtype` is trusted. Blocks missing the fields the
/// extractor relies on are rejected rather than treated as errors.
pub fn classify(block: &Block) -> Classification<'_> {
    classify_with_position(block, REWARD_TX_POSITION)
}

pub(crate) fn classify_with_position(
    block: &Block,
    position: StakeTxPosition,
) -> Classification<'_> {
    if block.validationtype.as_deref() != Some(STAKE_VALIDATION_TYPE) {
        return Classification::rejected();
    }
    if block.hash.is_empty() {
        tracing::debug!("Rejecting stake block {} without a hash", block.height);
        return Classification::rejected();
    }

    match position.select(&block.tx) {
        Some(tx) if is_valid_txid(&tx.txid) && !tx.vout.is_empty() => {
            Classification { is_stake_block: true, reward_tx: Some(tx) }
        }
        _ => {
            tracing::debug!("Rejecting stake block {} with malformed stake transaction", block.height);
            Classification::rejected()
        }
    }
}

/// Whether a block's timestamp is not implausibly far ahead of `now` (unix seconds).
pub fn is_block_time_plausible(block: &Block, now: i64) -> bool {
    block.time > 0 && block.time <= now + MAX_FUTURE_BLOCK_TIME_SECS
}

/// Transaction ids are 32 bytes, hex encoded.
pub fn is_valid_txid(txid: &str) -> bool {
    txid.len() == 64 && hex::decode(txid).is_ok()
}
