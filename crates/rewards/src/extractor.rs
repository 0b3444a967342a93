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

//! Reward extraction from stake transactions.
//!
//! The reward credited to an address is the net amount minted to it by the stake transaction:
//! the sum of every output paying the address, minus the sum of every spent input the address
//! owned. Taking a single output's face value overstates earnings because the staked balance
//! flows back through the same transaction.
//!
//! Extraction is split in two so the caller controls all I/O: [required_prevouts] names the
//! previous outputs that must be looked up, and [extract_stake_events] consumes the lookups.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    Block, OutPoint, Transaction, TxOutput, DEFAULT_ACTIVATION_HEIGHT, DEFAULT_MAX_REWARD_SATS,
};

/// One confirmed reward payment to a tracked address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEvent {
    /// Tracked address that received the reward
    pub identity_address: String,
    /// Stake transaction id
    pub txid: String,
    /// Index of the first output paying `identity_address`
    pub vout: u32,
    pub block_height: u64,
    pub block_hash: String,
    /// Block time in unix seconds
    pub block_time: i64,
    /// Net minted amount, or the outputs-only amount while `stake_amount_pending` is set
    pub amount_sats: i64,
    /// Total value of the staked inputs, when the stake transaction spent any
    pub stake_amount_sats: Option<i64>,
    /// Address that supplied the staked input. `None` until the inputs are resolved.
    pub source_address: Option<String>,
    /// Set when a previous-output lookup failed; cleared once by the backfill pass
    pub stake_amount_pending: bool,
    /// Set when `amount_sats` exceeds the configured per-block ceiling
    pub exceeds_ceiling: bool,
}

impl StakeEvent {
    /// Whether the staked input came from the identity itself.
    pub fn is_self_stake(&self) -> bool {
        self.source_address.as_deref() == Some(self.identity_address.as_str())
    }

    /// Whether this event may contribute to the identity's own staking statistics.
    pub fn counts_toward_identity(&self) -> bool {
        self.is_self_stake() && !self.exceeds_ceiling
    }
}

/// Set of addresses whose rewards are recorded
#[derive(Debug, Clone, Default)]
pub struct TrackedAddresses {
    addresses: HashSet<String>,
}

impl TrackedAddresses {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { addresses: addresses.into_iter().map(Into::into).collect() }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.addresses.iter()
    }
}

/// Tunables for reward extraction
#[derive(Debug, Clone)]
pub struct ExtractionParams {
    /// Protocol-level accounts that are never credited with rewards
    pub excluded_addresses: HashSet<String>,
    /// Rewards above this are stored but flagged
    pub max_reward_sats: i64,
    /// Blocks below this height are ignored
    pub activation_height: u64,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            excluded_addresses: HashSet::new(),
            max_reward_sats: DEFAULT_MAX_REWARD_SATS,
            activation_height: DEFAULT_ACTIVATION_HEIGHT,
        }
    }
}

/// The parts of a previous output the extractor needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevOutput {
    pub value_sats: i64,
    pub addresses: Vec<String>,
}

impl From<&TxOutput> for PrevOutput {
    fn from(out: &TxOutput) -> Self {
        Self { value_sats: out.value_sats(), addresses: out.addresses().to_vec() }
    }
}

/// Previous-output lookups keyed by outpoint. `None` records a lookup that failed.
pub type PrevOutputs = HashMap<OutPoint, Option<PrevOutput>>;

#[derive(Debug, Clone, Default)]
struct OutputMatch {
    total_sats: i64,
    /// Indexes of the outputs paying the address, in transaction order
    vouts: Vec<u32>,
}

fn match_outputs(
    tx: &Transaction,
    tracked: &TrackedAddresses,
    params: &ExtractionParams,
) -> BTreeMap<String, OutputMatch> {
    let mut matches: BTreeMap<String, OutputMatch> = BTreeMap::new();
    for out in &tx.vout {
        let mut seen_in_output = HashSet::new();
        for address in out.addresses() {
            if !tracked.contains(address)
                || params.excluded_addresses.contains(address)
                || !seen_in_output.insert(address.as_str())
            {
                continue;
            }
            let entry = matches.entry(address.clone()).or_default();
            entry.total_sats += out.value_sats();
            entry.vouts.push(out.n);
        }
    }
    matches
}

/// Previous outputs that must be looked up before [extract_stake_events] can compute net
/// rewards for `reward_tx`. Empty when no output pays a tracked address.
pub fn required_prevouts(
    reward_tx: &Transaction,
    tracked: &TrackedAddresses,
    params: &ExtractionParams,
) -> Vec<OutPoint> {
    if match_outputs(reward_tx, tracked, params).is_empty() {
        return Vec::new();
    }
    let mut seen = HashSet::new();
    reward_tx.vin.iter().filter_map(|vin| vin.outpoint()).filter(|op| seen.insert(op.clone())).collect()
}

/// Compute the stake events `reward_tx` credits to tracked addresses.
///
/// Emits at most one event per tracked address, keyed on the lowest output paying it that no
/// other event in the transaction already uses. An address left without such an output (a
/// multisig output shared with another tracked address) is skipped. A failed previous-output lookup does not drop
/// the event: it is recorded with its outputs-only amount, no source address and
/// `stake_amount_pending` set.
pub fn extract_stake_events(
    block: &Block,
    reward_tx: &Transaction,
    tracked: &TrackedAddresses,
    prevouts: &PrevOutputs,
    params: &ExtractionParams,
) -> Vec<StakeEvent> {
    if block.height < params.activation_height {
        return Vec::new();
    }
    let matches = match_outputs(reward_tx, tracked, params);
    if matches.is_empty() {
        return Vec::new();
    }

    let mut has_inputs = false;
    let mut pending = false;
    let mut total_input_sats = 0i64;
    let mut input_sats_by_address: HashMap<&str, i64> = HashMap::new();
    for outpoint in reward_tx.vin.iter().filter_map(|vin| vin.outpoint()) {
        has_inputs = true;
        match prevouts.get(&outpoint) {
            Some(Some(prev)) => {
                total_input_sats += prev.value_sats;
                let unique: HashSet<&str> = prev.addresses.iter().map(String::as_str).collect();
                for address in unique {
                    *input_sats_by_address.entry(address).or_default() += prev.value_sats;
                }
            }
            _ => pending = true,
        }
    }

    // Largest contributor of staked value, ties broken by address for determinism
    let dominant_source = input_sats_by_address
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(address, _)| address.to_string());

    let mut events = Vec::with_capacity(matches.len());
    let mut claimed_vouts = HashSet::new();
    for (address, matched) in matches {
        let (amount_sats, stake_amount_sats, source_address) = if pending {
            (matched.total_sats, None, None)
        } else if !has_inputs {
            // Generation-only transaction: nothing was staked from elsewhere
            (matched.total_sats, None, Some(address.clone()))
        } else {
            let own_inputs = input_sats_by_address.get(address.as_str()).copied().unwrap_or(0);
            let source = if own_inputs > 0 { Some(address.clone()) } else { dominant_source.clone() };
            (matched.total_sats - own_inputs, Some(total_input_sats), source)
        };

        if amount_sats <= 0 {
            tracing::debug!(
                "Skipping non-positive net reward {} for {} in block {}",
                amount_sats,
                address,
                block.height
            );
            continue;
        }

        let Some(vout) =
            matched.vouts.iter().copied().filter(|n| !claimed_vouts.contains(n)).min()
        else {
            tracing::warn!(
                "Outputs {:?} of {} in block {} already credit another tracked address; skipping {}",
                matched.vouts,
                reward_tx.txid,
                block.height,
                address
            );
            continue;
        };
        claimed_vouts.insert(vout);

        let exceeds_ceiling = amount_sats > params.max_reward_sats;
        if exceeds_ceiling {
            tracing::warn!(
                "Reward of {} sats for {} in block {} exceeds ceiling of {} sats; flagging",
                amount_sats,
                address,
                block.height,
                params.max_reward_sats
            );
        }

        events.push(StakeEvent {
            identity_address: address,
            txid: reward_tx.txid.clone(),
            vout,
            block_height: block.height,
            block_hash: block.hash.clone(),
            block_time: block.time,
            amount_sats,
            stake_amount_sats,
            source_address,
            stake_amount_pending: pending,
            exceeds_ceiling,
        });
    }
    events
}
