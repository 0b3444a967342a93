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

//! Builders for synthetic chain data.

use vrsc_rewards::{coins_to_sats, Block, ScriptPubKey, Transaction, TxInput, TxOutput};

/// Unix time the synthetic chain starts at
pub const GENESIS_TIME: i64 = 1_700_000_000;

/// Seconds between synthetic blocks
pub const BLOCK_INTERVAL: i64 = 60;

/// Deterministic 64-hex txid
pub fn txid(seed: u64) -> String {
    format!("{:064x}", seed)
}

/// Deterministic 64-hex block hash, disjoint from [txid] for small seeds
pub fn block_hash(height: u64) -> String {
    format!("ff{:062x}", height)
}

pub fn block_time(height: u64) -> i64 {
    GENESIS_TIME + height as i64 * BLOCK_INTERVAL
}

pub fn output(n: u32, address: &str, coins: f64) -> TxOutput {
    TxOutput {
        value: coins,
        value_sat: Some(coins_to_sats(coins)),
        n,
        script_pub_key: ScriptPubKey {
            addresses: vec![address.to_string()],
            kind: Some("pubkeyhash".into()),
        },
    }
}

pub fn coinbase_input() -> TxInput {
    TxInput { coinbase: Some("03a0350c".into()), txid: None, vout: None }
}

pub fn spend(prev_txid: &str, vout: u32) -> TxInput {
    TxInput { coinbase: None, txid: Some(prev_txid.to_string()), vout: Some(vout) }
}

/// Transaction whose outputs are `(address, coins)` pairs numbered from 0.
pub fn transaction(txid: String, vin: Vec<TxInput>, outputs: &[(&str, f64)]) -> Transaction {
    let vout = outputs
        .iter()
        .enumerate()
        .map(|(n, (address, coins))| output(n as u32, address, *coins))
        .collect();
    Transaction { txid, vin, vout }
}

pub fn coinbase(txid: String, outputs: &[(&str, f64)]) -> Transaction {
    transaction(txid, vec![coinbase_input()], outputs)
}

pub fn block(height: u64, validation: &str, tx: Vec<Transaction>) -> Block {
    Block {
        hash: block_hash(height),
        height,
        time: block_time(height),
        validationtype: Some(validation.to_string()),
        tx,
    }
}

/// Proof-of-stake block whose last transaction is `stake_tx`
pub fn stake_block(height: u64, stake_tx: Transaction) -> Block {
    let reward = coinbase(txid(height << 32), &[("RMinerCoinbaseAddressxxxxxxxxxxxxx", 0.0)]);
    block(height, "stake", vec![reward, stake_tx])
}

/// Proof-of-work block paying `miner`
pub fn work_block(height: u64, miner: &str) -> Block {
    block(height, "work", vec![coinbase(txid(height << 32), &[(miner, 12.0)])])
}

/// A stake transaction spending `staked` coins from `source` and paying `staked + reward` to
/// `recipient`. Returns the funding transaction and the stake transaction.
pub fn staking_pair(
    seed: u64,
    source: &str,
    recipient: &str,
    staked: f64,
    reward: f64,
) -> (Transaction, Transaction) {
    let funding = transaction(txid(seed), vec![coinbase_input()], &[(source, staked)]);
    let stake = transaction(
        txid(seed + 1),
        vec![spend(&funding.txid, 0)],
        &[(recipient, staked + reward)],
    );
    (funding, stake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staking_pair_shape() {
        let (funding, stake) = staking_pair(100, "iAlice", "iAlice", 1000.0, 12.0);
        assert_eq!(stake.vin[0].outpoint().unwrap().txid, funding.txid);
        assert_eq!(stake.vout[0].value_sats(), 101_200_000_000);
        assert_eq!(funding.vout[0].value_sats(), 100_000_000_000);
    }

    #[test]
    fn test_stake_block_places_stake_tx_last() {
        let (_, stake) = staking_pair(100, "iAlice", "iAlice", 1000.0, 12.0);
        let block = stake_block(7, stake.clone());
        assert_eq!(block.tx.last(), Some(&stake));
        assert_ne!(block.hash, txid(7));
    }
}
