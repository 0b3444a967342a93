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

//! Chain data as returned by `getblock <hash> 2` and `getrawtransaction <txid> 1`.
//!
//! Every field is lenient: a node that omits a field yields an empty value, and the classifier
//! decides whether what is left is usable.

use serde::{Deserialize, Serialize};

use crate::SATS_PER_COIN;

/// Convert a coin amount as reported by the node into satoshis.
pub fn coins_to_sats(value: f64) -> i64 {
    (value * SATS_PER_COIN as f64).round() as i64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub height: u64,
    /// Block time in unix seconds
    #[serde(default)]
    pub time: i64,
    /// `stake` or `work`
    #[serde(default)]
    pub validationtype: Option<String>,
    #[serde(default)]
    pub tx: Vec<Transaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
}

impl Transaction {
    /// A generation transaction has a single coinbase input.
    pub fn is_coinbase(&self) -> bool {
        self.vin.first().is_some_and(TxInput::is_coinbase)
    }

    /// Output with index `n`, looked up by the reported index rather than position.
    pub fn output(&self, n: u32) -> Option<&TxOutput> {
        self.vout.iter().find(|out| out.n == n)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
}

impl TxInput {
    pub fn is_coinbase(&self) -> bool {
        self.coinbase.is_some()
    }

    /// The previous output this input spends, if it spends one.
    pub fn outpoint(&self) -> Option<OutPoint> {
        if self.is_coinbase() {
            return None;
        }
        match (&self.txid, self.vout) {
            (Some(txid), Some(vout)) => Some(OutPoint { txid: txid.clone(), vout }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(default)]
    pub value: f64,
    #[serde(default, rename = "valueSat", skip_serializing_if = "Option::is_none")]
    pub value_sat: Option<i64>,
    #[serde(default)]
    pub n: u32,
    #[serde(default, rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

impl TxOutput {
    /// Output value in satoshis, preferring the node's exact `valueSat` when present.
    pub fn value_sats(&self) -> i64 {
        self.value_sat.unwrap_or_else(|| coins_to_sats(self.value))
    }

    pub fn addresses(&self) -> &[String] {
        &self.script_pub_key.addresses
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Reference to a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins_to_sats() {
        assert_eq!(coins_to_sats(12.0), 1_200_000_000);
        assert_eq!(coins_to_sats(0.00000001), 1);
        // Amounts with no exact binary representation round to the nearest satoshi
        assert_eq!(coins_to_sats(5.99999999), 599_999_999);
        assert_eq!(coins_to_sats(0.1 + 0.2), 30_000_000);
        assert_eq!(coins_to_sats(0.0), 0);
    }

    #[test]
    fn test_parse_getblock_verbose() {
        let json = serde_json::json!({
            "hash": "00000000000000000000000000000000000000000000000000000000000000aa",
            "height": 1_000_000,
            "time": 1_600_000_000,
            "validationtype": "stake",
            "confirmations": 12,
            "tx": [
                {
                    "txid": "11".repeat(32),
                    "vin": [{ "coinbase": "03a08601", "sequence": 4294967295u64 }],
                    "vout": [{
                        "value": 6.0,
                        "valueSat": 600000000,
                        "n": 0,
                        "scriptPubKey": { "type": "pubkeyhash", "addresses": ["RAddr"] }
                    }]
                },
                {
                    "txid": "22".repeat(32),
                    "vin": [{ "txid": "33".repeat(32), "vout": 1, "sequence": 0 }],
                    "vout": [{ "value": 12.5, "n": 0, "scriptPubKey": {} }]
                }
            ]
        });

        let block: Block = serde_json::from_value(json).unwrap();
        assert_eq!(block.height, 1_000_000);
        assert_eq!(block.validationtype.as_deref(), Some("stake"));
        assert_eq!(block.tx.len(), 2);
        assert!(block.tx[0].is_coinbase());
        assert_eq!(block.tx[0].vout[0].value_sats(), 600_000_000);
        assert_eq!(block.tx[0].vout[0].addresses(), ["RAddr".to_string()]);

        let stake_tx = &block.tx[1];
        assert!(!stake_tx.is_coinbase());
        assert_eq!(
            stake_tx.vin[0].outpoint(),
            Some(OutPoint { txid: "33".repeat(32), vout: 1 })
        );
        assert_eq!(stake_tx.vout[0].value_sats(), 1_250_000_000);
        assert!(stake_tx.vout[0].addresses().is_empty());
    }

    #[test]
    fn test_missing_fields_default() {
        let block: Block = serde_json::from_value(serde_json::json!({ "height": 5 })).unwrap();
        assert_eq!(block.height, 5);
        assert!(block.hash.is_empty());
        assert!(block.validationtype.is_none());
        assert!(block.tx.is_empty());
    }

    #[test]
    fn test_output_lookup_by_index() {
        let tx = Transaction {
            txid: "aa".repeat(32),
            vin: vec![],
            vout: vec![
                TxOutput { value: 1.0, n: 3, ..Default::default() },
                TxOutput { value: 2.0, n: 0, ..Default::default() },
            ],
        };
        assert_eq!(tx.output(3).map(TxOutput::value_sats), Some(100_000_000));
        assert_eq!(tx.output(0).map(TxOutput::value_sats), Some(200_000_000));
        assert!(tx.output(1).is_none());
    }
}
