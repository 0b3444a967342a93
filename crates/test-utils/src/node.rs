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

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::{json, Value};
use vrsc_rewards::{Block, Transaction};
use wiremock::{matchers::method, Mock, MockServer, Request, ResponseTemplate};

use crate::builders::work_block;

#[derive(Default)]
struct ChainState {
    tip: u64,
    blocks: BTreeMap<u64, Block>,
    heights_by_hash: HashMap<String, u64>,
    transactions: HashMap<String, Transaction>,
    identities: HashMap<String, String>,
    /// getblock bodies served in place of a height's well-formed block
    raw_blocks: HashMap<u64, Value>,
    /// (method, key) -> remaining injected failures
    failures: HashMap<(String, String), u32>,
    calls: HashMap<String, u64>,
    delay: Duration,
}

enum Reply {
    Ok(Value),
    RpcError(i64, &'static str),
    Unavailable,
}

impl ChainState {
    fn take_failure(&mut self, method: &str, key: &str) -> bool {
        match self.failures.get_mut(&(method.to_string(), key.to_string())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn handle(&mut self, method: &str, params: &Value) -> Reply {
        *self.calls.entry(method.to_string()).or_default() += 1;

        match method {
            "getblockcount" => Reply::Ok(json!(self.tip)),
            "getblockhash" => {
                let height = params[0].as_u64().unwrap_or(u64::MAX);
                if self.take_failure(method, &height.to_string()) {
                    return Reply::Unavailable;
                }
                match self.blocks.get(&height) {
                    Some(block) if height <= self.tip => Reply::Ok(json!(block.hash)),
                    _ => Reply::RpcError(-8, "Block height out of range"),
                }
            }
            "getblock" => {
                let hash = params[0].as_str().unwrap_or_default().to_string();
                if self.take_failure(method, &hash) {
                    return Reply::Unavailable;
                }
                let height = self.heights_by_hash.get(&hash).copied();
                if let Some(raw) = height.and_then(|h| self.raw_blocks.get(&h)) {
                    return Reply::Ok(raw.clone());
                }
                match height.and_then(|h| self.blocks.get(&h)) {
                    Some(block) => Reply::Ok(json!(block)),
                    None => Reply::RpcError(-5, "Block not found"),
                }
            }
            "getrawtransaction" => {
                let txid = params[0].as_str().unwrap_or_default().to_string();
                if self.take_failure(method, &txid) {
                    return Reply::Unavailable;
                }
                match self.transactions.get(&txid) {
                    Some(tx) => Reply::Ok(json!(tx)),
                    None => Reply::RpcError(-5, "No such mempool or blockchain transaction"),
                }
            }
            "getidentity" => {
                let name = params[0].as_str().unwrap_or_default();
                match self.identities.get(name) {
                    Some(address) => Reply::Ok(json!({
                        "identity": {"name": name.trim_end_matches('@'), "identityaddress": address},
                        "status": "active"
                    })),
                    None => Reply::RpcError(-5, "Identity not found"),
                }
            }
            _ => Reply::RpcError(-32601, "Method not found"),
        }
    }
}

/// Mock verusd serving an in-memory chain over JSON-RPC
pub struct MockVerusNode {
    server: MockServer,
    state: Arc<Mutex<ChainState>>,
}

impl MockVerusNode {
    pub async fn new() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(ChainState::default()));

        let node = Self { server, state };
        node.setup_rpc_endpoint().await;
        node
    }

    /// Base URL of the mock node
    pub fn url(&self) -> String {
        self.server.uri()
    }

    async fn setup_rpc_endpoint(&self) {
        let state = self.state.clone();

        Mock::given(method("POST"))
            .respond_with(move |req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
                let rpc_method = body["method"].as_str().unwrap_or_default().to_string();

                let mut state = state.lock().unwrap();
                let reply = state.handle(&rpc_method, &body["params"]);
                let template = match reply {
                    Reply::Ok(result) => ResponseTemplate::new(200)
                        .set_body_json(json!({"result": result, "error": null, "id": body["id"]})),
                    Reply::RpcError(code, message) => ResponseTemplate::new(500).set_body_json(
                        json!({"result": null, "error": {"code": code, "message": message}, "id": body["id"]}),
                    ),
                    Reply::Unavailable => {
                        tracing::debug!("Injected failure for {}", rpc_method);
                        ResponseTemplate::new(503).set_body_string("Service Unavailable")
                    }
                };
                template.set_delay(state.delay)
            })
            .mount(&self.server)
            .await;
    }

    /// Add a block and its transactions. The tip follows the highest block.
    pub fn add_block(&self, block: Block) {
        let mut state = self.state.lock().unwrap();
        for tx in &block.tx {
            state.transactions.insert(tx.txid.clone(), tx.clone());
        }
        state.heights_by_hash.insert(block.hash.clone(), block.height);
        state.tip = state.tip.max(block.height);
        state.blocks.insert(block.height, block);
    }

    /// Fill `[from, to]` with proof-of-work blocks, leaving existing heights alone
    pub fn add_work_blocks(&self, from: u64, to: u64) {
        for height in from..=to {
            let exists = self.state.lock().unwrap().blocks.contains_key(&height);
            if !exists {
                self.add_block(work_block(height, "RMinerAddressxxxxxxxxxxxxxxxxxxxxx"));
            }
        }
    }

    /// Add a transaction that is not in any block, e.g. the funding side of a stake
    pub fn add_transaction(&self, tx: Transaction) {
        self.state.lock().unwrap().transactions.insert(tx.txid.clone(), tx);
    }

    pub fn add_identity(&self, name: &str, address: &str) {
        self.state.lock().unwrap().identities.insert(name.to_string(), address.to_string());
    }

    /// Report `tip` as the chain height, hiding blocks above it
    pub fn set_tip(&self, tip: u64) {
        self.state.lock().unwrap().tip = tip;
    }

    /// Serve `body` as the `getblock` result for the block at `height`
    pub fn set_raw_block(&self, height: u64, body: Value) {
        self.state.lock().unwrap().raw_blocks.insert(height, body);
    }

    /// Make the next `times` lookups of the block at `height` fail with HTTP 503
    pub fn fail_block(&self, height: u64, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(("getblockhash".to_string(), height.to_string()), times);
    }

    /// Make the next `times` lookups of `txid` fail with HTTP 503
    pub fn fail_transaction(&self, txid: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(("getrawtransaction".to_string(), txid.to_string()), times);
    }

    /// Delay every response
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Number of calls received for an RPC method
    pub fn calls(&self, rpc_method: &str) -> u64 {
        self.state.lock().unwrap().calls.get(rpc_method).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}
