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

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;
use vrsc_rewards::{Block, Transaction};

use super::{ChainRpc, IdentityResponse, RpcError};

const JSONRPC_VERSION: &str = "1.0";
const REQUEST_ID: &str = "stake-indexer";

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC client for verusd.
#[derive(Clone)]
pub struct RpcClient {
    inner: Client,
    url: Url,
    credentials: Option<(String, String)>,
}

impl RpcClient {
    pub fn new(
        url: Url,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let inner = Client::builder().timeout(timeout).build()?;
        Ok(Self { inner, url, credentials })
    }

    pub fn endpoint(&self) -> &Url {
        &self.url
    }

    /// Issues a raw call returning the untyped result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = JsonRpcRequest { jsonrpc: JSONRPC_VERSION, id: REQUEST_ID, method, params };

        let mut request = self.inner.post(self.url.clone()).json(&payload);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        // The daemon reports RPC errors with a 4xx/5xx status and a JSON body
        match serde_json::from_slice::<JsonRpcResponse>(&body) {
            Ok(JsonRpcResponse { error: Some(error), .. }) => {
                Err(RpcError::Rpc { code: error.code, message: error.message })
            }
            Ok(JsonRpcResponse { result, .. }) if status.is_success() => match result {
                Some(Value::Null) | None => Err(RpcError::EmptyResponse(method.to_string())),
                Some(value) => Ok(value),
            },
            Ok(_) => Err(RpcError::HttpStatus(status.as_u16())),
            Err(_) if !status.is_success() => Err(RpcError::HttpStatus(status.as_u16())),
            Err(err) => Err(err.into()),
        }
    }

    /// Issues a call and deserialises the result into `R`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<R, RpcError> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ChainRpc for RpcClient {
    async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", json!([height])).await
    }

    async fn get_block(&self, hash: &str) -> Result<Block, RpcError> {
        self.call("getblock", json!([hash, 2])).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Transaction, RpcError> {
        self.call("getrawtransaction", json!([txid, 1])).await
    }

    async fn get_identity(&self, name: &str) -> Result<IdentityResponse, RpcError> {
        self.call("getidentity", json!([name])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> RpcClient {
        let url = Url::parse(&server.base_url()).unwrap();
        RpcClient::new(url, Some(("user".into(), "pass".into())), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_block_count() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/")
                    .header_exists("authorization")
                    .body_contains("\"getblockcount\"");
                then.status(200).json_body(json!({"result": 3_512_345, "error": null, "id": "x"}));
            })
            .await;

        assert_eq!(client(&server).get_block_count().await.unwrap(), 3_512_345);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_block_decodes_transactions() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"getblock\"");
                then.status(200).json_body(json!({
                    "result": {
                        "hash": "00000000000000000000000000000000000000000000000000000000000000aa",
                        "height": 800_000,
                        "time": 1_700_000_000,
                        "validationtype": "stake",
                        "tx": [{
                            "txid": "11".repeat(32),
                            "vin": [{"coinbase": "03a0350c"}],
                            "vout": [{"value": 12.0, "n": 0, "scriptPubKey": {"addresses": ["iAlice"]}}]
                        }]
                    },
                    "error": null,
                    "id": "x"
                }));
            })
            .await;

        let block = client(&server).get_block("aa").await.unwrap();
        assert_eq!(block.height, 800_000);
        assert_eq!(block.validationtype.as_deref(), Some("stake"));
        assert_eq!(block.tx[0].vout[0].value_sats(), 1_200_000_000);
    }

    #[tokio::test]
    async fn test_rpc_error_body_on_500() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(500).json_body(json!({
                    "result": null,
                    "error": {"code": -5, "message": "Block not found"},
                    "id": "x"
                }));
            })
            .await;

        let err = client(&server).get_block_hash(99_999_999).await.unwrap_err();
        match err {
            RpcError::Rpc { code, ref message } => {
                assert_eq!(code, -5);
                assert_eq!(message, "Block not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(503).body("busy");
            })
            .await;

        let err = client(&server).get_block_count().await.unwrap_err();
        assert!(matches!(err, RpcError::HttpStatus(503)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Nothing listens on the discard port
        let url = Url::parse("http://127.0.0.1:9").unwrap();
        let client = RpcClient::new(url, None, Duration::from_secs(1)).unwrap();
        let err = client.get_block_count().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
