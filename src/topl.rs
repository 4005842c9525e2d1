//! Topl blockchain side: which network to talk to and how.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

pub const PRIVATE_TEST_NET_URI: &str = "http://localhost:9085";
pub const VALHALLA_URI_PREFIX: &str = "https://vertx.topl.services/valhalla/";
pub const MAIN_NET_URI_PREFIX: &str = "https://vertx.topl.services/mainnet/";

pub const PROPOSITION_TYPE: &str = "PublicKeyEd25519";

#[derive(Error, Debug)]
pub enum ToplError {
    #[error("Topl request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Topl provider answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Topl RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Topl RPC response carried neither result nor error")]
    EmptyResponse,
    #[error("Invalid provider URI {0}")]
    InvalidUri(String),
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Network {
    PrivateTestNet,
    ValhallaTestNet,
    ToplMainNet,
}

impl Network {
    /// Address network prefix.
    pub fn prefix(&self) -> u8 {
        match self {
            Network::ToplMainNet => 1,
            Network::ValhallaTestNet => 16,
            Network::PrivateTestNet => 64,
        }
    }
}

/// A Topl endpoint: network, URI and (possibly empty) API key.
#[derive(PartialEq, Debug, Clone)]
pub struct Provider {
    network: Network,
    uri: Url,
    api_key: String,
}

impl Provider {
    pub fn new(network: Network, uri: &str, api_key: &str) -> Result<Self, ToplError> {
        let uri = Url::parse(uri).or(Err(ToplError::InvalidUri(uri.to_owned())))?;
        Ok(Self {
            network,
            uri,
            api_key: api_key.to_owned(),
        })
    }

    pub fn private_test_net(api_key: &str) -> Result<Self, ToplError> {
        Self::new(Network::PrivateTestNet, PRIVATE_TEST_NET_URI, api_key)
    }

    pub fn valhalla_test_net(project_id: &str, api_key: &str) -> Result<Self, ToplError> {
        let uri = format!("{}{}", VALHALLA_URI_PREFIX, project_id);
        Self::new(Network::ValhallaTestNet, &uri, api_key)
    }

    pub fn topl_main_net(project_id: &str, api_key: &str) -> Result<Self, ToplError> {
        let uri = format!("{}{}", MAIN_NET_URI_PREFIX, project_id);
        Self::new(Network::ToplMainNet, &uri, api_key)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PolyTransfer {
    pub proposition_type: String,
    pub sender: Vec<String>,
    /// `(address, quantity)` pairs.
    pub recipients: Vec<(String, String)>,
    pub fee: String,
    pub change_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssetValue {
    #[serde(rename = "type")]
    pub value_type: String,
    pub quantity: String,
    pub asset_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl AssetValue {
    pub fn new(quantity: &str, asset_code: &str, metadata: Option<String>) -> Self {
        Self {
            value_type: "Asset".to_owned(),
            quantity: quantity.to_owned(),
            asset_code: asset_code.to_owned(),
            metadata,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssetTransfer {
    pub proposition_type: String,
    pub sender: Vec<String>,
    pub recipients: Vec<(String, AssetValue)>,
    pub fee: String,
    pub change_address: String,
    pub consolidation_address: String,
    pub minting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// An unsigned transaction as built by the provider.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub raw_tx: Value,
    /// Base64 bytes the sender has to sign.
    pub message_to_sign: String,
}

/// The provider's raw transaction with a `signatures` map attached.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct SignedTransaction {
    pub tx: Value,
}

#[async_trait]
pub trait ToplClient: Send + Sync {
    async fn raw_poly_transfer(&self, transfer: &PolyTransfer)
        -> Result<RawTransaction, ToplError>;

    /// Minting is an asset transfer with `minting` set.
    async fn raw_asset_transfer(&self, transfer: &AssetTransfer)
        -> Result<RawTransaction, ToplError>;

    /// Returns the id of the broadcast transaction.
    async fn broadcast_tx(&self, tx: &SignedTransaction) -> Result<String, ToplError>;
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<Value>,
    id: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastResult {
    tx_id: String,
}

/// Generates a JSON-RPC request for `method` with a single object parameter.
pub(crate) fn rpc_request(method: &str, params: Value, id: u64) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_owned(),
        method: method.to_owned(),
        params: vec![params],
        id: id.to_string(),
    }
}

/// JSON-RPC client for a Topl provider.
pub struct JsonRpcClient {
    http: reqwest::Client,
    provider: Provider,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ToplError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = rpc_request(method, params, id);
        let mut builder = self.http.post(self.provider.uri().clone()).json(&request);
        if !self.provider.api_key().is_empty() {
            builder = builder.header("x-api-key", self.provider.api_key());
        }
        tracing::debug!(method, id, "topl rpc call");
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToplError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body: JsonRpcResponse<T> = response.json().await?;
        match (body.result, body.error) {
            (_, Some(error)) => Err(ToplError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ToplError::EmptyResponse),
        }
    }
}

#[async_trait]
impl ToplClient for JsonRpcClient {
    async fn raw_poly_transfer(
        &self,
        transfer: &PolyTransfer,
    ) -> Result<RawTransaction, ToplError> {
        self.call("topl_rawPolyTransfer", json!(transfer)).await
    }

    async fn raw_asset_transfer(
        &self,
        transfer: &AssetTransfer,
    ) -> Result<RawTransaction, ToplError> {
        self.call("topl_rawAssetTransfer", json!(transfer)).await
    }

    async fn broadcast_tx(&self, tx: &SignedTransaction) -> Result<String, ToplError> {
        let result: BroadcastResult = self.call("topl_broadcastTx", json!({ "tx": tx.tx })).await?;
        Ok(result.tx_id)
    }
}
