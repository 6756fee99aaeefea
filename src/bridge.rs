use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::errors::ImporterError;

/// Thin typed accessor over the upstream cardano-http-bridge. All routes
/// live under `bridge_url/<network>/`.
#[derive(Clone)]
pub struct BridgeClient {
    network_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct BridgeStatus {
    pub tip: BridgeTip,
    #[serde(rename = "packedEpochs")]
    pub packed_epochs: i64,
}

#[derive(Debug, Deserialize)]
pub struct BridgeTip {
    /// Missing while the bridge itself is still syncing.
    pub local: Option<TipSide>,
    pub remote: TipSide,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TipSide {
    pub height: i64,
    /// `[epoch, slot]` pair.
    pub slot: (i64, i64),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisDocument {
    #[serde(default)]
    pub non_avvm_balances: BTreeMap<String, String>,
    #[serde(default)]
    pub avvm_distr: BTreeMap<String, String>,
}

impl BridgeClient {
    pub fn new(
        bridge_url: &str,
        network_name: &str,
        timeout: Duration,
    ) -> Result<Self, ImporterError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImporterError::Config(e.to_string()))?;
        Ok(Self {
            network_url: format!("{}/{}", bridge_url.trim_end_matches('/'), network_name),
            http,
        })
    }

    pub async fn status(&self) -> Result<BridgeStatus, ImporterError> {
        self.get_json("status").await
    }

    pub async fn block_by_height(&self, height: i64) -> Result<Bytes, ImporterError> {
        self.get_bytes(&format!("height/{height}")).await
    }

    pub async fn block_by_id(&self, hash: &str) -> Result<Bytes, ImporterError> {
        self.get_bytes(&format!("block/{hash}")).await
    }

    pub async fn epoch(&self, id: i64) -> Result<Bytes, ImporterError> {
        self.get_bytes(&format!("epoch/{id}")).await
    }

    pub async fn genesis(&self, hash: &str) -> Result<GenesisDocument, ImporterError> {
        self.get_json(&format!("genesis/{hash}")).await
    }

    /// Forwards a signed-tx payload. The upstream status and body pass
    /// through verbatim for the submit handler to interpret; only transport
    /// failures are errors here.
    pub async fn submit_signed(
        &self,
        payload: &serde_json::Value,
    ) -> Result<(StatusCode, String), ImporterError> {
        let url = self.url("txs/signed");
        debug!("POST {url}");
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(connectivity)?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.network_url, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ImporterError> {
        let url = self.url(path);
        debug!("GET {url}");
        let response = self.http.get(&url).send().await.map_err(connectivity)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImporterError::BridgeHttp {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    async fn get_bytes(&self, path: &str) -> Result<Bytes, ImporterError> {
        self.get(path).await?.bytes().await.map_err(connectivity)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ImporterError> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| ImporterError::Decode(format!("invalid json resp from {path}: {e}")))
    }
}

fn connectivity(e: reqwest::Error) -> ImporterError {
    if e.is_connect() || e.is_timeout() {
        ImporterError::BridgeUnavailable(e.to_string())
    } else {
        ImporterError::BridgeHttp {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            body: e.to_string(),
        }
    }
}
