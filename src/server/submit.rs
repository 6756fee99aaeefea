use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::AppState;
use crate::chain::address;
use crate::chain::tx::{parse_tx, ChainTx, TxState};
use crate::db::Db;
use crate::errors::ImporterError;

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub message: String,
}

type Reply = (StatusCode, Json<SubmitResponse>);

fn fail(message: impl Into<String>) -> Reply {
    (
        StatusCode::BAD_REQUEST,
        Json(SubmitResponse {
            success: false,
            message: message.into(),
        }),
    )
}

fn success() -> Reply {
    (
        StatusCode::OK,
        Json(SubmitResponse {
            success: true,
            message: "OK".into(),
        }),
    )
}

/// `POST /api/txs/signed` with `{"signedTx": "<base64>"}`. The tx is
/// validated against the materialized utxo set, forwarded to the bridge
/// either way, and persisted as pending once the bridge accepts it.
pub async fn submit_signed_tx(State(state): State<Arc<AppState>>, body: Bytes) -> Reply {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return fail("invalid request");
    };
    if !payload.is_object() {
        return fail("invalid request");
    }
    let Some(signed_tx) = payload
        .get("signedTx")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    else {
        return fail("request signedTx is empty");
    };

    let tx = match parse_signed_payload(signed_tx) {
        Ok(tx) => tx,
        Err(e) => return fail(e.to_string()),
    };

    let validate_error = validate_tx(&state, &tx).await;
    if let Some(message) = &validate_error {
        error!("local tx validation failed: {message}");
    }

    let (status, bridge_body) = match state.bridge.submit_signed(&payload).await {
        Ok(response) => response,
        Err(e) => {
            error!("failed to forward signed tx to bridge: {e}");
            return fail("send tx to bridge error");
        }
    };
    debug!("send tx response {status}: {bridge_body}");

    if status.is_success() {
        if let Err(e) = state.db.save_pending_tx(&tx).await {
            error!("fail to store tx as pending: {e}");
            return fail("Internal DB fail in the importer!");
        }
        if validate_error.is_some() {
            warn!("local validation error, but network send succeeded!");
        }
        return success();
    }

    match validate_error {
        // local diagnosis plus the network's answer
        Some(message) => fail(format!(
            "Transaction validation error: {message} (Network response: {bridge_body})."
        )),
        // locally clean: proxy the network response
        None => fail(bridge_body),
    }
}

fn parse_signed_payload(payload: &str) -> Result<ChainTx, ImporterError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| ImporterError::validation("invalid base64 signedTx input."))?;
    let mut tx = parse_tx(&raw)?;
    tx.time = Some(Utc::now());
    tx.state = TxState::Pending;
    Ok(tx)
}

async fn validate_tx(state: &AppState, tx: &ChainTx) -> Option<String> {
    let checks = async {
        validate_witnesses(&state.db, tx).await?;
        validate_destination_network(state.network_magic, tx)
    };
    checks.await.err().map(|e| e.to_string())
}

async fn validate_witnesses(db: &Db, tx: &ChainTx) -> Result<(), ImporterError> {
    let mut hashes: Vec<String> = tx.inputs.iter().map(|input| input.tx_id.clone()).collect();
    hashes.sort();
    hashes.dedup();
    let outputs = db.get_outputs_for_tx_hashes(&hashes).await?;
    check_witnesses(tx, &outputs)
}

/// Store-free part of the witness check. Each regular (type 0) input must
/// be covered by a witness whose public key hashes back to the root of the
/// address it spends from.
fn check_witnesses(
    tx: &ChainTx,
    outputs: &HashMap<String, Vec<(String, i64)>>,
) -> Result<(), ImporterError> {
    if tx.inputs.len() != tx.witnesses.len() {
        return Err(ImporterError::Validation(format!(
            "length of inputs: {} not equal length of witnesses: {}",
            tx.inputs.len(),
            tx.witnesses.len()
        )));
    }
    for (input, witness) in tx.inputs.iter().zip(&tx.witnesses) {
        if input.kind != 0 || witness.kind != 0 {
            debug!(
                "ignore non-regular input/witness types: {}/{}",
                input.kind, witness.kind
            );
            continue;
        }
        let tx_outputs = outputs.get(&input.tx_id).ok_or_else(|| {
            ImporterError::Validation(format!(
                "No UTXO is found for tx {}! Maybe the blockchain is still syncing? If not, something is wrong.",
                input.tx_id
            ))
        })?;
        let (address, amount) = tx_outputs.get(input.idx as usize).ok_or_else(|| {
            ImporterError::Validation(format!(
                "no output at index {} for tx {}",
                input.idx, input.tx_id
            ))
        })?;
        debug!(
            "validate witness for input: {}.{} ({amount} coin from {address})",
            input.tx_id, input.idx
        );

        let parts = address::deconstruct(address)
            .map_err(|e| ImporterError::Validation(format!("undecodable input address: {e}")))?;
        if parts.address_type != 0 {
            debug!(
                "unsupported address type: {}. skip witness validation for this input",
                parts.address_type
            );
            continue;
        }
        let key = witness
            .sign
            .first()
            .ok_or_else(|| ImporterError::validation("witness carries no public key"))?;
        let expected = address::witness_root(key, &parts.attributes_raw);
        if expected != parts.root {
            return Err(ImporterError::Validation(format!(
                "witness does not match: {} != {}",
                hex::encode(&parts.root),
                hex::encode(&expected)
            )));
        }
    }
    Ok(())
}

/// Every output must target the configured network; the magic is embedded
/// in address attribute 2 (absent on mainnet).
fn validate_destination_network(
    expected: Option<i32>,
    tx: &ChainTx,
) -> Result<(), ImporterError> {
    for (index, output) in tx.outputs.iter().enumerate() {
        let parts = address::deconstruct(&output.address)
            .map_err(|e| ImporterError::Validation(format!("undecodable output address: {e}")))?;
        let magic = parts.network_magic()?;
        if magic != expected {
            return Err(ImporterError::Validation(format!(
                "output {index} network magic is {magic:?}, expected {expected:?}"
            )));
        }
    }
    Ok(())
}
