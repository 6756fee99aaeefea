use chrono::{DateTime, TimeZone, Utc};
use pallas_codec::minicbor::Decoder;
use pallas_crypto::hash::Hasher;

use crate::chain::{self, tx::{parse_tx, ChainTx, TxState}};
use crate::errors::ImporterError;

/// Wire block type bytes.
const BLOCK_TYPE_EBB: u64 = 0;
const BLOCK_TYPE_MAIN: u64 = 1;

#[derive(Debug, Clone)]
pub struct ChainBlock {
    /// Blake2b-256 of `[type, header]`, hex.
    pub hash: String,
    pub prev_hash: String,
    pub epoch: i64,
    /// None for epoch-boundary blocks.
    pub slot: Option<i64>,
    /// Chain difficulty, used as the block height everywhere.
    pub height: i64,
    pub is_ebb: bool,
    pub txs: Vec<ChainTx>,
    /// Raw update payload, kept only when the block proposes or votes on a
    /// protocol update.
    pub upd: Option<Vec<u8>>,
    pub time: Option<DateTime<Utc>>,
}

/// Decodes a block blob `[type, [header, body, attributes]]`. Type 0 is an
/// epoch-boundary block, type 1 a regular block.
pub fn parse_block(raw: &[u8], network_start_time: i64) -> Result<ChainBlock, ImporterError> {
    let mut d = Decoder::new(raw);
    d.array()?;
    let kind = d.u64()?;
    if kind != BLOCK_TYPE_EBB && kind != BLOCK_TYPE_MAIN {
        return Err(ImporterError::Decode(format!(
            "unexpected block type: {kind}"
        )));
    }
    d.array()?;
    let header = chain::raw_item(&mut d, raw)?;
    let hash = header_to_id(header, kind);

    // header: [protocol magic, prev hash, body proof, consensus data, extra]
    let mut hd = Decoder::new(header);
    hd.array()?;
    let _protocol_magic = hd.u64()?;
    let prev_hash = hex::encode(hd.bytes()?);
    hd.skip()?; // body proof

    if kind == BLOCK_TYPE_EBB {
        // consensus data: [epoch, [difficulty]]
        hd.array()?;
        let epoch = hd.u64()? as i64;
        hd.array()?;
        let height = hd.u64()? as i64;
        return Ok(ChainBlock {
            hash,
            prev_hash,
            epoch,
            slot: None,
            height,
            is_ebb: true,
            txs: Vec::new(),
            upd: None,
            time: None,
        });
    }

    // consensus data: [[epoch, slot], leader key, [difficulty], signature]
    hd.array()?;
    hd.array()?;
    let epoch = hd.u64()? as i64;
    let slot = hd.u64()? as i64;
    hd.skip()?; // leader public key
    hd.array()?;
    let height = hd.u64()? as i64;

    let time = block_time(network_start_time, epoch, slot);

    // body: [tx payload, ssc, delegation, update]
    d.array()?;
    let mut txs: Vec<ChainTx> = Vec::new();
    chain::walk_array(&mut d, |d| {
        let entry = chain::raw_item(d, raw)?;
        let mut tx = parse_tx(entry)?;
        tx.block_num = Some(height);
        tx.block_hash = Some(hash.clone());
        tx.time = time;
        tx.ordinal = Some(txs.len() as i32);
        tx.state = TxState::Success;
        txs.push(tx);
        Ok::<_, ImporterError>(())
    })?;
    d.skip()?; // ssc payload
    d.skip()?; // delegation payload
    let upd_raw = chain::raw_item(&mut d, raw)?;
    let upd = if update_payload_is_empty(upd_raw)? {
        None
    } else {
        Some(upd_raw.to_vec())
    };

    Ok(ChainBlock {
        hash,
        prev_hash,
        epoch,
        slot: Some(slot),
        height,
        is_ebb: false,
        txs,
        upd,
        time,
    })
}

/// The block id hashes the two-element array `[type, header]` with the
/// header bytes taken from the wire untouched.
pub fn header_to_id(header: &[u8], kind: u64) -> String {
    let mut data = Vec::with_capacity(header.len() + 2);
    data.push(0x82);
    data.push(kind as u8);
    data.extend_from_slice(header);
    hex::encode(Hasher::<256>::hash(&data))
}

fn block_time(network_start_time: i64, epoch: i64, slot: i64) -> Option<DateTime<Utc>> {
    let seconds =
        network_start_time + (epoch * chain::SLOTS_IN_EPOCH + slot) * chain::SLOT_DURATION_SECS;
    Utc.timestamp_opt(seconds, 0).single()
}

/// The update payload is a pair of arrays (proposals, votes); the block
/// keeps it only when either side has entries.
fn update_payload_is_empty(raw: &[u8]) -> Result<bool, ImporterError> {
    let mut d = Decoder::new(raw);
    d.array()?;
    let mut total = 0usize;
    for _ in 0..2 {
        chain::walk_array(&mut d, |d| {
            d.skip()?;
            total += 1;
            Ok::<_, ImporterError>(())
        })?;
    }
    Ok(total == 0)
}
