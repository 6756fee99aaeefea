use chrono::{DateTime, Utc};
use pallas_codec::minicbor::{data::Type, Decoder};
use pallas_crypto::hash::Hasher;

use crate::chain;
use crate::errors::ImporterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Success,
    Failed,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Pending => "Pending",
            TxState::Success => "Success",
            TxState::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub kind: u64,
    /// Hex id of the transaction whose output is being spent.
    pub tx_id: String,
    pub idx: u64,
}

impl TxInput {
    pub fn utxo_id(&self) -> String {
        chain::address::utxo_id(&self.tx_id, self.idx as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// base58 rendering of the raw address item, as addresses appear
    /// everywhere else in the system.
    pub address: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxWitness {
    pub kind: u64,
    /// Byte-string elements of the witness payload; for a regular (type 0)
    /// witness these are `[public_key, signature]`.
    pub sign: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ChainTx {
    pub id: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub witnesses: Vec<TxWitness>,
    /// Hex of the canonical body bytes the id was computed over.
    pub tx_body: String,
    pub time: Option<DateTime<Utc>>,
    pub ordinal: Option<i32>,
    pub block_num: Option<i64>,
    pub block_hash: Option<String>,
    pub state: TxState,
}

/// Decodes a raw Byron transaction: either a signed
/// `[[inputs, outputs, attributes], witnesses]` pair or a bare
/// `[inputs, outputs, attributes]` body.
///
/// The id is Blake2b-256 over `[inputs, outputs, attributes]` with the two
/// lists reframed as indefinite-length arrays; the `0x9f`/`0xff` markers are
/// part of the hashed bytes. Element bytes are spliced from the wire
/// untouched, which keeps the hash byte-exact with the network.
pub fn parse_tx(raw: &[u8]) -> Result<ChainTx, ImporterError> {
    if raw.is_empty() {
        return Err(ImporterError::Decode("can not decode empty tx".into()));
    }
    let mut d = Decoder::new(raw);
    let signed = match d.array()? {
        Some(2) => true,
        Some(3) => false,
        other => {
            return Err(ImporterError::Decode(format!(
                "invalid decoded tx structure: array of {other:?}"
            )))
        }
    };
    if signed {
        // enter the base [inputs, outputs, attributes]
        d.array()?;
    }

    let mut inputs = Vec::new();
    let mut input_raws: Vec<&[u8]> = Vec::new();
    chain::walk_array(&mut d, |d| {
        let item = chain::raw_item(d, raw)?;
        inputs.push(parse_input(item)?);
        input_raws.push(item);
        Ok::<_, ImporterError>(())
    })?;

    let mut outputs = Vec::new();
    let mut output_raws: Vec<&[u8]> = Vec::new();
    chain::walk_array(&mut d, |d| {
        let item = chain::raw_item(d, raw)?;
        outputs.push(parse_output(item)?);
        output_raws.push(item);
        Ok::<_, ImporterError>(())
    })?;

    let attributes = chain::raw_item(&mut d, raw)?;

    let mut witnesses = Vec::new();
    if signed {
        chain::walk_array(&mut d, |d| {
            let item = chain::raw_item(d, raw)?;
            witnesses.push(parse_witness(item)?);
            Ok::<_, ImporterError>(())
        })?;
    }

    let body = canonical_tx_body(&input_raws, &output_raws, attributes);
    let id = hex::encode(Hasher::<256>::hash(&body));

    Ok(ChainTx {
        id,
        inputs,
        outputs,
        witnesses,
        tx_body: hex::encode(&body),
        time: None,
        ordinal: None,
        block_num: None,
        block_hash: None,
        state: TxState::Pending,
    })
}

fn canonical_tx_body(inputs: &[&[u8]], outputs: &[&[u8]], attributes: &[u8]) -> Vec<u8> {
    let size = 4 + attributes.len()
        + inputs.iter().map(|i| i.len()).sum::<usize>()
        + outputs.iter().map(|o| o.len()).sum::<usize>();
    let mut body = Vec::with_capacity(size);
    body.push(0x83);
    body.push(0x9f);
    for item in inputs {
        body.extend_from_slice(item);
    }
    body.push(0xff);
    body.push(0x9f);
    for item in outputs {
        body.extend_from_slice(item);
    }
    body.push(0xff);
    body.extend_from_slice(attributes);
    body
}

/// An input is `[type, #6.24(bytes(CBOR([tx_id, idx])))]`.
fn parse_input(raw: &[u8]) -> Result<TxInput, ImporterError> {
    let mut d = Decoder::new(raw);
    d.array()?;
    let kind = d.u64()?;
    let payload = chain::tagged_bytes(&mut d)?;

    let mut inner = Decoder::new(payload);
    inner.array()?;
    let tx_id = hex::encode(inner.bytes()?);
    let idx = inner.u64()?;
    Ok(TxInput { kind, tx_id, idx })
}

/// An output is `[address, value]`; the address item is kept raw and
/// rendered as base58.
fn parse_output(raw: &[u8]) -> Result<TxOutput, ImporterError> {
    let mut d = Decoder::new(raw);
    d.array()?;
    let address_raw = chain::raw_item(&mut d, raw)?;
    let value = d.u64()? as i64;
    Ok(TxOutput {
        address: bs58::encode(address_raw).into_string(),
        value,
    })
}

/// A witness is `[type, #6.24(bytes(CBOR([...])))]`; the inner byte strings
/// are collected, anything more exotic is kept as raw CBOR.
fn parse_witness(raw: &[u8]) -> Result<TxWitness, ImporterError> {
    let mut d = Decoder::new(raw);
    d.array()?;
    let kind = d.u64()?;
    let payload = chain::tagged_bytes(&mut d)?;

    let mut inner = Decoder::new(payload);
    let mut sign = Vec::new();
    chain::walk_array(&mut inner, |d| {
        match d.datatype()? {
            Type::Bytes => sign.push(d.bytes()?.to_vec()),
            _ => sign.push(chain::raw_item(d, payload)?.to_vec()),
        }
        Ok::<_, ImporterError>(())
    })?;
    Ok(TxWitness { kind, sign })
}

#[cfg(test)]
pub(crate) mod tests {
    use pallas_crypto::hash::Hasher;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::chain::{self, address};

    pub(crate) fn encode_input(tx_id: &[u8; 32], idx: u64) -> Vec<u8> {
        let pointer = chain::encode_canonical(|e| {
            e.array(2)?.bytes(tx_id)?.u64(idx)?;
            Ok(())
        });
        chain::encode_canonical(|e| {
            e.array(2)?
                .u8(0)?
                .tag(pallas_codec::minicbor::data::Tag::new(24))?
                .bytes(&pointer)?;
            Ok(())
        })
    }

    pub(crate) fn encode_output(address_raw: &[u8], value: u64) -> Vec<u8> {
        let mut out = chain::encode_canonical(|e| {
            e.array(2)?;
            Ok(())
        });
        out.extend_from_slice(address_raw);
        out.extend_from_slice(&chain::encode_canonical(|e| {
            e.u64(value)?;
            Ok(())
        }));
        out
    }

    pub(crate) fn encode_witness(kind: u64, key: &[u8], signature: &[u8]) -> Vec<u8> {
        let payload = chain::encode_canonical(|e| {
            e.array(2)?.bytes(key)?.bytes(signature)?;
            Ok(())
        });
        chain::encode_canonical(|e| {
            e.array(2)?
                .u64(kind)?
                .tag(pallas_codec::minicbor::data::Tag::new(24))?
                .bytes(&payload)?;
            Ok(())
        })
    }

    /// A signed tx blob with one input, one output and one witness, using
    /// indefinite-length input/output lists the way Byron serializes them.
    pub(crate) fn signed_tx_fixture(
        input_tx_id: &[u8; 32],
        address_raw: &[u8],
        value: u64,
    ) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let input = encode_input(input_tx_id, 0);
        let output = encode_output(address_raw, value);
        let witness = encode_witness(0, &[7u8; 64], &[9u8; 64]);

        let mut blob = vec![0x82, 0x83];
        blob.push(0x9f);
        blob.extend_from_slice(&input);
        blob.push(0xff);
        blob.push(0x9f);
        blob.extend_from_slice(&output);
        blob.push(0xff);
        blob.push(0xa0); // empty attributes
        blob.push(0x9f);
        blob.extend_from_slice(&witness);
        blob.push(0xff);
        (blob, input, output)
    }

    #[test]
    fn decodes_signed_tx_and_computes_id_over_indefinite_framing() {
        let input_tx_id = [3u8; 32];
        let address_raw = bs58::decode(
            address::redeem_key_to_address(&test_redeem_key()).unwrap(),
        )
        .into_vec()
        .unwrap();
        let (blob, input_raw, output_raw) = signed_tx_fixture(&input_tx_id, &address_raw, 1000);

        let tx = parse_tx(&blob).unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].kind, 0);
        assert_eq!(tx.inputs[0].tx_id, hex::encode(input_tx_id));
        assert_eq!(tx.inputs[0].idx, 0);
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, 1000);
        assert_eq!(tx.outputs[0].address, bs58::encode(&address_raw).into_string());
        assert_eq!(tx.witnesses.len(), 1);
        assert_eq!(tx.witnesses[0].sign[0], vec![7u8; 64]);

        // the hashed bytes are [0x83, 0x9f inputs 0xff, 0x9f outputs 0xff, attrs]
        let mut expected_body = vec![0x83, 0x9f];
        expected_body.extend_from_slice(&input_raw);
        expected_body.push(0xff);
        expected_body.push(0x9f);
        expected_body.extend_from_slice(&output_raw);
        expected_body.push(0xff);
        expected_body.push(0xa0);
        assert_eq!(tx.tx_body, hex::encode(&expected_body));
        assert_eq!(tx.id, hex::encode(Hasher::<256>::hash(&expected_body)));
    }

    #[test]
    fn bare_tx_body_decodes_without_witnesses() {
        let input = encode_input(&[5u8; 32], 2);
        let address_raw =
            bs58::decode(address::redeem_key_to_address(&test_redeem_key()).unwrap())
                .into_vec()
                .unwrap();
        let output = encode_output(&address_raw, 42);

        let mut blob = vec![0x83, 0x9f];
        blob.extend_from_slice(&input);
        blob.push(0xff);
        blob.push(0x9f);
        blob.extend_from_slice(&output);
        blob.push(0xff);
        blob.push(0xa0);

        let tx = parse_tx(&blob).unwrap();
        assert_eq!(tx.inputs[0].idx, 2);
        assert!(tx.witnesses.is_empty());

        // signing the same body does not change the id
        let witness = encode_witness(0, &[7u8; 64], &[9u8; 64]);
        let mut signed = vec![0x82];
        signed.extend_from_slice(&blob);
        signed.push(0x81);
        signed.extend_from_slice(&witness);
        let from_signed = parse_tx(&signed).unwrap();
        assert_eq!(tx.id, from_signed.id);
    }

    #[test]
    fn utxo_id_concatenates_without_delimiter() {
        let input = TxInput {
            kind: 0,
            tx_id: "ab".repeat(32),
            idx: 7,
        };
        assert_eq!(input.utxo_id(), format!("{}7", "ab".repeat(32)));
    }

    #[test]
    fn rejects_malformed_tx_structure() {
        let blob = chain::encode_canonical(|e| {
            e.array(1)?.u8(0)?;
            Ok(())
        });
        assert!(parse_tx(&blob).is_err());
        assert!(parse_tx(&[]).is_err());
    }

    pub(crate) fn test_redeem_key() -> String {
        use base64::Engine;
        base64::engine::general_purpose::URL_SAFE.encode([0x11u8; 32])
    }
}
