use pallas_codec::minicbor::{data::Type, decode, encode, Decoder, Encoder};

use crate::errors::ImporterError;

pub mod address;
pub mod block;
pub mod epoch;
pub mod tx;

pub const SLOTS_IN_EPOCH: i64 = 21600;
pub const SLOT_DURATION_SECS: i64 = 20;

/// Returns the raw bytes of the data item at the decoder head and advances
/// past it. `input` must be the slice the decoder was created over.
pub(crate) fn raw_item<'b>(d: &mut Decoder<'b>, input: &'b [u8]) -> Result<&'b [u8], decode::Error> {
    let start = d.position();
    d.skip()?;
    Ok(&input[start..d.position()])
}

/// Calls `f` once per element of the array at the decoder head. Byron
/// payloads mix definite and indefinite-length lists, so both are handled;
/// for the indefinite case the closing break byte is consumed.
pub(crate) fn walk_array<'b, E, F>(d: &mut Decoder<'b>, mut f: F) -> Result<(), E>
where
    E: From<decode::Error>,
    F: FnMut(&mut Decoder<'b>) -> Result<(), E>,
{
    match d.array().map_err(E::from)? {
        Some(len) => {
            for _ in 0..len {
                f(d)?;
            }
        }
        None => {
            while d.datatype().map_err(E::from)? != Type::Break {
                f(d)?;
            }
            d.set_position(d.position() + 1);
        }
    }
    Ok(())
}

/// Reads a tag-24 wrapped byte string (`#6.24(bytes)`), the envelope Byron
/// uses for nested CBOR payloads.
pub(crate) fn tagged_bytes<'b>(d: &mut Decoder<'b>) -> Result<&'b [u8], ImporterError> {
    let tag = d.tag()?;
    if tag.as_u64() != 24 {
        return Err(ImporterError::Decode(format!(
            "expected tag 24, got tag {}",
            tag.as_u64()
        )));
    }
    Ok(d.bytes()?)
}

/// Deterministic (shortest-form) CBOR encoding into a fresh buffer. Writing
/// to a `Vec` cannot fail, so the closure's error never materializes.
pub(crate) fn encode_canonical<F>(f: F) -> Vec<u8>
where
    F: FnOnce(&mut Encoder<Vec<u8>>) -> Result<(), encode::Error<std::convert::Infallible>>,
{
    let mut e = Encoder::new(Vec::new());
    f(&mut e).expect("infallible");
    e.into_writer()
}
