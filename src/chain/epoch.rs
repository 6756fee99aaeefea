use bytes::Bytes;

use crate::chain::block::{parse_block, ChainBlock};
use crate::errors::ImporterError;

/// Packed epoch blobs start with a 16-byte file header, followed by
/// `[u32-be size][block blob][padding to a 4-byte boundary]` records.
const EPOCH_FILE_HEADER_SIZE: usize = 16;

/// Lazy, single-pass iterator over the blocks of a packed epoch blob.
pub struct EpochBlocks {
    data: Bytes,
    offset: usize,
    network_start_time: i64,
    omit_ebb: bool,
    first: bool,
}

pub fn parse_epoch(
    data: Bytes,
    network_start_time: i64,
    omit_ebb: bool,
) -> Result<EpochBlocks, ImporterError> {
    if data.len() < EPOCH_FILE_HEADER_SIZE {
        return Err(ImporterError::Decode(
            "epoch blob shorter than its 16-byte header".into(),
        ));
    }
    Ok(EpochBlocks {
        data: data.slice(EPOCH_FILE_HEADER_SIZE..),
        offset: 0,
        network_start_time,
        omit_ebb,
        first: true,
    })
}

impl Iterator for EpochBlocks {
    type Item = Result<ChainBlock, ImporterError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.offset + 4 > self.data.len() {
                return None;
            }
            let mut size_bytes = [0u8; 4];
            size_bytes.copy_from_slice(&self.data[self.offset..self.offset + 4]);
            let size = u32::from_be_bytes(size_bytes) as usize;

            let start = self.offset + 4;
            if start + size > self.data.len() {
                self.offset = self.data.len();
                return Some(Err(ImporterError::Decode(
                    "truncated block record in epoch blob".into(),
                )));
            }
            let parsed = parse_block(&self.data[start..start + size], self.network_start_time);

            let padding = (4 - size % 4) % 4;
            self.offset = start + size + padding;

            let first = std::mem::replace(&mut self.first, false);
            match parsed {
                Ok(block) if first && self.omit_ebb && block.is_ebb => continue,
                other => return Some(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::chain::block::tests::{ebb_blob, main_blob};

    fn pack(blobs: &[Vec<u8>]) -> Bytes {
        let mut data = vec![0u8; EPOCH_FILE_HEADER_SIZE];
        for blob in blobs {
            data.extend_from_slice(&(blob.len() as u32).to_be_bytes());
            data.extend_from_slice(blob);
            let padding = (4 - blob.len() % 4) % 4;
            data.extend_from_slice(&vec![0u8; padding]);
        }
        Bytes::from(data)
    }

    #[rstest]
    #[case(true, 1)]
    #[case(false, 2)]
    fn leading_ebb_is_dropped_only_with_omit_ebb(#[case] omit_ebb: bool, #[case] expected: usize) {
        let ebb = ebb_blob(0, 0, &[0u8; 32]);
        let main = main_blob(0, 1, 1, &[2u8; 32], &[]);
        let packed = pack(&[ebb, main]);

        let blocks: Vec<_> = parse_epoch(packed, 0, omit_ebb)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(blocks.len(), expected);
        assert!(!blocks.last().unwrap().is_ebb);
    }

    #[test]
    fn omit_ebb_keeps_a_leading_regular_block() {
        let first = main_blob(0, 1, 1, &[2u8; 32], &[]);
        let second = main_blob(0, 2, 2, &[3u8; 32], &[]);
        let packed = pack(&[first, second]);

        let blocks: Vec<_> = parse_epoch(packed, 0, true)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].height, 1);
        assert_eq!(blocks[1].height, 2);
    }

    #[test]
    fn records_are_read_across_padding() {
        // block blobs rarely align to 4 bytes, so the iterator must step
        // over the per-record padding to find the next size field
        let blobs: Vec<_> = (1..=3)
            .map(|i| main_blob(0, i, i as u64, &[i as u8; 32], &[]))
            .collect();
        assert!(blobs.iter().any(|b| b.len() % 4 != 0));
        let packed = pack(&blobs);

        let heights: Vec<_> = parse_epoch(packed, 0, false)
            .unwrap()
            .map(|b| b.unwrap().height)
            .collect();
        assert_eq!(heights, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_blob_shorter_than_header() {
        assert!(parse_epoch(Bytes::from_static(&[0u8; 15]), 0, false).is_err());
    }

    #[test]
    fn truncated_record_surfaces_a_decode_error() {
        let mut data = vec![0u8; EPOCH_FILE_HEADER_SIZE];
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        let mut blocks = parse_epoch(Bytes::from(data), 0, false).unwrap();
        assert!(blocks.next().unwrap().is_err());
        assert!(blocks.next().is_none());
    }
}
