use std::ops::Range;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bridge::BridgeClient;
use crate::chain::block::{parse_block, ChainBlock};
use crate::chain::epoch::parse_epoch;
use crate::cli::SchedulerConfig;
use crate::db::{BlockSummary, Db};
use crate::errors::ImporterError;

/// Slots into its current epoch the remote tip must be before that epoch's
/// predecessor counts as stable.
const STABLE_SLOT_MARGIN: i64 = 2160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Processed,
    RollbackRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LastBlock {
    epoch: i64,
    hash: String,
}

#[derive(Debug, PartialEq, Eq)]
enum SyncMode {
    /// Pull these epochs as packed blobs.
    EpochBatch(Range<i64>),
    /// Stable epochs exist but the bridge has not packed them yet.
    AwaitPackedEpoch { last_stable: i64 },
    BlockByBlock,
}

/// The chain-follow engine: a single long-running task that polls the
/// bridge tip, ingests new blocks (whole epochs while far behind, single
/// blocks near the tip) and rewinds the store when the chain forks.
pub struct Scheduler {
    db: Db,
    bridge: BridgeClient,
    cfg: SchedulerConfig,
    network_start_time: i64,
    blocks_to_store: Vec<BlockSummary>,
    last_block: Option<LastBlock>,
}

impl Scheduler {
    pub fn new(
        db: Db,
        bridge: BridgeClient,
        cfg: SchedulerConfig,
        network_start_time: i64,
    ) -> Self {
        Self {
            db,
            bridge,
            cfg,
            network_start_time,
            blocks_to_store: Vec::new(),
            last_block: None,
        }
    }

    pub async fn start(mut self) -> Result<(), ImporterError> {
        info!(
            "start chain syncing. check tip every {} seconds, rollback depth {} blocks",
            self.cfg.check_tip_seconds, self.cfg.rollback_blocks_count
        );
        loop {
            let started = Instant::now();
            let mut error_sleep = None;
            if let Err(e) = self.check_tip().await {
                match e.backoff() {
                    Some(backoff) => {
                        warn!(
                            "failed to check tip: {e}. sleeping {}s and retrying",
                            backoff.as_secs()
                        );
                        // the retry must re-derive its chain position from
                        // the store
                        self.blocks_to_store.clear();
                        self.last_block = None;
                        error_sleep = Some(backoff);
                    }
                    None => return Err(e),
                }
            }
            let elapsed = started.elapsed();
            info!("chain sync loop finished in {}s", elapsed.as_secs());

            let pause = error_sleep.unwrap_or_else(|| {
                Duration::from_secs(self.cfg.check_tip_seconds).saturating_sub(elapsed)
            });
            if !pause.is_zero() {
                sleep(pause).await;
            }
        }
    }

    async fn check_tip(&mut self) -> Result<(), ImporterError> {
        info!("checking for new blocks");
        let best = self.db.best_block().await?;
        let status = self.bridge.status().await?;
        let Some(local) = status.tip.local else {
            info!("cardano-http-bridge not synced yet");
            return Ok(());
        };
        let remote = status.tip.remote;
        info!(
            "last imported block height: {}. node status => local: {:?}, remote: {:?}, packed epochs: {}",
            best.height, local.slot, remote.slot, status.packed_epochs
        );

        let (remote_epoch, remote_slot) = remote.slot;
        if best.epoch < remote_epoch {
            match select_sync_mode(
                best.epoch,
                best.slot.unwrap_or(0),
                remote_epoch,
                remote_slot,
                status.packed_epochs,
                self.cfg.epoch_download_threshold,
            ) {
                SyncMode::EpochBatch(epochs) => {
                    for epoch_id in epochs {
                        if self.process_epoch(epoch_id, best.height).await?
                            == BlockStatus::RollbackRequired
                        {
                            info!("rollback required");
                            self.rollback(best.height).await?;
                            return Ok(());
                        }
                    }
                    return Ok(());
                }
                SyncMode::AwaitPackedEpoch { last_stable } => {
                    info!(
                        "cardano-http-bridge has not yet packed stable epoch: {}. last remote stable epoch is: {last_stable}",
                        best.epoch
                    );
                    return Ok(());
                }
                SyncMode::BlockByBlock => {}
            }
        }

        let mut height = best.height + 1;
        let mut processed = 0;
        while height <= local.height && processed < self.cfg.max_blocks_per_loop {
            if self.process_block_height(height).await? == BlockStatus::RollbackRequired {
                info!("rollback required");
                self.rollback(height).await?;
                return Ok(());
            }
            processed += 1;
            height += 1;
        }
        Ok(())
    }

    /// Streams one packed epoch, applying every block above `height_floor`.
    async fn process_epoch(
        &mut self,
        epoch_id: i64,
        height_floor: i64,
    ) -> Result<BlockStatus, ImporterError> {
        info!("process epoch: {epoch_id} above height: {height_floor}");
        let blob = self.bridge.epoch(epoch_id).await?;
        let blocks = parse_epoch(blob, self.network_start_time, true)?;
        for block in blocks {
            let block = block?;
            if block.height > height_floor
                && self.process_block(block, false).await? == BlockStatus::RollbackRequired
            {
                return Ok(BlockStatus::RollbackRequired);
            }
        }
        Ok(BlockStatus::Processed)
    }

    async fn process_block_height(&mut self, height: i64) -> Result<BlockStatus, ImporterError> {
        let blob = self.bridge.block_by_height(height).await?;
        let block = parse_block(&blob, self.network_start_time)?;
        self.process_block(block, true).await
    }

    async fn process_block(
        &mut self,
        block: ChainBlock,
        flush: bool,
    ) -> Result<BlockStatus, ImporterError> {
        if let Some(last) = &self.last_block {
            if fork_detected(last, &block) {
                info!(
                    "block prev hash: {} mismatches {}. need rollback!",
                    block.prev_hash, last.hash
                );
                return Ok(BlockStatus::RollbackRequired);
            }
        }
        self.last_block = Some(LastBlock {
            epoch: block.epoch,
            hash: block.hash.clone(),
        });
        if block.upd.is_some() {
            debug!("block {} carries a protocol update payload", block.hash);
        }
        self.blocks_to_store.push(BlockSummary {
            block_hash: block.hash.clone(),
            block_height: block.height,
            epoch: block.epoch,
            slot: block.slot,
        });

        let block_has_txs = !block.txs.is_empty();
        if block_has_txs {
            self.db.store_block_txs(&block).await?;
        }
        if self.blocks_to_store.len() > self.cfg.blocks_cache_size || block_has_txs || flush {
            self.db
                .save_blocks_and_best(&self.blocks_to_store, block.height)
                .await?;
            self.blocks_to_store.clear();
        }
        if flush || block.height % self.cfg.log_block_parsed_threshold == 0 {
            info!(
                "block parsed => hash: {} epoch: {} slot: {:?} height: {}",
                block.hash, block.epoch, block.slot, block.height
            );
        }
        Ok(BlockStatus::Processed)
    }

    /// Rewinds the store by the configured depth. `at_height` is where the
    /// fork was noticed and is logged only.
    async fn rollback(&mut self, at_height: i64) -> Result<(), ImporterError> {
        info!(
            "rollback at height {at_height}, rewinding {} blocks",
            self.cfg.rollback_blocks_count
        );
        self.blocks_to_store.clear();
        self.last_block = None;

        let best = self.db.best_block().await?;
        let target = rollback_target(best.height, self.cfg.rollback_blocks_count);
        info!(
            "current DB height at rollback time: {}. rollback to: {target}",
            best.height
        );
        self.db.rollback_to(target).await?;

        let best = self.db.best_block().await?;
        self.last_block = best.hash.map(|hash| LastBlock {
            epoch: best.epoch,
            hash,
        });
        Ok(())
    }
}

/// A block forks the chain when it extends the same epoch as the previous
/// one but does not link to it. The first block after an epoch change is
/// exempt, its predecessor lives in the previous epoch.
fn fork_detected(last: &LastBlock, block: &ChainBlock) -> bool {
    block.epoch == last.epoch && block.prev_hash != last.hash
}

/// Whole stable epochs are pulled as packed blobs, which is far cheaper
/// than per-block fetches. The remote's current epoch and (until it is
/// 2160 slots in) its previous one are not yet stable.
fn select_sync_mode(
    best_epoch: i64,
    best_slot: i64,
    remote_epoch: i64,
    remote_slot: i64,
    packed_epochs: i64,
    epoch_download_threshold: i64,
) -> SyncMode {
    let last_stable = remote_epoch - if remote_slot > STABLE_SLOT_MARGIN { 1 } else { 2 };
    let many_stable = best_epoch < last_stable
        || (best_epoch == last_stable && best_slot < epoch_download_threshold);
    if !many_stable {
        return SyncMode::BlockByBlock;
    }
    if packed_epochs > best_epoch {
        SyncMode::EpochBatch(best_epoch..packed_epochs)
    } else {
        SyncMode::AwaitPackedEpoch { last_stable }
    }
}

/// The rewind depth is fixed by configuration; the target never crosses the
/// genesis boundary.
fn rollback_target(best_height: i64, rollback_blocks_count: i64) -> i64 {
    (best_height - rollback_blocks_count).max(0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn block(epoch: i64, hash: &str, prev_hash: &str) -> ChainBlock {
        ChainBlock {
            hash: hash.to_string(),
            prev_hash: prev_hash.to_string(),
            epoch,
            slot: Some(0),
            height: 1,
            is_ebb: false,
            txs: Vec::new(),
            upd: None,
            time: None,
        }
    }

    #[rstest]
    #[case(1, "h1", 1, "h1", false)] // linked, same epoch
    #[case(1, "h1", 1, "h0", true)] // same epoch, wrong parent
    #[case(1, "h1", 2, "h0", false)] // epoch change resets the check
    fn fork_detection_truth_table(
        #[case] last_epoch: i64,
        #[case] last_hash: &str,
        #[case] block_epoch: i64,
        #[case] prev_hash: &str,
        #[case] expected: bool,
    ) {
        let last = LastBlock {
            epoch: last_epoch,
            hash: last_hash.to_string(),
        };
        assert_eq!(fork_detected(&last, &block(block_epoch, "hx", prev_hash)), expected);
    }

    #[test]
    fn far_behind_tip_selects_epoch_batches() {
        // best at 0/0, remote at 5/3000, 4 epochs packed: epochs [0, 4)
        assert_eq!(
            select_sync_mode(0, 0, 5, 3000, 4, 14400),
            SyncMode::EpochBatch(0..4)
        );
    }

    #[test]
    fn stable_epoch_without_pack_waits() {
        assert_eq!(
            select_sync_mode(3, 0, 5, 3000, 3, 14400),
            SyncMode::AwaitPackedEpoch { last_stable: 4 }
        );
    }

    #[rstest]
    #[case(4, 0, 5, 3000, 5, 14400)] // inside the last stable epoch, below threshold
    #[case(4, 2000, 5, 2000, 5, 14400)] // remote fresh into its epoch: stable horizon drops to 3
    fn threshold_and_margin_boundaries(
        #[case] best_epoch: i64,
        #[case] best_slot: i64,
        #[case] remote_epoch: i64,
        #[case] remote_slot: i64,
        #[case] packed: i64,
        #[case] threshold: i64,
    ) {
        let mode = select_sync_mode(best_epoch, best_slot, remote_epoch, remote_slot, packed, threshold);
        match (best_slot, remote_slot) {
            (0, 3000) => assert_eq!(mode, SyncMode::EpochBatch(4..5)),
            _ => assert_eq!(mode, SyncMode::BlockByBlock),
        }
    }

    #[test]
    fn caught_up_epoch_goes_block_by_block() {
        assert_eq!(
            select_sync_mode(4, 20000, 5, 3000, 5, 14400),
            SyncMode::BlockByBlock
        );
    }

    #[rstest]
    #[case(10, 25, 0)] // clamped at the genesis boundary
    #[case(100, 25, 75)]
    #[case(25, 25, 0)]
    fn rollback_target_is_clamped(
        #[case] best: i64,
        #[case] depth: i64,
        #[case] expected: i64,
    ) {
        assert_eq!(rollback_target(best, depth), expected);
    }
}
