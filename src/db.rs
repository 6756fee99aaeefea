use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde::Serialize;
use tokio_postgres::{GenericClient, NoTls};
use tracing::{debug, info};

use crate::chain::address::{fix_long_address, utxo_id};
use crate::chain::block::ChainBlock;
use crate::chain::tx::{ChainTx, TxState};
use crate::cli::DbConfig;
use crate::errors::ImporterError;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS blocks (
        block_hash   VARCHAR(64) PRIMARY KEY,
        block_height BIGINT NOT NULL UNIQUE,
        epoch        BIGINT NOT NULL,
        slot         BIGINT
    );

    CREATE TABLE IF NOT EXISTS txs (
        hash            VARCHAR(64) PRIMARY KEY,
        inputs          JSONB,
        inputs_address  TEXT[],
        inputs_amount   BIGINT[],
        outputs_address TEXT[],
        outputs_amount  BIGINT[],
        block_num       BIGINT,
        block_hash      VARCHAR(64),
        tx_state        VARCHAR(16) NOT NULL,
        tx_body         TEXT,
        tx_ordinal      INTEGER,
        time            TIMESTAMPTZ,
        last_update     TIMESTAMPTZ NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_txs_block_num ON txs (block_num);

    CREATE TABLE IF NOT EXISTS utxos (
        utxo_id   VARCHAR(128) PRIMARY KEY,
        tx_hash   VARCHAR(64) NOT NULL,
        tx_index  INTEGER NOT NULL,
        receiver  VARCHAR(1024) NOT NULL,
        amount    BIGINT NOT NULL,
        block_num BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_utxos_block_num ON utxos (block_num);

    CREATE TABLE IF NOT EXISTS utxos_backup (
        utxo_id           VARCHAR(128) PRIMARY KEY,
        tx_hash           VARCHAR(64) NOT NULL,
        tx_index          INTEGER NOT NULL,
        receiver          VARCHAR(1024) NOT NULL,
        amount            BIGINT NOT NULL,
        block_num         BIGINT NOT NULL,
        deleted_block_num BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_utxos_backup_block_num ON utxos_backup (block_num);

    CREATE TABLE IF NOT EXISTS tx_addresses (
        tx_hash VARCHAR(64)  NOT NULL,
        address VARCHAR(1024) NOT NULL,
        PRIMARY KEY (tx_hash, address)
    );

    CREATE TABLE IF NOT EXISTS bestblock (
        best_block_num BIGINT NOT NULL
    );

    INSERT INTO bestblock (best_block_num)
    SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM bestblock);
"#;

const BACKUP_UTXOS_SQL: &str = "
    WITH moved_utxos AS (
        DELETE FROM utxos WHERE utxo_id = ANY($1)
        RETURNING utxo_id, tx_hash, tx_index, receiver, amount, block_num
    )
    INSERT INTO utxos_backup
        (utxo_id, tx_hash, tx_index, receiver, amount, block_num, deleted_block_num)
    SELECT utxo_id, tx_hash, tx_index, receiver, amount, block_num, $2
    FROM moved_utxos";

const RESTORE_UTXOS_SQL: &str = "
    WITH moved_utxos AS (
        DELETE FROM utxos_backup
        WHERE block_num <= $1 AND deleted_block_num > $1
        RETURNING utxo_id, tx_hash, tx_index, receiver, amount, block_num
    )
    INSERT INTO utxos (utxo_id, tx_hash, tx_index, receiver, amount, block_num)
    SELECT utxo_id, tx_hash, tx_index, receiver, amount, block_num
    FROM moved_utxos";

const UPSERT_TX_SQL: &str = "
    INSERT INTO txs
        (hash, inputs, inputs_address, inputs_amount, outputs_address, outputs_amount,
         block_num, block_hash, tx_state, tx_body, tx_ordinal, time, last_update)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (hash) DO UPDATE
    SET block_num   = EXCLUDED.block_num,
        block_hash  = EXCLUDED.block_hash,
        time        = EXCLUDED.time,
        tx_state    = EXCLUDED.tx_state,
        last_update = EXCLUDED.last_update,
        tx_ordinal  = EXCLUDED.tx_ordinal";

/// Persistent view of the chain. Cloning shares the underlying pool; the
/// scheduler and the submit handlers use the same instance concurrently.
#[derive(Clone)]
pub struct Db {
    pool: Pool,
}

#[derive(Debug, Clone)]
pub struct BestBlock {
    pub height: i64,
    pub epoch: i64,
    pub slot: Option<i64>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub block_hash: String,
    pub block_height: i64,
    pub epoch: i64,
    pub slot: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoRow {
    pub utxo_id: String,
    pub tx_hash: String,
    pub tx_index: i32,
    pub receiver: String,
    pub amount: i64,
    pub block_num: i64,
}

impl UtxoRow {
    pub fn new(receiver: &str, amount: i64, tx_hash: &str, tx_index: i32, block_num: i64) -> Self {
        Self {
            utxo_id: utxo_id(tx_hash, tx_index as i64),
            tx_hash: tx_hash.to_string(),
            tx_index,
            receiver: fix_long_address(receiver),
            amount,
            block_num,
        }
    }
}

/// A utxo as seen by a transaction that spends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedUtxo {
    pub id: String,
    pub address: String,
    pub amount: i64,
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    pub index: i32,
}

#[derive(Debug, Default)]
pub struct BlockUtxoPlan {
    /// Outputs this block adds to the utxo set, keyed by utxo id. Outputs
    /// consumed by a later tx of the same block are already removed.
    pub new_utxos: HashMap<String, UtxoRow>,
    /// Inputs satisfied by an earlier tx of the same block.
    pub intra_block: Vec<ResolvedUtxo>,
    /// Inputs that must be resolved against the store.
    pub required_ids: Vec<String>,
}

/// Splits the inputs of a block's transactions into those satisfied inside
/// the block and those that must come from the store. A utxo produced and
/// spent within the same block never reaches either utxo table.
pub fn plan_block_utxos(block: &ChainBlock) -> BlockUtxoPlan {
    let mut new_utxos: HashMap<String, UtxoRow> = HashMap::new();
    for tx in &block.txs {
        for (index, output) in tx.outputs.iter().enumerate() {
            let row = UtxoRow::new(&output.address, output.value, &tx.id, index as i32, block.height);
            new_utxos.insert(row.utxo_id.clone(), row);
        }
    }

    let mut intra_block = Vec::new();
    let mut required_ids = Vec::new();
    for tx in &block.txs {
        for input in &tx.inputs {
            let id = input.utxo_id();
            match new_utxos.remove(&id) {
                Some(row) => intra_block.push(ResolvedUtxo {
                    id: row.utxo_id,
                    address: row.receiver,
                    amount: row.amount,
                    tx_hash: row.tx_hash,
                    index: row.tx_index,
                }),
                None => required_ids.push(id),
            }
        }
    }

    BlockUtxoPlan {
        new_utxos,
        intra_block,
        required_ids,
    }
}

impl Db {
    pub async fn connect(cfg: &DbConfig) -> Result<Self, ImporterError> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&cfg.host)
            .port(cfg.port)
            .user(&cfg.user)
            .password(&cfg.password)
            .dbname(&cfg.database)
            .connect_timeout(Duration::from_secs(cfg.timeout));
        let manager = Manager::from_config(
            pg,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(cfg.pool_size)
            .build()
            .map_err(|e| ImporterError::Config(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<(), ImporterError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }

    /// Tip of the committed chain; an empty store reports height 0 with no
    /// hash.
    pub async fn best_block(&self) -> Result<BestBlock, ImporterError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT block_hash, block_height, epoch, slot
                 FROM blocks ORDER BY block_height DESC LIMIT 1",
                &[],
            )
            .await?;
        Ok(match row {
            Some(row) => BestBlock {
                hash: Some(row.get(0)),
                height: row.get(1),
                epoch: row.get(2),
                slot: row.get(3),
            },
            None => BestBlock {
                hash: None,
                height: 0,
                epoch: 0,
                slot: None,
            },
        })
    }

    /// The genesis bootstrap ran iff any utxos or blocks exist.
    pub async fn is_genesis_loaded(&self) -> Result<bool, ImporterError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT (SELECT count(*) FROM utxos) + (SELECT count(*) FROM blocks)",
                &[],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    /// Flushes the block buffer and moves the best-block pointer in one
    /// transaction, so a crash can never leave the pointer ahead of the
    /// block index.
    pub async fn save_blocks_and_best(
        &self,
        blocks: &[BlockSummary],
        height: i64,
    ) -> Result<(), ImporterError> {
        let mut client = self.pool.get().await?;
        let t = client.transaction().await?;
        let stmt = t
            .prepare(
                "INSERT INTO blocks (block_hash, block_height, epoch, slot)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (block_hash) DO NOTHING",
            )
            .await?;
        for block in blocks {
            t.execute(
                &stmt,
                &[&block.block_hash, &block.block_height, &block.epoch, &block.slot],
            )
            .await?;
        }
        update_best_in(&*t, height).await?;
        t.commit().await?;
        Ok(())
    }

    pub async fn save_utxos(&self, utxos: &[UtxoRow]) -> Result<(), ImporterError> {
        info!("store utxos: {}", utxos.len());
        let mut client = self.pool.get().await?;
        let t = client.transaction().await?;
        save_utxos_in(&*t, utxos.iter()).await?;
        t.commit().await?;
        Ok(())
    }

    pub async fn get_utxos_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<ResolvedUtxo>, ImporterError> {
        let client = self.pool.get().await?;
        get_utxos_in(&**client, ids).await
    }

    /// `tx hash -> [(address, amount)]` over the stored output arrays, used
    /// by submit validation to find the outputs a tx spends.
    pub async fn get_outputs_for_tx_hashes(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<(String, i64)>>, ImporterError> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT hash, outputs_address, outputs_amount FROM txs WHERE hash = ANY($1)",
                &[&hashes],
            )
            .await?;
        let mut outputs = HashMap::new();
        for row in rows {
            let hash: String = row.get(0);
            let addresses: Vec<String> = row.get(1);
            let amounts: Vec<i64> = row.get(2);
            outputs.insert(hash, addresses.into_iter().zip(amounts).collect());
        }
        Ok(outputs)
    }

    pub async fn save_tx(
        &self,
        tx: &ChainTx,
        resolved_inputs: &[ResolvedUtxo],
    ) -> Result<(), ImporterError> {
        let mut client = self.pool.get().await?;
        let t = client.transaction().await?;
        save_tx_in(&*t, tx, resolved_inputs).await?;
        t.commit().await?;
        Ok(())
    }

    /// Submit-path persistence: resolve whatever inputs currently exist in
    /// the utxo set and record the tx as pending.
    pub async fn save_pending_tx(&self, tx: &ChainTx) -> Result<(), ImporterError> {
        let ids: Vec<String> = tx.inputs.iter().map(|input| input.utxo_id()).collect();
        let resolved = self.get_utxos_by_ids(&ids).await?;
        self.save_tx(tx, &resolved).await
    }

    /// Applies a block's transactions in one transaction: every tx with its
    /// inputs resolved (intra-block or stored), then the surviving new
    /// utxos, then the spent ones moved to backup.
    pub async fn store_block_txs(&self, block: &ChainBlock) -> Result<(), ImporterError> {
        info!("store txs for block height: {}", block.height);
        let plan = plan_block_utxos(block);
        debug!("store block txs required utxos: {:?}", plan.required_ids);

        let mut client = self.pool.get().await?;
        let t = client.transaction().await?;

        let fetched = get_utxos_in(&*t, &plan.required_ids).await?;
        let mut all_utxos: HashMap<String, ResolvedUtxo> = HashMap::new();
        for utxo in fetched.into_iter().chain(plan.intra_block.iter().cloned()) {
            all_utxos.insert(utxo.id.clone(), utxo);
        }

        for tx in &block.txs {
            let mut resolved = Vec::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                match all_utxos.get(&input.utxo_id()) {
                    Some(utxo) => resolved.push(utxo.clone()),
                    None => return Err(ImporterError::UtxoMissing(tx.id.clone())),
                }
            }
            save_tx_in(&*t, tx, &resolved).await?;
        }

        save_utxos_in(&*t, plan.new_utxos.values()).await?;
        remove_and_backup_utxos_in(&*t, &plan.required_ids, block.height).await?;
        t.commit().await?;
        Ok(())
    }

    /// Rewinds the store to `height` in one transaction: txs above it are
    /// demoted to pending, invalid utxos dropped, backed-up utxos that were
    /// live at `height` restored, blocks above it deleted and the best
    /// pointer moved.
    pub async fn rollback_to(&self, height: i64) -> Result<(), ImporterError> {
        let mut client = self.pool.get().await?;
        let t = client.transaction().await?;
        rollback_txs_in(&*t, height).await?;
        rollback_utxos_backup_in(&*t, height).await?;
        rollback_blocks_in(&*t, height).await?;
        update_best_in(&*t, height).await?;
        t.commit().await?;
        Ok(())
    }
}

async fn update_best_in<C: GenericClient>(client: &C, height: i64) -> Result<(), ImporterError> {
    client
        .execute("UPDATE bestblock SET best_block_num = $1", &[&height])
        .await?;
    Ok(())
}

/// Moves the given utxos into the backup table, stamping the height of the
/// block that spent them.
async fn remove_and_backup_utxos_in<C: GenericClient>(
    client: &C,
    ids: &[String],
    deleted_block_num: i64,
) -> Result<(), ImporterError> {
    if ids.is_empty() {
        return Ok(());
    }
    debug!("backup and remove utxos: {ids:?}");
    client
        .execute(BACKUP_UTXOS_SQL, &[&ids, &deleted_block_num])
        .await?;
    Ok(())
}

async fn get_utxos_in<C: GenericClient>(
    client: &C,
    ids: &[String],
) -> Result<Vec<ResolvedUtxo>, ImporterError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = client
        .query(
            "SELECT utxo_id, receiver, amount, tx_hash, tx_index FROM utxos WHERE utxo_id = ANY($1)",
            &[&ids],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| ResolvedUtxo {
            id: row.get(0),
            address: row.get(1),
            amount: row.get(2),
            tx_hash: row.get(3),
            index: row.get(4),
        })
        .collect())
}

async fn save_utxos_in<'a, C, I>(client: &C, utxos: I) -> Result<(), ImporterError>
where
    C: GenericClient,
    I: IntoIterator<Item = &'a UtxoRow>,
{
    let stmt = client
        .prepare(
            "INSERT INTO utxos (utxo_id, tx_hash, tx_index, receiver, amount, block_num)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (utxo_id) DO NOTHING",
        )
        .await?;
    for utxo in utxos {
        client
            .execute(
                &stmt,
                &[
                    &utxo.utxo_id,
                    &utxo.tx_hash,
                    &utxo.tx_index,
                    &utxo.receiver,
                    &utxo.amount,
                    &utxo.block_num,
                ],
            )
            .await?;
    }
    Ok(())
}

async fn save_tx_in<C: GenericClient>(
    client: &C,
    tx: &ChainTx,
    resolved_inputs: &[ResolvedUtxo],
) -> Result<(), ImporterError> {
    let inputs_json = serde_json::to_value(resolved_inputs)
        .map_err(|e| ImporterError::Decode(e.to_string()))?;
    let inputs_address: Vec<String> = resolved_inputs.iter().map(|u| u.address.clone()).collect();
    let inputs_amount: Vec<i64> = resolved_inputs.iter().map(|u| u.amount).collect();
    let outputs_address: Vec<String> = tx
        .outputs
        .iter()
        .map(|o| fix_long_address(&o.address))
        .collect();
    let outputs_amount: Vec<i64> = tx.outputs.iter().map(|o| o.value).collect();
    let state = tx.state.as_str();
    let now = Utc::now();

    client
        .execute(
            UPSERT_TX_SQL,
            &[
                &tx.id,
                &inputs_json,
                &inputs_address,
                &inputs_amount,
                &outputs_address,
                &outputs_amount,
                &tx.block_num,
                &tx.block_hash,
                &state,
                &tx.tx_body,
                &tx.ordinal,
                &tx.time,
                &now,
            ],
        )
        .await?;

    let mut addresses: BTreeSet<String> = inputs_address.into_iter().collect();
    addresses.extend(outputs_address);
    let stmt = client
        .prepare(
            "INSERT INTO tx_addresses (tx_hash, address) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .await?;
    for address in &addresses {
        client.execute(&stmt, &[&tx.id, address]).await?;
    }
    Ok(())
}

async fn rollback_txs_in<C: GenericClient>(client: &C, height: i64) -> Result<(), ImporterError> {
    info!("rollback transactions above block height: {height}");
    let pending = TxState::Pending.as_str();
    let now = Utc::now();
    client
        .execute(
            "UPDATE txs
             SET tx_state = $1, block_num = NULL, block_hash = NULL, time = NULL, last_update = $2
             WHERE block_num > $3",
            &[&pending, &now, &height],
        )
        .await?;
    Ok(())
}

async fn rollback_utxos_backup_in<C: GenericClient>(
    client: &C,
    height: i64,
) -> Result<(), ImporterError> {
    info!("delete invalid utxos above block height: {height}");
    client
        .execute("DELETE FROM utxos WHERE block_num > $1", &[&height])
        .await?;
    client
        .execute("DELETE FROM utxos_backup WHERE block_num > $1", &[&height])
        .await?;

    info!("rollback utxos backup to block height: {height}");
    client.execute(RESTORE_UTXOS_SQL, &[&height]).await?;
    Ok(())
}

async fn rollback_blocks_in<C: GenericClient>(client: &C, height: i64) -> Result<(), ImporterError> {
    info!("rollback block history to block height: {height}");
    client
        .execute("DELETE FROM blocks WHERE block_height > $1", &[&height])
        .await?;
    Ok(())
}
