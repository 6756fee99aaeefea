use tracing::info;

use crate::bridge::{BridgeClient, GenesisDocument};
use crate::chain::address::{generate_utxo_hash, redeem_key_to_address};
use crate::cli::NetworkConfig;
use crate::db::{Db, UtxoRow};
use crate::errors::ImporterError;

/// Builds the initial utxo set from the genesis document. Runs once; a
/// store holding any blocks or utxos counts as bootstrapped.
pub async fn load_if_needed(
    db: &Db,
    bridge: &BridgeClient,
    network: &NetworkConfig,
) -> Result<(), ImporterError> {
    if db.is_genesis_loaded().await? {
        info!("genesis has already been loaded");
        return Ok(());
    }
    info!("start to load genesis: {}", network.genesis);
    let document = bridge.genesis(&network.genesis).await?;

    let utxos = non_avvm_balances_to_utxos(&document)?;
    if !utxos.is_empty() {
        info!("storing {} non-avvm genesis utxos", utxos.len());
        db.save_utxos(&utxos).await?;
    }
    let utxos = avvm_distr_to_utxos(&document)?;
    if !utxos.is_empty() {
        info!("storing {} avvm genesis utxos", utxos.len());
        db.save_utxos(&utxos).await?;
    }
    info!("genesis data is loaded");
    Ok(())
}

/// `nonAvvmBalances` maps plain addresses to amounts; the synthetic tx
/// hash is Blake2b-256 over the decoded address.
pub fn non_avvm_balances_to_utxos(
    document: &GenesisDocument,
) -> Result<Vec<UtxoRow>, ImporterError> {
    document
        .non_avvm_balances
        .iter()
        .map(|(address, amount)| {
            let amount = parse_amount(amount)?;
            let utxo_hash = generate_utxo_hash(address)?;
            Ok(UtxoRow::new(address, amount, &utxo_hash, 0, 0))
        })
        .collect()
}

/// `avvmDistr` maps URL-safe-base64 public redeem keys to amounts; the
/// receiver is the derived Byron redeem address.
pub fn avvm_distr_to_utxos(document: &GenesisDocument) -> Result<Vec<UtxoRow>, ImporterError> {
    document
        .avvm_distr
        .iter()
        .map(|(redeem_key, amount)| {
            let amount = parse_amount(amount)?;
            let address = redeem_key_to_address(redeem_key)?;
            let utxo_hash = generate_utxo_hash(&address)?;
            Ok(UtxoRow::new(&address, amount, &utxo_hash, 0, 0))
        })
        .collect()
}

fn parse_amount(raw: &str) -> Result<i64, ImporterError> {
    raw.parse()
        .map_err(|_| ImporterError::Decode(format!("invalid genesis amount: {raw}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::chain::address::{deconstruct, generate_utxo_hash};

    fn document(non_avvm: &[(&str, &str)], avvm: &[(&str, &str)]) -> GenesisDocument {
        GenesisDocument {
            non_avvm_balances: non_avvm
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            avvm_distr: avvm
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn non_avvm_balance_becomes_a_genesis_utxo() {
        let doc = document(&[("addrA", "100")], &[]);
        let utxos = non_avvm_balances_to_utxos(&doc).unwrap();

        assert_eq!(utxos.len(), 1);
        let utxo = &utxos[0];
        assert_eq!(utxo.receiver, "addrA");
        assert_eq!(utxo.amount, 100);
        assert_eq!(utxo.block_num, 0);
        assert_eq!(utxo.tx_index, 0);
        let expected_hash = generate_utxo_hash("addrA").unwrap();
        assert_eq!(utxo.utxo_id, format!("{expected_hash}0"));
    }

    #[test]
    fn avvm_entry_derives_a_redeem_address() {
        use base64::Engine;
        let key = base64::engine::general_purpose::URL_SAFE.encode([0x33u8; 32]);
        let doc = document(&[], &[(key.as_str(), "2463071701000000")]);

        let utxos = avvm_distr_to_utxos(&doc).unwrap();
        assert_eq!(utxos.len(), 1);
        let utxo = &utxos[0];
        assert_eq!(utxo.amount, 2463071701000000);
        assert_eq!(utxo.block_num, 0);
        let parts = deconstruct(&utxo.receiver).unwrap();
        assert_eq!(parts.address_type, 2);
        assert_eq!(utxo.utxo_id, format!("{}0", generate_utxo_hash(&utxo.receiver).unwrap()));
    }

    #[test]
    fn malformed_amount_is_a_decode_error() {
        let doc = document(&[("addrA", "lots")], &[]);
        assert!(non_avvm_balances_to_utxos(&doc).is_err());
    }
}
