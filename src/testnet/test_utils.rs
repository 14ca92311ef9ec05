//! Test utilities for blockchain testing

use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::wallet::{Wallet, Wallets};
use tempfile::TempDir;

/// Low enough to mine a block in a few milliseconds.
pub const TEST_DIFFICULTY: u32 = 4;

/// Create a temporary directory for testing
pub fn create_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(|e| BlockchainError::Io(e.to_string()))
}

/// Create a test blockchain with temporary storage
pub fn create_test_blockchain() -> Result<(Blockchain, TempDir)> {
    create_test_blockchain_for("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa")
}

/// Test blockchain whose genesis coinbase pays `genesis_address`.
pub fn create_test_blockchain_for(genesis_address: &str) -> Result<(Blockchain, TempDir)> {
    let temp_dir = create_temp_dir()?;
    let blockchain = Blockchain::create_blockchain_with_path(
        genesis_address,
        temp_dir.path().join("test_blockchain"),
        TEST_DIFFICULTY,
    )?;
    Ok((blockchain, temp_dir))
}

/// Independent stores that all start from the same genesis block.
pub fn create_test_network(
    node_count: usize,
    genesis_address: &str,
) -> Result<Vec<(Blockchain, TempDir)>> {
    let coinbase_tx = Transaction::new_coinbase_tx(genesis_address)?;
    let genesis = Block::generate_genesis_block(&coinbase_tx, TEST_DIFFICULTY)?;

    let mut nodes = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let temp_dir = create_temp_dir()?;
        let blockchain = Blockchain::create_with_genesis_block(
            &genesis,
            temp_dir.path().join(format!("test_node_{i}")),
            TEST_DIFFICULTY,
        )?;
        nodes.push((blockchain, temp_dir));
    }
    Ok(nodes)
}

/// Create test wallets for testing
pub fn create_test_wallets(count: usize) -> Result<(Wallets, Vec<String>, TempDir)> {
    let temp_dir = create_temp_dir()?;
    let mut wallets = Wallets::load(temp_dir.path().join("wallet.dat"))?;
    let addresses = (0..count)
        .map(|_| wallets.create_wallet())
        .collect::<Result<Vec<_>>>()?;
    Ok((wallets, addresses, temp_dir))
}

/// Mines `count` empty blocks paying `miner`.
pub fn extend_chain(blockchain: &Blockchain, count: usize, miner: &Wallet) -> Result<Vec<Block>> {
    (0..count)
        .map(|_| blockchain.mine_block(&[], &miner.get_address()))
        .collect()
}

/// Validate blockchain integrity
pub fn validate_blockchain_integrity(blockchain: &Blockchain) -> Result<bool> {
    match blockchain.validate_chain() {
        Ok(()) => Ok(true),
        Err(e) if e.is_validation() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_blockchain() {
        let (blockchain, _temp_dir) = create_test_blockchain().unwrap();
        assert_eq!(blockchain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_create_test_network_shares_genesis() {
        let wallet = Wallet::new().unwrap();
        let nodes = create_test_network(3, &wallet.get_address()).unwrap();
        assert_eq!(nodes.len(), 3);

        let genesis = nodes[0].0.get_tip_hash();
        for (blockchain, _) in &nodes {
            assert_eq!(blockchain.get_best_height().unwrap(), 0);
            assert_eq!(blockchain.get_tip_hash(), genesis);
            assert_eq!(blockchain.get_balance(&wallet.get_address()).unwrap(), 10);
        }
    }

    #[test]
    fn test_create_test_wallets() {
        let (_wallets, addresses, _dir) = create_test_wallets(5).unwrap();
        assert_eq!(addresses.len(), 5);

        for i in 0..addresses.len() {
            for j in i + 1..addresses.len() {
                assert_ne!(addresses[i], addresses[j]);
            }
        }
    }

    #[test]
    fn test_validate_blockchain_integrity() {
        let wallet = Wallet::new().unwrap();
        let (blockchain, _temp_dir) = create_test_blockchain_for(&wallet.get_address()).unwrap();
        extend_chain(&blockchain, 3, &wallet).unwrap();
        assert!(validate_blockchain_integrity(&blockchain).unwrap());
    }
}
