//! Blockchain integration tests
//!
//! Exercises the ledger end to end through the public API: genesis, balances,
//! payments with change, the UTXO index and its rebuild.

use num_bigint::BigUint;
use powledger::core::{Block, Blockchain, ProofOfWork, Transaction, SUBSIDY};
use powledger::storage::TXOutputs;
use powledger::{BlockchainError, Wallet};
use tempfile::{tempdir, TempDir};

const DIFFICULTY: u32 = 6;

fn create_test_blockchain(genesis: &Wallet) -> (Blockchain, TempDir) {
    let temp_dir = tempdir().unwrap();
    let blockchain = Blockchain::create_blockchain_with_path(
        &genesis.get_address(),
        temp_dir.path().join("test_blockchain"),
        DIFFICULTY,
    )
    .unwrap();
    (blockchain, temp_dir)
}

fn total_unspent(blockchain: &Blockchain) -> u64 {
    blockchain
        .get_utxo_set()
        .entries()
        .unwrap()
        .values()
        .flat_map(|outs| outs.iter().map(|(_, out)| out.get_value()).collect::<Vec<_>>())
        .sum()
}

#[test]
fn test_proof_of_work_validation() {
    let wallet = Wallet::new().unwrap();
    let coinbase_tx = Transaction::new_coinbase_tx(&wallet.get_address()).unwrap();
    let block = Block::new_block(vec![0xAB; 32], &[coinbase_tx], 1, DIFFICULTY).unwrap();

    assert!(ProofOfWork::validate(&block));
    assert!(block.verify_merkle_root().unwrap());
    assert!(BigUint::from_bytes_be(block.get_hash()) < ProofOfWork::target_for(DIFFICULTY));
}

#[test]
fn test_genesis_recipient_holds_the_subsidy() {
    let alice = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);

    assert_eq!(blockchain.get_best_height().unwrap(), 0);
    assert_eq!(blockchain.get_balance(&alice.get_address()).unwrap(), 10);

    let genesis = blockchain.get_tip_block().unwrap();
    assert!(genesis.is_genesis());
    assert!(ProofOfWork::validate(&genesis));
}

#[test]
fn test_payment_with_change() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let miner = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);

    let tx = blockchain.new_transaction(&alice, &bob.get_address(), 4).unwrap();
    let outputs: Vec<(u64, Vec<u8>)> = tx
        .get_vout()
        .iter()
        .map(|out| (out.get_value(), out.get_pub_key_hash().to_vec()))
        .collect();
    assert_eq!(
        outputs,
        vec![(4, bob.get_pub_key_hash()), (6, alice.get_pub_key_hash())]
    );
    assert!(blockchain.verify_transaction(&tx).unwrap());

    let block = blockchain.mine_block(&[tx], &miner.get_address()).unwrap();
    assert_eq!(block.get_height(), 1);
    assert!(ProofOfWork::validate(&block));

    assert_eq!(blockchain.get_balance(&alice.get_address()).unwrap(), 6);
    assert_eq!(blockchain.get_balance(&bob.get_address()).unwrap(), 4);
    assert_eq!(blockchain.get_balance(&miner.get_address()).unwrap(), SUBSIDY);
}

#[test]
fn test_exact_payment_has_no_change() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);

    let tx = blockchain.new_transaction(&alice, &bob.get_address(), 10).unwrap();
    assert_eq!(tx.get_vout().len(), 1);
}

#[test]
fn test_insufficient_funds_leaves_ledger_untouched() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);
    let before = blockchain.get_utxo_set().entries().unwrap();
    let tip = blockchain.get_tip_hash();

    let err = blockchain
        .new_transaction(&alice, &bob.get_address(), 11)
        .unwrap_err();
    assert_eq!(
        err,
        BlockchainError::InsufficientFunds {
            required: 11,
            available: 10
        }
    );

    assert_eq!(blockchain.get_utxo_set().entries().unwrap(), before);
    assert_eq!(blockchain.get_tip_hash(), tip);

    let err = blockchain
        .new_transaction(&bob, &alice.get_address(), 1)
        .unwrap_err();
    assert!(matches!(err, BlockchainError::InsufficientFunds { available: 0, .. }));
}

#[test]
fn test_invalid_addresses_are_rejected() {
    let alice = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);

    assert!(matches!(
        blockchain.get_balance("not-an-address"),
        Err(BlockchainError::InvalidAddress(_))
    ));
    assert!(matches!(
        blockchain.new_transaction(&alice, "not-an-address", 1),
        Err(BlockchainError::InvalidAddress(_))
    ));
    assert!(matches!(
        blockchain.new_transaction(&alice, &alice.get_address(), 0),
        Err(BlockchainError::InvalidTransaction(_))
    ));
}

#[test]
fn test_reindex_matches_incremental_updates() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let carol = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);

    let tx = blockchain.new_transaction(&alice, &bob.get_address(), 3).unwrap();
    blockchain.mine_block(&[tx], &carol.get_address()).unwrap();

    let tx1 = blockchain.new_transaction(&bob, &carol.get_address(), 2).unwrap();
    let tx2 = blockchain.new_transaction(&alice, &carol.get_address(), 7).unwrap();
    blockchain.mine_block(&[tx1, tx2], &bob.get_address()).unwrap();

    let tx = blockchain.new_transaction(&carol, &alice.get_address(), 15).unwrap();
    blockchain.mine_block(&[tx], &alice.get_address()).unwrap();

    let incremental = blockchain.get_utxo_set().entries().unwrap();

    blockchain.reindex_utxo().unwrap();
    let rebuilt = blockchain.get_utxo_set().entries().unwrap();
    assert_eq!(incremental, rebuilt);

    blockchain.reindex_utxo().unwrap();
    assert_eq!(blockchain.get_utxo_set().entries().unwrap(), rebuilt);

    // Nothing minted twice, nothing lost: four subsidies are all that exist.
    assert_eq!(total_unspent(&blockchain), 4 * SUBSIDY);
    assert_eq!(
        blockchain.get_balance(&alice.get_address()).unwrap()
            + blockchain.get_balance(&bob.get_address()).unwrap()
            + blockchain.get_balance(&carol.get_address()).unwrap(),
        4 * SUBSIDY
    );
}

#[test]
fn test_spent_output_leaves_the_index() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);
    let genesis_coinbase = blockchain.get_tip_block().unwrap().get_transactions()[0].clone();

    let tx = blockchain.new_transaction(&alice, &bob.get_address(), 10).unwrap();
    blockchain.mine_block(&[tx.clone()], &bob.get_address()).unwrap();

    let utxo_set = blockchain.get_utxo_set();
    assert!(!utxo_set.is_unspent(genesis_coinbase.get_id(), 0).unwrap());
    assert!(utxo_set.is_unspent(tx.get_id(), 0).unwrap());

    // Replaying the same spend is refused.
    assert!(blockchain.mine_block(&[tx], &bob.get_address()).is_err());
    assert_eq!(blockchain.get_best_height().unwrap(), 1);
}

#[test]
fn test_serialization_identity() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);
    let tx = blockchain.new_transaction(&alice, &bob.get_address(), 4).unwrap();
    let block = blockchain.mine_block(&[tx.clone()], &bob.get_address()).unwrap();

    assert_eq!(Transaction::deserialize(&tx.serialize().unwrap()).unwrap(), tx);
    assert_eq!(Block::deserialize(&block.serialize().unwrap()).unwrap(), block);
    for outs in blockchain.get_utxo_set().entries().unwrap().values() {
        assert_eq!(&TXOutputs::deserialize(&outs.serialize().unwrap()).unwrap(), outs);
    }
}

#[test]
fn test_chain_survives_reopen() {
    let alice = Wallet::new().unwrap();
    let (blockchain, dir) = create_test_blockchain(&alice);
    blockchain.mine_block(&[], &alice.get_address()).unwrap();
    let tip = blockchain.get_tip_hash();
    drop(blockchain);

    let reopened =
        Blockchain::new_blockchain_with_path(dir.path().join("test_blockchain"), DIFFICULTY)
            .unwrap();
    assert_eq!(reopened.get_tip_hash(), tip);
    assert_eq!(reopened.get_best_height().unwrap(), 1);
    assert_eq!(reopened.get_balance(&alice.get_address()).unwrap(), 2 * SUBSIDY);
    assert!(reopened.validate_chain().is_ok());

    // Creating again over an existing store keeps the existing chain.
    drop(reopened);
    let again = Blockchain::create_blockchain_with_path(
        &Wallet::new().unwrap().get_address(),
        dir.path().join("test_blockchain"),
        DIFFICULTY,
    )
    .unwrap();
    assert_eq!(again.get_tip_hash(), tip);
}

#[test]
fn test_merkle_proofs_for_mined_block() {
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();
    let (blockchain, _dir) = create_test_blockchain(&alice);
    let tx = blockchain.new_transaction(&alice, &bob.get_address(), 4).unwrap();
    let block = blockchain.mine_block(&[tx], &bob.get_address()).unwrap();

    for index in 0..block.get_transactions().len() {
        let proof = block.generate_merkle_proof(index).unwrap();
        assert!(block.verify_merkle_proof(&proof));
    }
}
