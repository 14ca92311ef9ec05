// The ledger: a sled database holding the block store (hash -> block plus the
// tip key) and the UTXO index. Every append touches both trees inside one
// sled transaction, and all appends go through a single writer lock.

use crate::config::Config;
use crate::core::transaction::PrevTransactions;
use crate::core::{Block, ProofOfWork, TXInput, TXOutput, Transaction, SUBSIDY};
use crate::error::{BlockchainError, Result};
use crate::storage::{UTXOSet, UTXO_TREE};
use crate::wallet::{decode_address, Wallet};
use data_encoding::HEXLOWER;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use sled::transaction::ConflictableTransactionResult;
use sled::{Db, Transactional, Tree};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const TIP_BLOCK_HASH_KEY: &str = "tip_block_hash";
const BLOCKS_TREE: &str = "blocks";

#[derive(Clone)]
pub struct Blockchain {
    db: Db,
    db_path: PathBuf,
    blocks: Tree,
    utxo_set: UTXOSet,
    tip_hash: Arc<RwLock<Vec<u8>>>,
    difficulty: u32,
    // Serialises every append (mined or received).
    writer: Arc<Mutex<()>>,
    // Bumped on every append; an in-flight mining round gives up when it moves.
    tip_epoch: Arc<AtomicU64>,
    mining_cancelled: Arc<AtomicBool>,
}

impl Blockchain {
    /// Creates (or reopens) the chain in this node's database directory.
    pub fn create_blockchain(genesis_address: &str, config: &Config) -> Result<Blockchain> {
        Self::create_blockchain_with_path(genesis_address, config.db_path(), config.difficulty)
    }

    /// Opens the existing chain in this node's database directory.
    pub fn new_blockchain(config: &Config) -> Result<Blockchain> {
        Self::new_blockchain_with_path(config.db_path(), config.difficulty)
    }

    /// Opens the chain at `db_path`, minting a genesis block paying
    /// `genesis_address` if the store is empty.
    pub fn create_blockchain_with_path(
        genesis_address: &str,
        db_path: impl AsRef<Path>,
        difficulty: u32,
    ) -> Result<Blockchain> {
        let (db, blocks, utxo_tree) = Self::open_trees(db_path.as_ref())?;

        let tip_hash = match blocks.get(TIP_BLOCK_HASH_KEY)? {
            Some(tip) => {
                info!("Found existing blockchain at {}", db_path.as_ref().display());
                tip.to_vec()
            }
            None => {
                info!("Creating genesis block for address: {genesis_address}");
                let coinbase_tx = Transaction::new_coinbase_tx(genesis_address)?;
                let block = Block::generate_genesis_block(&coinbase_tx, difficulty)?;
                Self::persist_genesis(&blocks, &block)?;
                block.get_hash().to_vec()
            }
        };

        let blockchain = Self::from_parts(db, db_path.as_ref(), blocks, utxo_tree, tip_hash, difficulty);
        blockchain.reindex_utxo()?;
        Ok(blockchain)
    }

    /// Starts a new store from a genesis block mined elsewhere, so this node
    /// can join an existing network.
    pub fn create_with_genesis_block(
        genesis: &Block,
        db_path: impl AsRef<Path>,
        difficulty: u32,
    ) -> Result<Blockchain> {
        if !genesis.is_genesis() {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {} is not a genesis block",
                genesis.hash_hex()
            )));
        }
        check_block_shape(genesis, difficulty)?;

        let (db, blocks, utxo_tree) = Self::open_trees(db_path.as_ref())?;
        if blocks.contains_key(TIP_BLOCK_HASH_KEY)? {
            return Err(BlockchainError::Database(format!(
                "A blockchain already exists at {}",
                db_path.as_ref().display()
            )));
        }
        Self::persist_genesis(&blocks, genesis)?;

        let blockchain = Self::from_parts(
            db,
            db_path.as_ref(),
            blocks,
            utxo_tree,
            genesis.get_hash().to_vec(),
            difficulty,
        );
        blockchain.reindex_utxo()?;
        Ok(blockchain)
    }

    fn persist_genesis(blocks: &Tree, block: &Block) -> Result<()> {
        let block_data = block.serialize()?;
        blocks.transaction(|tx_db| -> ConflictableTransactionResult<(), BlockchainError> {
            tx_db.insert(block.get_hash(), block_data.as_slice())?;
            tx_db.insert(TIP_BLOCK_HASH_KEY, block.get_hash())?;
            Ok(())
        })?;
        Ok(())
    }

    /// Reopens an existing chain by reading its persisted tip.
    pub fn new_blockchain_with_path(db_path: impl AsRef<Path>, difficulty: u32) -> Result<Blockchain> {
        let (db, blocks, utxo_tree) = Self::open_trees(db_path.as_ref())?;
        let tip_hash = blocks.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
            BlockchainError::Database(
                "No existing blockchain found. Create one first.".to_string(),
            )
        })?;

        Ok(Self::from_parts(
            db,
            db_path.as_ref(),
            blocks,
            utxo_tree,
            tip_hash.to_vec(),
            difficulty,
        ))
    }

    fn open_trees(db_path: &Path) -> Result<(Db, Tree, Tree)> {
        let db = sled::open(db_path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let utxo_tree = db.open_tree(UTXO_TREE)?;
        Ok((db, blocks, utxo_tree))
    }

    fn from_parts(
        db: Db,
        db_path: &Path,
        blocks: Tree,
        utxo_tree: Tree,
        tip_hash: Vec<u8>,
        difficulty: u32,
    ) -> Blockchain {
        Blockchain {
            db,
            db_path: db_path.to_path_buf(),
            blocks,
            utxo_set: UTXOSet::new(utxo_tree),
            tip_hash: Arc::new(RwLock::new(tip_hash)),
            difficulty,
            writer: Arc::new(Mutex::new(())),
            tip_epoch: Arc::new(AtomicU64::new(0)),
            mining_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_utxo_set(&self) -> &UTXOSet {
        &self.utxo_set
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash.read().clone()
    }

    pub fn get_tip_block(&self) -> Result<Block> {
        let tip_hash = self.get_tip_hash();
        self.get_block(&tip_hash)?.ok_or_else(|| {
            BlockchainError::Database(format!("Tip block {} not found", HEXLOWER.encode(&tip_hash)))
        })
    }

    pub fn get_best_height(&self) -> Result<u64> {
        Ok(self.get_tip_block()?.get_height())
    }

    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.blocks.clone())
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks.get(block_hash)? {
            Some(block_bytes) => Ok(Some(Block::deserialize(block_bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn block_exists(&self, block_hash: &[u8]) -> Result<bool> {
        Ok(self.blocks.contains_key(block_hash)?)
    }

    /// Up to `limit` block hashes, walked from the tip toward genesis.
    pub fn get_block_hashes(&self, limit: usize) -> Result<Vec<Vec<u8>>> {
        let mut hashes = vec![];
        for block in self.iterator().take(limit) {
            hashes.push(block?.get_hash().to_vec());
        }
        Ok(hashes)
    }

    /// Linear scan from the tip.
    pub fn find_transaction(&self, txid: &[u8]) -> Result<Option<Transaction>> {
        for block in self.iterator() {
            let block = block?;
            if let Some(tx) = block.get_transactions().iter().find(|tx| tx.get_id() == txid) {
                return Ok(Some(tx.clone()));
            }
        }
        Ok(None)
    }

    /// Resolves every input's previous transaction that exists on chain.
    /// Unresolved inputs are left out so sign/verify report them.
    pub fn prev_transactions(&self, tx: &Transaction) -> Result<PrevTransactions> {
        let mut prev_txs = PrevTransactions::new();
        if tx.is_coinbase() {
            return Ok(prev_txs);
        }
        for vin in tx.get_vin() {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            if prev_txs.contains_key(&txid_hex) {
                continue;
            }
            if let Some(prev_tx) = self.find_transaction(vin.get_txid())? {
                prev_txs.insert(txid_hex, prev_tx);
            }
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        let prev_txs = self.prev_transactions(tx)?;
        tx.sign(pkcs8, &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        let prev_txs = self.prev_transactions(tx)?;
        tx.verify(&prev_txs)
    }

    pub fn get_balance(&self, address: &str) -> Result<u64> {
        let pub_key_hash = decode_address(address)?;
        Ok(self
            .utxo_set
            .find_utxo(&pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    /// Builds and signs a payment of `amount` from `from` to `to`, with change
    /// back to `from` when the selected outputs overpay.
    pub fn new_transaction(&self, from: &Wallet, to: &str, amount: u64) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::InvalidTransaction(
                "Amount must be greater than zero".to_string(),
            ));
        }
        let payment = TXOutput::new(amount, to)?;

        let pub_key_hash = from.get_pub_key_hash();
        let (accumulated, valid_outputs) =
            self.utxo_set.find_spendable_outputs(&pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let inputs = valid_outputs
            .iter()
            .map(|(txid, idx)| TXInput::new(txid, *idx, from.get_public_key()))
            .collect();
        let mut outputs = vec![payment];
        if accumulated > amount {
            outputs.push(TXOutput::new_locked(accumulated - amount, &pub_key_hash));
        }

        let mut tx = Transaction::new_unsigned(inputs, outputs)?;
        self.sign_transaction(&mut tx, from.get_pkcs8())?;
        tx.refresh_id()?;
        Ok(tx)
    }

    /// Checks a single non-coinbase transaction against the current chain.
    pub fn check_transaction(&self, tx: &Transaction) -> Result<()> {
        self.check_spends(std::slice::from_ref(tx))
    }

    /// Keeps each candidate that is still valid next to the ones kept before
    /// it, in order. Invalid or conflicting transactions are skipped.
    pub fn select_mineable(&self, candidates: &[Transaction]) -> Vec<Transaction> {
        let mut selected: Vec<Transaction> = vec![];
        for tx in candidates {
            selected.push(tx.clone());
            if let Err(e) = self.check_spends(&selected) {
                warn!("Skipping transaction {}: {e}", tx.id_hex());
                selected.pop();
            }
        }
        selected
    }

    // Signatures, value balance, unspent inputs and no output spent twice
    // across `txs`. Coinbase transactions are not accepted here.
    fn check_spends(&self, txs: &[Transaction]) -> Result<()> {
        let mut spent_outputs: HashSet<(Vec<u8>, i64)> = HashSet::new();
        let mut seen_ids: HashSet<Vec<u8>> = HashSet::new();

        for tx in txs {
            if tx.is_coinbase() {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "Unexpected coinbase transaction {}",
                    tx.id_hex()
                )));
            }
            self.check_txid(tx, &mut seen_ids)?;
            if tx.get_vin().is_empty() {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "Transaction {} has no inputs",
                    tx.id_hex()
                )));
            }

            let prev_txs = self.prev_transactions(tx)?;
            if !tx.verify(&prev_txs)? {
                return Err(BlockchainError::InvalidSignature(tx.id_hex()));
            }

            let mut input_value = 0u64;
            for input in tx.get_vin() {
                let output_reference = (input.get_txid().to_vec(), input.get_vout());
                if !spent_outputs.insert(output_reference) {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "Double spend of {}:{} in transaction {}",
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout(),
                        tx.id_hex()
                    )));
                }

                let spent = input
                    .output_index()
                    .map(|idx| self.utxo_set.get_output(input.get_txid(), idx))
                    .transpose()?
                    .flatten()
                    .ok_or_else(|| {
                        BlockchainError::InvalidTransaction(format!(
                            "Input {}:{} is already spent",
                            HEXLOWER.encode(input.get_txid()),
                            input.get_vout()
                        ))
                    })?;
                input_value = input_value.saturating_add(spent.get_value());
            }

            if tx.get_output_value()? > input_value {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "Transaction {} spends more than its inputs",
                    tx.id_hex()
                )));
            }
        }
        Ok(())
    }

    // The id must be the content digest, unique among `seen_ids` and not
    // already a key of the UTXO index.
    fn check_txid(&self, tx: &Transaction, seen_ids: &mut HashSet<Vec<u8>>) -> Result<()> {
        if tx.get_id() != tx.hash()?.as_slice() {
            return Err(BlockchainError::InvalidTransaction(format!(
                "Transaction id {} does not match its contents",
                tx.id_hex()
            )));
        }
        if !seen_ids.insert(tx.get_id().to_vec()) {
            return Err(BlockchainError::InvalidTransaction(format!(
                "Duplicate transaction {}",
                tx.id_hex()
            )));
        }
        if self.utxo_set.has_entry(tx.get_id())? {
            return Err(BlockchainError::InvalidTransaction(format!(
                "Transaction {} is already in the UTXO set",
                tx.id_hex()
            )));
        }
        Ok(())
    }

    /// Mines `transactions` plus a coinbase paying `miner_address` on top of
    /// the current tip. Any invalid candidate fails the whole attempt. If the
    /// tip moves while mining, the attempt ends with `MiningCancelled` or
    /// `StaleTip` and nothing is written.
    pub fn mine_block(&self, transactions: &[Transaction], miner_address: &str) -> Result<Block> {
        self.check_spends(transactions)?;

        let mut block_transactions = transactions.to_vec();
        block_transactions.push(Transaction::new_coinbase_tx(miner_address)?);

        let (tip_hash, next_height, epoch) = {
            let _guard = self.writer.lock();
            let tip = self.get_tip_block()?;
            (
                tip.get_hash().to_vec(),
                tip.get_height() + 1,
                self.tip_epoch.load(Ordering::SeqCst),
            )
        };
        self.mining_cancelled.store(false, Ordering::SeqCst);

        info!(
            "Mining block at height {next_height} with {} transactions (difficulty: {})",
            block_transactions.len(),
            self.difficulty
        );
        let block = Block::candidate(tip_hash.clone(), &block_transactions, next_height, self.difficulty)?
            .mine_until(|| {
                self.mining_cancelled.load(Ordering::SeqCst)
                    || self.tip_epoch.load(Ordering::SeqCst) != epoch
            })?;

        let _guard = self.writer.lock();
        let current_tip = self.get_tip_hash();
        if current_tip != tip_hash {
            return Err(BlockchainError::StaleTip {
                expected: HEXLOWER.encode(&tip_hash),
                found: HEXLOWER.encode(&current_tip),
            });
        }
        self.commit_block(&block)?;
        info!("Successfully mined block: {}", block.hash_hex());
        Ok(block)
    }

    /// Stops an in-flight `mine_block`, which then returns `MiningCancelled`.
    pub fn cancel_mining(&self) {
        self.mining_cancelled.store(true, Ordering::SeqCst);
    }

    /// Checks that a peer-supplied block is the valid successor of the tip.
    pub fn validate_next_block(&self, block: &Block) -> Result<()> {
        let tip = self.get_tip_block()?;
        if block.get_height() != tip.get_height() + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "Expected height {}, got {}",
                tip.get_height() + 1,
                block.get_height()
            )));
        }
        if block.get_pre_block_hash() != tip.get_hash() {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {} does not extend tip {}",
                block.hash_hex(),
                tip.hash_hex()
            )));
        }
        check_block_shape(block, self.difficulty)?;

        let (coinbase, spends) = block
            .get_transactions()
            .split_last()
            .ok_or_else(|| BlockchainError::InvalidBlock("Block has no transactions".to_string()))?;
        if !coinbase.is_coinbase() {
            return Err(BlockchainError::InvalidBlock(
                "Last transaction must be the coinbase".to_string(),
            ));
        }
        if coinbase.get_output_value()? > SUBSIDY {
            return Err(BlockchainError::InvalidBlock(format!(
                "Coinbase pays more than the subsidy of {SUBSIDY}"
            )));
        }
        self.check_spends(spends)
            .and_then(|()| {
                let mut seen_ids: HashSet<Vec<u8>> =
                    spends.iter().map(|tx| tx.get_id().to_vec()).collect();
                self.check_txid(coinbase, &mut seen_ids)
            })
            .map_err(|e| BlockchainError::InvalidBlock(format!("Block {}: {e}", block.hash_hex())))
    }

    /// Appends a block that was mined elsewhere. The caller validates it
    /// first; this only re-checks that it still extends the tip.
    pub fn add_block(&self, block: &Block) -> Result<()> {
        let _guard = self.writer.lock();
        if self.block_exists(block.get_hash())? {
            return Ok(());
        }

        let tip_hash = self.get_tip_hash();
        if block.get_pre_block_hash() != tip_hash.as_slice() {
            return Err(BlockchainError::StaleTip {
                expected: HEXLOWER.encode(block.get_pre_block_hash()),
                found: HEXLOWER.encode(&tip_hash),
            });
        }
        self.commit_block(block)?;
        info!("Added block {} at height {}", block.hash_hex(), block.get_height());
        Ok(())
    }

    // Block, tip and UTXO changes land together or not at all. Caller holds
    // the writer lock.
    fn commit_block(&self, block: &Block) -> Result<()> {
        let block_data = block.serialize()?;
        (&self.blocks, self.utxo_set.get_tree()).transaction(
            |(blocks, utxo)| -> ConflictableTransactionResult<(), BlockchainError> {
                blocks.insert(block.get_hash(), block_data.as_slice())?;
                blocks.insert(TIP_BLOCK_HASH_KEY, block.get_hash())?;
                UTXOSet::apply_block(utxo, block)?;
                Ok(())
            },
        )?;

        *self.tip_hash.write() = block.get_hash().to_vec();
        self.tip_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn reindex_utxo(&self) -> Result<()> {
        let _guard = self.writer.lock();
        self.utxo_set.reindex(self.iterator())
    }

    /// Walks the whole chain checking linkage, heights, Merkle roots and
    /// proof of work.
    pub fn validate_chain(&self) -> Result<()> {
        let mut expected: Option<(Vec<u8>, u64)> = None;
        for block in self.iterator() {
            let block = block?;
            if let Some((hash, height)) = &expected {
                if block.get_hash() != hash.as_slice() || block.get_height() != *height {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "Broken link at block {}",
                        block.hash_hex()
                    )));
                }
            }
            check_block_shape(&block, self.difficulty)?;

            if block.get_height() == 0 {
                if !block.is_genesis() {
                    return Err(BlockchainError::InvalidBlock(
                        "Genesis block has a previous hash".to_string(),
                    ));
                }
                return Ok(());
            }
            expected = Some((block.get_pre_block_hash().to_vec(), block.get_height() - 1));
        }
        Err(BlockchainError::InvalidBlock(
            "Chain does not reach a genesis block".to_string(),
        ))
    }
}

// Difficulty, Merkle commitment and proof of work.
fn check_block_shape(block: &Block, difficulty: u32) -> Result<()> {
    if block.get_difficulty() != difficulty {
        return Err(BlockchainError::InvalidBlock(format!(
            "Difficulty {} does not match {difficulty}",
            block.get_difficulty()
        )));
    }
    if !block.verify_merkle_root()? {
        return Err(BlockchainError::InvalidBlock(format!(
            "Merkle root mismatch in block {}",
            block.hash_hex()
        )));
    }
    if !ProofOfWork::validate(block) {
        return Err(BlockchainError::InvalidBlock(format!(
            "Invalid proof of work for block {}",
            block.hash_hex()
        )));
    }
    Ok(())
}

/// Walks blocks from a starting hash back to genesis.
pub struct BlockchainIterator {
    blocks: Tree,
    current_hash: Vec<u8>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, blocks: Tree) -> BlockchainIterator {
        BlockchainIterator {
            blocks,
            current_hash: tip_hash,
        }
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }
        let current_hash = std::mem::take(&mut self.current_hash);

        let block = match self.blocks.get(&current_hash) {
            Ok(Some(data)) => Block::deserialize(data.as_ref()),
            Ok(None) => Err(BlockchainError::Database(format!(
                "Block {} missing from store",
                HEXLOWER.encode(&current_hash)
            ))),
            Err(e) => Err(e.into()),
        };
        if let Ok(block) = &block {
            self.current_hash = block.get_pre_block_hash().to_vec();
        }
        Some(block)
    }
}
