use crate::core::merkle::{merkle_root, MerkleProof, MerkleTree};
use crate::core::{ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

/// A mined unit of the chain. Immutable once its nonce and hash are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    pre_block_hash: Vec<u8>,
    hash: Vec<u8>,
    transactions: Vec<Transaction>,
    nonce: i64,
    height: u64,
    difficulty: u32,
    /// Merkle root over the transaction ids; the commitment proof-of-work hashes.
    merkle_root: Vec<u8>,
}

impl Block {
    /// A block with every field fixed except nonce and hash.
    pub fn candidate(
        pre_block_hash: Vec<u8>,
        transactions: &[Transaction],
        height: u64,
        difficulty: u32,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        Ok(Block {
            timestamp: current_timestamp()?,
            pre_block_hash,
            hash: vec![],
            transactions: transactions.to_vec(),
            nonce: 0,
            height,
            difficulty,
            merkle_root: Self::merkle_root_of(transactions)?,
        })
    }

    /// Mines a candidate to completion.
    pub fn new_block(
        pre_block_hash: Vec<u8>,
        transactions: &[Transaction],
        height: u64,
        difficulty: u32,
    ) -> Result<Block> {
        Self::candidate(pre_block_hash, transactions, height, difficulty)?.mine()
    }

    pub fn generate_genesis_block(coinbase: &Transaction, difficulty: u32) -> Result<Block> {
        Self::new_block(vec![], std::slice::from_ref(coinbase), 0, difficulty)
    }

    pub fn mine(self) -> Result<Block> {
        self.mine_until(|| false)
    }

    /// Solves the proof-of-work puzzle, polling `cancelled` while searching.
    pub fn mine_until<F: Fn() -> bool>(mut self, cancelled: F) -> Result<Block> {
        let (nonce, hash) = ProofOfWork::new_proof_of_work(&self).run_until(cancelled)?;
        self.nonce = nonce;
        self.hash = hash;
        info!(
            "Mined block {} at height {} (nonce {nonce})",
            self.hash_hex(),
            self.height
        );
        Ok(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_merkle_root(&self) -> &[u8] {
        &self.merkle_root
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.pre_block_hash.is_empty()
    }

    fn merkle_root_of(transactions: &[Transaction]) -> Result<Vec<u8>> {
        let ids: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.get_id().to_vec()).collect();
        merkle_root(&ids)
    }

    pub fn compute_merkle_root(&self) -> Result<Vec<u8>> {
        Self::merkle_root_of(&self.transactions)
    }

    pub fn verify_merkle_root(&self) -> Result<bool> {
        Ok(self.compute_merkle_root()? == self.merkle_root)
    }

    /// Inclusion proof for the transaction at `transaction_index`.
    pub fn generate_merkle_proof(&self, transaction_index: usize) -> Result<MerkleProof> {
        let tx = self.transactions.get(transaction_index).ok_or_else(|| {
            BlockchainError::InvalidBlock(format!(
                "Transaction index {transaction_index} out of bounds"
            ))
        })?;
        let ids: Vec<Vec<u8>> = self
            .transactions
            .iter()
            .map(|tx| tx.get_id().to_vec())
            .collect();
        MerkleTree::new(&ids)?.proof(transaction_index, tx.get_id())
    }

    pub fn verify_merkle_proof(&self, proof: &MerkleProof) -> bool {
        proof.merkle_root == self.merkle_root && proof.verify()
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_difficulty(&self, difficulty: u32) -> Block {
        Block {
            difficulty,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_pre_block_hash(&self, pre_block_hash: Vec<u8>) -> Block {
        Block {
            pre_block_hash,
            ..self.clone()
        }
    }
}
