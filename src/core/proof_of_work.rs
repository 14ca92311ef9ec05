use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::BigUint;

/// Default number of leading zero bits a block hash must have.
pub const TARGET_BITS: u32 = 20;

const MAX_NONCE: i64 = i64::MAX;

// How many nonces are tried between two polls of the cancellation predicate.
const CANCEL_POLL_INTERVAL: i64 = 1 << 12;

pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: BigUint,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block) -> ProofOfWork<'a> {
        ProofOfWork {
            block,
            target: Self::target_for(block.get_difficulty()),
        }
    }

    /// `2^(256 - difficulty)`; a hash is valid when strictly below it.
    pub fn target_for(difficulty: u32) -> BigUint {
        BigUint::from(1u8) << (256 - difficulty.min(256)) as usize
    }

    /// Recomputes the digest for the stored nonce and checks it against both
    /// the stored hash and the target. Never re-solves the puzzle.
    pub fn validate(block: &Block) -> bool {
        let difficulty = block.get_difficulty();
        if difficulty == 0 || difficulty > 255 {
            return false;
        }
        let commitment = match block.compute_merkle_root() {
            Ok(root) if root == block.get_merkle_root() => root,
            _ => return false,
        };

        let pow = ProofOfWork::new_proof_of_work(block);
        let hash = sha256_digest(&pow.prepare_data(&commitment, block.get_nonce()));
        hash == block.get_hash() && pow.meets_target(&hash)
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigUint::from_bytes_be(hash) < self.target
    }

    /// previous hash ++ transaction commitment ++ timestamp ++ difficulty ++ nonce,
    /// integers as 8-byte big-endian.
    fn prepare_data(&self, commitment: &[u8], nonce: i64) -> Vec<u8> {
        let pre_block_hash = self.block.get_pre_block_hash();
        let mut data_bytes = Vec::with_capacity(pre_block_hash.len() + commitment.len() + 24);
        data_bytes.extend_from_slice(pre_block_hash);
        data_bytes.extend_from_slice(commitment);
        data_bytes.extend(self.block.get_timestamp().to_be_bytes());
        data_bytes.extend(i64::from(self.block.get_difficulty()).to_be_bytes());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    /// Searches for the smallest nonce that satisfies the target.
    pub fn run(&self) -> Result<(i64, Vec<u8>)> {
        self.run_until(|| false)
    }

    /// Like [`run`](Self::run), but gives up with `MiningCancelled` once
    /// `cancelled` returns true.
    pub fn run_until<F: Fn() -> bool>(&self, cancelled: F) -> Result<(i64, Vec<u8>)> {
        let commitment = self.block.get_merkle_root();
        debug!(
            "Mining block at height {} (difficulty {})",
            self.block.get_height(),
            self.block.get_difficulty()
        );

        let mut nonce = 0;
        while nonce < MAX_NONCE {
            if nonce % CANCEL_POLL_INTERVAL == 0 && cancelled() {
                info!("Mining at height {} cancelled", self.block.get_height());
                return Err(BlockchainError::MiningCancelled);
            }

            let hash = sha256_digest(&self.prepare_data(commitment, nonce));
            if self.meets_target(&hash) {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                return Ok((nonce, hash));
            }
            nonce += 1;
        }

        Err(BlockchainError::Config(format!(
            "Nonce space exhausted at difficulty {}",
            self.block.get_difficulty()
        )))
    }
}
