use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use serde::{Deserialize, Serialize};

/// Binary hash tree over a sequence of transaction ids.
///
/// Leaves are `sha256(id)`. Every level with an odd number of nodes
/// duplicates its last node before pairing, and each parent is
/// `sha256(left ++ right)`. The tree is built bottom-up level by level,
/// so there is no recursion depth to worry about for large blocks.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` holds the (padded) leaves, the last level holds the root.
    levels: Vec<Vec<Vec<u8>>>,
    leaf_count: usize,
}

/// Inclusion proof for one leaf of a [`MerkleTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub transaction_id: Vec<u8>,
    pub merkle_root: Vec<u8>,
    pub proof_path: Vec<ProofElement>,
    pub transaction_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofElement {
    pub hash: Vec<u8>,
    /// true if the sibling sits on the right of the running hash
    pub is_right: bool,
}

impl MerkleTree {
    pub fn new(ids: &[Vec<u8>]) -> Result<Self> {
        if ids.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Cannot build a Merkle tree from an empty id list".to_string(),
            ));
        }

        let mut leaves: Vec<Vec<u8>> = ids.iter().map(|id| sha256_digest(id)).collect();
        pad_to_even(&mut leaves);

        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let mut next: Vec<Vec<u8>> = current
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            if next.len() > 1 {
                pad_to_even(&mut next);
            }
            levels.push(next);
        }

        Ok(MerkleTree {
            levels,
            leaf_count: ids.len(),
        })
    }

    pub fn root(&self) -> Vec<u8> {
        self.levels[self.levels.len() - 1][0].clone()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Builds the sibling path from the leaf at `index` up to the root.
    pub fn proof(&self, index: usize, transaction_id: &[u8]) -> Result<MerkleProof> {
        if index >= self.leaf_count {
            return Err(BlockchainError::InvalidBlock(format!(
                "Transaction index {index} out of bounds ({} leaves)",
                self.leaf_count
            )));
        }
        if sha256_digest(transaction_id) != self.levels[0][index] {
            return Err(BlockchainError::InvalidBlock(format!(
                "Transaction id does not match leaf {index}"
            )));
        }

        let mut proof_path = Vec::with_capacity(self.levels.len() - 1);
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let is_right = position % 2 == 0;
            let sibling = if is_right { position + 1 } else { position - 1 };
            proof_path.push(ProofElement {
                hash: level[sibling].clone(),
                is_right,
            });
            position /= 2;
        }

        Ok(MerkleProof {
            transaction_id: transaction_id.to_vec(),
            merkle_root: self.root(),
            proof_path,
            transaction_index: index,
        })
    }
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        let mut current = sha256_digest(&self.transaction_id);
        for element in &self.proof_path {
            current = if element.is_right {
                hash_pair(&current, &element.hash)
            } else {
                hash_pair(&element.hash, &current)
            };
        }
        current == self.merkle_root
    }
}

/// Merkle root of `ids`, the transaction-set commitment of a block.
pub fn merkle_root(ids: &[Vec<u8>]) -> Result<Vec<u8>> {
    Ok(MerkleTree::new(ids)?.root())
}

fn pad_to_even(nodes: &mut Vec<Vec<u8>>) {
    if nodes.len() % 2 != 0 {
        let last = nodes[nodes.len() - 1].clone();
        nodes.push(last);
    }
}

fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(left.len() + right.len());
    combined.extend_from_slice(left);
    combined.extend_from_slice(right);
    sha256_digest(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i; 32]).collect()
    }

    #[test]
    fn test_single_id_is_paired_with_itself() {
        let id = vec![7u8; 32];
        let leaf = sha256_digest(&id);
        let expected = hash_pair(&leaf, &leaf);

        assert_eq!(merkle_root(&[id]).unwrap(), expected);
    }

    #[test]
    fn test_two_ids() {
        let ids = ids(2);
        let expected = hash_pair(&sha256_digest(&ids[0]), &sha256_digest(&ids[1]));
        assert_eq!(merkle_root(&ids).unwrap(), expected);
    }

    #[test]
    fn test_odd_count_duplicates_last_leaf() {
        let three = ids(3);
        let mut padded = three.clone();
        padded.push(three[2].clone());

        assert_eq!(merkle_root(&three).unwrap(), merkle_root(&padded).unwrap());
    }

    #[test]
    fn test_order_sensitive() {
        let forward = ids(4);
        let mut swapped = forward.clone();
        swapped.swap(1, 2);

        assert_ne!(merkle_root(&forward).unwrap(), merkle_root(&swapped).unwrap());
    }

    #[test]
    fn test_empty_list_is_rejected() {
        assert!(merkle_root(&[]).is_err());
    }

    #[test]
    fn test_proofs_verify_for_every_leaf() {
        for n in 1..=9u8 {
            let ids = ids(n);
            let tree = MerkleTree::new(&ids).unwrap();
            for (index, id) in ids.iter().enumerate() {
                let proof = tree.proof(index, id).unwrap();
                assert!(proof.verify(), "leaf {index} of {n}");
                assert_eq!(proof.merkle_root, tree.root());
            }
        }
    }

    #[test]
    fn test_tampered_proof_fails() {
        let ids = ids(5);
        let tree = MerkleTree::new(&ids).unwrap();
        let mut proof = tree.proof(3, &ids[3]).unwrap();
        proof.transaction_id = vec![0xAA; 32];
        assert!(!proof.verify());

        assert!(tree.proof(3, &ids[2]).is_err());
        assert!(tree.proof(5, &ids[0]).is_err());
    }
}
