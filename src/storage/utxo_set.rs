use crate::core::{Block, BlockchainIterator, TXOutput, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};
use sled::{Batch, Tree};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const UTXO_TREE: &str = "chainstate";

/// Still-unspent outputs of one transaction, keyed by output index.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutputs {
    outputs: BTreeMap<usize, TXOutput>,
}

impl TXOutputs {
    pub fn from_transaction(tx: &Transaction) -> TXOutputs {
        TXOutputs {
            outputs: tx.get_vout().iter().cloned().enumerate().collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&TXOutput> {
        self.outputs.get(&index)
    }

    pub fn remove(&mut self, index: usize) -> Option<TXOutput> {
        self.outputs.remove(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &TXOutput)> {
        self.outputs.iter()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<TXOutputs> {
        deserialize(bytes)
    }
}

/// ( K -> txid, V -> TXOutputs ), derived from the chain and kept in step
/// with it by the ledger.
#[derive(Clone)]
pub struct UTXOSet {
    tree: Tree,
}

impl UTXOSet {
    pub fn new(tree: Tree) -> UTXOSet {
        UTXOSet { tree }
    }

    pub fn get_tree(&self) -> &Tree {
        &self.tree
    }

    /// Accumulates outputs locked to `pub_key_hash` in key order until the
    /// total reaches `amount`.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, Vec<(Vec<u8>, usize)>)> {
        let mut unspent_outputs = vec![];
        let mut accumulated = 0u64;

        for item in self.tree.iter() {
            let (k, v) = item?;
            let outs = TXOutputs::deserialize(v.as_ref())?;

            for (idx, out) in outs.iter() {
                if accumulated >= amount {
                    return Ok((accumulated, unspent_outputs));
                }
                if out.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(out.get_value());
                    unspent_outputs.push((k.to_vec(), *idx));
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for item in self.tree.iter() {
            let (_, v) = item?;
            let outs = TXOutputs::deserialize(v.as_ref())?;
            utxos.extend(
                outs.iter()
                    .filter(|(_, out)| out.is_locked_with_key(pub_key_hash))
                    .map(|(_, out)| out.clone()),
            );
        }
        Ok(utxos)
    }

    pub fn get_output(&self, txid: &[u8], index: usize) -> Result<Option<TXOutput>> {
        match self.tree.get(txid)? {
            Some(bytes) => Ok(TXOutputs::deserialize(bytes.as_ref())?.get(index).cloned()),
            None => Ok(None),
        }
    }

    pub fn is_unspent(&self, txid: &[u8], index: usize) -> Result<bool> {
        Ok(self.get_output(txid, index)?.is_some())
    }

    /// Whether `txid` still has unspent outputs.
    pub fn has_entry(&self, txid: &[u8]) -> Result<bool> {
        Ok(self.tree.contains_key(txid)?)
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<u64> {
        let mut counter = 0;
        for item in self.tree.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Full contents keyed by hex txid, for inspection and comparison.
    pub fn entries(&self) -> Result<BTreeMap<String, TXOutputs>> {
        let mut entries = BTreeMap::new();
        for item in self.tree.iter() {
            let (k, v) = item?;
            entries.insert(HEXLOWER.encode(k.as_ref()), TXOutputs::deserialize(v.as_ref())?);
        }
        Ok(entries)
    }

    /// Rebuilds the whole index from the chain, tip to genesis, and swaps it in
    /// with a single batch.
    pub fn reindex(&self, blocks: BlockchainIterator) -> Result<()> {
        let mut utxo: HashMap<Vec<u8>, TXOutputs> = HashMap::new();
        let mut spent_txos: HashMap<Vec<u8>, HashSet<usize>> = HashMap::new();

        for block in blocks {
            let block = block?;
            // Later transactions of a block may spend earlier ones.
            for tx in block.get_transactions().iter().rev() {
                let mut outs = TXOutputs::from_transaction(tx);
                if let Some(spent) = spent_txos.get(tx.get_id()) {
                    for idx in spent {
                        outs.remove(*idx);
                    }
                }
                if !outs.is_empty() {
                    utxo.insert(tx.get_id().to_vec(), outs);
                }

                if tx.is_coinbase() {
                    continue;
                }
                for txin in tx.get_vin() {
                    if let Some(idx) = txin.output_index() {
                        spent_txos
                            .entry(txin.get_txid().to_vec())
                            .or_default()
                            .insert(idx);
                    }
                }
            }
        }

        let mut batch = Batch::default();
        for item in self.tree.iter().keys() {
            batch.remove(item?);
        }
        for (txid, outs) in &utxo {
            batch.insert(txid.as_slice(), outs.serialize()?);
        }
        self.tree.apply_batch(batch)?;

        info!("Reindexed UTXO set: {} transactions", utxo.len());
        Ok(())
    }

    /// Applies one accepted block on its own.
    pub fn update(&self, block: &Block) -> Result<()> {
        self.tree
            .transaction(|utxo_tree| Self::apply_block(utxo_tree, block))?;
        Ok(())
    }

    /// Consumes the block's spent outputs and records its new ones inside an
    /// enclosing sled transaction. Spending an output that is not in the set
    /// aborts the transaction.
    pub fn apply_block(
        utxo_tree: &TransactionalTree,
        block: &Block,
    ) -> ConflictableTransactionResult<(), BlockchainError> {
        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                for vin in tx.get_vin() {
                    let missing = || {
                        ConflictableTransactionError::Abort(BlockchainError::MissingPreviousOutput(
                            format!("{}:{}", HEXLOWER.encode(vin.get_txid()), vin.get_vout()),
                        ))
                    };

                    let outs_bytes = utxo_tree.get(vin.get_txid())?.ok_or_else(missing)?;
                    let mut outs = TXOutputs::deserialize(outs_bytes.as_ref())
                        .map_err(ConflictableTransactionError::Abort)?;
                    vin.output_index()
                        .and_then(|idx| outs.remove(idx))
                        .ok_or_else(missing)?;

                    if outs.is_empty() {
                        utxo_tree.remove(vin.get_txid())?;
                    } else {
                        let bytes = outs.serialize().map_err(ConflictableTransactionError::Abort)?;
                        utxo_tree.insert(vin.get_txid(), bytes)?;
                    }
                }
            }

            if utxo_tree.get(tx.get_id())?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    BlockchainError::InvalidTransaction(format!(
                        "Transaction {} would overwrite unspent outputs",
                        tx.id_hex()
                    )),
                ));
            }
            let new_outputs = TXOutputs::from_transaction(tx);
            if !new_outputs.is_empty() {
                let bytes = new_outputs
                    .serialize()
                    .map_err(ConflictableTransactionError::Abort)?;
                utxo_tree.insert(tx.get_id(), bytes)?;
            }
        }
        Ok(())
    }
}
