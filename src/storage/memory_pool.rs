use crate::core::Transaction;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Transactions waiting to be mined.
/// ( K -> txid_hex, V => Transaction )
#[derive(Default)]
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool::default()
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        self.inner.read().get(txid_hex).cloned()
    }

    /// Returns false if the transaction was already pooled.
    pub fn add(&self, tx: Transaction) -> bool {
        self.inner.write().insert(tx.id_hex(), tx).is_none()
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        self.inner.read().contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) -> Option<Transaction> {
        self.inner.write().remove(txid_hex)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot ordered by creation time so mining picks older transactions first.
    pub fn get_all(&self) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self.inner.read().values().cloned().collect();
        txs.sort_by(|a, b| {
            a.get_timestamp()
                .cmp(&b.get_timestamp())
                .then_with(|| a.get_id().cmp(b.get_id()))
        });
        txs
    }

    /// Drops every pooled transaction that appears in `txs` or spends an
    /// output one of them spends.
    pub fn remove_conflicting(&self, txs: &[Transaction]) {
        let spent: Vec<(&[u8], i64)> = txs
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.get_vin().iter().map(|vin| (vin.get_txid(), vin.get_vout())))
            .collect();

        let mut pool = self.inner.write();
        for tx in txs {
            pool.remove(&tx.id_hex());
        }
        pool.retain(|_, pooled| {
            !pooled
                .get_vin()
                .iter()
                .any(|vin| spent.contains(&(vin.get_txid(), vin.get_vout())))
        });
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}
