// Transactions follow the UTXO model: each input consumes an output of an
// earlier transaction, each output locks a value to one public-key hash.
// Signatures are computed over a "trimmed copy" of the transaction, rebuilt
// separately for every input.

use crate::error::{BlockchainError, Result};
use crate::utils::{
    current_timestamp_nanos, deserialize, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, serialize, sha256_digest,
};
use crate::wallet::{decode_address, hash_pub_key};
use data_encoding::HEXLOWER;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Reward minted by every coinbase transaction.
pub const SUBSIDY: u64 = 10;

/// Output index carried by the single input of a coinbase transaction.
pub const COINBASE_OUTPUT_INDEX: i64 = -1;

/// Previous transactions keyed by hex-encoded id, as needed by sign/verify.
pub type PrevTransactions = HashMap<String, Transaction>;

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: i64,
    signature: Vec<u8>,
    pub_key: Vec<u8>,
}

impl TXInput {
    /// An unsigned input spending output `vout` of transaction `txid`.
    pub fn new(txid: &[u8], vout: usize, pub_key: &[u8]) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout: vout as i64,
            signature: vec![],
            pub_key: pub_key.to_vec(),
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The spent output index, or `None` for the coinbase sentinel.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(&self.pub_key) == pub_key_hash
    }

    #[cfg(test)]
    pub(crate) fn signature_mut(&mut self) -> &mut Vec<u8> {
        &mut self.signature
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// An output paying `value` to `address`.
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        Ok(TXOutput {
            value,
            pub_key_hash: decode_address(address)?,
        })
    }

    pub fn new_locked(value: u64, pub_key_hash: &[u8]) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
    /// Creation time in nanoseconds; salts the id so identical coinbases differ.
    timestamp: i64,
}

impl Transaction {
    pub fn new_coinbase_tx(to: &str) -> Result<Transaction> {
        Self::new_coinbase_tx_with_reward(to, SUBSIDY)
    }

    pub fn new_coinbase_tx_with_reward(to: &str, reward: u64) -> Result<Transaction> {
        let txout = TXOutput::new(reward, to)?;
        // The coinbase input carries random data in place of a signature.
        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_OUTPUT_INDEX,
            signature: Uuid::new_v4().as_bytes().to_vec(),
            pub_key: vec![],
        };

        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![txout],
            timestamp: current_timestamp_nanos()?,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// An unsigned transaction with its id computed over the current contents.
    pub fn new_unsigned(vin: Vec<TXInput>, vout: Vec<TXOutput>) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            vin,
            vout,
            timestamp: current_timestamp_nanos()?,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1
            && self.vin[0].txid.is_empty()
            && self.vin[0].vout == COINBASE_OUTPUT_INDEX
    }

    /// sha256 over the encoding of this transaction with the id field cleared.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
            timestamp: self.timestamp,
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    /// Recomputes the id after the contents changed (e.g. after signing).
    pub fn refresh_id(&mut self) -> Result<()> {
        self.id = self.hash()?;
        Ok(())
    }

    /// Copy with every input's signature and public key cleared.
    fn trimmed_copy(&self) -> Transaction {
        let vin = self
            .vin
            .iter()
            .map(|input| TXInput {
                txid: input.txid.clone(),
                vout: input.vout,
                signature: vec![],
                pub_key: vec![],
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin,
            vout: self.vout.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Digest signed for input `idx`: the trimmed copy with only that input's
    /// key field set to the recipient hash of the output it spends.
    fn signature_digest(
        tx_copy: &mut Transaction,
        idx: usize,
        spent_pub_key_hash: &[u8],
    ) -> Result<Vec<u8>> {
        tx_copy.vin[idx].signature.clear();
        tx_copy.vin[idx].pub_key = spent_pub_key_hash.to_vec();
        let digest = tx_copy.hash()?;
        tx_copy.vin[idx].pub_key.clear();
        Ok(digest)
    }

    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &PrevTransactions) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut spent_hashes = Vec::with_capacity(self.vin.len());
        for vin in &self.vin {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            let output = prev_txs
                .get(&txid_hex)
                .and_then(|prev_tx| vin.output_index().and_then(|idx| prev_tx.vout.get(idx)))
                .ok_or_else(|| {
                    BlockchainError::UnresolvedInput(format!("{txid_hex}:{}", vin.vout))
                })?;
            spent_hashes.push(output.pub_key_hash.clone());
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, spent_hash) in spent_hashes.iter().enumerate() {
            let digest = Self::signature_digest(&mut tx_copy, idx, spent_hash)?;
            self.vin[idx].signature = ecdsa_p256_sha256_sign_digest(pkcs8, &digest)?;
        }
        Ok(())
    }

    /// `Ok(false)` when any signature does not hold, an error when an input
    /// cannot be resolved at all. Coinbase transactions are always valid.
    pub fn verify(&self, prev_txs: &PrevTransactions) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            let output = prev_txs
                .get(&txid_hex)
                .and_then(|prev_tx| vin.output_index().and_then(|i| prev_tx.vout.get(i)))
                .ok_or_else(|| {
                    BlockchainError::MissingPreviousOutput(format!("{txid_hex}:{}", vin.vout))
                })?;

            if !vin.uses_key(output.get_pub_key_hash()) {
                warn!("Input {idx} of {} spends an output locked to another key", self.id_hex());
                return Ok(false);
            }

            let digest = Self::signature_digest(&mut tx_copy, idx, output.get_pub_key_hash())?;
            if !ecdsa_p256_sha256_sign_verify(&vin.pub_key, &vin.signature, &digest) {
                warn!("Input {idx} of {} carries an invalid signature", self.id_hex());
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_output_value(&self) -> Result<u64> {
        self.vout.iter().try_fold(0u64, |total, out| {
            total
                .checked_add(out.value)
                .ok_or_else(|| BlockchainError::InvalidTransaction("Output value overflow".to_string()))
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    #[cfg(test)]
    pub(crate) fn vin_mut(&mut self) -> &mut Vec<TXInput> {
        &mut self.vin
    }

    #[cfg(test)]
    pub(crate) fn set_id(&mut self, id: &[u8]) {
        self.id = id.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn prev_map(txs: &[&Transaction]) -> PrevTransactions {
        txs.iter().map(|tx| (tx.id_hex(), (*tx).clone())).collect()
    }

    fn spend(from: &Wallet, prev: &Transaction, to: &str, amount: u64) -> Transaction {
        let input = TXInput::new(prev.get_id(), 0, from.get_public_key());
        let output = TXOutput::new(amount, to).unwrap();
        Transaction::new_unsigned(vec![input], vec![output]).unwrap()
    }

    #[test]
    fn test_coinbase_shape() {
        let wallet = Wallet::new().unwrap();
        let tx = Transaction::new_coinbase_tx(&wallet.get_address()).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.get_vin()[0].get_vout(), COINBASE_OUTPUT_INDEX);
        assert!(tx.get_vin()[0].get_txid().is_empty());
        assert_eq!(tx.get_vout()[0].get_value(), SUBSIDY);
        assert!(tx.get_vout()[0].is_locked_with_key(&wallet.get_pub_key_hash()));
        assert!(tx.verify(&PrevTransactions::new()).unwrap());
    }

    #[test]
    fn test_identical_coinbases_get_distinct_ids() {
        let address = Wallet::new().unwrap().get_address();
        let a = Transaction::new_coinbase_tx(&address).unwrap();
        let b = Transaction::new_coinbase_tx(&address).unwrap();
        assert_ne!(a.get_id(), b.get_id());
    }

    #[test]
    fn test_sign_then_verify() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let funding = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let prev = prev_map(&[&funding]);

        let mut tx = spend(&alice, &funding, &bob.get_address(), 10);
        tx.sign(alice.get_pkcs8(), &prev).unwrap();
        tx.refresh_id().unwrap();

        assert!(tx.verify(&prev).unwrap());
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let alice = Wallet::new().unwrap();
        let funding = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let prev = prev_map(&[&funding]);

        let mut tx = spend(&alice, &funding, &alice.get_address(), 10);
        tx.sign(alice.get_pkcs8(), &prev).unwrap();

        for position in [0usize, 31, 63] {
            let mut tampered = tx.clone();
            tampered.vin_mut()[0].signature_mut()[position] ^= 0x01;
            assert!(!tampered.verify(&prev).unwrap(), "byte {position}");
        }
    }

    #[test]
    fn test_signing_with_foreign_key_fails_verification() {
        let alice = Wallet::new().unwrap();
        let mallory = Wallet::new().unwrap();
        let funding = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let prev = prev_map(&[&funding]);

        // Mallory claims Alice's output with her own key.
        let mut tx = spend(&mallory, &funding, &mallory.get_address(), 10);
        tx.sign(mallory.get_pkcs8(), &prev).unwrap();
        assert!(!tx.verify(&prev).unwrap());
    }

    #[test]
    fn test_each_input_signs_its_own_snapshot() {
        let alice = Wallet::new().unwrap();
        let first = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let second = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let prev = prev_map(&[&first, &second]);

        let inputs = vec![
            TXInput::new(first.get_id(), 0, alice.get_public_key()),
            TXInput::new(second.get_id(), 0, alice.get_public_key()),
        ];
        let outputs = vec![TXOutput::new_locked(20, &alice.get_pub_key_hash())];
        let mut tx = Transaction::new_unsigned(inputs, outputs).unwrap();
        tx.sign(alice.get_pkcs8(), &prev).unwrap();
        assert!(tx.verify(&prev).unwrap());

        // Swapping the two signatures must break both inputs.
        let mut swapped = tx.clone();
        let first_sig = swapped.vin_mut()[0].signature.clone();
        let second_sig = swapped.vin_mut()[1].signature.clone();
        swapped.vin_mut()[0].signature = second_sig;
        swapped.vin_mut()[1].signature = first_sig;
        assert!(!swapped.verify(&prev).unwrap());
    }

    #[test]
    fn test_sign_with_unknown_input_is_unresolved() {
        let alice = Wallet::new().unwrap();
        let funding = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let mut tx = spend(&alice, &funding, &alice.get_address(), 10);

        let err = tx.sign(alice.get_pkcs8(), &PrevTransactions::new()).unwrap_err();
        assert!(matches!(err, BlockchainError::UnresolvedInput(_)));
    }

    #[test]
    fn test_verify_with_missing_output_fails() {
        let alice = Wallet::new().unwrap();
        let funding = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let prev = prev_map(&[&funding]);

        let input = TXInput::new(funding.get_id(), 3, alice.get_public_key());
        let tx = Transaction::new_unsigned(vec![input], vec![]).unwrap();
        let err = tx.verify(&prev).unwrap_err();
        assert!(matches!(err, BlockchainError::MissingPreviousOutput(_)));
    }

    #[test]
    fn test_serialize_identity() {
        let alice = Wallet::new().unwrap();
        let funding = Transaction::new_coinbase_tx(&alice.get_address()).unwrap();
        let mut tx = spend(&alice, &funding, &alice.get_address(), 7);
        tx.sign(alice.get_pkcs8(), &prev_map(&[&funding])).unwrap();
        tx.refresh_id().unwrap();

        let decoded = Transaction::deserialize(&tx.serialize().unwrap()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash().unwrap(), tx.get_id());
    }
}
