// protocol/src/send.rs

//! Sender-side validation of the receiver's partial transaction
//! (SPEC_FULL.md §4.2) and the flow that drives a payment end to end
//! (SPEC_FULL.md §4.3).

use crate::hexutil::hex_to_bytes;
use bitcoin::consensus::encode;
use bitcoin::{Address, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid};
use node::{NodeClient, NodeError};
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("rejecting partial transaction: {0}")]
    Invalid(String),
    #[error(transparent)]
    Node(#[from] NodeError),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("request to receiver failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Decode(String),
    #[error(transparent)]
    Validation(#[from] ValidateError),
}

/// Confirm the receiver only added one input, that its witness actually
/// satisfies the script it claims to spend under standard consensus
/// verification, and that it bumped the payment output by exactly that
/// input's value — nothing else about the transaction may have changed.
pub async fn validate(
    template: &Transaction,
    partial: &Transaction,
    node: &dyn NodeClient,
) -> Result<(), ValidateError> {
    if partial.version != template.version {
        return Err(ValidateError::Invalid("transaction version changed".to_string()));
    }
    if partial.lock_time != template.lock_time {
        return Err(ValidateError::Invalid("lock_time changed".to_string()));
    }
    if partial.output.len() != template.output.len() {
        return Err(ValidateError::Invalid("output count changed".to_string()));
    }
    if partial.input.len() != template.input.len() + 1 {
        return Err(ValidateError::Invalid(format!(
            "expected {} inputs, found {}",
            template.input.len() + 1,
            partial.input.len()
        )));
    }

    let mut template_inputs: HashMap<OutPoint, &TxIn> =
        template.input.iter().map(|i| (i.previous_output, i)).collect();

    let mut contributed = None;
    for (idx, input) in partial.input.iter().enumerate() {
        if let Some(t) = template_inputs.remove(&input.previous_output) {
            if input.sequence != t.sequence {
                return Err(ValidateError::Invalid(
                    "a template input's sequence number changed".to_string(),
                ));
            }
            if input.script_sig != t.script_sig {
                return Err(ValidateError::Invalid(
                    "a template input's signature script changed".to_string(),
                ));
            }
            if !input.witness.is_empty() {
                return Err(ValidateError::Invalid(
                    "a template input's witness was not cleared".to_string(),
                ));
            }
            continue;
        }
        if contributed.is_some() {
            return Err(ValidateError::Invalid("found 2 contributed inputs".to_string()));
        }
        contributed = Some((idx, input));
    }
    if !template_inputs.is_empty() {
        return Err(ValidateError::Invalid(
            "a template input is missing from the partial transaction".to_string(),
        ));
    }
    let (contributed_index, contributed) = contributed
        .ok_or_else(|| ValidateError::Invalid("no new input was added".to_string()))?;

    if contributed.witness.is_empty() {
        return Err(ValidateError::Invalid("contributed input is unsigned".to_string()));
    }

    let contributed_info = node
        .get_tx_out(contributed.previous_output.txid, contributed.previous_output.vout)
        .await?
        .ok_or_else(|| {
            ValidateError::Invalid("contributed input does not spend a known unspent output".to_string())
        })?;

    let serialized_partial = encode::serialize(partial);
    bitcoinconsensus::verify(
        contributed_info.script_pubkey.as_bytes(),
        contributed_info.value_sat as u64,
        &serialized_partial,
        contributed_index,
    )
    .map_err(|e| {
        ValidateError::Invalid(format!(
            "contributed input fails script verification: {e:?}"
        ))
    })?;

    let template_total: u64 = template.output.iter().map(|o| o.value.to_sat()).sum();
    let partial_total: u64 = partial.output.iter().map(|o| o.value.to_sat()).sum();
    let added = partial_total.checked_sub(template_total).ok_or_else(|| {
        ValidateError::Invalid("partial transaction pays out less than the template".to_string())
    })?;
    if added != contributed_info.value_sat as u64 {
        return Err(ValidateError::Invalid(format!(
            "output value increase ({added}) does not match contributed input value ({})",
            contributed_info.value_sat
        )));
    }

    let mut unmatched_template: Vec<&TxOut> = template.output.iter().collect();
    let mut bumped_count = 0;
    for output in &partial.output {
        if let Some(pos) = unmatched_template.iter().position(|t| **t == *output) {
            unmatched_template.remove(pos);
            continue;
        }
        if let Some(pos) = unmatched_template
            .iter()
            .position(|t| t.script_pubkey == output.script_pubkey && output.value.to_sat() > t.value.to_sat())
        {
            unmatched_template.remove(pos);
            bumped_count += 1;
            continue;
        }
        return Err(ValidateError::Invalid(
            "partial transaction contains an output not present in the template".to_string(),
        ));
    }
    if !unmatched_template.is_empty() {
        return Err(ValidateError::Invalid(
            "a template output is missing from the partial transaction".to_string(),
        ));
    }
    if bumped_count != 1 {
        return Err(ValidateError::Invalid(format!(
            "expected exactly one bumped output, found {bumped_count}"
        )));
    }

    Ok(())
}

/// Drive one payment end to end: build and sign the template, send it to
/// the receiver, validate and re-sign what comes back, and broadcast.
pub async fn run(
    node: &dyn NodeClient,
    receiver_url: &str,
    destination: &Address,
    amount_sat: i64,
) -> Result<Txid, SendError> {
    let unfunded = node.create_raw_transaction(destination, amount_sat).await?;
    let funded = node.fund_raw_transaction(&unfunded).await?;

    let template_signed = node.sign_raw_transaction_with_wallet(&funded).await?;
    if !template_signed.complete {
        return Err(SendError::Decode(
            "wallet could not fully sign the template transaction".to_string(),
        ));
    }
    let template = template_signed.tx;

    let client = reqwest::Client::new();
    let response = client
        .post(receiver_url)
        .body(encode::serialize(&template))
        .send()
        .await?
        .error_for_status()?;
    let is_text_plain = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == "text/plain")
        .unwrap_or(false);
    let body = response.bytes().await?;
    let partial_bytes = if is_text_plain {
        let text = std::str::from_utf8(&body)
            .map_err(|_| SendError::Decode("receiver response body is not valid UTF-8 hex".to_string()))?;
        hex_to_bytes(text.trim())
            .map_err(|e| SendError::Decode(format!("could not hex-decode receiver response: {e}")))?
    } else {
        body.to_vec()
    };
    let partial: Transaction = encode::deserialize(&partial_bytes)
        .map_err(|e| SendError::Decode(format!("receiver returned an invalid transaction: {e}")))?;

    validate(&template, &partial, node).await?;

    let partial_signed = node.sign_raw_transaction_with_wallet(&partial).await?;
    if !partial_signed.complete {
        return Err(SendError::Decode(
            "wallet could not fully sign the partial transaction".to_string(),
        ));
    }

    let txid = node.send_raw_transaction(&partial_signed.tx).await?;
    info!(%txid, "broadcast final transaction");
    Ok(txid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
    use bitcoin::sighash::{EcdsaSighashType, SighashCache};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, CompressedPublicKey, Sequence, TxIn, WPubkeyHash, Witness};
    use node::{AddressInfo, SignResult, TxOutInfo, Utxo};
    use std::str::FromStr;

    fn p2wpkh_script(byte: u8) -> ScriptBuf {
        let hash = WPubkeyHash::from_byte_array([byte; 20]);
        ScriptBuf::new_p2wpkh(&hash)
    }

    fn outpoint(txid_hex: &str, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_str(txid_hex).unwrap(), vout)
    }

    fn sender_input() -> TxIn {
        TxIn {
            previous_output: outpoint(&"1".repeat(64), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::from_slice(&[vec![9u8; 71], vec![8u8; 33]]),
        }
    }

    fn contributed_input() -> TxIn {
        TxIn {
            previous_output: outpoint(&"2".repeat(64), 3),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::from_slice(&[vec![1u8; 71], vec![2u8; 33]]),
        }
    }

    fn base_template() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![sender_input()],
            output: vec![TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: p2wpkh_script(0xaa),
            }],
        }
    }

    struct MockNode {
        contributed_value_sat: i64,
        contributed_spk: ScriptBuf,
    }

    #[async_trait]
    impl NodeClient for MockNode {
        async fn get_chain_params(&self) -> Result<bitcoin::Network, NodeError> {
            unimplemented!()
        }
        async fn get_new_address(
            &self,
        ) -> Result<bitcoin::Address<bitcoin::address::NetworkUnchecked>, NodeError> {
            unimplemented!()
        }
        async fn list_unspent(&self) -> Result<Vec<Utxo>, NodeError> {
            unimplemented!()
        }
        async fn get_tx_out(&self, _txid: Txid, _vout: u32) -> Result<Option<TxOutInfo>, NodeError> {
            Ok(Some(TxOutInfo {
                script_pubkey: self.contributed_spk.clone(),
                value_sat: self.contributed_value_sat,
            }))
        }
        async fn get_address_info(&self, _address: &Address) -> Result<AddressInfo, NodeError> {
            unimplemented!()
        }
        async fn list_received_by_address(&self) -> Result<Vec<String>, NodeError> {
            unimplemented!()
        }
        async fn test_mempool_accept(&self, _tx: &Transaction) -> Result<bool, NodeError> {
            unimplemented!()
        }
        async fn sign_raw_transaction_with_wallet(
            &self,
            _tx: &Transaction,
        ) -> Result<SignResult, NodeError> {
            unimplemented!()
        }
        async fn send_raw_transaction(&self, _tx: &Transaction) -> Result<Txid, NodeError> {
            unimplemented!()
        }
        async fn get_mempool_entry(&self, _txid: Txid) -> Result<bool, NodeError> {
            unimplemented!()
        }
        async fn create_raw_transaction(
            &self,
            _address: &Address,
            _amount_sat: i64,
        ) -> Result<Transaction, NodeError> {
            unimplemented!()
        }
        async fn fund_raw_transaction(&self, _tx: &Transaction) -> Result<Transaction, NodeError> {
            unimplemented!()
        }
    }

    fn valid_partial() -> Transaction {
        let mut tx = base_template();
        tx.input[0].witness = Witness::new();
        tx.input.push(contributed_input());
        tx.output[0].value = Amount::from_sat(70_000);
        tx
    }

    /// A deterministic keypair plus the p2wpkh script it actually spends, so
    /// tests can produce a witness that passes real script verification.
    fn contributed_keypair() -> (SecretKey, ScriptBuf) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let pk = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let compressed = CompressedPublicKey(pk);
        (sk, ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()))
    }

    /// Sign `tx`'s input at `index` as a p2wpkh spend of `script_pubkey`,
    /// given its value, producing a witness that verifies under consensus
    /// rules.
    fn sign_p2wpkh_input(
        tx: &mut Transaction,
        index: usize,
        script_pubkey: &ScriptBuf,
        value_sat: i64,
        sk: &SecretKey,
    ) {
        let secp = Secp256k1::new();
        let sighash = SighashCache::new(&*tx)
            .p2wpkh_signature_hash(index, script_pubkey, Amount::from_sat(value_sat as u64), EcdsaSighashType::All)
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = secp.sign_ecdsa(&msg, sk);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(EcdsaSighashType::All as u8);
        let pk = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, sk);

        let mut witness = Witness::new();
        witness.push(&sig_bytes);
        witness.push(&pk.serialize());
        tx.input[index].witness = witness;
    }

    #[tokio::test]
    async fn accepts_correctly_bumped_partial() {
        let template = base_template();
        let mut partial = valid_partial();
        let (sk, contributed_spk) = contributed_keypair();
        let contributed_index = partial.input.len() - 1;
        sign_p2wpkh_input(&mut partial, contributed_index, &contributed_spk, 20_000, &sk);

        let node = MockNode {
            contributed_value_sat: 20_000,
            contributed_spk,
        };
        validate(&template, &partial, &node).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_forged_witness_on_a_real_utxo() {
        let template = base_template();
        let partial = valid_partial();
        let (_sk, contributed_spk) = contributed_keypair();
        let node = MockNode {
            contributed_value_sat: 20_000,
            contributed_spk,
        };
        let err = validate(&template, &partial, &node).await.unwrap_err();
        assert!(matches!(err, ValidateError::Invalid(_)));
    }

    #[tokio::test]
    async fn rejects_mismatched_bump_amount() {
        let template = base_template();
        let partial = valid_partial();
        let node = MockNode {
            contributed_value_sat: 5_000,
            contributed_spk: p2wpkh_script(0xcc),
        };
        let err = validate(&template, &partial, &node).await.unwrap_err();
        assert!(matches!(err, ValidateError::Invalid(_)));
    }

    #[tokio::test]
    async fn rejects_extra_output() {
        let template = base_template();
        let mut partial = valid_partial();
        partial.output.push(TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: p2wpkh_script(0xdd),
        });
        let node = MockNode {
            contributed_value_sat: 20_000,
            contributed_spk: p2wpkh_script(0xcc),
        };
        let err = validate(&template, &partial, &node).await.unwrap_err();
        assert!(matches!(err, ValidateError::Invalid(_)));
    }

    #[tokio::test]
    async fn rejects_dropped_template_input() {
        let template = base_template();
        let mut partial = valid_partial();
        partial.input.remove(0);
        let node = MockNode {
            contributed_value_sat: 20_000,
            contributed_spk: p2wpkh_script(0xcc),
        };
        let err = validate(&template, &partial, &node).await.unwrap_err();
        assert!(matches!(err, ValidateError::Invalid(_)));
    }

    #[tokio::test]
    async fn rejects_two_foreign_inputs() {
        let template = base_template();
        let mut partial = valid_partial();
        let mut extra = contributed_input();
        extra.previous_output = outpoint(&"3".repeat(64), 0);
        partial.input.push(extra);
        let node = MockNode {
            contributed_value_sat: 20_000,
            contributed_spk: p2wpkh_script(0xcc),
        };
        let err = validate(&template, &partial, &node).await.unwrap_err();
        assert!(matches!(err, ValidateError::Invalid(_)));
    }
}
