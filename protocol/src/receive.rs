// protocol/src/receive.rs

//! Receiver-side assembly of the partial transaction (SPEC_FULL.md §4.1).
//!
//! [`assemble`] takes the sender's signed template, validates it, adds one
//! wallet-owned input chosen by [`hash::pick_utxo`], bumps the payment
//! output by that input's value, has the wallet sign it, and persists the
//! exchange before returning the partial's wire bytes. A background task
//! watches for the final transaction to confirm and rebroadcasts the
//! template once if it doesn't.

use crate::bip69;
use crate::hexutil::bytes_to_hex;
use crate::persist::{self, ExchangeRecord};
use bitcoin::consensus::encode;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, TxIn, Witness};
use node::{NodeClient, NodeError, Utxo};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AssembleError {
    /// The sender's template fails a check the sender controls — rejected
    /// with a reason the sender can act on.
    #[error("rejecting template: {0}")]
    Client(String),
    #[error(transparent)]
    Node(#[from] NodeError),
    /// Something that correct operation should never produce.
    #[error("invariant violation: {0}")]
    Fatal(String),
}

/// Builds a fresh node connection on demand. The background monitor uses
/// this rather than holding on to the request-handling connection, so it
/// keeps working even if that connection is later dropped or reset.
pub type NodeFactory = Arc<dyn Fn() -> Arc<dyn NodeClient> + Send + Sync>;

/// Assemble a partial transaction from `template`, returning its
/// consensus-serialized bytes ready to send back to the sender.
pub async fn assemble(
    node: Arc<dyn NodeClient>,
    monitor_factory: NodeFactory,
    data_dir: &Path,
    template: &Transaction,
) -> Result<Vec<u8>, AssembleError> {
    validate_template_shape(template)?;

    if !node.test_mempool_accept(template).await? {
        return Err(AssembleError::Client(
            "template transaction is not mempool-acceptable".to_string(),
        ));
    }

    let network = node.get_chain_params().await?;
    let (target_index, target_amount_sat) =
        find_payment_target(node.as_ref(), template, network).await?;

    let prevout_txids: Vec<[u8; 32]> = template
        .input
        .iter()
        .map(|input| {
            use bitcoin::hashes::Hash;
            input.previous_output.txid.to_byte_array()
        })
        .collect();
    let seed = hash::derive_seed(prevout_txids.iter())
        .expect("template input presence already validated by validate_template_shape");

    let utxos = node.list_unspent().await?;
    let excluded: HashSet<OutPoint> = template.input.iter().map(|i| i.previous_output).collect();
    let utxo = hash::pick_utxo(&seed, &utxos, |u: &Utxo| u.outpoint, &excluded)
        .ok_or_else(|| AssembleError::Client("no eligible wallet UTXO available".to_string()))?
        .clone();

    let preserve_order = bip69::is_sorted(template);
    let template_script_sigs: HashMap<OutPoint, ScriptBuf> = template
        .input
        .iter()
        .map(|i| (i.previous_output, i.script_sig.clone()))
        .collect();

    let mut partial = template.clone();
    for input in partial.input.iter_mut() {
        input.witness = Witness::new();
    }

    let contributed_sequence = template.input[0].sequence;
    partial.input.push(TxIn {
        previous_output: utxo.outpoint,
        script_sig: ScriptBuf::new(),
        sequence: contributed_sequence,
        witness: Witness::new(),
    });

    let target_output = &mut partial.output[target_index];
    let bumped = target_output.value.to_sat() + utxo.amount_sat as u64;
    target_output.value = Amount::from_sat(bumped);

    if preserve_order {
        bip69::sort_in_place(&mut partial);
    } else {
        partial.input.shuffle(&mut rand::thread_rng());
    }

    let contributed_index = partial
        .input
        .iter()
        .position(|i| i.previous_output == utxo.outpoint)
        .ok_or_else(|| {
            AssembleError::Fatal("contributed input missing from partial after assembly".to_string())
        })?;

    let sign_result = node.sign_raw_transaction_with_wallet(&partial).await?;
    if !sign_result.complete {
        return Err(AssembleError::Fatal(
            "wallet did not fully sign the partial transaction".to_string(),
        ));
    }
    let mut signed = sign_result.tx;

    reclear_foreign_witnesses(&mut signed, &template_script_sigs, contributed_index)?;

    let final_txid = signed.compute_txid();
    let record = ExchangeRecord {
        amount_sat: target_amount_sat,
        template_hex: bytes_to_hex(&encode::serialize(template)),
        partial_hex: bytes_to_hex(&encode::serialize(&signed)),
    };
    persist::write_exchange(data_dir, &final_txid.to_string(), &record)
        .map_err(|e| AssembleError::Fatal(format!("failed to persist exchange record: {e}")))?;

    info!(txid = %final_txid, amount_sat = target_amount_sat, "assembled partial transaction");
    tokio::spawn(monitor_exchange(
        monitor_factory,
        template.clone(),
        signed.clone(),
    ));

    Ok(encode::serialize(&signed))
}

fn validate_template_shape(template: &Transaction) -> Result<(), AssembleError> {
    if template.input.is_empty() {
        return Err(AssembleError::Client(
            "template transaction has no inputs".to_string(),
        ));
    }
    if template.input.iter().any(|i| i.witness.is_empty()) {
        return Err(AssembleError::Client(
            "template transaction has an unsigned input".to_string(),
        ));
    }
    Ok(())
}

async fn find_payment_target(
    node: &dyn NodeClient,
    template: &Transaction,
    network: Network,
) -> Result<(usize, i64), AssembleError> {
    for (idx, output) in template.output.iter().enumerate() {
        let Ok(address) = Address::from_script(&output.script_pubkey, network) else {
            continue;
        };
        if node.is_mine_and_fresh(&address).await? {
            return Ok((idx, output.value.to_sat() as i64));
        }
    }
    Err(AssembleError::Client(
        "no output pays a fresh wallet address".to_string(),
    ))
}

/// Clear every input's witness except `contributed_index`, restoring the
/// template's original signature-script. The wallet is only expected to
/// sign the contributed input, but a wallet that happens to recognize one
/// of the sender's inputs could otherwise attach a witness that later
/// fails the sender's byte-for-byte comparison against the template.
fn reclear_foreign_witnesses(
    signed: &mut Transaction,
    template_script_sigs: &HashMap<OutPoint, ScriptBuf>,
    contributed_index: usize,
) -> Result<(), AssembleError> {
    for (idx, input) in signed.input.iter_mut().enumerate() {
        if idx == contributed_index {
            continue;
        }
        let Some(script_sig) = template_script_sigs.get(&input.previous_output) else {
            return Err(AssembleError::Fatal(format!(
                "signed transaction contains unrecognized input {:?}",
                input.previous_output
            )));
        };
        input.script_sig = script_sig.clone();
        input.witness = Witness::new();
    }
    Ok(())
}

/// Watches the mempool for `partial`'s txid every five minutes, using a
/// fresh connection from `monitor_factory` each tick. Rebroadcasts
/// `template` once if the partial never shows up, then gives up.
async fn monitor_exchange(monitor_factory: NodeFactory, template: Transaction, partial: Transaction) {
    let txid = partial.compute_txid();
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    interval.tick().await; // first tick fires immediately; skip it
    let mut rebroadcast_attempted = false;

    loop {
        interval.tick().await;
        let node = monitor_factory();
        match node.get_mempool_entry(txid).await {
            Ok(true) => {
                info!(%txid, "partial transaction observed in mempool, monitor exiting");
                return;
            }
            Ok(false) if rebroadcast_attempted => {
                warn!(%txid, "partial transaction still absent after rebroadcast, giving up");
                return;
            }
            Ok(false) => {
                warn!(%txid, "partial transaction absent from mempool, rebroadcasting template");
                if let Err(err) = node.send_raw_transaction(&template).await {
                    warn!(%txid, error = %err, "template rebroadcast failed");
                }
                rebroadcast_attempted = true;
            }
            Err(err) => {
                warn!(%txid, error = %err, "mempool check failed, treating as absent");
            }
        }
    }
}
