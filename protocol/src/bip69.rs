// protocol/src/bip69.rs

//! BIP-69 canonical transaction ordering: inputs sorted lexicographically by
//! prevout (txid bytes, then vout), outputs sorted by value then
//! script-pubkey bytes. Used as a privacy signal — SPEC_FULL.md §4.1 step 7
//! preserves it on the partial only if the template already had it.

use bitcoin::hashes::Hash;
use bitcoin::{Transaction, TxIn, TxOut};
use std::cmp::Ordering;

fn input_key(input: &TxIn) -> ([u8; 32], u32) {
    (input.previous_output.txid.to_byte_array(), input.previous_output.vout)
}

fn output_key(output: &TxOut) -> (u64, Vec<u8>) {
    (output.value.to_sat(), output.script_pubkey.to_bytes())
}

fn cmp_inputs(a: &TxIn, b: &TxIn) -> Ordering {
    input_key(a).cmp(&input_key(b))
}

fn cmp_outputs(a: &TxOut, b: &TxOut) -> Ordering {
    output_key(a).cmp(&output_key(b))
}

/// True if `tx`'s inputs and outputs are already in BIP-69 order.
pub fn is_sorted(tx: &Transaction) -> bool {
    tx.input.windows(2).all(|w| cmp_inputs(&w[0], &w[1]) != Ordering::Greater)
        && tx.output.windows(2).all(|w| cmp_outputs(&w[0], &w[1]) != Ordering::Greater)
}

/// Sort `tx`'s inputs and outputs in place per BIP-69.
pub fn sort_in_place(tx: &mut Transaction) {
    tx.input.sort_by(cmp_inputs);
    tx.output.sort_by(cmp_outputs);
}
