// hash/src/lib.rs

//! Seeded, obfuscated UTXO selection (see SPEC_FULL.md §4.4).
//!
//! Selection must be stable under the same seed (so a receiver doesn't churn
//! through its UTXO set when re-queried) and unpredictable to anyone who
//! doesn't hold the process-local secret (so a prober can't harvest the
//! wallet's coins by sending many templates). Both properties come from
//! hashing `(txid, vout, seed, secret)` with RIPEMD-160 and taking the
//! minimum.

use bitcoin::hashes::Hash;
use bitcoin::OutPoint;
use rand::RngCore;
use ripemd::{Digest, Ripemd160};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Process-global obfuscation secret. Populated exactly once, on first use,
/// and read-only forever after (see SPEC_FULL.md §4.4 — the original source
/// this is ported from populates a shadowed local variable instead of the
/// package-level one, so the real secret there is always empty; a single
/// `OnceLock` binding here makes that mistake impossible to reproduce).
static SECRET: OnceLock<[u8; 16]> = OnceLock::new();

fn secret() -> &'static [u8; 16] {
    SECRET.get_or_init(|| {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    })
}

/// Hash `parts` together with the process secret, RIPEMD-160. The secret is
/// written last, following the original's stated rationale: appending it
/// last rather than first forecloses a length-extension attack against the
/// intermediate state.
fn obfuhash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.update(secret());
    hasher.finalize().into()
}

/// Compute the ordering key for a single UTXO under `seed`.
pub fn selection_key(outpoint: &OutPoint, seed: &[u8; 32]) -> [u8; 20] {
    let txid_bytes: [u8; 32] = outpoint.txid.to_byte_array();
    let vout_bytes = outpoint.vout.to_le_bytes();
    obfuhash(&[&txid_bytes, &vout_bytes, seed])
}

/// Derive the seed for a template: the byte-maximum of its inputs' prevout
/// txids (SPEC_FULL.md §4.1 step 4). Returns `None` if `prevouts` is empty.
pub fn derive_seed<'a>(prevout_txids: impl Iterator<Item = &'a [u8; 32]>) -> Option<[u8; 32]> {
    prevout_txids.max_by(|a, b| a.as_slice().cmp(b.as_slice())).copied()
}

/// Select the minimum-hash UTXO under `seed`, excluding any outpoint in
/// `excluded`. Returns `None` if every candidate is excluded.
///
/// Stable under reordering of `candidates` by construction (a total order
/// over hash values, independent of input order).
pub fn pick_utxo<'a, T>(
    seed: &[u8; 32],
    candidates: &'a [T],
    outpoint_of: impl Fn(&T) -> OutPoint,
    excluded: &HashSet<OutPoint>,
) -> Option<&'a T> {
    candidates
        .iter()
        .filter(|c| !excluded.contains(&outpoint_of(c)))
        .min_by_key(|c| selection_key(&outpoint_of(c), seed))
}
