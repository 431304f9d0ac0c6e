// protocol/src/persist.rs

//! Persistence of completed exchanges (SPEC_FULL.md §6, §9).
//!
//! The original this is ported from writes `amount.txt`,
//! `template_transaction.hex`, and `partial_transaction.hex` directly —  a
//! crash between any two of those writes leaves a half-written exchange
//! record. Each file here is instead written to a sibling `.tmp` path and
//! renamed into place, and the directory is `fsync`'d once all three renames
//! land, so the record on disk is always either absent or complete.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    /// A directory collision — the final txid has been seen before. Per
    /// SPEC_FULL.md §4.1 step 10, this is fatal: the directory name is
    /// unique per transaction, so a pre-existing one means something is
    /// badly wrong (a replay, or a hash collision).
    #[error("exchange directory already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("I/O error persisting exchange record: {0}")]
    Io(#[from] io::Error),
}

/// The data persisted for one completed exchange, keyed by final txid.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    /// The payment's target amount, i.e. the template's payment output
    /// value before the receiver's bump — not the contributed UTXO's value.
    pub amount_sat: i64,
    pub template_hex: String,
    pub partial_hex: String,
}

/// Write `record` atomically to `<data_dir>/<txid>/`. Fails if that
/// directory already exists. Returns the directory written.
pub fn write_exchange(
    data_dir: &Path,
    txid: &str,
    record: &ExchangeRecord,
) -> Result<PathBuf, PersistError> {
    let dir = data_dir.join(txid);
    if dir.exists() {
        return Err(PersistError::AlreadyExists(dir));
    }
    fs::create_dir_all(data_dir)?;
    create_dir_0700(&dir)?;

    write_atomic(&dir, "amount.txt", record.amount_sat.to_string().as_bytes())?;
    write_atomic(&dir, "template_transaction.hex", record.template_hex.as_bytes())?;
    write_atomic(&dir, "partial_transaction.hex", record.partial_hex.as_bytes())?;

    fsync_dir(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
fn create_dir_0700(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_dir_0700(dir: &Path) -> io::Result<()> {
    fs::create_dir(dir)
}

fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> io::Result<()> {
    let final_path = dir.join(name);
    let tmp_path = dir.join(format!("{name}.tmp"));
    {
        let mut f = File::create(&tmp_path)?;
        use std::io::Write;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Read back a previously-written exchange record. Used by tests and by
/// operational tooling, not by the hot path.
pub fn read_exchange(data_dir: &Path, txid: &str) -> Result<ExchangeRecord, PersistError> {
    let dir = data_dir.join(txid);
    let amount_sat: i64 = fs::read_to_string(dir.join("amount.txt"))?
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "amount.txt is not an integer"))?;
    let template_hex = fs::read_to_string(dir.join("template_transaction.hex"))?;
    let partial_hex = fs::read_to_string(dir.join("partial_transaction.hex"))?;
    Ok(ExchangeRecord {
        amount_sat,
        template_hex,
        partial_hex,
    })
}
