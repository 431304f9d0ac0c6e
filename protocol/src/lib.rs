// protocol/src/lib.rs

//! The bustapay protocol core: the receiver's partial-transaction assembly
//! pipeline, the sender's validation pipeline and flow coordinator, BIP-69
//! ordering, and atomic persistence of completed exchanges.

pub mod bip69;
pub mod hexutil;
pub mod persist;
pub mod receive;
pub mod send;

pub use hexutil::{bytes_to_hex, hex_to_bytes};
pub use receive::{assemble, AssembleError, NodeFactory};
pub use send::{run as send_run, validate, SendError, ValidateError};
