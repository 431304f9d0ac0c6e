// node/src/lib.rs

//! The narrow Bitcoin-node interface bustapay consumes (SPEC_FULL.md §4.6).
//!
//! Every method here is a thin, single-purpose RPC call. The trait exists so
//! the receiver/sender pipelines in `protocol` can be tested against a mock
//! implementation without a live `bitcoind`; [`BitcoinCoreClient`] is the one
//! production implementation, built on the `client`/`transport` JSON-RPC
//! stack rather than a dedicated Bitcoin Core RPC crate.

pub mod test_config;

use async_trait::async_trait;
use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode;
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Transaction, Txid};
use client::RpcClient;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::OnceCell;

pub use test_config::TestConfig;

/// Errors surfaced by the node interface. Callers in `protocol` wrap these
/// into the broader `NodeError` arm of their own error taxonomy.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Rpc(#[from] client::ClientError),
    #[error("unexpected RPC response shape: {0}")]
    Decode(String),
    #[error("invalid address from node: {0}")]
    Address(#[from] bitcoin::address::ParseError),
    #[error("unrecognized chain name from node: {0}")]
    UnknownChain(String),
}

/// A wallet-owned, currently-unspent output, as reported by `listunspent`.
#[derive(Debug, Clone)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub script_pubkey: ScriptBuf,
    pub amount_sat: i64,
}

/// The on-chain state of a single output, as reported by `gettxout`.
#[derive(Debug, Clone)]
pub struct TxOutInfo {
    pub script_pubkey: ScriptBuf,
    pub value_sat: i64,
}

/// What the wallet knows about an address, as reported by `getaddressinfo`.
#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub is_mine: bool,
    pub hd_key_path: Option<String>,
}

/// The result of asking the wallet/policy engine to sign a transaction.
#[derive(Debug, Clone)]
pub struct SignResult {
    pub tx: Transaction,
    pub complete: bool,
}

/// The minimal Bitcoin-node surface bustapay needs. See SPEC_FULL.md §4.6.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_chain_params(&self) -> Result<Network, NodeError>;
    async fn get_new_address(&self) -> Result<Address<NetworkUnchecked>, NodeError>;
    async fn list_unspent(&self) -> Result<Vec<Utxo>, NodeError>;
    async fn get_tx_out(&self, txid: Txid, vout: u32) -> Result<Option<TxOutInfo>, NodeError>;
    async fn get_address_info(&self, address: &Address) -> Result<AddressInfo, NodeError>;
    async fn list_received_by_address(&self) -> Result<Vec<String>, NodeError>;
    async fn test_mempool_accept(&self, tx: &Transaction) -> Result<bool, NodeError>;
    async fn sign_raw_transaction_with_wallet(
        &self,
        tx: &Transaction,
    ) -> Result<SignResult, NodeError>;
    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, NodeError>;
    async fn get_mempool_entry(&self, txid: Txid) -> Result<bool, NodeError>;
    async fn create_raw_transaction(
        &self,
        address: &Address,
        amount_sat: i64,
    ) -> Result<Transaction, NodeError>;
    async fn fund_raw_transaction(&self, tx: &Transaction) -> Result<Transaction, NodeError>;

    /// Fresh-address heuristic (SPEC_FULL.md §4.5): wallet-owned, not a
    /// change address, never previously received funds.
    async fn is_mine_and_fresh(&self, address: &Address) -> Result<bool, NodeError> {
        let info = self.get_address_info(address).await?;
        if !info.is_mine {
            return Ok(false);
        }
        if let Some(path) = &info.hd_key_path {
            if change_path_regex().is_match(path) {
                return Ok(false);
            }
        }
        let received = self.list_received_by_address().await?;
        let addr_str = address.to_string();
        Ok(!received.iter().any(|a| a == &addr_str))
    }
}

fn change_path_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"m/0'/1'/\d+'").unwrap())
}

/// Production [`NodeClient`], talking to a real `bitcoind` over JSON-RPC.
///
/// Never shared across the request handler and the background monitor
/// (SPEC_FULL.md §4.6/§5) — callers construct a fresh instance per use;
/// construction is cheap (an `RpcClient` clone plus an empty cache cell).
pub struct BitcoinCoreClient {
    client: RpcClient,
    chain: OnceCell<Network>,
}

impl BitcoinCoreClient {
    pub fn new(cfg: &config::BitcoindConfig) -> Self {
        let url = format!("http://{}:{}", cfg.host, cfg.port);
        Self {
            client: RpcClient::new_with_auth(url, &cfg.user, &cfg.pass),
            chain: OnceCell::new(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: &[Value]) -> Result<T, NodeError> {
        let value = self.client.call_method(method, params).await?;
        serde_json::from_value(value).map_err(|e| NodeError::Decode(e.to_string()))
    }

    fn decode_tx(hex_str: &str) -> Result<Transaction, NodeError> {
        let bytes = hex_to_bytes(hex_str)?;
        encode::deserialize(&bytes).map_err(|e| NodeError::Decode(e.to_string()))
    }
}

fn hex_to_bytes(s: &str) -> Result<Vec<u8>, NodeError> {
    fn val(c: u8) -> Result<u8, NodeError> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(NodeError::Decode(format!("invalid hex byte: {}", c as char))),
        }
    }
    let s = s.as_bytes();
    if s.len() % 2 != 0 {
        return Err(NodeError::Decode("odd-length hex string".into()));
    }
    s.chunks(2)
        .map(|pair| Ok(val(pair[0])? << 4 | val(pair[1])?))
        .collect()
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    chain: String,
}

#[derive(Debug, Deserialize)]
struct UnspentEntry {
    txid: String,
    vout: u32,
    #[serde(rename = "scriptPubKey")]
    script_pubkey: String,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct GetTxOutResult {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pubkey: ScriptPubKeyHex,
}

#[derive(Debug, Deserialize)]
struct ScriptPubKeyHex {
    hex: String,
}

#[derive(Debug, Deserialize)]
struct GetAddressInfoResult {
    ismine: bool,
    hdkeypath: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceivedByAddressEntry {
    address: String,
}

#[derive(Debug, Deserialize)]
struct TestMempoolAcceptEntry {
    allowed: bool,
}

#[derive(Debug, Deserialize)]
struct SignRawTransactionResult {
    hex: String,
    complete: bool,
}

#[derive(Debug, Deserialize)]
struct FundRawTransactionResult {
    hex: String,
}

#[async_trait]
impl NodeClient for BitcoinCoreClient {
    async fn get_chain_params(&self) -> Result<Network, NodeError> {
        let chain = self
            .chain
            .get_or_try_init(|| async {
                let info: BlockchainInfo = self.call("getblockchaininfo", &[]).await?;
                match info.chain.as_str() {
                    "main" => Ok(Network::Bitcoin),
                    "test" => Ok(Network::Testnet),
                    "signet" => Ok(Network::Signet),
                    "regtest" => Ok(Network::Regtest),
                    other => Err(NodeError::UnknownChain(other.to_string())),
                }
            })
            .await?;
        Ok(*chain)
    }

    async fn get_new_address(&self) -> Result<Address<NetworkUnchecked>, NodeError> {
        let addr: String = self.call("getnewaddress", &[]).await?;
        Ok(Address::from_str(&addr)?)
    }

    async fn list_unspent(&self) -> Result<Vec<Utxo>, NodeError> {
        let entries: Vec<UnspentEntry> = self.call("listunspent", &[json!(0)]).await?;
        entries
            .into_iter()
            .map(|e| {
                let txid = Txid::from_str(&e.txid).map_err(|err| NodeError::Decode(err.to_string()))?;
                let script = ScriptBuf::from_bytes(hex_to_bytes(&e.script_pubkey)?);
                Ok(Utxo {
                    outpoint: OutPoint::new(txid, e.vout),
                    script_pubkey: script,
                    amount_sat: btc_to_sat(e.amount),
                })
            })
            .collect()
    }

    async fn get_tx_out(&self, txid: Txid, vout: u32) -> Result<Option<TxOutInfo>, NodeError> {
        let value = self
            .client
            .call_method("gettxout", &[json!(txid.to_string()), json!(vout), json!(false)])
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let result: GetTxOutResult =
            serde_json::from_value(value).map_err(|e| NodeError::Decode(e.to_string()))?;
        Ok(Some(TxOutInfo {
            script_pubkey: ScriptBuf::from_bytes(hex_to_bytes(&result.script_pubkey.hex)?),
            value_sat: btc_to_sat(result.value),
        }))
    }

    async fn get_address_info(&self, address: &Address) -> Result<AddressInfo, NodeError> {
        let result: GetAddressInfoResult = self
            .call("getaddressinfo", &[json!(address.to_string())])
            .await?;
        Ok(AddressInfo {
            is_mine: result.ismine,
            hd_key_path: result.hdkeypath,
        })
    }

    async fn list_received_by_address(&self) -> Result<Vec<String>, NodeError> {
        let entries: Vec<ReceivedByAddressEntry> =
            self.call("listreceivedbyaddress", &[]).await?;
        Ok(entries.into_iter().map(|e| e.address).collect())
    }

    async fn test_mempool_accept(&self, tx: &Transaction) -> Result<bool, NodeError> {
        let tx_hex = bytes_to_hex(&encode::serialize(tx));
        let results: Vec<TestMempoolAcceptEntry> = self
            .call("testmempoolaccept", &[json!([tx_hex])])
            .await?;
        Ok(results.first().map(|r| r.allowed).unwrap_or(false))
    }

    async fn sign_raw_transaction_with_wallet(
        &self,
        tx: &Transaction,
    ) -> Result<SignResult, NodeError> {
        let tx_hex = bytes_to_hex(&encode::serialize(tx));
        let result: SignRawTransactionResult =
            self.call("signrawtransactionwithwallet", &[json!(tx_hex)]).await?;
        Ok(SignResult {
            tx: Self::decode_tx(&result.hex)?,
            complete: result.complete,
        })
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, NodeError> {
        let tx_hex = bytes_to_hex(&encode::serialize(tx));
        let txid_str: String = self.call("sendrawtransaction", &[json!(tx_hex)]).await?;
        Txid::from_str(&txid_str).map_err(|e| NodeError::Decode(e.to_string()))
    }

    async fn get_mempool_entry(&self, txid: Txid) -> Result<bool, NodeError> {
        // The node rejects unknown txids with an RPC error; that error is
        // swallowed and treated as "not present" rather than propagated,
        // matching the original this is ported from (see SPEC_FULL.md §4.1).
        match self
            .client
            .call_method("getmempoolentry", &[json!(txid.to_string())])
            .await
        {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn create_raw_transaction(
        &self,
        address: &Address,
        amount_sat: i64,
    ) -> Result<Transaction, NodeError> {
        let amount_btc = amount_sat as f64 / 100_000_000.0;
        let outputs = json!({ address.to_string(): amount_btc });
        let tx_hex: String = self
            .call("createrawtransaction", &[json!([]), outputs])
            .await?;
        Self::decode_tx(&tx_hex)
    }

    async fn fund_raw_transaction(&self, tx: &Transaction) -> Result<Transaction, NodeError> {
        let tx_hex = bytes_to_hex(&encode::serialize(tx));
        let result: FundRawTransactionResult =
            self.call("fundrawtransaction", &[json!(tx_hex)]).await?;
        Self::decode_tx(&result.hex)
    }
}

fn btc_to_sat(amount_btc: f64) -> i64 {
    (amount_btc * 100_000_000.0).round() as i64
}
