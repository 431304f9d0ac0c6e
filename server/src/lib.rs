// server/src/lib.rs

//! The HTTP boundary a receiver exposes to senders (SPEC_FULL.md §4.5, §7).
//!
//! Two routes: `POST /` accepts a sender's template transaction and returns
//! the assembled partial, and `GET /get-newish-address` hands out a payment
//! address, reusing the last one handed out as long as it's still fresh.
//! Grounded on the `HttpServer`/router split in the pack's ldk-node payjoin
//! receiver, adapted from raw `TcpListener` + router to axum's routing and
//! extractor API.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bitcoin::consensus::encode;
use bitcoin::{Address, Transaction};
use node::NodeClient;
use protocol::{assemble, hex_to_bytes, AssembleError, NodeFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Reject anything at or above this many bytes before even looking at the body.
const MAX_BODY_LEN: usize = 100_000;

/// Shared state behind every request handler.
pub struct AppState {
    node: Arc<dyn NodeClient>,
    monitor_factory: NodeFactory,
    data_dir: PathBuf,
    cached_address: Mutex<Option<Address>>,
}

impl AppState {
    pub fn new(node: Arc<dyn NodeClient>, monitor_factory: NodeFactory, data_dir: PathBuf) -> Self {
        Self {
            node,
            monitor_factory,
            data_dir,
            cached_address: Mutex::new(None),
        }
    }
}

/// Build the router without binding a listener — split out so tests can
/// drive it with `tower::ServiceExt::oneshot`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(receive_template))
        .route("/get-newish-address", get(get_newish_address))
        .with_state(state)
}

/// Bind `port` and serve until a shutdown signal arrives.
pub async fn serve(port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(%port, "listening for payjoin requests");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining in-flight requests");
}

async fn receive_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_length = match headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        Some(len) => len,
        None => return (StatusCode::BAD_REQUEST, "missing Content-Length".to_string()).into_response(),
    };
    if content_length >= MAX_BODY_LEN {
        return (StatusCode::BAD_REQUEST, "request body too large".to_string()).into_response();
    }

    let is_text_plain = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == "text/plain")
        .unwrap_or(false);

    let raw = if is_text_plain {
        let text = match std::str::from_utf8(&body) {
            Ok(text) => text,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "body is not valid UTF-8 hex".to_string())
                    .into_response()
            }
        };
        match hex_to_bytes(text.trim()) {
            Ok(bytes) => bytes,
            Err(err) => {
                return (StatusCode::BAD_REQUEST, format!("could not hex-decode body: {err}"))
                    .into_response()
            }
        }
    } else {
        body.to_vec()
    };

    let template: Transaction = match encode::deserialize(&raw) {
        Ok(tx) => tx,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("could not decode template transaction: {err}"),
            )
                .into_response()
        }
    };

    match assemble(
        state.node.clone(),
        state.monitor_factory.clone(),
        &state.data_dir,
        &template,
    )
    .await
    {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(AssembleError::Client(reason)) => (StatusCode::BAD_REQUEST, reason).into_response(),
        Err(AssembleError::Node(err)) => {
            error!(error = %err, "node error while assembling partial transaction");
            (StatusCode::BAD_REQUEST, "request could not be processed".to_string()).into_response()
        }
        Err(AssembleError::Fatal(msg)) => {
            error!(%msg, "invariant violation while assembling partial transaction");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
        }
    }
}

async fn get_newish_address(State(state): State<Arc<AppState>>) -> Response {
    let mut cached = state.cached_address.lock().await;
    if let Some(address) = cached.as_ref() {
        match state.node.is_mine_and_fresh(address).await {
            Ok(true) => return address.to_string().into_response(),
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "freshness check failed, issuing a new address anyway");
            }
        }
    }

    let address = match issue_address(&state).await {
        Ok(address) => address,
        Err(err) => {
            error!(error = %err, "failed to generate a new address");
            return (StatusCode::BAD_REQUEST, "request could not be processed".to_string())
                .into_response();
        }
    };
    *cached = Some(address.clone());
    address.to_string().into_response()
}

async fn issue_address(state: &AppState) -> Result<Address, node::NodeError> {
    let unchecked = state.node.get_new_address().await?;
    let network = state.node.get_chain_params().await?;
    unchecked
        .require_network(network)
        .map_err(node::NodeError::Address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bitcoin::address::NetworkUnchecked;
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, Txid, WPubkeyHash};
    use http_body_util::BodyExt;
    use node::{AddressInfo, NodeError, SignResult, TxOutInfo, Utxo};
    use std::str::FromStr;
    use tower::ServiceExt;

    struct MockNode {
        address: Address,
    }

    #[async_trait]
    impl NodeClient for MockNode {
        async fn get_chain_params(&self) -> Result<Network, NodeError> {
            Ok(Network::Regtest)
        }
        async fn get_new_address(&self) -> Result<Address<NetworkUnchecked>, NodeError> {
            Ok(Address::from_str(&self.address.to_string()).unwrap())
        }
        async fn list_unspent(&self) -> Result<Vec<Utxo>, NodeError> {
            Ok(vec![])
        }
        async fn get_tx_out(&self, _txid: Txid, _vout: u32) -> Result<Option<TxOutInfo>, NodeError> {
            Ok(None)
        }
        async fn get_address_info(&self, _address: &Address) -> Result<AddressInfo, NodeError> {
            Ok(AddressInfo {
                is_mine: true,
                hd_key_path: None,
            })
        }
        async fn list_received_by_address(&self) -> Result<Vec<String>, NodeError> {
            Ok(vec![])
        }
        async fn test_mempool_accept(&self, _tx: &Transaction) -> Result<bool, NodeError> {
            Ok(true)
        }
        async fn sign_raw_transaction_with_wallet(
            &self,
            tx: &Transaction,
        ) -> Result<SignResult, NodeError> {
            Ok(SignResult {
                tx: tx.clone(),
                complete: true,
            })
        }
        async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, NodeError> {
            Ok(tx.compute_txid())
        }
        async fn get_mempool_entry(&self, _txid: Txid) -> Result<bool, NodeError> {
            Ok(true)
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

    fn test_address() -> Address {
        let hash = WPubkeyHash::from_byte_array([0x42; 20]);
        Address::from_script(&bitcoin::ScriptBuf::new_p2wpkh(&hash), Network::Regtest).unwrap()
    }

    fn test_state() -> Arc<AppState> {
        let node: Arc<dyn NodeClient> = Arc::new(MockNode {
            address: test_address(),
        });
        let factory: NodeFactory = {
            let node = node.clone();
            Arc::new(move || node.clone())
        };
        Arc::new(AppState::new(
            node,
            factory,
            std::env::temp_dir().join("bustapay-server-test"),
        ))
    }

    #[tokio::test]
    async fn newish_address_returns_and_caches() {
        let state = test_state();
        let app = router(state.clone());

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/get-newish-address")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            test_address().to_string()
        );
    }

    #[tokio::test]
    async fn rejects_garbage_template() {
        let state = test_state();
        let app = router(state);

        let body = vec![0xff, 0x00, 0x01];
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_LENGTH, body.len())
            .body(axum::body::Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_missing_content_length() {
        let state = test_state();
        let app = router(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .body(axum::body::Body::from(vec![0u8; 4]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), "missing Content-Length");
    }

    #[tokio::test]
    async fn rejects_oversized_content_length() {
        let state = test_state();
        let app = router(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_LENGTH, 100_000)
            .body(axum::body::Body::from(vec![0u8; 4]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), "request body too large");
    }

    #[tokio::test]
    async fn hex_body_is_decoded_before_raw_bytes_would_be() {
        let state = test_state();
        let app = router(state);

        // Not a valid transaction, but valid hex — should get past decoding
        // into a "could not decode template transaction" error, not a
        // hex-decode error, proving the text/plain branch ran.
        let hex_body = "deadbeef".to_string();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, hex_body.len())
            .body(axum::body::Body::from(hex_body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("could not decode template transaction"), "{text}");
    }
}
