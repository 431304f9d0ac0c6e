// node/src/test_config.rs

use config::{BitcoindConfig, Config};
use std::env;

/// Configuration for a Bitcoin node reachable in a test environment.
///
/// Defaults are:
/// - `rpc_port = 18443` (bitcoind's regtest default)
/// - `rpc_username = "rpcuser"`
/// - `rpc_password = "rpcpassword"`
///
/// Reads `RPC_PORT`, `RPC_USER`, `RPC_PASS` environment variables to override
/// defaults via [`TestConfig::from_env`].
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub rpc_port: u16,
    pub rpc_username: String,
    pub rpc_password: String,
}

impl TestConfig {
    /// Create a `TestConfig`, overriding defaults with environment variables.
    #[allow(clippy::field_reassign_with_default)]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(port_str) = env::var("RPC_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.rpc_port = port;
            }
        }
        if let Ok(user) = env::var("RPC_USER") {
            cfg.rpc_username = user;
        }
        if let Ok(pass) = env::var("RPC_PASS") {
            cfg.rpc_password = pass;
        }
        cfg
    }

    /// Convert this test configuration into a full `Config`.
    pub fn into_config(self) -> Config {
        Config {
            bitcoind: BitcoindConfig {
                host: "127.0.0.1".to_string(),
                port: self.rpc_port,
                user: self.rpc_username,
                pass: self.rpc_password,
            },
            ..Config::default()
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            rpc_port: 18443,
            rpc_username: "rpcuser".to_string(),
            rpc_password: "rpcpassword".to_string(),
        }
    }
}
