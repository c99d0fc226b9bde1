//! cortexctl - command-line client for cortexd

pub mod cli;
pub mod display;
pub mod rpc_client;

pub use rpc_client::{discover_socket_path, ClientError, RpcClient};
