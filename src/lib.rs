//! Self-healing line-delimited JSON-RPC client.
//!
//! ARCHITECTURE
//! ============
//! - [`connection`]: TCP connection actor with reconnect and backoff
//! - [`rpc`]: correlation of calls and responses, session upgrade to TLS
//! - [`proxy`]: typed calls for the proxy admin service
//!
//! Wire frames live in the `frames` crate.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod rpc;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigPatch, ConnectionConfig, SessionMode, TlsMaterial};
pub use connection::{ConnectionEvent, ConnectionState, DurableConnection, Link};
pub use error::{ClientError, ConfigError, HandshakeError, ProtocolError, TransportError};
pub use frames::{Id, Response, RpcError};
pub use proxy::{Output, ProxyClient, Tunnel, TunnelsConfig};
pub use rpc::pending::{CONNECTION_CLOSED_CODE, TIMEOUT_CODE};
pub use rpc::{InvokeOptions, RpcClient, SessionStatus};
