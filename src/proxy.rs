//! Typed calls to the proxy admin service.
//!
//! Each operation builds its params, invokes a fixed method name and unwraps
//! the response into an [`Output`]. Reconnect, correlation and timeouts all
//! come from the underlying [`RpcClient`].

use frames::{Response, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::rpc::{InvokeOptions, RpcClient};

pub const METHOD_MULTIPLY: &str = "AdminServiceRFC.Multiply";
pub const METHOD_UPDATE_TUNNELS_CONFIG: &str = "AdminServiceRFC.UpdateTunnelsConfig";

/// One tunnel entry of the proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    #[serde(rename = "type")]
    pub kind: String,
    pub network: String,
    pub address: String,
    pub username: String,
    pub password: String,
    pub connection_num: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelsConfig {
    pub tunnels: Vec<Tunnel>,
}

/// Unwrapped call outcome. A `null` result counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Output {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl From<Response> for Output {
    fn from(response: Response) -> Self {
        match response {
            Response::Success(success) => Self { result: Some(success.result).filter(|v| !v.is_null()), error: None },
            Response::Failure(failure) => Self { result: None, error: Some(failure.error) },
        }
    }
}

#[derive(Clone)]
pub struct ProxyClient {
    rpc: RpcClient,
}

impl ProxyClient {
    /// # Errors
    ///
    /// Same as [`RpcClient::new`].
    pub fn new(config: ConnectionConfig) -> Result<Self, ClientError> {
        Ok(Self { rpc: RpcClient::new(config)? })
    }

    #[must_use]
    pub fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    #[must_use]
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// # Errors
    ///
    /// Same as [`RpcClient::connect`].
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.rpc.connect().await
    }

    /// # Errors
    ///
    /// Same as [`RpcClient::disconnect`].
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.rpc.disconnect().await
    }

    /// # Errors
    ///
    /// Same as [`RpcClient::invoke`].
    pub async fn multiply(&self, x: i64, y: i64, options: InvokeOptions) -> Result<Output, ClientError> {
        let response = self.rpc.invoke(METHOD_MULTIPLY, json!({ "x": x, "y": y }), options).await?;
        Ok(response.into())
    }

    /// # Errors
    ///
    /// Same as [`RpcClient::invoke`], plus [`ClientError::Encode`] if the
    /// config cannot be serialized.
    pub async fn update_tunnels_config(&self, config: &TunnelsConfig, options: InvokeOptions) -> Result<Output, ClientError> {
        let params = serde_json::to_value(config).map_err(frames::CodecError::from)?;
        let response = self.rpc.invoke(METHOD_UPDATE_TUNNELS_CONFIG, params, options).await?;
        Ok(response.into())
    }
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod tests;
