//! RPC Client
//!
//! TCP client for calling other nodes. One connection per call; the node
//! name is dialed as a `host:port` address.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_frame, write_frame, Request, Response, Rpc};
use crate::error::{Error, TransportError};
use crate::types::NodeName;

/// TCP transport for `Rpc`
pub struct TcpRpc {
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout (covers connect, send and receive)
    request_timeout: Duration,
}

impl TcpRpc {
    /// Create a new RPC client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Connect to a node
    async fn connect(&self, node: &NodeName) -> Result<TcpStream, TransportError> {
        let result = timeout(self.connect_timeout, TcpStream::connect(node.as_str())).await;

        match result {
            Ok(Ok(stream)) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| TransportError::Unreachable {
                        node: node.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::Unreachable {
                node: node.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout(node.clone())),
        }
    }

    /// Send without timeout wrapper
    async fn call_inner(
        &self,
        node: &NodeName,
        request: &Request,
    ) -> Result<Response, TransportError> {
        let mut stream = self.connect(node).await?;
        let (mut reader, mut writer) = stream.split();

        let io_failure = |e: Error| match e {
            Error::Io(io) => TransportError::Unreachable {
                node: node.clone(),
                reason: io.to_string(),
            },
            other => TransportError::Protocol {
                node: node.clone(),
                reason: other.to_string(),
            },
        };

        write_frame(&mut writer, request).await.map_err(io_failure)?;
        read_frame(&mut reader).await.map_err(io_failure)
    }
}

#[async_trait::async_trait]
impl Rpc for TcpRpc {
    async fn call(&self, node: &NodeName, request: Request) -> Result<Response, TransportError> {
        tracing::trace!("Calling {} on {}", request.type_name(), node);

        match timeout(self.request_timeout, self.call_inner(node, &request)).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    tracing::debug!("{} to {} failed: {}", request.type_name(), node, e);
                }
                result
            }
            Err(_) => Err(TransportError::Timeout(node.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        let client = TcpRpc::new(Duration::from_millis(100), Duration::from_millis(500));

        // Nothing listens on port 1
        let result = client.call(&NodeName::from("127.0.0.1:1"), Request::Role).await;
        assert!(matches!(
            result,
            Err(TransportError::Unreachable { .. }) | Err(TransportError::Timeout(_))
        ));
    }
}
