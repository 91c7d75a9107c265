//! RPC Module
//!
//! Request/response calls between nodes: the `Rpc` seam, a framed TCP
//! transport, an in-process transport and the dispatcher that serves
//! incoming requests.

pub mod protocol;
mod client;
mod server;
mod local;
mod dispatch;

pub use protocol::{Request, Response, FrameHeader};
pub use client::TcpRpc;
pub use server::RpcServer;
pub use local::LocalNetwork;
pub use dispatch::Dispatcher;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result, TransportError};
use crate::types::{NodeName, Record, Value};

/// Synchronous request/response call to another node.
///
/// `Err` means the call itself failed (the `badrpc` case); failures on the
/// remote side come back as `Response::Failed`.
#[async_trait::async_trait]
pub trait Rpc: Send + Sync {
    async fn call(
        &self,
        node: &NodeName,
        request: Request,
    ) -> std::result::Result<Response, TransportError>;
}

/// Call `node` and turn a remote failure into an `Error`
pub async fn call(rpc: &dyn Rpc, node: &NodeName, request: Request) -> Result<Response> {
    match rpc.call(node, request).await? {
        Response::Failed { code, message } => Err(Error::from_remote(code, message)),
        other => Ok(other),
    }
}

/// Call expecting `Response::Ok`
pub async fn call_unit(rpc: &dyn Rpc, node: &NodeName, request: Request) -> Result<()> {
    match call(rpc, node, request).await? {
        Response::Ok => Ok(()),
        other => Err(unexpected(node, &other)),
    }
}

/// Call expecting `Response::Value`
pub async fn call_value(rpc: &dyn Rpc, node: &NodeName, request: Request) -> Result<Value> {
    match call(rpc, node, request).await? {
        Response::Value(value) => Ok(value),
        other => Err(unexpected(node, &other)),
    }
}

/// Call expecting `Response::Nodes`
pub async fn call_nodes(rpc: &dyn Rpc, node: &NodeName, request: Request) -> Result<Vec<NodeName>> {
    match call(rpc, node, request).await? {
        Response::Nodes(nodes) => Ok(nodes),
        other => Err(unexpected(node, &other)),
    }
}

/// Call expecting `Response::Records`
pub async fn call_records(rpc: &dyn Rpc, node: &NodeName, request: Request) -> Result<Vec<Record>> {
    match call(rpc, node, request).await? {
        Response::Records(records) => Ok(records),
        other => Err(unexpected(node, &other)),
    }
}

/// A reply of the wrong shape is a protocol failure
pub fn unexpected(node: &NodeName, response: &Response) -> Error {
    TransportError::Protocol {
        node: node.clone(),
        reason: format!("unexpected reply {}", response.type_name()),
    }
    .into()
}

/// Read a framed message from a reader
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Internal(format!("Frame too large: {} bytes", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Internal("Frame checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(message)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Request::Replicants).await.unwrap();
        let req: Request = read_frame(&mut b).await.unwrap();
        assert!(matches!(req, Request::Replicants));
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = bincode::serialize(&Request::Role).unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let result: Result<Request> = read_frame(&mut b).await;
        assert!(result.is_err());
    }
}
