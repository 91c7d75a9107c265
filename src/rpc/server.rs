//! RPC Server
//!
//! TCP server accepting calls from other nodes and answering them through
//! the `Dispatcher`.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::{read_frame, write_frame, Dispatcher, Request};
use crate::error::{Error, Result};

/// RPC server for cluster communication
pub struct RpcServer {
    /// Bind address
    bind_address: String,
    /// Serves decoded requests
    dispatcher: Arc<Dispatcher>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl RpcServer {
    /// Create a new RPC server
    pub fn new(bind_address: String, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            dispatcher,
            shutdown: shutdown_tx,
        }
    }

    /// Start the server
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("RPC server listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let dispatcher = Arc::clone(&self.dispatcher);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, dispatcher).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("RPC server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve requests on one connection until the peer hangs up
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    dispatcher: Arc<Dispatcher>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_frame::<Request, _>(&mut reader).await {
            Ok(request) => {
                tracing::trace!("Received {} from {}", request.type_name(), peer_addr);
                let response = dispatcher.handle(request).await;
                write_frame(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading request: {}", e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::ErrorCode;
    use crate::node::{ClusterNode, NodeOptions};
    use crate::role::Role;
    use crate::rpc::{LocalNetwork, Response, Rpc, TcpRpc};
    use crate::types::{NodeName, Shard, TxCall, Value};

    #[tokio::test]
    async fn test_calls_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeName::new(listener.local_addr().unwrap().to_string());

        let node = ClusterNode::build(
            NodeOptions::new(addr.clone(), Role::Core),
            Arc::new(LocalNetwork::new()),
        );
        node.start().await.unwrap();

        let server = Arc::new(RpcServer::new(
            addr.to_string(),
            Arc::clone(node.dispatcher()),
        ));
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve(listener).await });

        let client = TcpRpc::new(Duration::from_secs(1), Duration::from_secs(2));
        let response = client.call(&addr, Request::Role).await.unwrap();
        assert!(matches!(response, Response::Role(Role::Core)));

        // Remote failures come back as a response, not a transport error
        let call = TxCall::new("no.such.procedure", Value::Null);
        let response = client
            .call(
                &addr,
                Request::Transaction {
                    shard: Shard::LocalContent,
                    call,
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            response,
            Response::Failed {
                code: ErrorCode::UnknownProcedure,
                ..
            }
        ));

        server.stop();
        handle.await.unwrap().unwrap();
    }
}
