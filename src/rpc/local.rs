//! In-process transport
//!
//! Routes calls straight to the dispatchers of nodes living in the same
//! process. Nodes can be marked down to simulate unreachable peers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use super::{Dispatcher, Request, Response, Rpc};
use crate::error::TransportError;
use crate::types::NodeName;

/// Network of in-process nodes
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeName, Arc<Dispatcher>>>,
    down: RwLock<HashSet<NodeName>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable through this network
    pub fn register(&self, node: NodeName, dispatcher: Arc<Dispatcher>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node, dispatcher);
    }

    /// Mark `node` unreachable (or reachable again)
    pub fn set_down(&self, node: &NodeName, down: bool) {
        let mut set = self.down.write().unwrap_or_else(|e| e.into_inner());
        if down {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    fn dispatcher(&self, node: &NodeName) -> Option<Arc<Dispatcher>> {
        if self
            .down
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(node)
        {
            return None;
        }
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .cloned()
    }
}

#[async_trait::async_trait]
impl Rpc for LocalNetwork {
    async fn call(&self, node: &NodeName, request: Request) -> Result<Response, TransportError> {
        let dispatcher = self
            .dispatcher(node)
            .ok_or_else(|| TransportError::Unreachable {
                node: node.clone(),
                reason: "node is down".into(),
            })?;
        Ok(dispatcher.handle(request).await)
    }
}
