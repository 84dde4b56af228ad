//! Cluster placement and request proxying.
//!
//! Every flow lives on exactly one node. The manager maps a flow id to a
//! stable shard and the shard to a node; the proxy forwards unary commands to
//! the owning node and fans streaming subscriptions across the cluster.
//! Remote nodes are reached through the [`FlowNodeClient`] interface; the
//! RPC transport behind it is not part of this crate.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, SelectAll, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::model::{FlowCommand, FlowError, FlowId, FlowResponse, LifecycleEvent};
use crate::supervisor::SupervisorHandle;

pub type LifecycleStream = BoxStream<'static, anyhow::Result<LifecycleEvent>>;

/// A node that can execute flow commands. Implemented locally by the
/// supervisor and remotely by the RPC client layer.
#[async_trait]
pub trait FlowNodeClient: Send + Sync {
    async fn submit(&self, flow_id: FlowId, command: FlowCommand)
        -> Result<FlowResponse, FlowError>;

    /// Stream of lifecycle notices from this node's flows.
    fn lifecycle_stream(&self) -> LifecycleStream;
}

/// In-process node backed by the local supervisor.
pub struct LocalFlowNode {
    supervisor: SupervisorHandle,
}

impl LocalFlowNode {
    pub fn new(supervisor: SupervisorHandle) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl FlowNodeClient for LocalFlowNode {
    async fn submit(
        &self,
        flow_id: FlowId,
        command: FlowCommand,
    ) -> Result<FlowResponse, FlowError> {
        self.supervisor.submit(flow_id, command).await
    }

    fn lifecycle_stream(&self) -> LifecycleStream {
        BroadcastStream::new(self.supervisor.subscribe_lifecycle())
            .map(|item| item.map_err(anyhow::Error::new))
            .boxed()
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of shards flows are hashed into. Fixed for the lifetime of the
    /// cluster so placement stays stable as long as membership does.
    pub shard_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig { shard_count: 1024 }
    }
}

/// Shard-to-node placement over a fixed membership list.
pub struct ClusterManager {
    config: ClusterConfig,
    nodes: Vec<Arc<dyn FlowNodeClient>>,
}

impl ClusterManager {
    pub fn new(
        config: ClusterConfig,
        nodes: Vec<Arc<dyn FlowNodeClient>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!nodes.is_empty(), "cluster requires at least one node");
        anyhow::ensure!(config.shard_count > 0, "shard count must be positive");
        Ok(ClusterManager { config, nodes })
    }

    pub fn shard_for(&self, flow_id: FlowId) -> u32 {
        let mut hasher = DefaultHasher::new();
        flow_id.hash(&mut hasher);
        (hasher.finish() % self.config.shard_count as u64) as u32
    }

    pub fn node_index(&self, flow_id: FlowId) -> usize {
        (self.shard_for(flow_id) as usize) % self.nodes.len()
    }

    pub fn client_for(&self, flow_id: FlowId) -> &Arc<dyn FlowNodeClient> {
        &self.nodes[self.node_index(flow_id)]
    }

    pub fn clients(&self) -> &[Arc<dyn FlowNodeClient>] {
        &self.nodes
    }
}

/// Forwards each request to the node owning its flow.
pub struct ClusterProxy {
    manager: Arc<ClusterManager>,
}

impl ClusterProxy {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        ClusterProxy { manager }
    }

    /// Create a new flow: mint its id, then route the creation to the owning
    /// node.
    pub async fn create_graph(&self, function_id: impl Into<String>) -> Result<FlowId, FlowError> {
        let flow_id = FlowId::generate();
        debug!(flow_id = %flow_id, node = self.manager.node_index(flow_id), "proxying create");
        let response = self
            .manager
            .client_for(flow_id)
            .submit(
                flow_id,
                FlowCommand::CreateGraph {
                    function_id: function_id.into(),
                },
            )
            .await?;
        match response {
            FlowResponse::GraphCreated { flow_id } => Ok(flow_id),
            other => {
                debug!(flow_id = %flow_id, ?other, "unexpected create response");
                Err(FlowError::GraphNotFound { flow_id })
            }
        }
    }

    /// Forward a unary command to the owning node.
    pub async fn submit(
        &self,
        flow_id: FlowId,
        command: FlowCommand,
    ) -> Result<FlowResponse, FlowError> {
        self.manager.client_for(flow_id).submit(flow_id, command).await
    }

    /// Per-flow event stream, served by the single owning node.
    pub async fn stream_events(&self, flow_id: FlowId) -> Result<FlowResponse, FlowError> {
        self.submit(flow_id, FlowCommand::StreamEvents).await
    }

    /// Cluster-wide lifecycle stream: every node's stream merged. The first
    /// failure from any backend ends the merged stream.
    pub fn stream_lifecycle(&self) -> LifecycleStream {
        let mut merged: SelectAll<LifecycleStream> = SelectAll::new();
        for node in self.manager.clients() {
            merged.push(node.lifecycle_stream());
        }
        merged
            .scan(false, |errored, item| {
                if *errored {
                    return futures::future::ready(None);
                }
                if item.is_err() {
                    *errored = true;
                }
                futures::future::ready(Some(item))
            })
            .boxed()
    }
}
