//! Per-node supervision and routing of graph actors.
//!
//! The supervisor exclusively owns the set of live graph actors. Any message
//! carrying a flow id is routed to the owning actor, demand-spawning it if it
//! is not resident (journal replay hydrates it). Actors ask to be evicted
//! when idle; a crashed or evicted actor is respawned on the next message for
//! its flow.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::{
    spawn_graph_actor, DeactivateGraph, GraphActorConfig, GraphActorHandle, GraphRequest,
};
use crate::executor::ExecutorHandle;
use crate::journal::EventJournal;
use crate::model::{FlowCommand, FlowError, FlowId, FlowResponse, LifecycleEvent, Routable};

enum SupervisorMessage {
    Route(GraphRequest),
    LiveFlowCount(oneshot::Sender<usize>),
}

/// Cloneable front door to the node's flows.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorMessage>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl SupervisorHandle {
    /// Submit a command for a flow and await its typed response.
    pub async fn submit(
        &self,
        flow_id: FlowId,
        command: FlowCommand,
    ) -> Result<FlowResponse, FlowError> {
        let (reply, rx) = oneshot::channel();
        let request = GraphRequest {
            flow_id,
            command,
            reply,
        };
        if self
            .tx
            .send(SupervisorMessage::Route(request))
            .await
            .is_err()
        {
            return Err(FlowError::GraphNotFound { flow_id });
        }
        rx.await
            .unwrap_or(Err(FlowError::GraphNotFound { flow_id }))
    }

    /// Subscribe to graph lifecycle notices for every flow on this node.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Number of resident graph actors, for diagnostics.
    pub async fn live_flow_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorMessage::LiveFlowCount(reply))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub struct Supervisor {
    handle: SupervisorHandle,
    task: JoinHandle<()>,
}

impl Supervisor {
    pub fn start(
        journal: Arc<dyn EventJournal>,
        executor: ExecutorHandle,
        actor_config: GraphActorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (deactivate_tx, deactivate_rx) = mpsc::channel(64);
        let (lifecycle_tx, _) = broadcast::channel(256);

        let inner = SupervisorTask {
            journal,
            executor,
            actor_config,
            children: HashMap::new(),
            deactivate_tx,
            lifecycle_tx: lifecycle_tx.clone(),
        };
        info!("starting graph supervisor");
        let task = tokio::spawn(inner.run(rx, deactivate_rx));
        Supervisor {
            handle: SupervisorHandle { tx, lifecycle_tx },
            task,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) {
        drop(self.handle);
        let _ = self.task.await;
    }
}

struct SupervisorTask {
    journal: Arc<dyn EventJournal>,
    executor: ExecutorHandle,
    actor_config: GraphActorConfig,
    children: HashMap<FlowId, GraphActorHandle>,
    deactivate_tx: mpsc::Sender<DeactivateGraph>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl SupervisorTask {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SupervisorMessage>,
        mut deactivate_rx: mpsc::Receiver<DeactivateGraph>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(SupervisorMessage::Route(request)) => self.route(request).await,
                        Some(SupervisorMessage::LiveFlowCount(reply)) => {
                            let _ = reply.send(self.children.len());
                        }
                        None => break,
                    }
                }
                notice = deactivate_rx.recv() => {
                    if let Some(notice) = notice {
                        self.deactivate(notice).await;
                    }
                }
            }
        }
        for (_, child) in self.children.drain() {
            child.stop().await;
        }
        debug!("graph supervisor stopped");
    }

    async fn route(&mut self, request: GraphRequest) {
        let flow_id = request.flow_id();
        let child = self.child_for(flow_id);
        // The actor answers the caller directly; a mailbox that closed
        // between lookup and send means the actor died, so respawn once.
        if let Err(request) = child.forward(request).await {
            warn!(flow_id = %flow_id, "graph actor mailbox closed, respawning");
            self.children.remove(&flow_id);
            let child = self.child_for(flow_id);
            if let Err(request) = child.forward(request).await {
                let _ = request.reply.send(Err(FlowError::GraphNotFound { flow_id }));
            }
        }
    }

    /// Fetch the live child for a flow, respawning if it is gone. A respawn
    /// replays the journal; an empty journal makes the actor answer
    /// `GraphNotFound` for anything but `CreateGraph`.
    fn child_for(&mut self, flow_id: FlowId) -> GraphActorHandle {
        let respawn = match self.children.get(&flow_id) {
            Some(child) if !child.is_closed() => return child.clone(),
            Some(_) => {
                warn!(flow_id = %flow_id, "graph actor is gone, respawning");
                true
            }
            None => false,
        };
        if !respawn {
            debug!(flow_id = %flow_id, "spawning graph actor");
        }
        let child = spawn_graph_actor(
            flow_id,
            Arc::clone(&self.journal),
            self.executor.clone(),
            self.deactivate_tx.clone(),
            self.lifecycle_tx.clone(),
            self.actor_config.clone(),
        );
        self.children.insert(flow_id, child.clone());
        child
    }

    async fn deactivate(&mut self, notice: DeactivateGraph) {
        if let Some(child) = self.children.remove(&notice.flow_id) {
            child.stop().await;
            debug!(flow_id = %notice.flow_id, "evicted graph actor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::journal::InMemoryJournal;
    use crate::model::{CompletionOperation, CompletionResult, Datum};
    use std::time::Duration;

    fn test_supervisor(actor_config: GraphActorConfig) -> (Supervisor, Arc<InMemoryJournal>) {
        let journal = Arc::new(InMemoryJournal::new());
        let blobs = Arc::new(crate::blobs::InMemoryBlobStore::new());
        let executor = Executor::start(ExecutorConfig::new("http://127.0.0.1:1"), blobs);
        let supervisor = Supervisor::start(
            Arc::clone(&journal) as Arc<dyn EventJournal>,
            executor.handle(),
            actor_config,
        );
        (supervisor, journal)
    }

    #[tokio::test]
    async fn create_route_and_reject_duplicates() {
        let (supervisor, _journal) = test_supervisor(GraphActorConfig::default());
        let handle = supervisor.handle();
        let flow_id = FlowId::generate();

        let response = handle
            .submit(
                flow_id,
                FlowCommand::CreateGraph {
                    function_id: "app/fn".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(response, FlowResponse::GraphCreated { .. }));

        let err = handle
            .submit(
                flow_id,
                FlowCommand::CreateGraph {
                    function_id: "app/fn".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::GraphAlreadyExists { flow_id });
    }

    #[tokio::test]
    async fn unknown_flow_returns_graph_not_found() {
        let (supervisor, _journal) = test_supervisor(GraphActorConfig::default());
        let handle = supervisor.handle();
        let err = handle
            .submit(FlowId::generate(), FlowCommand::GetGraphState)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::GraphNotFound { .. }));
    }

    #[tokio::test]
    async fn evicted_flow_is_rehydrated_from_the_journal() {
        let (supervisor, _journal) = test_supervisor(GraphActorConfig {
            inactivity_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_millis(50),
        });
        let handle = supervisor.handle();
        let flow_id = FlowId::generate();

        handle
            .submit(
                flow_id,
                FlowCommand::CreateGraph {
                    function_id: "app/fn".into(),
                },
            )
            .await
            .unwrap();
        handle
            .submit(
                flow_id,
                FlowCommand::AddCompletedValueStage {
                    result: CompletionResult::success(Datum::Empty),
                },
            )
            .await
            .unwrap();
        assert_eq!(handle.live_flow_count().await, 1);

        // Idle past the inactivity timeout; the actor asks to be evicted.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.live_flow_count().await, 0);

        // The next message respawns the actor and replays its state.
        let response = handle
            .submit(flow_id, FlowCommand::GetGraphState)
            .await
            .unwrap();
        match response {
            FlowResponse::GraphState(state) => {
                assert_eq!(state.stages.len(), 1);
                assert_eq!(
                    state.stages.values().next().unwrap().operation,
                    CompletionOperation::CompletedValue
                );
            }
            other => panic!("expected graph state, got {other:?}"),
        }
        assert_eq!(handle.live_flow_count().await, 1);
    }
}
