//! Event-sourced actor owning one completion graph.
//!
//! One instance per live flow. The actor is the only component that persists
//! events and the only writer of its graph; every mutation flows through its
//! serial mailbox. Listener callbacks from the graph are queued as effects
//! and drained inside the actor loop rather than re-entering the graph, which
//! keeps invariants flat and avoids recursion on deep dependency chains.
//!
//! On start the journal is replayed with triggering suppressed, then
//! [`CompletionGraph::recover`] resumes pending work and delay timers are
//! re-armed from their persisted absolute deadlines.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::executor::{
    ExecutorHandle, ExecutorRequest, FaasInvocationResponse, InvokeFunctionRequest,
    InvokeStageRequest,
};
use crate::graph::{CompletionGraph, GraphListener};
use crate::journal::EventJournal;
use crate::model::{
    BlobRef, CompletionOperation, CompletionResult, Datum, Event, FlowCommand, FlowError, FlowId,
    FlowResponse, LifecycleEvent, Routable, SequencedEvent, StageId, StatusValue,
};

/// Request routed to a flow's actor by the supervisor.
#[derive(Debug)]
pub struct GraphRequest {
    pub flow_id: FlowId,
    pub command: FlowCommand,
    pub reply: oneshot::Sender<Result<FlowResponse, FlowError>>,
}

impl Routable for GraphRequest {
    fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

/// Notice from an actor asking the supervisor to evict it.
#[derive(Debug, Clone, Copy)]
pub struct DeactivateGraph {
    pub flow_id: FlowId,
}

impl Routable for DeactivateGraph {
    fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

#[derive(Debug, Clone)]
pub struct GraphActorConfig {
    /// Idle time before a live graph asks to be passivated.
    pub inactivity_timeout: Duration,
    /// Idle time before a completed graph asks to be passivated, and the
    /// wait budget for `GetStageResult`.
    pub read_timeout: Duration,
}

impl Default for GraphActorConfig {
    fn default() -> Self {
        GraphActorConfig {
            inactivity_timeout: Duration::from_secs(24 * 60 * 60),
            read_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
enum ActorMessage {
    Request(GraphRequest),
    CompleteDelay { stage_id: StageId },
    WaiterTimeout { stage_id: StageId, waiter: u64 },
    Stop,
}

/// Cloneable mailbox address of one graph actor.
#[derive(Clone, Debug)]
pub struct GraphActorHandle {
    tx: mpsc::Sender<ActorMessage>,
}

impl GraphActorHandle {
    /// Send a command and await its typed response.
    ///
    /// Returns `GraphNotFound` if the actor is gone; the supervisor respawns
    /// actors on routing, so callers going through it never observe a
    /// half-dead mailbox.
    pub async fn request(
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
        if self.tx.send(ActorMessage::Request(request)).await.is_err() {
            return Err(FlowError::GraphNotFound { flow_id });
        }
        rx.await
            .unwrap_or(Err(FlowError::GraphNotFound { flow_id }))
    }

    /// Forward a routed request into the mailbox. On a closed mailbox the
    /// request is handed back so the caller can respawn and retry.
    pub(crate) async fn forward(&self, request: GraphRequest) -> Result<(), GraphRequest> {
        self.tx
            .send(ActorMessage::Request(request))
            .await
            .map_err(|e| match e.0 {
                ActorMessage::Request(request) => request,
                _ => unreachable!("only requests are forwarded"),
            })
    }

    /// Ask the actor to stop after the messages already in its mailbox. The
    /// actor holds its own sender for timer callbacks, so dropping handles
    /// alone would never close the mailbox.
    pub(crate) async fn stop(&self) {
        let _ = self.tx.send(ActorMessage::Stop).await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Queued listener callbacks, drained by the actor between messages.
#[derive(Default)]
struct EffectQueue {
    queue: VecDeque<Effect>,
}

enum Effect {
    Execute {
        stage_id: StageId,
        operation: CompletionOperation,
        closure: Option<BlobRef>,
        args: Vec<Datum>,
    },
    Complete {
        stage_id: StageId,
        result: CompletionResult,
    },
    Compose {
        stage_id: StageId,
        composed_stage_id: StageId,
    },
    GraphComplete,
}

impl GraphListener for EffectQueue {
    fn on_execute_stage(
        &mut self,
        stage_id: StageId,
        operation: CompletionOperation,
        closure: Option<BlobRef>,
        args: Vec<Datum>,
    ) {
        self.queue.push_back(Effect::Execute {
            stage_id,
            operation,
            closure,
            args,
        });
    }

    fn on_complete_stage(&mut self, stage_id: StageId, result: CompletionResult) {
        self.queue.push_back(Effect::Complete { stage_id, result });
    }

    fn on_compose_stage(&mut self, stage_id: StageId, composed_stage_id: StageId) {
        self.queue.push_back(Effect::Compose {
            stage_id,
            composed_stage_id,
        });
    }

    fn on_complete_graph(&mut self) {
        self.queue.push_back(Effect::GraphComplete);
    }
}

/// Spawn the actor task for one flow. The journal replays before the first
/// message is handled.
pub fn spawn_graph_actor(
    flow_id: FlowId,
    journal: Arc<dyn EventJournal>,
    executor: ExecutorHandle,
    deactivate_tx: mpsc::Sender<DeactivateGraph>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    config: GraphActorConfig,
) -> GraphActorHandle {
    let (tx, rx) = mpsc::channel(64);
    let (faas_tx, faas_rx) = mpsc::channel(64);
    let (events_tx, _) = broadcast::channel(256);

    let actor = GraphActor {
        flow_id,
        journal,
        executor,
        deactivate_tx,
        lifecycle_tx,
        events_tx,
        config,
        graph: None,
        next_seq: 0,
        self_tx: tx.clone(),
        faas_tx,
        waiters: HashMap::new(),
        next_waiter: 0,
        deactivation_requested: false,
    };
    tokio::spawn(actor.run(rx, faas_rx));
    GraphActorHandle { tx }
}

struct GraphActor {
    flow_id: FlowId,
    journal: Arc<dyn EventJournal>,
    executor: ExecutorHandle,
    deactivate_tx: mpsc::Sender<DeactivateGraph>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    events_tx: broadcast::Sender<SequencedEvent>,
    config: GraphActorConfig,
    graph: Option<CompletionGraph>,
    next_seq: u64,
    self_tx: mpsc::Sender<ActorMessage>,
    faas_tx: mpsc::Sender<FaasInvocationResponse>,
    waiters: HashMap<StageId, Vec<(u64, oneshot::Sender<Result<FlowResponse, FlowError>>)>>,
    next_waiter: u64,
    deactivation_requested: bool,
}

impl GraphActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ActorMessage>,
        mut faas_rx: mpsc::Receiver<FaasInvocationResponse>,
    ) {
        self.replay().await;

        loop {
            let deadline = Instant::now() + self.idle_timeout();
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(ActorMessage::Stop) | None => break,
                        Some(msg) => {
                            self.deactivation_requested = false;
                            self.handle_message(msg).await;
                        }
                    }
                }
                response = faas_rx.recv() => {
                    if let Some(response) = response {
                        self.deactivation_requested = false;
                        self.handle_faas_response(response).await;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.request_deactivation().await;
                }
            }
        }
        debug!(flow_id = %self.flow_id, "graph actor stopped");
    }

    fn idle_timeout(&self) -> Duration {
        match &self.graph {
            Some(graph) if graph.is_completed() => self.config.read_timeout,
            _ => self.config.inactivity_timeout,
        }
    }

    async fn request_deactivation(&mut self) {
        if self.deactivation_requested {
            return;
        }
        self.deactivation_requested = true;
        debug!(flow_id = %self.flow_id, "requesting passivation of idle actor");
        let _ = self
            .deactivate_tx
            .send(DeactivateGraph {
                flow_id: self.flow_id,
            })
            .await;
    }

    async fn replay(&mut self) {
        let events = match self.journal.load(self.flow_id).await {
            Ok(events) => events,
            Err(e) => {
                error!(flow_id = %self.flow_id, error = %e, "failed to read journal");
                panic!("journal read failed for flow {}: {e}", self.flow_id);
            }
        };
        if events.is_empty() {
            return;
        }
        debug!(flow_id = %self.flow_id, count = events.len(), "replaying journal");

        let mut effects = EffectQueue::default();
        let mut delays: Vec<(StageId, i64)> = Vec::new();
        for sequenced in &events {
            match &sequenced.event {
                Event::GraphCreated {
                    flow_id,
                    function_id,
                    ..
                } => {
                    self.graph = Some(CompletionGraph::new(*flow_id, function_id.clone()));
                }
                event => {
                    if let Event::DelayScheduled {
                        stage_id, time_ms, ..
                    } = event
                    {
                        delays.push((*stage_id, *time_ms));
                    }
                    let graph = self.graph.as_mut().unwrap_or_else(|| {
                        panic!(
                            "corrupt journal for flow {}: {} before graph_created",
                            self.flow_id,
                            event.kind()
                        )
                    });
                    graph.update_with_event(event, false, &mut effects);
                }
            }
        }
        self.next_seq = events.len() as u64;

        // Resume: fail lost invocations, re-fire what became ready, re-arm
        // timers with whatever delay remains.
        let mut effects = EffectQueue::default();
        if let Some(graph) = self.graph.as_mut() {
            graph.recover(&mut effects);
        }
        self.drain_effects(effects).await;
        for (stage_id, time_ms) in delays {
            let unresolved = self
                .graph
                .as_ref()
                .and_then(|g| g.get_stage(stage_id))
                .map(|s| !s.is_resolved())
                .unwrap_or(false);
            if unresolved {
                self.arm_delay(stage_id, time_ms);
            }
        }
        info!(flow_id = %self.flow_id, "replay complete");
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Request(request) => self.handle_request(request).await,
            ActorMessage::CompleteDelay { stage_id } => self.handle_complete_delay(stage_id).await,
            ActorMessage::WaiterTimeout { stage_id, waiter } => {
                self.handle_waiter_timeout(stage_id, waiter);
            }
            ActorMessage::Stop => unreachable!("stop is handled by the run loop"),
        }
    }

    async fn handle_request(&mut self, request: GraphRequest) {
        let GraphRequest {
            flow_id,
            command,
            reply,
        } = request;

        if self.graph.is_none() {
            let outcome = match command {
                FlowCommand::CreateGraph { function_id } => self.create_graph(function_id).await,
                _ => Err(FlowError::GraphNotFound { flow_id }),
            };
            let _ = reply.send(outcome);
            return;
        }
        if matches!(command, FlowCommand::CreateGraph { .. }) {
            let _ = reply.send(Err(FlowError::GraphAlreadyExists { flow_id }));
            return;
        }
        if let Err(e) = self.graph.as_ref().expect("graph checked above").validate_command(&command) {
            let _ = reply.send(Err(e));
            return;
        }

        match command {
            FlowCommand::CreateGraph { .. } => unreachable!("handled above"),
            FlowCommand::AddStage {
                operation,
                closure,
                dependencies,
            } => {
                let outcome = self.add_stage(operation, closure, dependencies).await;
                let _ = reply.send(outcome);
            }
            FlowCommand::AddCompletedValueStage { result } => {
                debug!(flow_id = %self.flow_id, "adding completed value stage");
                let outcome = match self
                    .add_stage(CompletionOperation::CompletedValue, None, vec![])
                    .await
                {
                    Ok(FlowResponse::StageAdded { stage_id }) => {
                        match self
                            .persist_and_apply(Event::StageCompleted {
                                stage_id,
                                result,
                                ts: Utc::now(),
                            })
                            .await
                        {
                            Ok(()) => Ok(FlowResponse::StageAdded { stage_id }),
                            Err(e) => Err(e),
                        }
                    }
                    other => other,
                };
                let _ = reply.send(outcome);
            }
            FlowCommand::AddDelayStage { delay_ms } => {
                debug!(flow_id = %self.flow_id, delay_ms, "adding delay stage");
                let outcome = match self
                    .add_stage(CompletionOperation::Delay, None, vec![])
                    .await
                {
                    Ok(FlowResponse::StageAdded { stage_id }) => {
                        let time_ms = Utc::now().timestamp_millis() + delay_ms as i64;
                        match self
                            .persist_and_apply(Event::DelayScheduled {
                                stage_id,
                                time_ms,
                                ts: Utc::now(),
                            })
                            .await
                        {
                            Ok(()) => {
                                self.arm_delay(stage_id, time_ms);
                                Ok(FlowResponse::StageAdded { stage_id })
                            }
                            Err(e) => Err(e),
                        }
                    }
                    other => other,
                };
                let _ = reply.send(outcome);
            }
            FlowCommand::AddInvokeFunctionStage { function_id, arg } => {
                debug!(flow_id = %self.flow_id, target = %function_id, "adding invoke function stage");
                let outcome = match self
                    .add_stage(CompletionOperation::InvokeFunction, None, vec![])
                    .await
                {
                    Ok(FlowResponse::StageAdded { stage_id }) => {
                        match self
                            .persist_and_apply(Event::FaasInvocationStarted {
                                stage_id,
                                ts: Utc::now(),
                            })
                            .await
                        {
                            Ok(()) => {
                                self.executor
                                    .send(ExecutorRequest::InvokeFunction(
                                        InvokeFunctionRequest {
                                            flow_id: self.flow_id,
                                            stage_id,
                                            function_id,
                                            arg,
                                        },
                                        self.faas_tx.clone(),
                                    ))
                                    .await;
                                Ok(FlowResponse::StageAdded { stage_id })
                            }
                            Err(e) => Err(e),
                        }
                    }
                    other => other,
                };
                let _ = reply.send(outcome);
            }
            FlowCommand::AddExternalCompletionStage => {
                debug!(flow_id = %self.flow_id, "adding external completion stage");
                let outcome = self
                    .add_stage(CompletionOperation::ExternalCompletion, None, vec![])
                    .await;
                let _ = reply.send(outcome);
            }
            FlowCommand::CompleteStageExternally { stage_id, result } => {
                debug!(flow_id = %self.flow_id, stage_id = %stage_id, "completing stage externally");
                let completable = self
                    .graph
                    .as_ref()
                    .and_then(|g| g.get_stage(stage_id))
                    .map(|s| !s.is_resolved())
                    .unwrap_or(false);
                let outcome = if completable {
                    match self
                        .persist_and_apply(Event::StageCompleted {
                            stage_id,
                            result,
                            ts: Utc::now(),
                        })
                        .await
                    {
                        Ok(()) => Ok(FlowResponse::StageCompletedExternally {
                            stage_id,
                            successful: true,
                        }),
                        Err(e) => Err(e),
                    }
                } else {
                    Ok(FlowResponse::StageCompletedExternally {
                        stage_id,
                        successful: false,
                    })
                };
                let _ = reply.send(outcome);
            }
            FlowCommand::CommitGraph => {
                let graph = self.graph.as_ref().expect("graph checked above");
                if graph.is_committed() {
                    // Idempotent.
                    let _ = reply.send(Ok(FlowResponse::GraphCommitted));
                    return;
                }
                debug!(flow_id = %self.flow_id, "committing graph");
                let outcome = self
                    .persist_and_apply(Event::GraphCommitted {
                        flow_id: self.flow_id,
                        ts: Utc::now(),
                    })
                    .await
                    .map(|()| FlowResponse::GraphCommitted);
                let _ = reply.send(outcome);
            }
            FlowCommand::GetStageResult { stage_id } => {
                self.handle_get_stage_result(stage_id, reply);
            }
            FlowCommand::GetGraphState => {
                let graph = self.graph.as_ref().expect("graph checked above");
                let _ = reply.send(Ok(FlowResponse::GraphState(graph.state_snapshot())));
            }
            FlowCommand::StreamEvents => {
                let backlog = match self.journal.load(self.flow_id).await {
                    Ok(backlog) => backlog,
                    Err(e) => {
                        error!(flow_id = %self.flow_id, error = %e, "failed to load event backlog");
                        let _ = reply.send(Err(FlowError::EventPersistenceError {
                            flow_id: self.flow_id,
                        }));
                        return;
                    }
                };
                let _ = reply.send(Ok(FlowResponse::EventStream {
                    backlog,
                    live: self.events_tx.subscribe(),
                }));
            }
        }
    }

    async fn create_graph(&mut self, function_id: String) -> Result<FlowResponse, FlowError> {
        debug!(flow_id = %self.flow_id, function_id = %function_id, "creating graph");
        let event = Event::GraphCreated {
            flow_id: self.flow_id,
            function_id: function_id.clone(),
            ts: Utc::now(),
        };
        let seq = self.persist(event).await?;
        self.graph = Some(CompletionGraph::new(self.flow_id, function_id.clone()));
        let _ = self.lifecycle_tx.send(LifecycleEvent::GraphCreated {
            flow_id: self.flow_id,
            function_id,
            seq,
        });
        Ok(FlowResponse::GraphCreated {
            flow_id: self.flow_id,
        })
    }

    async fn add_stage(
        &mut self,
        operation: CompletionOperation,
        closure: Option<BlobRef>,
        dependencies: Vec<StageId>,
    ) -> Result<FlowResponse, FlowError> {
        let graph = self.graph.as_ref().expect("graph exists for add_stage");
        let stage_id = graph.next_stage_id();
        debug!(flow_id = %self.flow_id, stage_id = %stage_id, operation = %operation, "adding stage");
        self.persist_and_apply(Event::StageAdded {
            stage_id,
            operation,
            closure,
            dependencies,
            ts: Utc::now(),
        })
        .await?;
        Ok(FlowResponse::StageAdded { stage_id })
    }

    fn handle_get_stage_result(
        &mut self,
        stage_id: StageId,
        reply: oneshot::Sender<Result<FlowResponse, FlowError>>,
    ) {
        let stage = self
            .graph
            .as_ref()
            .and_then(|g| g.get_stage(stage_id))
            .expect("stage validated");
        if let Some(result) = stage.result() {
            let _ = reply.send(Ok(FlowResponse::StageResult {
                stage_id,
                result: result.clone(),
            }));
            return;
        }

        // Park the reply on the stage; completion or the read timeout will
        // resolve it without blocking the mailbox.
        let waiter = self.next_waiter;
        self.next_waiter += 1;
        self.waiters.entry(stage_id).or_default().push((waiter, reply));
        let self_tx = self.self_tx.clone();
        let timeout = self.config.read_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = self_tx
                .send(ActorMessage::WaiterTimeout { stage_id, waiter })
                .await;
        });
    }

    fn handle_waiter_timeout(&mut self, stage_id: StageId, waiter: u64) {
        if let Some(waiters) = self.waiters.get_mut(&stage_id) {
            if let Some(pos) = waiters.iter().position(|(id, _)| *id == waiter) {
                let (_, reply) = waiters.remove(pos);
                let _ = reply.send(Err(FlowError::StageCompletionError {
                    flow_id: self.flow_id,
                    stage_id,
                }));
            }
            if waiters.is_empty() {
                self.waiters.remove(&stage_id);
            }
        }
    }

    fn notify_waiters(&mut self, stage_id: StageId) {
        let result = self
            .graph
            .as_ref()
            .and_then(|g| g.get_stage(stage_id))
            .and_then(|s| s.result().cloned());
        let Some(result) = result else { return };
        if let Some(waiters) = self.waiters.remove(&stage_id) {
            for (_, reply) in waiters {
                let _ = reply.send(Ok(FlowResponse::StageResult {
                    stage_id,
                    result: result.clone(),
                }));
            }
        }
    }

    async fn handle_complete_delay(&mut self, stage_id: StageId) {
        let Some(graph) = self.graph.as_ref() else {
            return;
        };
        if graph.is_completed() {
            // Avoids accumulating duplicate completion events.
            return;
        }
        let resolved = graph
            .get_stage(stage_id)
            .map(|s| s.is_resolved())
            .unwrap_or(true);
        if resolved {
            return;
        }
        debug!(flow_id = %self.flow_id, stage_id = %stage_id, "completing delayed stage");
        self.persist_and_apply_or_die(Event::StageCompleted {
            stage_id,
            result: CompletionResult::empty_success(),
            ts: Utc::now(),
        })
        .await;
    }

    async fn handle_faas_response(&mut self, response: FaasInvocationResponse) {
        debug!(flow_id = %self.flow_id, stage_id = %response.stage_id, "received FaaS invocation response");
        if self.graph.is_none() {
            warn!(flow_id = %self.flow_id, "dropping FaaS response for uninitialized graph");
            return;
        }
        self.persist_and_apply_or_die(Event::FaasInvocationCompleted {
            stage_id: response.stage_id,
            result: response.result.clone(),
            ts: Utc::now(),
        })
        .await;

        let mut effects = EffectQueue::default();
        self.graph
            .as_mut()
            .expect("graph checked above")
            .handle_invocation_result(response.stage_id, response.result, &mut effects);
        self.drain_effects(effects).await;
    }

    /// Persist an event, bump the sequence, and publish it on the stream.
    async fn persist(&mut self, event: Event) -> Result<u64, FlowError> {
        let seq = self.next_seq;
        if let Err(e) = self.journal.append(self.flow_id, seq, &event).await {
            error!(flow_id = %self.flow_id, seq, error = %e, "failed to persist event");
            return Err(FlowError::EventPersistenceError {
                flow_id: self.flow_id,
            });
        }
        self.next_seq += 1;
        let _ = self.events_tx.send(SequencedEvent {
            flow_id: self.flow_id,
            seq,
            event,
        });
        Ok(seq)
    }

    /// Persist then apply a command-driven event. A persistence failure is
    /// fatal to the command only: nothing is applied.
    async fn persist_and_apply(&mut self, event: Event) -> Result<(), FlowError> {
        self.persist(event.clone()).await?;
        self.apply_and_drain(event).await;
        Ok(())
    }

    /// Persist then apply a listener-driven event. A persistence failure
    /// here leaves the graph ahead of the journal, so the actor dies and is
    /// rebuilt from the journal on the next message.
    async fn persist_and_apply_or_die(&mut self, event: Event) {
        if let Err(e) = self.persist_and_apply(event).await {
            panic!(
                "unrecoverable persistence failure for flow {}: {e}",
                self.flow_id
            );
        }
    }

    async fn apply_and_drain(&mut self, event: Event) {
        let mut effects = EffectQueue::default();
        self.graph
            .as_mut()
            .expect("graph exists when applying events")
            .update_with_event(&event, true, &mut effects);
        if let Event::StageCompleted { stage_id, .. } = &event {
            self.notify_waiters(*stage_id);
        }
        self.drain_effects(effects).await;
    }

    async fn drain_effects(&mut self, mut effects: EffectQueue) {
        while let Some(effect) = effects.queue.pop_front() {
            match effect {
                Effect::Execute {
                    stage_id,
                    operation,
                    closure,
                    args,
                } => {
                    info!(flow_id = %self.flow_id, stage_id = %stage_id, operation = %operation, "executing stage");
                    self.persist_or_die(Event::FaasInvocationStarted {
                        stage_id,
                        ts: Utc::now(),
                    })
                    .await;
                    let function_id = self
                        .graph
                        .as_ref()
                        .expect("graph exists while draining effects")
                        .function_id()
                        .to_string();
                    self.executor
                        .send(ExecutorRequest::InvokeStage(
                            InvokeStageRequest {
                                flow_id: self.flow_id,
                                stage_id,
                                function_id,
                                operation,
                                closure,
                                args,
                            },
                            self.faas_tx.clone(),
                        ))
                        .await;
                }
                Effect::Complete { stage_id, result } => {
                    info!(flow_id = %self.flow_id, stage_id = %stage_id, "completing stage");
                    let event = Event::StageCompleted {
                        stage_id,
                        result,
                        ts: Utc::now(),
                    };
                    self.persist_or_die(event.clone()).await;
                    let mut more = EffectQueue::default();
                    self.graph
                        .as_mut()
                        .expect("graph exists while draining effects")
                        .update_with_event(&event, true, &mut more);
                    self.notify_waiters(stage_id);
                    effects.queue.extend(more.queue);
                }
                Effect::Compose {
                    stage_id,
                    composed_stage_id,
                } => {
                    info!(flow_id = %self.flow_id, stage_id = %stage_id, composed = %composed_stage_id, "composing stage");
                    let event = Event::StageComposed {
                        stage_id,
                        composed_stage_id,
                        ts: Utc::now(),
                    };
                    self.persist_or_die(event.clone()).await;
                    let mut more = EffectQueue::default();
                    self.graph
                        .as_mut()
                        .expect("graph exists while draining effects")
                        .update_with_event(&event, true, &mut more);
                    effects.queue.extend(more.queue);
                }
                Effect::GraphComplete => {
                    info!(flow_id = %self.flow_id, "graph completed");
                    let status = self.terminal_status();
                    self.persist_or_die(Event::GraphTerminating {
                        flow_id: self.flow_id,
                        status,
                        ts: Utc::now(),
                    })
                    .await;
                    let event = Event::GraphCompleted {
                        flow_id: self.flow_id,
                        ts: Utc::now(),
                    };
                    let seq = match self.persist(event.clone()).await {
                        Ok(seq) => seq,
                        Err(e) => panic!(
                            "unrecoverable persistence failure for flow {}: {e}",
                            self.flow_id
                        ),
                    };
                    let mut more = EffectQueue::default();
                    self.graph
                        .as_mut()
                        .expect("graph exists while draining effects")
                        .update_with_event(&event, true, &mut more);
                    effects.queue.extend(more.queue);
                    let _ = self.lifecycle_tx.send(LifecycleEvent::GraphCompleted {
                        flow_id: self.flow_id,
                        seq,
                    });
                    self.request_deactivation().await;
                }
            }
        }
    }

    async fn persist_or_die(&mut self, event: Event) {
        if let Err(e) = self.persist(event).await {
            panic!(
                "unrecoverable persistence failure for flow {}: {e}",
                self.flow_id
            );
        }
    }

    fn terminal_status(&self) -> StatusValue {
        let any_failed = self
            .graph
            .as_ref()
            .map(|g| g.stages().any(|s| s.is_failed()))
            .unwrap_or(false);
        if any_failed {
            StatusValue::Failed
        } else {
            StatusValue::Succeeded
        }
    }

    /// Arm (or immediately fire) a delay timer for its remaining duration.
    /// Timer handles are never persisted.
    fn arm_delay(&self, stage_id: StageId, time_ms: i64) {
        let remaining = time_ms - Utc::now().timestamp_millis();
        let self_tx = self.self_tx.clone();
        if remaining <= 0 {
            debug!(flow_id = %self.flow_id, stage_id = %stage_id, "queueing completion of elapsed delay");
            tokio::spawn(async move {
                let _ = self_tx.send(ActorMessage::CompleteDelay { stage_id }).await;
            });
        } else {
            debug!(flow_id = %self.flow_id, stage_id = %stage_id, remaining_ms = remaining, "scheduling delayed completion");
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
                let _ = self_tx.send(ActorMessage::CompleteDelay { stage_id }).await;
            });
        }
    }
}
