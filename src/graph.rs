//! In-memory representation of one completion flow.
//!
//! The graph owns the stages of a single flow, evaluates triggers as
//! dependencies resolve, and applies journal events. It performs no I/O:
//! every side effect is a [`GraphListener`] callback, implemented by the
//! owning actor. Replay applies events with `trigger = false` so listener
//! callbacks already captured in the journal are not re-issued; a single
//! [`CompletionGraph::recover`] call afterwards resumes pending work.

use std::collections::BTreeMap;

use tracing::debug;

use crate::model::{
    BlobRef, CompletionOperation, CompletionResult, Datum, ErrorKind, Event, FlowCommand,
    FlowError, FlowId, GraphState, ResultStatus, StageId, StageStatus, StageSummary,
};
use crate::strategy::{
    dependency_arity, strategy_for, ExecutionAction, ResultMode, Strategy, TriggerRule,
};

/// Side-effect sink for graph state changes.
///
/// Implemented by the graph actor, which persists events and dispatches
/// executor work. Implementations must not call back into the graph
/// re-entrantly; queue and drain instead.
pub trait GraphListener {
    /// The stage fired and its closure should be invoked with `args`.
    fn on_execute_stage(
        &mut self,
        stage_id: StageId,
        operation: CompletionOperation,
        closure: Option<BlobRef>,
        args: Vec<Datum>,
    );

    /// The stage's result is known and should be recorded.
    fn on_complete_stage(&mut self, stage_id: StageId, result: CompletionResult);

    /// `composed_stage_id` should be composed into `stage_id`.
    fn on_compose_stage(&mut self, stage_id: StageId, composed_stage_id: StageId);

    /// The graph is committed and every stage is resolved.
    fn on_complete_graph(&mut self);
}

/// One node in a completion graph.
#[derive(Debug)]
pub struct CompletionStage {
    pub id: StageId,
    pub operation: CompletionOperation,
    strategy: Strategy,
    pub closure: Option<BlobRef>,
    pub dependencies: Vec<StageId>,
    children: Vec<StageId>,
    /// Stage this one will be completed with, set by `thenCompose`.
    compose_reference: Option<StageId>,
    /// Stage to complete when this one resolves (the compose parent).
    compose_target: Option<StageId>,
    result: Option<CompletionResult>,
    /// Sticky: set when the stage is first observed firing, preventing a
    /// double fire within one recovery or steady-state pass.
    triggered: bool,
}

impl CompletionStage {
    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_successful(&self) -> bool {
        matches!(&self.result, Some(r) if r.is_successful())
    }

    pub fn is_failed(&self) -> bool {
        matches!(&self.result, Some(r) if r.is_failed())
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn result(&self) -> Option<&CompletionResult> {
        self.result.as_ref()
    }

    pub fn result_mode(&self) -> ResultMode {
        self.strategy.result_mode
    }

    pub fn compose_reference(&self) -> Option<StageId> {
        self.compose_reference
    }

    fn status(&self) -> StageStatus {
        if self.is_failed() {
            StageStatus::Failed
        } else if self.is_successful() {
            StageStatus::Successful
        } else if self.triggered {
            StageStatus::Running
        } else {
            StageStatus::Pending
        }
    }
}

/// The dependency-driven state machine for one flow.
#[derive(Debug)]
pub struct CompletionGraph {
    flow_id: FlowId,
    function_id: String,
    stages: BTreeMap<StageId, CompletionStage>,
    next_stage_id: u32,
    committed: bool,
    completed: bool,
    /// Latch for the one-shot `on_complete_graph` signal.
    completion_signaled: bool,
}

impl CompletionGraph {
    pub fn new(flow_id: FlowId, function_id: impl Into<String>) -> Self {
        CompletionGraph {
            flow_id,
            function_id: function_id.into(),
            stages: BTreeMap::new(),
            next_stage_id: 0,
            committed: false,
            completed: false,
            completion_signaled: false,
        }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// The id the next added stage will receive.
    pub fn next_stage_id(&self) -> StageId {
        StageId(self.next_stage_id)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn get_stage(&self, id: StageId) -> Option<&CompletionStage> {
        self.stages.get(&id)
    }

    pub fn stages(&self) -> impl Iterator<Item = &CompletionStage> {
        self.stages.values()
    }

    fn all_resolved(&self) -> bool {
        self.stages.values().all(|s| s.is_resolved())
    }

    /// Check a client command against the current graph state.
    ///
    /// A failed check produces a typed error and must append no event.
    pub fn validate_command(&self, command: &FlowCommand) -> Result<(), FlowError> {
        if self.completed && !matches!(command, FlowCommand::GetStageResult { .. } | FlowCommand::GetGraphState | FlowCommand::StreamEvents) {
            return Err(FlowError::GraphAlreadyCompleted {
                flow_id: self.flow_id,
            });
        }

        match command {
            FlowCommand::AddStage {
                operation,
                dependencies,
                ..
            } => {
                // The externally-completed operations have dedicated commands
                // and are not valid chained stages.
                if matches!(
                    operation,
                    CompletionOperation::CompletedValue
                        | CompletionOperation::Delay
                        | CompletionOperation::InvokeFunction
                        | CompletionOperation::ExternalCompletion
                ) {
                    return Err(FlowError::UnknownOperation {
                        flow_id: self.flow_id,
                    });
                }
                if !dependency_arity(*operation).accepts(dependencies.len()) {
                    return Err(FlowError::InvalidOperandCount {
                        flow_id: self.flow_id,
                        operation: *operation,
                    });
                }
                for dep in dependencies {
                    if !self.stages.contains_key(dep) {
                        return Err(FlowError::InvalidStageDependency {
                            flow_id: self.flow_id,
                        });
                    }
                }
                Ok(())
            }
            FlowCommand::CompleteStageExternally { stage_id, .. }
            | FlowCommand::GetStageResult { stage_id } => {
                if !self.stages.contains_key(stage_id) {
                    return Err(FlowError::StageNotFound {
                        flow_id: self.flow_id,
                        stage_id: *stage_id,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Apply a journal event to the in-memory state.
    ///
    /// `trigger` is false during replay: trigger evaluation still runs (the
    /// sticky `triggered` bit feeds recovery) but listener callbacks are
    /// suppressed because their consequences are already in the journal.
    pub fn update_with_event(
        &mut self,
        event: &Event,
        trigger: bool,
        listener: &mut dyn GraphListener,
    ) {
        match event {
            Event::GraphCreated { .. } => {}
            Event::GraphCommitted { .. } => {
                self.committed = true;
                self.check_completion(trigger, listener);
            }
            Event::GraphTerminating { .. } => {}
            Event::GraphCompleted { .. } => {
                self.completed = true;
                self.completion_signaled = true;
            }
            Event::StageAdded {
                stage_id,
                operation,
                closure,
                dependencies,
                ..
            } => {
                self.apply_stage_added(*stage_id, *operation, closure.clone(), dependencies);
                self.try_trigger_stage(*stage_id, trigger, listener);
            }
            Event::StageCompleted {
                stage_id, result, ..
            } => {
                self.apply_stage_completed(*stage_id, result.clone(), trigger, listener);
            }
            Event::StageComposed {
                stage_id,
                composed_stage_id,
                ..
            } => {
                self.apply_stage_composed(*stage_id, *composed_stage_id, trigger, listener);
            }
            Event::DelayScheduled { .. } => {
                // Journal fidelity only; the actor re-arms the timer.
            }
            Event::FaasInvocationStarted { stage_id, .. } => {
                // Evidence the stage fired; recovery fails it if the
                // matching completion never arrives.
                if let Some(stage) = self.stages.get_mut(stage_id) {
                    stage.triggered = true;
                }
            }
            Event::FaasInvocationCompleted { .. } => {
                // Translated into StageCompleted / StageComposed by the
                // actor; nothing to change here.
            }
        }
    }

    /// Resume pending work after a full replay.
    ///
    /// Any stage observed firing without a matching completion lost its
    /// in-flight invocation in the crash; fail it so dependents make
    /// progress, then re-evaluate every trigger in id order.
    pub fn recover(&mut self, listener: &mut dyn GraphListener) {
        // A composed parent is no longer waiting on its invocation; its
        // completion comes from the referenced stage, so it is not lost.
        let lost: Vec<StageId> = self
            .stages
            .values()
            .filter(|s| s.triggered && !s.is_resolved() && s.compose_reference.is_none())
            .map(|s| s.id)
            .collect();
        for stage_id in lost {
            debug!(flow_id = %self.flow_id, stage_id = %stage_id, "failing partially recovered stage");
            listener.on_complete_stage(
                stage_id,
                CompletionResult::internal_error(
                    ErrorKind::StageLost,
                    "stage invocation was lost during recovery",
                ),
            );
        }

        // A composed parent whose referenced stage resolved before the crash
        // lost only its own completion event; re-drive it from the child.
        let composed: Vec<(StageId, CompletionResult)> = self
            .stages
            .values()
            .filter(|s| !s.is_resolved())
            .filter_map(|s| {
                let referenced = s.compose_reference?;
                self.stages
                    .get(&referenced)
                    .and_then(|child| child.result().cloned())
                    .map(|result| (s.id, result))
            })
            .collect();
        for (stage_id, result) in composed {
            debug!(flow_id = %self.flow_id, stage_id = %stage_id, "completing composed stage from its referenced stage");
            listener.on_complete_stage(stage_id, result);
        }

        let ids: Vec<StageId> = self.stages.keys().copied().collect();
        for stage_id in ids {
            self.try_trigger_stage(stage_id, true, listener);
        }
        self.check_completion(true, listener);
    }

    /// Interpret a FaaS invocation outcome according to the stage's result
    /// mode, emitting the completion or composition it implies.
    ///
    /// Called by the actor once the invocation-completed event is persisted;
    /// the resulting listener callbacks are persisted and applied as their
    /// own events.
    pub fn handle_invocation_result(
        &mut self,
        stage_id: StageId,
        result: CompletionResult,
        listener: &mut dyn GraphListener,
    ) {
        let stage = match self.stages.get(&stage_id) {
            Some(s) => s,
            None => {
                panic!(
                    "invocation result for missing stage {} in flow {}",
                    stage_id, self.flow_id
                );
            }
        };
        if stage.is_resolved() {
            // A recovery already failed this stage; the late response loses.
            debug!(flow_id = %self.flow_id, stage_id = %stage_id, "dropping invocation result for resolved stage");
            return;
        }

        match stage.strategy.result_mode {
            ResultMode::Invocation => listener.on_complete_stage(stage_id, result),
            ResultMode::Referenced => {
                if result.is_failed() {
                    listener.on_complete_stage(stage_id, result);
                    return;
                }
                match &result.datum {
                    Datum::StageRef(referenced) if self.stages.contains_key(referenced) => {
                        listener.on_compose_stage(stage_id, *referenced);
                    }
                    _ => listener.on_complete_stage(
                        stage_id,
                        CompletionResult::internal_error(
                            ErrorKind::InvalidStageResponse,
                            "composed invocation did not return a valid stage reference",
                        ),
                    ),
                }
            }
            ResultMode::Parent => {
                if result.is_failed() {
                    listener.on_complete_stage(stage_id, result);
                    return;
                }
                let parent_result = stage
                    .dependencies
                    .first()
                    .and_then(|dep| self.stages[dep].result.clone())
                    .unwrap_or(result);
                listener.on_complete_stage(stage_id, parent_result);
            }
            ResultMode::NoResult => {}
        }
    }

    /// External view of the graph for state queries.
    pub fn state_snapshot(&self) -> GraphState {
        let stages = self
            .stages
            .values()
            .map(|s| {
                (
                    s.id,
                    StageSummary {
                        operation: s.operation,
                        status: s.status(),
                        dependencies: s.dependencies.clone(),
                    },
                )
            })
            .collect();
        GraphState {
            flow_id: self.flow_id,
            function_id: self.function_id.clone(),
            stages,
        }
    }

    fn apply_stage_added(
        &mut self,
        stage_id: StageId,
        operation: CompletionOperation,
        closure: Option<BlobRef>,
        dependencies: &[StageId],
    ) {
        if self.stages.contains_key(&stage_id) || stage_id != self.next_stage_id() {
            panic!(
                "corrupt journal for flow {}: stage {} added out of order (expected {})",
                self.flow_id,
                stage_id,
                self.next_stage_id()
            );
        }
        for dep in dependencies {
            let dep_stage = self.stages.get_mut(dep).unwrap_or_else(|| {
                panic!(
                    "corrupt journal for flow {}: stage {} depends on missing stage {}",
                    self.flow_id, stage_id, dep
                )
            });
            dep_stage.children.push(stage_id);
        }

        self.stages.insert(
            stage_id,
            CompletionStage {
                id: stage_id,
                operation,
                strategy: strategy_for(operation),
                closure,
                dependencies: dependencies.to_vec(),
                children: Vec::new(),
                compose_reference: None,
                compose_target: None,
                result: None,
                triggered: false,
            },
        );
        self.next_stage_id += 1;
    }

    fn apply_stage_completed(
        &mut self,
        stage_id: StageId,
        result: CompletionResult,
        trigger: bool,
        listener: &mut dyn GraphListener,
    ) {
        let stage = self.stages.get_mut(&stage_id).unwrap_or_else(|| {
            panic!(
                "corrupt journal for flow {}: completion for missing stage {}",
                self.flow_id, stage_id
            )
        });
        if stage.result.is_some() {
            // Result is set at most once; later attempts are no-ops.
            return;
        }
        stage.triggered = true;
        stage.result = Some(result.clone());
        let children = stage.children.clone();
        let compose_target = stage.compose_target;

        for child in children {
            self.try_trigger_stage(child, trigger, listener);
        }
        if let Some(parent) = compose_target {
            if trigger && !self.stages[&parent].is_resolved() {
                listener.on_complete_stage(parent, result);
            }
        }
        self.check_completion(trigger, listener);
    }

    fn apply_stage_composed(
        &mut self,
        stage_id: StageId,
        composed_stage_id: StageId,
        trigger: bool,
        listener: &mut dyn GraphListener,
    ) {
        if !self.stages.contains_key(&stage_id) || !self.stages.contains_key(&composed_stage_id) {
            panic!(
                "corrupt journal for flow {}: composing {} into missing stage {}",
                self.flow_id, composed_stage_id, stage_id
            );
        }
        self.stages
            .get_mut(&stage_id)
            .expect("checked above")
            .compose_reference = Some(composed_stage_id);
        let child = self.stages.get_mut(&composed_stage_id).expect("checked above");
        child.compose_target = Some(stage_id);

        // The referenced stage may already be resolved.
        if let Some(result) = child.result.clone() {
            if trigger && !self.stages[&stage_id].is_resolved() {
                listener.on_complete_stage(stage_id, result);
            }
        }
    }

    /// Evaluate a stage's trigger and, when it fires for the first time, run
    /// its execution action.
    fn try_trigger_stage(
        &mut self,
        stage_id: StageId,
        trigger: bool,
        listener: &mut dyn GraphListener,
    ) {
        let stage = match self.stages.get(&stage_id) {
            Some(s) => s,
            None => return,
        };
        if stage.triggered || stage.is_resolved() {
            return;
        }
        let (status, inputs) = match self.evaluate_trigger(stage) {
            Some(outcome) => outcome,
            None => return,
        };
        self.stages
            .get_mut(&stage_id)
            .expect("stage checked above")
            .triggered = true;
        debug!(flow_id = %self.flow_id, stage_id = %stage_id, ?status, "stage trigger satisfied");
        if trigger {
            self.fire_stage(stage_id, status, inputs, listener);
        }
    }

    fn evaluate_trigger(
        &self,
        stage: &CompletionStage,
    ) -> Option<(ResultStatus, Vec<CompletionResult>)> {
        match stage.strategy.trigger {
            TriggerRule::Immediate => Some((ResultStatus::Succeeded, Vec::new())),
            TriggerRule::Never => None,
            TriggerRule::All => {
                let mut results = Vec::with_capacity(stage.dependencies.len());
                for dep in &stage.dependencies {
                    let dep_stage = &self.stages[dep];
                    match dep_stage.result() {
                        None => return None,
                        Some(r) => results.push(r.clone()),
                    }
                }
                match results.iter().find(|r| r.is_failed()) {
                    Some(first_failed) => {
                        Some((ResultStatus::Failed, vec![first_failed.clone()]))
                    }
                    None => Some((ResultStatus::Succeeded, results)),
                }
            }
            TriggerRule::Any => {
                let mut first_failure: Option<CompletionResult> = None;
                let mut have_unresolved = false;
                for dep in &stage.dependencies {
                    let dep_stage = &self.stages[dep];
                    match dep_stage.result() {
                        Some(r) if r.is_successful() => {
                            return Some((ResultStatus::Succeeded, vec![r.clone()]));
                        }
                        Some(r) => {
                            if first_failure.is_none() {
                                first_failure = Some(r.clone());
                            }
                        }
                        None => have_unresolved = true,
                    }
                }
                if have_unresolved {
                    None
                } else {
                    first_failure.map(|r| (ResultStatus::Failed, vec![r]))
                }
            }
        }
    }

    fn fire_stage(
        &mut self,
        stage_id: StageId,
        status: ResultStatus,
        inputs: Vec<CompletionResult>,
        listener: &mut dyn GraphListener,
    ) {
        let stage = &self.stages[&stage_id];
        let action = match status {
            ResultStatus::Succeeded => stage.strategy.on_success,
            ResultStatus::Failed => stage.strategy.on_failure,
        };
        let operation = stage.operation;
        let closure = stage.closure.clone();

        match action {
            ExecutionAction::InvokeWithoutArgs => {
                listener.on_execute_stage(stage_id, operation, closure, Vec::new());
            }
            ExecutionAction::InvokeWithResult => {
                let args = inputs
                    .into_iter()
                    .map(|r| {
                        if !r.is_successful() {
                            panic!(
                                "stage {} fired successfully with a failed input",
                                stage_id
                            );
                        }
                        r.datum
                    })
                    .collect();
                listener.on_execute_stage(stage_id, operation, closure, args);
            }
            ExecutionAction::InvokeWithError => {
                let args = inputs
                    .into_iter()
                    .map(|r| {
                        if !r.is_failed() {
                            panic!(
                                "stage {} fired erroneously with a successful input",
                                stage_id
                            );
                        }
                        r.datum
                    })
                    .collect();
                listener.on_execute_stage(stage_id, operation, closure, args);
            }
            ExecutionAction::InvokeWithResultOrError => {
                // All-triggered stages select every dependency result; the
                // value/error pair is built from the first.
                let result = inputs.into_iter().next().unwrap_or_else(|| {
                    panic!("stage {} fired with no inputs", stage_id)
                });
                let args = if result.is_failed() {
                    vec![Datum::Empty, result.datum]
                } else {
                    vec![result.datum, Datum::Empty]
                };
                listener.on_execute_stage(stage_id, operation, closure, args);
            }
            ExecutionAction::SucceedWithEmpty => {
                listener.on_complete_stage(stage_id, CompletionResult::empty_success());
            }
            ExecutionAction::PropagateSuccess | ExecutionAction::PropagateError => {
                listener.on_complete_stage(stage_id, single_input(stage_id, inputs));
            }
            ExecutionAction::CompleteExternally => {}
        }
    }

    fn check_completion(&mut self, trigger: bool, listener: &mut dyn GraphListener) {
        if !trigger
            || !self.committed
            || self.completed
            || self.completion_signaled
            || !self.all_resolved()
        {
            return;
        }
        self.completion_signaled = true;
        listener.on_complete_graph();
    }
}

fn single_input(stage_id: StageId, mut inputs: Vec<CompletionResult>) -> CompletionResult {
    if inputs.len() != 1 {
        panic!(
            "stage {} fired with {} inputs where exactly one was expected",
            stage_id,
            inputs.len()
        );
    }
    inputs.remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingListener {
        executions: Vec<(StageId, Vec<Datum>)>,
        completions: Vec<(StageId, CompletionResult)>,
        compositions: Vec<(StageId, StageId)>,
        graph_completions: usize,
    }

    impl GraphListener for RecordingListener {
        fn on_execute_stage(
            &mut self,
            stage_id: StageId,
            _operation: CompletionOperation,
            _closure: Option<BlobRef>,
            args: Vec<Datum>,
        ) {
            self.executions.push((stage_id, args));
        }

        fn on_complete_stage(&mut self, stage_id: StageId, result: CompletionResult) {
            self.completions.push((stage_id, result));
        }

        fn on_compose_stage(&mut self, stage_id: StageId, composed_stage_id: StageId) {
            self.compositions.push((stage_id, composed_stage_id));
        }

        fn on_complete_graph(&mut self) {
            self.graph_completions += 1;
        }
    }

    fn sample_blob() -> BlobRef {
        BlobRef {
            id: Uuid::new_v4(),
            content_type: "application/octet-stream".into(),
            length: 1,
        }
    }

    fn add_stage(
        graph: &mut CompletionGraph,
        listener: &mut RecordingListener,
        operation: CompletionOperation,
        deps: &[StageId],
        trigger: bool,
    ) -> StageId {
        let stage_id = graph.next_stage_id();
        graph.update_with_event(
            &Event::StageAdded {
                stage_id,
                operation,
                closure: Some(sample_blob()),
                dependencies: deps.to_vec(),
                ts: Utc::now(),
            },
            trigger,
            listener,
        );
        stage_id
    }

    fn complete_stage(
        graph: &mut CompletionGraph,
        listener: &mut RecordingListener,
        stage_id: StageId,
        result: CompletionResult,
        trigger: bool,
    ) {
        graph.update_with_event(
            &Event::StageCompleted {
                stage_id,
                result,
                ts: Utc::now(),
            },
            trigger,
            listener,
        );
    }

    fn blob_success() -> CompletionResult {
        CompletionResult::success(Datum::Blob(sample_blob()))
    }

    fn new_graph() -> CompletionGraph {
        CompletionGraph::new(FlowId::generate(), "app/fn")
    }

    #[test]
    fn stage_ids_are_assigned_in_order() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        assert_eq!(graph.next_stage_id(), StageId(0));
        add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        assert_eq!(graph.next_stage_id(), StageId(1));
    }

    #[test]
    fn supply_fires_on_add() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], true);
        assert_eq!(listener.executions, vec![(a, vec![])]);
        assert!(!graph.get_stage(a).unwrap().is_resolved());
        assert!(graph.get_stage(a).unwrap().is_triggered());
    }

    #[test]
    fn supply_does_not_fire_during_replay_but_is_marked_triggered() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        assert!(listener.executions.is_empty());
        assert!(graph.get_stage(a).unwrap().is_triggered());
    }

    #[test]
    fn then_apply_fires_with_dependency_result() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenApply, &[a], false);
        assert!(listener.executions.is_empty());

        let result = blob_success();
        complete_stage(&mut graph, &mut listener, a, result.clone(), true);
        assert_eq!(listener.executions, vec![(b, vec![result.datum])]);
    }

    #[test]
    fn then_apply_fires_at_add_when_dependency_already_resolved() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let result = blob_success();
        complete_stage(&mut graph, &mut listener, a, result.clone(), false);

        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenApply, &[a], true);
        assert_eq!(listener.executions, vec![(b, vec![result.datum])]);
    }

    #[test]
    fn failure_propagates_without_invoking_the_closure() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenApply, &[a], false);

        let failure = CompletionResult::internal_error(ErrorKind::StageFailed, "boom");
        complete_stage(&mut graph, &mut listener, a, failure.clone(), true);
        assert!(listener.executions.is_empty());
        assert_eq!(listener.completions, vec![(b, failure)]);
    }

    #[test]
    fn replayed_completion_does_not_fire_children() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        add_stage(&mut graph, &mut listener, CompletionOperation::ThenApply, &[a], false);

        complete_stage(&mut graph, &mut listener, a, blob_success(), false);
        assert!(listener.executions.is_empty());
        assert!(listener.completions.is_empty());
    }

    #[test]
    fn second_completion_is_a_silent_noop() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let first = blob_success();
        complete_stage(&mut graph, &mut listener, a, first.clone(), true);
        complete_stage(
            &mut graph,
            &mut listener,
            a,
            CompletionResult::internal_error(ErrorKind::StageFailed, "late"),
            true,
        );
        assert_eq!(graph.get_stage(a).unwrap().result(), Some(&first));
    }

    #[test]
    fn compose_completes_the_parent_with_the_referenced_stage_result() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        complete_stage(&mut graph, &mut listener, a, blob_success(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenCompose, &[a], false);
        let c = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);

        graph.update_with_event(
            &Event::StageComposed {
                stage_id: b,
                composed_stage_id: c,
                ts: Utc::now(),
            },
            true,
            &mut listener,
        );
        assert!(!graph.get_stage(b).unwrap().is_resolved());
        assert_eq!(graph.get_stage(b).unwrap().compose_reference(), Some(c));

        let final_result = blob_success();
        complete_stage(&mut graph, &mut listener, c, final_result.clone(), true);
        assert_eq!(listener.completions, vec![(b, final_result)]);
    }

    #[test]
    fn compose_with_an_already_resolved_child_completes_immediately() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        complete_stage(&mut graph, &mut listener, a, blob_success(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenCompose, &[a], false);
        let c = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let child_result = blob_success();
        complete_stage(&mut graph, &mut listener, c, child_result.clone(), false);

        graph.update_with_event(
            &Event::StageComposed {
                stage_id: b,
                composed_stage_id: c,
                ts: Utc::now(),
            },
            true,
            &mut listener,
        );
        assert_eq!(listener.completions, vec![(b, child_result)]);
    }

    #[test]
    fn all_of_waits_for_every_dependency() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let c = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let d = add_stage(&mut graph, &mut listener, CompletionOperation::AllOf, &[a, b, c], false);

        complete_stage(&mut graph, &mut listener, a, blob_success(), true);
        complete_stage(&mut graph, &mut listener, b, blob_success(), true);
        assert!(listener.completions.is_empty());
        complete_stage(&mut graph, &mut listener, c, blob_success(), true);
        assert_eq!(
            listener.completions,
            vec![(d, CompletionResult::empty_success())]
        );
    }

    #[test]
    fn all_of_fails_with_the_first_failed_dependency_result() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let d = add_stage(&mut graph, &mut listener, CompletionOperation::AllOf, &[a, b], false);

        let failure = CompletionResult::internal_error(ErrorKind::StageFailed, "first");
        complete_stage(&mut graph, &mut listener, a, failure.clone(), true);
        assert!(listener.completions.is_empty());
        complete_stage(&mut graph, &mut listener, b, blob_success(), true);
        assert_eq!(listener.completions, vec![(d, failure)]);
    }

    #[test]
    fn any_of_takes_the_first_success_and_fails_only_when_all_fail() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let e = add_stage(&mut graph, &mut listener, CompletionOperation::AnyOf, &[a, b], false);

        let failure = CompletionResult::internal_error(ErrorKind::StageFailed, "a failed");
        complete_stage(&mut graph, &mut listener, a, failure, true);
        assert!(listener.completions.is_empty());
        let success = blob_success();
        complete_stage(&mut graph, &mut listener, b, success.clone(), true);
        assert_eq!(listener.completions, vec![(e, success)]);

        // All-failed variant.
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let e = add_stage(&mut graph, &mut listener, CompletionOperation::AnyOf, &[a, b], false);
        let first = CompletionResult::internal_error(ErrorKind::StageFailed, "first");
        complete_stage(&mut graph, &mut listener, a, first.clone(), true);
        complete_stage(
            &mut graph,
            &mut listener,
            b,
            CompletionResult::internal_error(ErrorKind::StageTimeout, "second"),
            true,
        );
        assert_eq!(listener.completions, vec![(e, first)]);
    }

    #[test]
    fn then_combine_fires_with_both_dependencies_resolved() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let c = add_stage(&mut graph, &mut listener, CompletionOperation::ThenCombine, &[a, b], false);

        let left = blob_success();
        complete_stage(&mut graph, &mut listener, a, left.clone(), true);
        assert!(listener.executions.is_empty());
        complete_stage(&mut graph, &mut listener, b, blob_success(), true);
        assert_eq!(
            listener.executions,
            vec![(c, vec![left.datum, Datum::Empty])]
        );
    }

    #[test]
    fn recover_completes_a_composed_stage_whose_referenced_stage_resolved() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        complete_stage(&mut graph, &mut listener, a, CompletionResult::empty_success(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenCompose, &[a], false);
        let c = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        graph.update_with_event(
            &Event::StageComposed {
                stage_id: b,
                composed_stage_id: c,
                ts: Utc::now(),
            },
            false,
            &mut listener,
        );
        let child_result = blob_success();
        complete_stage(&mut graph, &mut listener, c, child_result.clone(), false);

        graph.recover(&mut listener);
        assert_eq!(listener.completions, vec![(b, child_result)]);
    }

    #[test]
    fn recover_leaves_a_composed_stage_waiting_on_an_unresolved_child() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        complete_stage(&mut graph, &mut listener, a, CompletionResult::empty_success(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenCompose, &[a], false);
        let c = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        graph.update_with_event(
            &Event::StageComposed {
                stage_id: b,
                composed_stage_id: c,
                ts: Utc::now(),
            },
            false,
            &mut listener,
        );

        graph.recover(&mut listener);
        assert!(listener.completions.is_empty());
        assert!(!graph.get_stage(b).unwrap().is_resolved());

        // The child resolving later still completes the parent.
        let child_result = blob_success();
        complete_stage(&mut graph, &mut listener, c, child_result.clone(), true);
        assert_eq!(listener.completions, vec![(b, child_result)]);
    }

    #[test]
    fn when_complete_receives_empty_error_pair_on_failure() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::WhenComplete, &[a], false);

        let failure = CompletionResult::internal_error(ErrorKind::StageFailed, "boom");
        complete_stage(&mut graph, &mut listener, a, failure.clone(), true);
        assert_eq!(
            listener.executions,
            vec![(b, vec![Datum::Empty, failure.datum])]
        );
    }

    #[test]
    fn exceptionally_propagates_success_and_invokes_on_failure() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::Exceptionally, &[a], false);
        let success = blob_success();
        complete_stage(&mut graph, &mut listener, a, success.clone(), true);
        assert_eq!(listener.completions, vec![(b, success)]);
        assert!(listener.executions.is_empty());

        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::Exceptionally, &[a], false);
        let failure = CompletionResult::internal_error(ErrorKind::StageFailed, "boom");
        complete_stage(&mut graph, &mut listener, a, failure.clone(), true);
        assert_eq!(listener.executions, vec![(b, vec![failure.datum])]);
    }

    #[test]
    fn referenced_invocation_result_emits_a_composition() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        complete_stage(&mut graph, &mut listener, a, blob_success(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenCompose, &[a], false);
        let c = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);

        graph.handle_invocation_result(
            b,
            CompletionResult::success(Datum::StageRef(c)),
            &mut listener,
        );
        assert_eq!(listener.compositions, vec![(b, c)]);
        assert!(listener.completions.is_empty());
    }

    #[test]
    fn referenced_invocation_without_a_stageref_fails_with_invalid_response() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        complete_stage(&mut graph, &mut listener, a, blob_success(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenCompose, &[a], false);

        graph.handle_invocation_result(b, blob_success(), &mut listener);
        assert_eq!(listener.completions.len(), 1);
        let (stage_id, result) = &listener.completions[0];
        assert_eq!(*stage_id, b);
        assert!(matches!(
            &result.datum,
            Datum::Error { kind: ErrorKind::InvalidStageResponse, .. }
        ));
    }

    #[test]
    fn parent_mode_keeps_the_input_result_unless_the_invocation_failed() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let input = blob_success();
        complete_stage(&mut graph, &mut listener, a, input.clone(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::WhenComplete, &[a], false);

        graph.handle_invocation_result(b, CompletionResult::empty_success(), &mut listener);
        assert_eq!(listener.completions, vec![(b, input)]);

        // Invocation failure overrides the parent result.
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        complete_stage(&mut graph, &mut listener, a, blob_success(), false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::WhenComplete, &[a], false);
        let failure = CompletionResult::internal_error(ErrorKind::StageFailed, "closure blew up");
        graph.handle_invocation_result(b, failure.clone(), &mut listener);
        assert_eq!(listener.completions, vec![(b, failure)]);
    }

    #[test]
    fn late_invocation_result_for_a_resolved_stage_is_dropped() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        let lost = CompletionResult::internal_error(ErrorKind::StageLost, "lost");
        complete_stage(&mut graph, &mut listener, a, lost.clone(), false);

        graph.handle_invocation_result(a, blob_success(), &mut listener);
        assert!(listener.completions.is_empty());
        assert_eq!(graph.get_stage(a).unwrap().result(), Some(&lost));
    }

    #[test]
    fn empty_committed_graph_completes_once() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        graph.update_with_event(
            &Event::GraphCommitted {
                flow_id: graph.flow_id(),
                ts: Utc::now(),
            },
            true,
            &mut listener,
        );
        assert_eq!(listener.graph_completions, 1);
    }

    #[test]
    fn committed_graph_completes_when_the_last_stage_resolves() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        graph.update_with_event(
            &Event::GraphCommitted {
                flow_id: graph.flow_id(),
                ts: Utc::now(),
            },
            true,
            &mut listener,
        );
        assert_eq!(listener.graph_completions, 0);
        complete_stage(&mut graph, &mut listener, a, blob_success(), true);
        assert_eq!(listener.graph_completions, 1);
        // Applying the persisted completion must not signal again.
        graph.update_with_event(
            &Event::GraphCompleted {
                flow_id: graph.flow_id(),
                ts: Utc::now(),
            },
            true,
            &mut listener,
        );
        assert_eq!(listener.graph_completions, 1);
        assert!(graph.is_completed());
    }

    #[test]
    fn recover_fails_triggered_unresolved_stages_with_stage_lost() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        graph.recover(&mut listener);
        assert_eq!(listener.completions.len(), 1);
        let (stage_id, result) = &listener.completions[0];
        assert_eq!(*stage_id, a);
        assert!(matches!(
            &result.datum,
            Datum::Error { kind: ErrorKind::StageLost, .. }
        ));
    }

    #[test]
    fn recover_re_evaluates_triggers_for_stages_unblocked_during_replay() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenApply, &[a], false);
        let result = blob_success();
        complete_stage(&mut graph, &mut listener, a, result.clone(), false);
        assert!(!graph.get_stage(b).unwrap().is_triggered());

        graph.recover(&mut listener);
        assert_eq!(listener.executions, vec![(b, vec![result.datum])]);
    }

    #[test]
    fn external_completion_stage_survives_recovery_untouched() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::ExternalCompletion, &[], false);
        graph.recover(&mut listener);
        assert!(listener.completions.is_empty());
        assert!(!graph.get_stage(a).unwrap().is_resolved());
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn duplicate_stage_add_fails_loudly() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], false);
        graph.update_with_event(
            &Event::StageAdded {
                stage_id: StageId(0),
                operation: CompletionOperation::Supply,
                closure: None,
                dependencies: vec![],
                ts: Utc::now(),
            },
            false,
            &mut listener,
        );
    }

    #[test]
    fn validation_rejects_bad_dependency_counts() {
        let graph = new_graph();
        let cmd = FlowCommand::AddStage {
            operation: CompletionOperation::ThenApply,
            closure: None,
            dependencies: vec![],
        };
        assert!(matches!(
            graph.validate_command(&cmd),
            Err(FlowError::InvalidOperandCount { .. })
        ));
        let cmd = FlowCommand::AddStage {
            operation: CompletionOperation::ThenApply,
            closure: None,
            dependencies: vec![StageId(0), StageId(1)],
        };
        assert!(matches!(
            graph.validate_command(&cmd),
            Err(FlowError::InvalidOperandCount { .. })
        ));
    }

    #[test]
    fn validation_rejects_unknown_dependencies() {
        let graph = new_graph();
        let cmd = FlowCommand::AddStage {
            operation: CompletionOperation::Supply,
            closure: None,
            dependencies: vec![],
        };
        assert!(graph.validate_command(&cmd).is_ok());
        let cmd = FlowCommand::AddStage {
            operation: CompletionOperation::ThenApply,
            closure: None,
            dependencies: vec![StageId(7)],
        };
        assert!(matches!(
            graph.validate_command(&cmd),
            Err(FlowError::InvalidStageDependency { .. })
        ));
    }

    #[test]
    fn validation_rejects_value_operations_as_chained_stages() {
        let graph = new_graph();
        let cmd = FlowCommand::AddStage {
            operation: CompletionOperation::Delay,
            closure: None,
            dependencies: vec![],
        };
        assert!(matches!(
            graph.validate_command(&cmd),
            Err(FlowError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn validation_rejects_structural_commands_on_a_completed_graph() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        graph.update_with_event(
            &Event::GraphCommitted {
                flow_id: graph.flow_id(),
                ts: Utc::now(),
            },
            true,
            &mut listener,
        );
        graph.update_with_event(
            &Event::GraphCompleted {
                flow_id: graph.flow_id(),
                ts: Utc::now(),
            },
            true,
            &mut listener,
        );
        let cmd = FlowCommand::AddStage {
            operation: CompletionOperation::Supply,
            closure: None,
            dependencies: vec![],
        };
        assert!(matches!(
            graph.validate_command(&cmd),
            Err(FlowError::GraphAlreadyCompleted { .. })
        ));
    }

    #[test]
    fn state_snapshot_reports_stage_status() {
        let mut graph = new_graph();
        let mut listener = RecordingListener::default();
        let a = add_stage(&mut graph, &mut listener, CompletionOperation::Supply, &[], true);
        let b = add_stage(&mut graph, &mut listener, CompletionOperation::ThenApply, &[a], true);
        let snapshot = graph.state_snapshot();
        assert_eq!(snapshot.stages[&a].status, StageStatus::Running);
        assert_eq!(snapshot.stages[&b].status, StageStatus::Pending);
        assert_eq!(snapshot.stages[&b].dependencies, vec![a]);

        complete_stage(&mut graph, &mut listener, a, blob_success(), true);
        let snapshot = graph.state_snapshot();
        assert_eq!(snapshot.stages[&a].status, StageStatus::Successful);
    }
}
