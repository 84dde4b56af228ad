//! Combinator semantics as data.
//!
//! Each operation maps to a triple (trigger rule, success execution, failure
//! execution) plus a result-handling mode. Keeping the mapping in one static
//! table makes all eighteen semantics visible at a glance and trivially
//! testable; the graph interprets the rules, nothing here holds state.

use crate::model::CompletionOperation;

/// When a stage becomes ready to fire, relative to its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRule {
    /// Fire when every dependency is resolved; failed if any failed.
    All,
    /// Fire on the first successful dependency, or when all have failed.
    Any,
    /// Fire as soon as the stage exists.
    Immediate,
    /// Never fire from dependency changes; completion arrives externally.
    Never,
}

/// What to do when the stage fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionAction {
    /// Invoke the closure with no arguments.
    InvokeWithoutArgs,
    /// Invoke the closure with the selected dependency results.
    InvokeWithResult,
    /// Invoke the closure with the selected failed dependency result.
    InvokeWithError,
    /// Invoke the closure with `(value, empty)` on success or
    /// `(empty, error)` on failure.
    InvokeWithResultOrError,
    /// Complete the stage directly with an empty success.
    SucceedWithEmpty,
    /// Complete the stage with the selected successful result as-is.
    PropagateSuccess,
    /// Complete the stage with the selected failed result as-is.
    PropagateError,
    /// Do nothing; completion is delivered externally.
    CompleteExternally,
}

/// How an executed stage's invocation output becomes its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    /// The invocation's completion result is the stage result.
    Invocation,
    /// A successful invocation must return a stage reference; the stage is
    /// later completed with the referenced stage's result.
    Referenced,
    /// The stage is completed with its input result; invocation errors
    /// override to failed.
    Parent,
    /// Invocations are not used; the stage is completed by other means.
    NoResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub trigger: TriggerRule,
    pub on_success: ExecutionAction,
    pub on_failure: ExecutionAction,
    pub result_mode: ResultMode,
}

/// Dependency count accepted by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyArity {
    Exactly(usize),
    AtLeast(usize),
}

impl DependencyArity {
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            DependencyArity::Exactly(n) => count == *n,
            DependencyArity::AtLeast(n) => count >= *n,
        }
    }
}

/// The strategy for an operation. Total over all operations.
pub fn strategy_for(operation: CompletionOperation) -> Strategy {
    use CompletionOperation::*;
    use ExecutionAction::*;
    use ResultMode::*;
    use TriggerRule::*;

    match operation {
        Supply => strategy(Immediate, InvokeWithoutArgs, PropagateError, Invocation),
        ThenApply | ThenAccept | AcceptEither | ApplyToEither => {
            strategy(Any, InvokeWithResult, PropagateError, Invocation)
        }
        ThenRun => strategy(Any, InvokeWithoutArgs, PropagateError, Invocation),
        ThenCombine | ThenAcceptBoth => {
            strategy(All, InvokeWithResultOrError, PropagateError, Invocation)
        }
        ThenCompose => strategy(Any, InvokeWithResult, PropagateError, Referenced),
        WhenComplete => strategy(Any, InvokeWithResultOrError, InvokeWithResultOrError, Parent),
        Handle => strategy(Any, InvokeWithResultOrError, InvokeWithResultOrError, Invocation),
        Exceptionally => strategy(Any, PropagateSuccess, InvokeWithError, Invocation),
        AllOf => strategy(All, SucceedWithEmpty, PropagateError, NoResult),
        AnyOf => strategy(Any, PropagateSuccess, PropagateError, NoResult),
        CompletedValue | ExternalCompletion => {
            strategy(Never, CompleteExternally, CompleteExternally, NoResult)
        }
        Delay => strategy(Never, CompleteExternally, CompleteExternally, NoResult),
        InvokeFunction => strategy(Immediate, CompleteExternally, CompleteExternally, Invocation),
    }
}

/// How many dependencies the operation requires at add time.
pub fn dependency_arity(operation: CompletionOperation) -> DependencyArity {
    use CompletionOperation::*;
    match operation {
        Supply | CompletedValue | Delay | InvokeFunction | ExternalCompletion => {
            DependencyArity::Exactly(0)
        }
        ThenApply | ThenAccept | ThenRun | ThenCompose | WhenComplete | Handle | Exceptionally => {
            DependencyArity::Exactly(1)
        }
        ThenCombine | ThenAcceptBoth | ApplyToEither | AcceptEither => DependencyArity::Exactly(2),
        AllOf | AnyOf => DependencyArity::AtLeast(1),
    }
}

fn strategy(
    trigger: TriggerRule,
    on_success: ExecutionAction,
    on_failure: ExecutionAction,
    result_mode: ResultMode,
) -> Strategy {
    Strategy {
        trigger,
        on_success,
        on_failure,
        result_mode,
    }
}
