//! Core data model for completion flows.
//!
//! Everything that crosses a module boundary lives here: identifiers, datums,
//! completion results, the combinator operation set, journal events, client
//! commands and their typed error responses.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Globally unique flow identifier, hashable for cluster placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub Uuid);

impl FlowId {
    pub fn generate() -> Self {
        FlowId(Uuid::new_v4())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stage identifier, monotonically increasing within a flow.
///
/// Assigned by the owning graph at stage creation and stable across recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reference to a blob held in the blob store. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: Uuid,
    pub content_type: String,
    pub length: u64,
}

/// HTTP methods accepted in httpreq datums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "HEAD" => Some(HttpMethod::Head),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "OPTIONS" => Some(HttpMethod::Options),
            _ => None,
        }
    }
}

/// A single HTTP header pair. Keys may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

/// HTTP request payload carried by an `invokeFunction` stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReqDatum {
    pub method: HttpMethod,
    pub headers: Vec<HttpHeader>,
    pub body: Option<BlobRef>,
}

/// HTTP response payload produced by an `invokeFunction` stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRespDatum {
    pub status_code: u16,
    pub headers: Vec<HttpHeader>,
    pub body: Option<BlobRef>,
}

impl HttpReqDatum {
    pub fn header_values(&self, key: &str) -> Vec<&str> {
        header_values(&self.headers, key)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.header_values(key).first().copied()
    }
}

impl HttpRespDatum {
    pub fn header_values(&self, key: &str) -> Vec<&str> {
        header_values(&self.headers, key)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.header_values(key).first().copied()
    }
}

fn header_values<'a>(headers: &'a [HttpHeader], key: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|h| h.key.eq_ignore_ascii_case(key))
        .map(|h| h.value.as_str())
        .collect()
}

/// Error classes carried inside failed completion results.
///
/// These travel over the wire (dash-separated, see `protocol`) and through the
/// journal; anything unrecognized on the way in is coerced to `UnknownError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StageFailed,
    StageTimeout,
    StageLost,
    InvalidStageResponse,
    FunctionInvokeFailed,
    UnknownError,
}

impl ErrorKind {
    /// Wire spelling used in `FnProject-ErrorType` headers.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ErrorKind::StageFailed => "stage-failed",
            ErrorKind::StageTimeout => "stage-timeout",
            ErrorKind::StageLost => "stage-lost",
            ErrorKind::InvalidStageResponse => "invalid-stage-response",
            ErrorKind::FunctionInvokeFailed => "function-invoke-failed",
            ErrorKind::UnknownError => "unknown-error",
        }
    }

    /// Unrecognized names coerce to `UnknownError` rather than failing.
    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "stage-failed" => ErrorKind::StageFailed,
            "stage-timeout" => ErrorKind::StageTimeout,
            "stage-lost" => ErrorKind::StageLost,
            "invalid-stage-response" => ErrorKind::InvalidStageResponse,
            "function-invoke-failed" => ErrorKind::FunctionInvokeFailed,
            _ => ErrorKind::UnknownError,
        }
    }
}

/// Terminal status values carried by status datums and terminating events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusValue {
    Succeeded,
    Failed,
    Cancelled,
    Killed,
}

/// The value produced or consumed by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Datum {
    Empty,
    Blob(BlobRef),
    Error { kind: ErrorKind, message: String },
    StageRef(StageId),
    HttpReq(HttpReqDatum),
    HttpResp(HttpRespDatum),
    Status(StatusValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Succeeded,
    Failed,
}

/// Outcome of a stage: a datum plus whether it succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub status: ResultStatus,
    pub datum: Datum,
}

impl CompletionResult {
    pub fn success(datum: Datum) -> Self {
        CompletionResult {
            status: ResultStatus::Succeeded,
            datum,
        }
    }

    pub fn failure(datum: Datum) -> Self {
        CompletionResult {
            status: ResultStatus::Failed,
            datum,
        }
    }

    pub fn empty_success() -> Self {
        Self::success(Datum::Empty)
    }

    /// A failed result carrying an internally generated error datum.
    pub fn internal_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::failure(Datum::Error {
            kind,
            message: message.into(),
        })
    }

    pub fn is_successful(&self) -> bool {
        self.status == ResultStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.status == ResultStatus::Failed
    }
}

/// The combinator a stage was created with.
///
/// Names follow the client-visible futures API; semantics are defined by the
/// strategy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionOperation {
    Supply,
    ThenApply,
    ThenAccept,
    ThenRun,
    ThenCompose,
    ThenCombine,
    ThenAcceptBoth,
    ApplyToEither,
    AcceptEither,
    WhenComplete,
    Handle,
    Exceptionally,
    AllOf,
    AnyOf,
    CompletedValue,
    Delay,
    InvokeFunction,
    ExternalCompletion,
}

impl CompletionOperation {
    pub fn name(&self) -> &'static str {
        match self {
            CompletionOperation::Supply => "supply",
            CompletionOperation::ThenApply => "thenApply",
            CompletionOperation::ThenAccept => "thenAccept",
            CompletionOperation::ThenRun => "thenRun",
            CompletionOperation::ThenCompose => "thenCompose",
            CompletionOperation::ThenCombine => "thenCombine",
            CompletionOperation::ThenAcceptBoth => "thenAcceptBoth",
            CompletionOperation::ApplyToEither => "applyToEither",
            CompletionOperation::AcceptEither => "acceptEither",
            CompletionOperation::WhenComplete => "whenComplete",
            CompletionOperation::Handle => "handle",
            CompletionOperation::Exceptionally => "exceptionally",
            CompletionOperation::AllOf => "allOf",
            CompletionOperation::AnyOf => "anyOf",
            CompletionOperation::CompletedValue => "completedValue",
            CompletionOperation::Delay => "delay",
            CompletionOperation::InvokeFunction => "invokeFunction",
            CompletionOperation::ExternalCompletion => "externalCompletion",
        }
    }
}

impl fmt::Display for CompletionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Journal record. The journal sequence is the authoritative order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    GraphCreated {
        flow_id: FlowId,
        function_id: String,
        ts: DateTime<Utc>,
    },
    GraphCommitted {
        flow_id: FlowId,
        ts: DateTime<Utc>,
    },
    GraphTerminating {
        flow_id: FlowId,
        status: StatusValue,
        ts: DateTime<Utc>,
    },
    GraphCompleted {
        flow_id: FlowId,
        ts: DateTime<Utc>,
    },
    StageAdded {
        stage_id: StageId,
        operation: CompletionOperation,
        closure: Option<BlobRef>,
        dependencies: Vec<StageId>,
        ts: DateTime<Utc>,
    },
    StageCompleted {
        stage_id: StageId,
        result: CompletionResult,
        ts: DateTime<Utc>,
    },
    StageComposed {
        stage_id: StageId,
        composed_stage_id: StageId,
        ts: DateTime<Utc>,
    },
    DelayScheduled {
        stage_id: StageId,
        /// Absolute completion deadline, epoch milliseconds.
        time_ms: i64,
        ts: DateTime<Utc>,
    },
    FaasInvocationStarted {
        stage_id: StageId,
        ts: DateTime<Utc>,
    },
    FaasInvocationCompleted {
        stage_id: StageId,
        result: CompletionResult,
        ts: DateTime<Utc>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::GraphCreated { .. } => "graph_created",
            Event::GraphCommitted { .. } => "graph_committed",
            Event::GraphTerminating { .. } => "graph_terminating",
            Event::GraphCompleted { .. } => "graph_completed",
            Event::StageAdded { .. } => "stage_added",
            Event::StageCompleted { .. } => "stage_completed",
            Event::StageComposed { .. } => "stage_composed",
            Event::DelayScheduled { .. } => "delay_scheduled",
            Event::FaasInvocationStarted { .. } => "faas_invocation_started",
            Event::FaasInvocationCompleted { .. } => "faas_invocation_completed",
        }
    }
}

/// A journal event tagged with its flow and sequence number, as exposed on
/// the per-flow event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub flow_id: FlowId,
    pub seq: u64,
    pub event: Event,
}

/// Cluster-wide lifecycle notices, one stream across all flows on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    GraphCreated {
        flow_id: FlowId,
        function_id: String,
        seq: u64,
    },
    GraphCompleted {
        flow_id: FlowId,
        seq: u64,
    },
}

/// Client-facing request bound to a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowCommand {
    CreateGraph {
        function_id: String,
    },
    AddStage {
        operation: CompletionOperation,
        closure: Option<BlobRef>,
        dependencies: Vec<StageId>,
    },
    AddCompletedValueStage {
        result: CompletionResult,
    },
    AddDelayStage {
        delay_ms: u64,
    },
    AddInvokeFunctionStage {
        function_id: String,
        arg: HttpReqDatum,
    },
    AddExternalCompletionStage,
    CompleteStageExternally {
        stage_id: StageId,
        result: CompletionResult,
    },
    CommitGraph,
    GetStageResult {
        stage_id: StageId,
    },
    GetGraphState,
    StreamEvents,
}

/// Per-stage snapshot row in a graph state response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Successful,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub operation: CompletionOperation,
    pub status: StageStatus,
    pub dependencies: Vec<StageId>,
}

/// Point-in-time external view of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub flow_id: FlowId,
    pub function_id: String,
    pub stages: BTreeMap<StageId, StageSummary>,
}

/// Successful command responses.
#[derive(Debug)]
pub enum FlowResponse {
    GraphCreated {
        flow_id: FlowId,
    },
    StageAdded {
        stage_id: StageId,
    },
    StageCompletedExternally {
        stage_id: StageId,
        successful: bool,
    },
    GraphCommitted,
    StageResult {
        stage_id: StageId,
        result: CompletionResult,
    },
    GraphState(GraphState),
    EventStream {
        backlog: Vec<SequencedEvent>,
        live: tokio::sync::broadcast::Receiver<SequencedEvent>,
    },
}

/// Typed command failures returned to clients. Never surfaced as panics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("graph {flow_id} not found")]
    GraphNotFound { flow_id: FlowId },
    #[error("graph {flow_id} already exists")]
    GraphAlreadyExists { flow_id: FlowId },
    #[error("graph {flow_id} is already completed")]
    GraphAlreadyCompleted { flow_id: FlowId },
    #[error("stage {stage_id} not found in graph {flow_id}")]
    StageNotFound { flow_id: FlowId, stage_id: StageId },
    #[error("graph {flow_id} refers to an invalid stage dependency")]
    InvalidStageDependency { flow_id: FlowId },
    #[error("unrecognized operation in graph {flow_id}")]
    UnknownOperation { flow_id: FlowId },
    #[error("wrong number of dependencies for {operation} in graph {flow_id}")]
    InvalidOperandCount {
        flow_id: FlowId,
        operation: CompletionOperation,
    },
    #[error("stage {stage_id} in graph {flow_id} completed abnormally or timed out")]
    StageCompletionError { flow_id: FlowId, stage_id: StageId },
    #[error("failed to persist event for graph {flow_id}")]
    EventPersistenceError { flow_id: FlowId },
}

/// Capability of any message that can be routed to a flow's actor.
pub trait Routable {
    fn flow_id(&self) -> FlowId;
}
