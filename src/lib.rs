//! Millrace - a completion-flow engine over a FaaS backend
//!
//! Client programs submit completion flows: DAGs of asynchronous stages whose
//! combinators mirror a widely used futures API. Each flow is an
//! event-sourced state machine owned by one actor; every state change is
//! journaled so a flow survives crash and migration. The key components are:
//!
//! ## Flow engine
//!
//! - [`graph`]: the per-flow dependency graph, trigger evaluation, recovery
//! - [`strategy`]: combinator semantics as a static table
//! - [`actor`]: the event-sourced actor owning one flow
//!
//! ## Infrastructure
//!
//! - [`executor`]: stage and function invocation over HTTP
//! - [`supervisor`]: per-node routing and demand spawning
//! - [`cluster`]: flow placement and cross-node proxying
//! - [`journal`] / [`blobs`]: append-only event log and blob storage

pub mod actor;
pub mod blobs;
pub mod cluster;
pub mod config;
pub mod executor;
pub mod graph;
pub mod journal;
pub mod model;
pub mod protocol;
pub mod strategy;
pub mod supervisor;

// Configuration
pub use config::Config;

// Core model
pub use model::{
    BlobRef, CompletionOperation, CompletionResult, Datum, ErrorKind, Event, FlowCommand,
    FlowError, FlowId, FlowResponse, GraphState, HttpHeader, HttpMethod, HttpReqDatum,
    HttpRespDatum, LifecycleEvent, ResultStatus, SequencedEvent, StageId, StageStatus,
};

// Flow engine
pub use graph::{CompletionGraph, CompletionStage, GraphListener};
pub use strategy::{dependency_arity, strategy_for, ResultMode, Strategy, TriggerRule};

// Actors
pub use actor::{spawn_graph_actor, GraphActorConfig, GraphActorHandle, GraphRequest};
pub use supervisor::{Supervisor, SupervisorHandle};

// Execution
pub use executor::{
    Executor, ExecutorConfig, ExecutorHandle, FaasInvocationResponse, InvokeFunctionRequest,
    InvokeStageRequest,
};

// Cluster
pub use cluster::{ClusterConfig, ClusterManager, ClusterProxy, FlowNodeClient, LocalFlowNode};

// Persistence
pub use blobs::{BlobStore, InMemoryBlobStore, SqlBlobStore};
pub use journal::{EventJournal, InMemoryJournal, SqlJournal};
