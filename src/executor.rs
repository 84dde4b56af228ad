//! FaaS executor.
//!
//! A per-node actor that turns stage and function invocations into outbound
//! HTTP calls against the FaaS backend. Requests arrive on a mailbox; the
//! HTTP work runs on detached tasks so a slow function never blocks the
//! mailbox, and every outcome (including transport failure) comes back to the
//! requesting graph actor as a [`FaasInvocationResponse`] message.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blobs::BlobStore;
use crate::model::{
    BlobRef, CompletionOperation, CompletionResult, Datum, ErrorKind, FlowId, HttpHeader,
    HttpReqDatum, HttpRespDatum, Routable, StageId,
};
use crate::protocol::{
    self, write_datum, DEFAULT_CONTENT_TYPE, HEADER_FLOW_ID, HEADER_STAGE_ID,
};

/// Invoke a stage's closure with encoded arguments.
#[derive(Debug, Clone)]
pub struct InvokeStageRequest {
    pub flow_id: FlowId,
    pub stage_id: StageId,
    pub function_id: String,
    pub operation: CompletionOperation,
    pub closure: Option<BlobRef>,
    pub args: Vec<Datum>,
}

/// Invoke an external function with an HTTP request payload.
#[derive(Debug, Clone)]
pub struct InvokeFunctionRequest {
    pub flow_id: FlowId,
    pub stage_id: StageId,
    pub function_id: String,
    pub arg: HttpReqDatum,
}

/// Reply delivered to the requesting graph actor.
#[derive(Debug, Clone)]
pub struct FaasInvocationResponse {
    pub flow_id: FlowId,
    pub stage_id: StageId,
    pub function_id: String,
    pub result: CompletionResult,
}

impl Routable for InvokeStageRequest {
    fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

impl Routable for InvokeFunctionRequest {
    fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

impl Routable for FaasInvocationResponse {
    fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

#[derive(Debug)]
pub enum ExecutorRequest {
    InvokeStage(InvokeStageRequest, mpsc::Sender<FaasInvocationResponse>),
    InvokeFunction(InvokeFunctionRequest, mpsc::Sender<FaasInvocationResponse>),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Base address of the FaaS backend, e.g. `http://functions:8080/r`.
    pub faas_addr: String,
    /// Hard client timeout for each outbound call.
    pub request_timeout: Duration,
}

impl ExecutorConfig {
    pub fn new(faas_addr: impl Into<String>) -> Self {
        ExecutorConfig {
            faas_addr: faas_addr.into(),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Cloneable mailbox address of the executor.
#[derive(Clone, Debug)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<ExecutorRequest>,
}

impl ExecutorHandle {
    pub async fn send(&self, request: ExecutorRequest) {
        if self.tx.send(request).await.is_err() {
            warn!("executor mailbox closed, dropping invocation request");
        }
    }
}

pub struct Executor {
    handle: ExecutorHandle,
    task: JoinHandle<()>,
}

impl Executor {
    pub fn start(config: ExecutorConfig, blobs: Arc<dyn BlobStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| panic!("failed to build FaaS HTTP client: {e}"));
        let (tx, mut rx) = mpsc::channel::<ExecutorRequest>(256);
        let inner = Arc::new(ExecutorInner {
            faas_addr: config.faas_addr.trim_end_matches('/').to_string(),
            client,
            blobs,
        });
        info!(faas_addr = %inner.faas_addr, "starting executor");

        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    match request {
                        ExecutorRequest::InvokeStage(msg, reply) => {
                            let response = inner.handle_invoke_stage(&msg).await;
                            if reply.send(response).await.is_err() {
                                debug!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, "requester gone before stage invocation reply");
                            }
                        }
                        ExecutorRequest::InvokeFunction(msg, reply) => {
                            let response = inner.handle_invoke_function(&msg).await;
                            if reply.send(response).await.is_err() {
                                debug!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, "requester gone before function invocation reply");
                            }
                        }
                    }
                });
            }
        });

        Executor {
            handle: ExecutorHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) {
        drop(self.handle);
        let _ = self.task.await;
    }
}

struct ExecutorInner {
    faas_addr: String,
    client: reqwest::Client,
    blobs: Arc<dyn BlobStore>,
}

impl ExecutorInner {
    fn function_url(&self, function_id: &str) -> String {
        format!(
            "{}/{}",
            self.faas_addr,
            function_id.trim_start_matches('/')
        )
    }

    async fn handle_invoke_stage(&self, msg: &InvokeStageRequest) -> FaasInvocationResponse {
        debug!(
            flow_id = %msg.flow_id,
            stage_id = %msg.stage_id,
            function_id = %msg.function_id,
            operation = %msg.operation,
            "invoking stage"
        );

        let form = match self.build_stage_form(msg).await {
            Ok(form) => form,
            Err(e) => {
                error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "failed to encode stage invocation body");
                return stage_response(
                    msg,
                    CompletionResult::internal_error(
                        ErrorKind::StageFailed,
                        "error creating stage invoke request",
                    ),
                );
            }
        };

        let request = self
            .client
            .post(self.function_url(&msg.function_id))
            .header(HEADER_FLOW_ID, msg.flow_id.to_string())
            .header(HEADER_STAGE_ID, msg.stage_id.to_string())
            .multipart(form);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return stage_response(
                    msg,
                    CompletionResult::internal_error(ErrorKind::StageTimeout, "stage timed out"),
                );
            }
            Err(e) => {
                error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "HTTP error invoking stage");
                return stage_response(
                    msg,
                    CompletionResult::internal_error(
                        ErrorKind::StageFailed,
                        "HTTP error invoking stage",
                    ),
                );
            }
        };

        let status = response.status().as_u16();
        if status != 200 {
            warn!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, http_status = status, "non-200 from FaaS endpoint");
            if status == 504 {
                return stage_response(
                    msg,
                    CompletionResult::internal_error(ErrorKind::StageTimeout, "stage timed out"),
                );
            }
            return stage_response(
                msg,
                CompletionResult::internal_error(
                    ErrorKind::StageFailed,
                    format!("invalid HTTP response from functions platform, code {status}"),
                ),
            );
        }

        let headers = collect_headers(response.headers());
        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "failed to read stage response body");
                return stage_response(
                    msg,
                    CompletionResult::internal_error(
                        ErrorKind::InvalidStageResponse,
                        "failed to read result from functions service",
                    ),
                );
            }
        };

        match protocol::read_completion_result(self.blobs.as_ref(), &headers, &body).await {
            Ok(result) => {
                debug!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, successful = result.is_successful(), "got stage response");
                stage_response(msg, result)
            }
            Err(e) => {
                error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "failed to parse stage response");
                stage_response(
                    msg,
                    CompletionResult::internal_error(
                        ErrorKind::InvalidStageResponse,
                        "failed to read result from functions service",
                    ),
                )
            }
        }
    }

    async fn build_stage_form(&self, msg: &InvokeStageRequest) -> anyhow::Result<Form> {
        let mut form = Form::new();
        if let Some(closure) = &msg.closure {
            let frame = write_datum(self.blobs.as_ref(), &Datum::Blob(closure.clone())).await?;
            form = form.part("closure", frame_to_part(frame)?);
        }
        for (i, arg) in msg.args.iter().enumerate() {
            let frame = write_datum(self.blobs.as_ref(), arg).await?;
            form = form.part(format!("arg_{i}"), frame_to_part(frame)?);
        }
        Ok(form)
    }

    async fn handle_invoke_function(&self, msg: &InvokeFunctionRequest) -> FaasInvocationResponse {
        debug!(
            flow_id = %msg.flow_id,
            stage_id = %msg.stage_id,
            target_function_id = %msg.function_id,
            method = msg.arg.method.as_str(),
            "sending function invocation"
        );

        let method = reqwest::Method::from_bytes(msg.arg.method.as_str().as_bytes())
            .expect("method set comes from a fixed enum");
        let mut request = self
            .client
            .request(method, self.function_url(&msg.function_id));
        for h in &msg.arg.headers {
            request = request.header(&h.key, &h.value);
        }
        if let Some(body) = &msg.arg.body {
            let bytes = match self.blobs.read(body).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "failed to read function body blob");
                    return function_response(msg, "failed to read request body");
                }
            };
            request = request
                .header(reqwest::header::CONTENT_TYPE, body.content_type.clone())
                .body(bytes);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "HTTP error calling functions service");
                return function_response(msg, "failed to call function");
            }
        };

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let headers: Vec<HttpHeader> = collect_headers(response.headers())
            .into_iter()
            .filter(|h| !h.key.eq_ignore_ascii_case("content-type"))
            .collect();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "error reading data from function");
                return function_response(msg, "could not read function response");
            }
        };

        let body = if bytes.is_empty() {
            None
        } else {
            match self.blobs.create(&content_type, bytes.to_vec()).await {
                Ok(blob) => Some(blob),
                Err(e) => {
                    error!(flow_id = %msg.flow_id, stage_id = %msg.stage_id, error = %e, "failed to store function response body");
                    return function_response(msg, "could not store function response");
                }
            }
        };

        let datum = Datum::HttpResp(HttpRespDatum {
            status_code,
            headers,
            body,
        });
        // Non-error codes count as success.
        let result = if (200..400).contains(&status_code) {
            CompletionResult::success(datum)
        } else {
            CompletionResult::failure(datum)
        };
        FaasInvocationResponse {
            flow_id: msg.flow_id,
            stage_id: msg.stage_id,
            function_id: msg.function_id.clone(),
            result,
        }
    }
}

fn stage_response(msg: &InvokeStageRequest, result: CompletionResult) -> FaasInvocationResponse {
    FaasInvocationResponse {
        flow_id: msg.flow_id,
        stage_id: msg.stage_id,
        function_id: msg.function_id.clone(),
        result,
    }
}

fn function_response(msg: &InvokeFunctionRequest, message: &str) -> FaasInvocationResponse {
    FaasInvocationResponse {
        flow_id: msg.flow_id,
        stage_id: msg.stage_id,
        function_id: msg.function_id.clone(),
        result: CompletionResult::internal_error(ErrorKind::FunctionInvokeFailed, message),
    }
}

fn frame_to_part(frame: protocol::DatumFrame) -> anyhow::Result<Part> {
    let mut headers = HeaderMap::new();
    for h in &frame.headers {
        headers.append(
            HeaderName::from_bytes(h.key.as_bytes())?,
            HeaderValue::from_str(&h.value)?,
        );
    }
    Ok(Part::bytes(frame.body).headers(headers))
}

fn collect_headers(headers: &HeaderMap) -> Vec<HttpHeader> {
    headers
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|v| HttpHeader {
                key: key.as_str().to_string(),
                value: v.to_string(),
            })
        })
        .collect()
}
