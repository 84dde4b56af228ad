//! Datum wire format shared with the FaaS backend.
//!
//! Each datum travels as one multipart part or one HTTP message. The part
//! headers carry the datum type and its type-specific fields; bodies hold
//! blob bytes. Bodies are staged through the blob store in both directions so
//! events never carry payloads inline.

use thiserror::Error;

use crate::blobs::{BlobError, BlobStore};
use crate::model::{
    CompletionResult, Datum, ErrorKind, HttpHeader, HttpMethod, HttpReqDatum, HttpRespDatum,
    StageId,
};

pub const HEADER_DATUM_TYPE: &str = "FnProject-DatumType";
pub const HEADER_RESULT_STATUS: &str = "FnProject-ResultStatus";
pub const HEADER_ERROR_TYPE: &str = "FnProject-ErrorType";
pub const HEADER_STAGE_REF: &str = "FnProject-StageRef";
pub const HEADER_METHOD: &str = "FnProject-Method";
pub const HEADER_RESULT_CODE: &str = "FnProject-ResultCode";
pub const HEADER_HEADER_PREFIX: &str = "FnProject-Header-";
pub const HEADER_FLOW_ID: &str = "FnProject-Threadid";
pub const HEADER_STAGE_ID: &str = "FnProject-Stageid";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

pub const DATUM_TYPE_BLOB: &str = "blob";
pub const DATUM_TYPE_EMPTY: &str = "empty";
pub const DATUM_TYPE_ERROR: &str = "error";
pub const DATUM_TYPE_STAGE_REF: &str = "stageref";
pub const DATUM_TYPE_HTTP_REQ: &str = "httpreq";
pub const DATUM_TYPE_HTTP_RESP: &str = "httpresp";

pub const RESULT_STATUS_SUCCESS: &str = "success";
pub const RESULT_STATUS_FAILURE: &str = "failure";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("unrecognized datum type {0:?}")]
    InvalidDatumType(String),
    #[error("error datums must be text/plain")]
    InvalidErrorContentType,
    #[error("invalid stage reference {0:?}")]
    InvalidStageRef(String),
    #[error("invalid HTTP method {0:?}")]
    InvalidHttpMethod(String),
    #[error("invalid result code {0:?}")]
    InvalidResultCode(String),
    #[error("invalid result status {0:?}")]
    InvalidResultStatus(String),
    #[error("datum has no wire representation")]
    UnsupportedDatum,
    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// One encoded datum: the headers and body of a multipart part or HTTP
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatumFrame {
    pub headers: Vec<HttpHeader>,
    pub body: Vec<u8>,
}

fn get_header<'a>(headers: &'a [HttpHeader], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.key.eq_ignore_ascii_case(key))
        .map(|h| h.value.as_str())
}

fn user_headers(headers: &[HttpHeader]) -> Vec<HttpHeader> {
    headers
        .iter()
        .filter_map(|h| {
            let (prefix, name) = h.key.split_at_checked(HEADER_HEADER_PREFIX.len())?;
            if !name.is_empty() && prefix.eq_ignore_ascii_case(HEADER_HEADER_PREFIX) {
                Some(HttpHeader {
                    key: name.to_string(),
                    value: h.value.clone(),
                })
            } else {
                None
            }
        })
        .collect()
}

fn header(key: impl Into<String>, value: impl Into<String>) -> HttpHeader {
    HttpHeader {
        key: key.into(),
        value: value.into(),
    }
}

/// Encode a datum into a wire frame, pulling blob bodies from the store.
pub async fn write_datum(
    store: &dyn BlobStore,
    datum: &Datum,
) -> Result<DatumFrame, ProtocolError> {
    match datum {
        Datum::Empty => Ok(DatumFrame {
            headers: vec![header(HEADER_DATUM_TYPE, DATUM_TYPE_EMPTY)],
            body: Vec::new(),
        }),
        Datum::Blob(blob) => Ok(DatumFrame {
            headers: vec![
                header(HEADER_DATUM_TYPE, DATUM_TYPE_BLOB),
                header(HEADER_CONTENT_TYPE, blob.content_type.clone()),
            ],
            body: store.read(blob).await?,
        }),
        Datum::Error { kind, message } => Ok(DatumFrame {
            headers: vec![
                header(HEADER_DATUM_TYPE, DATUM_TYPE_ERROR),
                header(HEADER_CONTENT_TYPE, "text/plain"),
                header(HEADER_ERROR_TYPE, kind.wire_name()),
            ],
            body: message.clone().into_bytes(),
        }),
        Datum::StageRef(stage_id) => Ok(DatumFrame {
            headers: vec![
                header(HEADER_DATUM_TYPE, DATUM_TYPE_STAGE_REF),
                header(HEADER_STAGE_REF, stage_id.to_string()),
            ],
            body: Vec::new(),
        }),
        Datum::HttpReq(req) => {
            let mut headers = vec![
                header(HEADER_DATUM_TYPE, DATUM_TYPE_HTTP_REQ),
                header(HEADER_METHOD, req.method.as_str()),
            ];
            for h in &req.headers {
                headers.push(header(
                    format!("{HEADER_HEADER_PREFIX}{}", h.key),
                    h.value.clone(),
                ));
            }
            let body = match &req.body {
                Some(blob) => {
                    headers.push(header(HEADER_CONTENT_TYPE, blob.content_type.clone()));
                    store.read(blob).await?
                }
                None => Vec::new(),
            };
            Ok(DatumFrame { headers, body })
        }
        Datum::HttpResp(resp) => {
            let mut headers = vec![
                header(HEADER_DATUM_TYPE, DATUM_TYPE_HTTP_RESP),
                header(HEADER_RESULT_CODE, resp.status_code.to_string()),
            ];
            for h in &resp.headers {
                headers.push(header(
                    format!("{HEADER_HEADER_PREFIX}{}", h.key),
                    h.value.clone(),
                ));
            }
            let body = match &resp.body {
                Some(blob) => {
                    headers.push(header(HEADER_CONTENT_TYPE, blob.content_type.clone()));
                    store.read(blob).await?
                }
                None => Vec::new(),
            };
            Ok(DatumFrame { headers, body })
        }
        Datum::Status(_) => Err(ProtocolError::UnsupportedDatum),
    }
}

/// Decode a datum from message headers and body, staging any body bytes into
/// the blob store.
pub async fn read_datum(
    store: &dyn BlobStore,
    headers: &[HttpHeader],
    body: &[u8],
) -> Result<Datum, ProtocolError> {
    let datum_type = get_header(headers, HEADER_DATUM_TYPE)
        .ok_or(ProtocolError::MissingHeader(HEADER_DATUM_TYPE))?;

    match datum_type {
        DATUM_TYPE_EMPTY => Ok(Datum::Empty),
        DATUM_TYPE_BLOB => {
            let content_type = get_header(headers, HEADER_CONTENT_TYPE)
                .ok_or(ProtocolError::MissingHeader(HEADER_CONTENT_TYPE))?;
            let blob = store.create(content_type, body.to_vec()).await?;
            Ok(Datum::Blob(blob))
        }
        DATUM_TYPE_ERROR => {
            let content_type = get_header(headers, HEADER_CONTENT_TYPE)
                .ok_or(ProtocolError::MissingHeader(HEADER_CONTENT_TYPE))?;
            if content_type != "text/plain" {
                return Err(ProtocolError::InvalidErrorContentType);
            }
            let error_type = get_header(headers, HEADER_ERROR_TYPE)
                .ok_or(ProtocolError::MissingHeader(HEADER_ERROR_TYPE))?;
            Ok(Datum::Error {
                kind: ErrorKind::from_wire_name(error_type),
                message: String::from_utf8_lossy(body).into_owned(),
            })
        }
        DATUM_TYPE_STAGE_REF => {
            let raw = get_header(headers, HEADER_STAGE_REF)
                .ok_or(ProtocolError::MissingHeader(HEADER_STAGE_REF))?;
            let stage_id = raw
                .parse::<u32>()
                .map_err(|_| ProtocolError::InvalidStageRef(raw.to_string()))?;
            Ok(Datum::StageRef(StageId(stage_id)))
        }
        DATUM_TYPE_HTTP_REQ => {
            let raw_method = get_header(headers, HEADER_METHOD)
                .ok_or(ProtocolError::MissingHeader(HEADER_METHOD))?;
            let method = HttpMethod::parse(raw_method)
                .ok_or_else(|| ProtocolError::InvalidHttpMethod(raw_method.to_string()))?;
            let body = read_optional_body(store, headers, body).await?;
            Ok(Datum::HttpReq(HttpReqDatum {
                method,
                headers: user_headers(headers),
                body,
            }))
        }
        DATUM_TYPE_HTTP_RESP => {
            let raw_code = get_header(headers, HEADER_RESULT_CODE)
                .ok_or(ProtocolError::MissingHeader(HEADER_RESULT_CODE))?;
            let status_code = raw_code
                .parse::<u16>()
                .map_err(|_| ProtocolError::InvalidResultCode(raw_code.to_string()))?;
            let body = read_optional_body(store, headers, body).await?;
            Ok(Datum::HttpResp(HttpRespDatum {
                status_code,
                headers: user_headers(headers),
                body,
            }))
        }
        other => Err(ProtocolError::InvalidDatumType(other.to_string())),
    }
}

/// Decode a stage invocation response: a datum plus the result status header.
pub async fn read_completion_result(
    store: &dyn BlobStore,
    headers: &[HttpHeader],
    body: &[u8],
) -> Result<CompletionResult, ProtocolError> {
    let raw_status = get_header(headers, HEADER_RESULT_STATUS)
        .ok_or(ProtocolError::MissingHeader(HEADER_RESULT_STATUS))?;
    let successful = match raw_status {
        RESULT_STATUS_SUCCESS => true,
        RESULT_STATUS_FAILURE => false,
        other => return Err(ProtocolError::InvalidResultStatus(other.to_string())),
    };
    let datum = read_datum(store, headers, body).await?;
    Ok(if successful {
        CompletionResult::success(datum)
    } else {
        CompletionResult::failure(datum)
    })
}

async fn read_optional_body(
    store: &dyn BlobStore,
    headers: &[HttpHeader],
    body: &[u8],
) -> Result<Option<crate::model::BlobRef>, ProtocolError> {
    if body.is_empty() {
        return Ok(None);
    }
    let content_type = get_header(headers, HEADER_CONTENT_TYPE).unwrap_or(DEFAULT_CONTENT_TYPE);
    Ok(Some(store.create(content_type, body.to_vec()).await?))
}
