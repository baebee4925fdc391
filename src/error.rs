//! Error taxonomy and HTTP response helpers

use crate::runtime::StackState;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors surfaced by stack lifecycle operations.
///
/// Adapter-level failures are logged with full command context at the call
/// site; only these stable variants travel up to API clients, so diagnostics
/// stay in the logs and never leak command internals over HTTP.
#[derive(Debug, Error)]
pub enum StackError {
    /// No definition directory (or compose file) exists for this name.
    #[error("could not find stack: {0}")]
    StackNotFound(String),

    /// Stop was requested on a stack that is not in a stoppable state.
    #[error("stack '{name}' cannot be stopped while {state}")]
    InvalidTransition { name: String, state: StackState },

    /// The underlying container runtime command failed.
    #[error("{0}")]
    RuntimeFailure(String),
}

impl StackError {
    pub fn not_found(name: impl Into<String>) -> Self {
        StackError::StackNotFound(name.into())
    }
}

/// Body type served by every handler in this crate.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Build a plain-text response - infallible with valid StatusCode
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Build a JSON response from an already-serialized body
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
