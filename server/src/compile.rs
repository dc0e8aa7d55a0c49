use std::future::Future;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use tokio::task::JoinError;
use tracing::{instrument, warn, Instrument, Span};
use webcompile_build::{CompileRequest, CompileResult, Error};

use crate::AppState;

/// Every failure of a compile request is reported the same way: a 500 with
/// the message as plain text.
#[derive(Debug)]
pub(crate) enum CompileError {
    Compile(Error),
    Panic(String),
}

impl From<Error> for CompileError {
    fn from(value: Error) -> Self {
        CompileError::Compile(value)
    }
}

impl IntoResponse for CompileError {
    fn into_response(self) -> Response {
        let msg = match self {
            CompileError::Compile(e) => e.to_string(),
            CompileError::Panic(msg) => msg,
        };
        warn!(err=%msg, "compile request failed");

        (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
    }
}

#[instrument(skip_all)]
pub(crate) async fn post(
    State(AppState { service }): State<AppState>,
    body: Bytes,
) -> Result<Json<CompileResult>, CompileError> {
    let request: CompileRequest = serde_json::from_slice(&body).map_err(Error::from)?;

    run_detached(async move { service.compile(request).await }).await
}

/// Runs `compile` on its own task, which keeps running if the client
/// disconnects, so the workspace is always cleaned up.
async fn run_detached<F>(compile: F) -> Result<Json<CompileResult>, CompileError>
where
    F: Future<Output = Result<CompileResult, Error>> + Send + 'static,
{
    let handle = tokio::spawn(compile.instrument(Span::current()));

    match handle.await {
        Ok(result) => Ok(Json(result?)),
        Err(e) => Err(CompileError::Panic(join_error_message(e))),
    }
}

/// Extracts the panic message out of a failed task.
fn join_error_message(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }

    let panic = e.into_panic();
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown error".to_string()
    }
}
