//! Control-plane HTTP API
//!
//! All paths live under `/api`. Login, check-auth and the optional
//! data-wipe endpoint are unprotected; everything else requires a valid
//! session cookie.

use crate::auth::{cookie_value, session_cookie, AuthProvider};
use crate::error::{json_response, text_response, ResponseBody};
use crate::orchestrator::StackOrchestrator;
use crate::runtime::StackState;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{COOKIE, SET_COOKIE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Paths reachable without a session
const UNPROTECTED_PATHS: &[&str] = &["/api/login", "/api/check-auth", "/api/stacks/wipe-data"];

/// Everything the API handlers need, injected at construction
pub struct ApiContext {
    pub orchestrator: Arc<StackOrchestrator>,
    pub auth: Arc<dyn AuthProvider>,
    pub cookie_name: String,
    pub wipe_endpoint_enabled: bool,
}

#[derive(Serialize)]
struct StackInfo {
    name: String,
    state: &'static str,
    #[serde(rename = "urlPath")]
    url_path: String,
}

#[derive(Deserialize)]
struct StackNameBody {
    name: String,
}

#[derive(Deserialize)]
struct LoginBody {
    user: String,
    password: String,
}

/// Dispatch one `/api/*` request
pub async fn handle_api_request(
    req: Request<Incoming>,
    ctx: Arc<ApiContext>,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    debug!(%method, %path, "Control-plane API request");

    let session = session_of(&req, &ctx);
    if !UNPROTECTED_PATHS.contains(&path.as_str()) && session.is_none() {
        debug!(%path, "Rejecting unauthenticated API request");
        return Ok(text_response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/api/stacks/read") => read_stacks(&ctx).await,

        (&Method::POST, "/api/stacks/deploy") => {
            let Some(name) = decode_stack_name(req).await? else {
                return Ok(text_response(StatusCode::BAD_REQUEST, "Failed to decode JSON"));
            };
            deploy_stack(&ctx, &name).await
        }

        (&Method::POST, "/api/stacks/stop") => {
            let Some(name) = decode_stack_name(req).await? else {
                return Ok(text_response(StatusCode::BAD_REQUEST, "Failed to decode JSON"));
            };
            stop_stack(&ctx, &name).await
        }

        (&Method::POST, "/api/stacks/wipe-data") if ctx.wipe_endpoint_enabled => {
            wipe_data(&ctx).await
        }

        (&Method::POST, "/api/login") => {
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<LoginBody>(&body) {
                Ok(login) => handle_login(&ctx, &login),
                Err(_) => text_response(StatusCode::BAD_REQUEST, "Failed to decode JSON"),
            }
        }

        (&Method::GET, "/api/check-auth") => match session {
            Some(_) => text_response(StatusCode::OK, "ok"),
            None => text_response(StatusCode::UNAUTHORIZED, "unauthorized"),
        },

        (&Method::GET, "/api/secret") => issue_secret(&ctx, &req),

        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Session cookie value of the request, if it resolves to a live session
fn session_of(req: &Request<Incoming>, ctx: &ApiContext) -> Option<String> {
    let header = req.headers().get(COOKIE)?.to_str().ok()?;
    let value = cookie_value(header, &ctx.cookie_name)?;
    ctx.auth.validate_session(&value)?;
    Some(value)
}

async fn read_stacks(ctx: &ApiContext) -> Response<ResponseBody> {
    let state_info = ctx.orchestrator.list_state().await;
    let stacks: Vec<StackInfo> = state_info
        .into_iter()
        .map(|(name, details)| StackInfo {
            name,
            state: details.state.as_str(),
            url_path: details.path,
        })
        .collect();

    match serde_json::to_string(&stacks) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize stack state info");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

async fn deploy_stack(ctx: &ApiContext, name: &str) -> Response<ResponseBody> {
    if let Err(e) = ctx.orchestrator.deploy(name).await {
        error!(stack = name, error = %e, "Deploying stack failed");
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Deploying stack failed: {name}"),
        );
    }
    text_response(StatusCode::OK, "")
}

async fn stop_stack(ctx: &ApiContext, name: &str) -> Response<ResponseBody> {
    if let Err(e) = ctx.orchestrator.stop(name).await {
        warn!(stack = name, error = %e, "Stopping stack failed");
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Stopping stack failed: {name}"),
        );
    }
    text_response(StatusCode::OK, "")
}

/// Stop every stack that left `Uninitialized`, logging failures instead of
/// aborting: the endpoint exists to reset non-production environments.
async fn wipe_data(ctx: &ApiContext) -> Response<ResponseBody> {
    let state_info = ctx.orchestrator.list_state().await;
    for (name, details) in state_info {
        if details.state != StackState::Uninitialized {
            if let Err(e) = ctx.orchestrator.stop(&name).await {
                error!(stack = %name, error = %e, "Could not stop stack during wipe");
            }
        }
    }
    text_response(StatusCode::OK, "")
}

fn handle_login(ctx: &ApiContext, login: &LoginBody) -> Response<ResponseBody> {
    match ctx.auth.login(&login.user, &login.password) {
        Some(cookie_value) => {
            info!(user = %login.user, "User logged in");
            let mut response = text_response(StatusCode::OK, "");
            let cookie = session_cookie(&ctx.cookie_name, &cookie_value);
            if let Ok(value) = cookie.parse() {
                response.headers_mut().insert(SET_COOKIE, value);
            }
            response
        }
        None => {
            warn!(user = %login.user, "Login rejected");
            text_response(StatusCode::UNAUTHORIZED, "invalid credentials")
        }
    }
}

/// Mint a one-time secret bound to the caller's session, for handing the
/// session off to an app subdomain.
fn issue_secret(ctx: &ApiContext, req: &Request<Incoming>) -> Response<ResponseBody> {
    // The auth wall already ran, so the cookie resolves unless the session
    // was invalidated in between.
    let cookie_header = req
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(value) = cookie_value(cookie_header, &ctx.cookie_name) else {
        return text_response(StatusCode::UNAUTHORIZED, "unauthorized");
    };

    match ctx.auth.issue_secret(&value) {
        Some(secret) => {
            let body = serde_json::json!({ "secret": secret });
            json_response(StatusCode::OK, body.to_string())
        }
        None => text_response(StatusCode::UNAUTHORIZED, "unauthorized"),
    }
}

async fn decode_stack_name(req: Request<Incoming>) -> Result<Option<String>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice::<StackNameBody>(&body)
        .ok()
        .map(|b| b.name))
}
