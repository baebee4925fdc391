//! The single HTTP entry point
//!
//! Every inbound request is dispatched by exact hostname match: the
//! configured control-plane hostnames reach the API, everything else is
//! treated as `<stack>.<root_domain>` and reverse-proxied to the backing
//! container - after either exchanging a one-time handoff secret or
//! validating the session cookie.

use crate::api::{handle_api_request, ApiContext};
use crate::auth::{cookie_value, session_cookie, AuthProvider};
use crate::error::{text_response, ResponseBody};
use crate::pool::ConnectionPool;
use crate::stack_config::StackConfigProvider;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, COOKIE, HOST, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Header carrying the original Host to the proxied stack
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Query parameter carrying a one-time session-handoff token
const SECRET_PARAM: &str = "secret";

/// Shared, immutable per-request dependencies of the proxy
pub struct ProxyContext {
    pub api: Arc<ApiContext>,
    pub auth: Arc<dyn AuthProvider>,
    pub configs: Arc<StackConfigProvider>,
    pub control_hosts: Vec<String>,
    pub root_domain: String,
    pub cookie_name: String,
    pub pool: ConnectionPool,
}

impl ProxyContext {
    fn is_control_host(&self, host: &str) -> bool {
        self.control_hosts.iter().any(|h| h == host)
    }
}

/// The host-routing proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<ProxyContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, context: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&context);
        async move { handle_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let Some(host) = host_of(&req) else {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "Missing or invalid Host header",
        ));
    };

    if ctx.is_control_host(&host) {
        if req.uri().path().starts_with("/api/") {
            handle_api_request(req, Arc::clone(&ctx.api)).await
        } else {
            // The control-plane GUI is served by a separate asset server.
            Ok(text_response(StatusCode::NOT_FOUND, "not found"))
        }
    } else {
        proxy_to_stack(req, &host, ctx).await
    }
}

/// Proxy branch: resolve the stack from the subdomain and forward, unless
/// the request carries a one-time handoff secret.
async fn proxy_to_stack(
    mut req: Request<Incoming>,
    host: &str,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let hostname = host.split(':').next().unwrap_or(host);
    let stack = hostname
        .strip_suffix(&format!(".{}", ctx.root_domain))
        .unwrap_or(hostname);
    debug!(stack, host, "Proxying request");

    // One-time secret exchange: the token is traded for a session cookie
    // scoped to this subdomain, and the browser is redirected to the same
    // URL without the secret so it never reaches the app's logs. The
    // original request is not forwarded.
    if let Some(secret) = query_param(req.uri(), SECRET_PARAM) {
        let Some(value) = ctx.auth.get_and_invalidate_secret(&secret) else {
            error!(stack, "Failed to get associated cookie value or delete secret");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to get associated cookie value or delete secret",
            ));
        };

        let location = uri_without_query_param(req.uri(), SECRET_PARAM);
        let cookie = session_cookie(&ctx.cookie_name, &value);
        let mut response = text_response(StatusCode::FOUND, "");
        if let Ok(value) = cookie.parse() {
            response.headers_mut().insert(SET_COOKIE, value);
        }
        if let Ok(value) = location.parse() {
            response.headers_mut().insert(LOCATION, value);
        }
        debug!(stack, location = %location, "Exchanged handoff secret for session cookie");
        return Ok(response);
    }

    // Normal path: the request must carry a valid session.
    if !has_valid_session(&req, &ctx) {
        debug!(stack, "Rejecting unauthenticated proxied request");
        return Ok(text_response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let port = ctx.configs.get(stack).port;
    let authority = format!("{}:{}", stack, port);

    if let Ok(value) = HeaderValue::from_str(host) {
        req.headers_mut().insert(X_FORWARDED_HOST, value);
    }

    match ctx.pool.send_request(req, &authority).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(stack, authority = %authority, error = %e, "Failed to forward request to stack");
            Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "failed to reach the stack",
            ))
        }
    }
}

fn has_valid_session(req: &Request<Incoming>, ctx: &ProxyContext) -> bool {
    let Some(header) = req.headers().get(COOKIE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(value) = cookie_value(header, &ctx.cookie_name) else {
        return false;
    };
    ctx.auth.validate_session(&value).is_some()
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Host header of the request, port included, lightly validated so stack
/// names derived from it are safe to log and to place in a URI authority.
fn host_of(req: &Request<Incoming>) -> Option<String> {
    let host = req.headers().get(HOST).and_then(|h| h.to_str().ok())?;

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN + 6 {
        return None;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':')
    {
        warn!(host, "Rejecting request with suspicious Host header");
        return None;
    }

    Some(host.to_lowercase())
}

/// Value of a query parameter, if present
fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// The request's path and query with one parameter removed
fn uri_without_query_param(uri: &Uri, key: &str) -> String {
    let remaining: Vec<&str> = uri
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split_once('=').map(|(k, _)| k) != Some(key))
        .collect();

    if remaining.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), remaining.join("&"))
    }
}
