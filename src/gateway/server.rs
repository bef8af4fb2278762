//! The gateway's accept loop (spec C7/§6): terminates HTTP, routes each
//! connection's requests to either the brokered-proxy path or the admin
//! JSON API, and shuts down on `watch::Receiver<bool>` like the rest of
//! the crate's long-running components.
//!
//! Grounded on the teacher's `proxy/server.rs` accept-loop shape
//! (`TcpListener` + `service_fn` + `http1::Builder`), generalised to
//! route on the request-target's absolute-form instead of unconditional
//! CONNECT/forward handling, and with the admin half delegated to an
//! `axum::Router` via `tower::ServiceExt::oneshot` rather than a second
//! listener (the teacher's `api/server.rs` binds its own port; this
//! gateway serves both concerns on one).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::{debug, error, info, instrument};

use crate::checker::Checker;
use crate::config::GatewayConfig;
use crate::error::{Result, SuperproxyError};
use crate::fetcher::Fetcher;
use crate::pool::ProxyPool;
use crate::session::BrokeredSession;

use super::admin::{self, AdminState};
use super::auth::AccessControl;
use super::headers;

pub struct Gateway {
    config: GatewayConfig,
    pool: Arc<ProxyPool>,
    admin_router: axum::Router,
    proxy_auth: AccessControl,
    admin_auth: AccessControl,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        pool: Arc<ProxyPool>,
        fetcher: Option<Arc<Fetcher>>,
        checker: Option<Arc<Checker>>,
    ) -> Self {
        let proxy_auth = AccessControl::new(config.proxy_ip_allow.clone(), config.proxy_auth.clone());
        let admin_auth = AccessControl::new(config.admin_ip_allow.clone(), config.admin_auth.clone());
        let admin_router = admin::router(AdminState {
            pool: Arc::clone(&pool),
            fetcher,
            checker,
        });

        Self {
            config,
            pool,
            admin_router,
            proxy_auth,
            admin_auth,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| SuperproxyError::InvalidConfig(format!("invalid gateway address: {e}")))?;

        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "gateway listening");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let admin_router = self.admin_router.clone();
                            let proxy_auth = self.proxy_auth.clone();
                            let admin_auth = self.admin_auth.clone();
                            let pool = Arc::clone(&self.pool);
                            let default_timeout = self.config.request_timeout;
                            let default_max_retries = self.config.default_max_retries;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    stream,
                                    client_addr,
                                    admin_router,
                                    proxy_auth,
                                    admin_auth,
                                    pool,
                                    default_timeout,
                                    default_max_retries,
                                ).await {
                                    debug!(error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept error"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: tokio::net::TcpStream,
    client_addr: SocketAddr,
    admin_router: axum::Router,
    proxy_auth: AccessControl,
    admin_auth: AccessControl,
    pool: Arc<ProxyPool>,
    default_timeout: u64,
    default_max_retries: u32,
) -> Result<()> {
    let io = TokioIo::new(stream);
    let client_ip = client_addr.ip().to_string();

    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let admin_router = admin_router.clone();
        let proxy_auth = proxy_auth.clone();
        let admin_auth = admin_auth.clone();
        let pool = Arc::clone(&pool);
        let client_ip = client_ip.clone();

        async move {
            let response = route(
                req,
                &client_ip,
                admin_router,
                &proxy_auth,
                &admin_auth,
                pool,
                default_timeout,
                default_max_retries,
            )
            .await;
            Ok::<_, std::convert::Infallible>(response)
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| SuperproxyError::Internal(format!("connection error: {e}")))?;

    Ok(())
}

/// Routes one request to either the brokered-proxy leg or the admin
/// `axum::Router`, based on whether the request-target is absolute-form
/// (spec §6: a relative path is always the gateway's own admin surface,
/// an absolute URI is always a brokering request — this must be checked
/// *before* any path-based dispatch so a target like `http://h/status`
/// is never mistaken for the gateway's own `/status`).
#[allow(clippy::too_many_arguments)]
async fn route(
    req: Request<Incoming>,
    client_ip: &str,
    admin_router: axum::Router,
    proxy_auth: &AccessControl,
    admin_auth: &AccessControl,
    pool: Arc<ProxyPool>,
    default_timeout: u64,
    default_max_retries: u32,
) -> Response<Body> {
    let is_proxy_request = req.uri().scheme().is_some();

    if is_proxy_request {
        if let Err(e) = proxy_auth.check_ip(client_ip) {
            return e.into_response();
        }
        if let Err(e) = proxy_auth.check_basic_auth(req.headers()) {
            return e.into_response();
        }
        return broker(req, pool, default_timeout, default_max_retries).await;
    }

    if let Err(e) = admin_auth.check_ip(client_ip) {
        return e.into_response();
    }
    if let Err(e) = admin_auth.check_basic_auth(req.headers()) {
        return e.into_response();
    }
    serve_admin(req, admin_router).await
}

async fn serve_admin(req: Request<Incoming>, admin_router: axum::Router) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let axum_req = Request::from_parts(parts, Body::new(body));
    match admin_router.oneshot(axum_req).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}

async fn broker(
    req: Request<Incoming>,
    pool: Arc<ProxyPool>,
    default_timeout: u64,
    default_max_retries: u32,
) -> Response<Body> {
    let policy = headers::decode(req.headers(), default_max_retries, default_timeout);
    let method = req.method().clone();
    let url = req.uri().to_string();
    let outbound_headers = headers::strip_hop_by_hop(req.headers());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return SuperproxyError::InvalidRequest(format!("failed to read request body: {e}"))
                .into_gateway_response()
        }
    };

    let session = match BrokeredSession::new(pool, policy.get_opts) {
        Ok(session) => session,
        Err(e) => return e.into_gateway_response(),
    };

    let result = session.request(method, &url, outbound_headers, body, policy.session_opts).await;

    match result {
        Ok(brokered) => {
            let mut response_headers = headers::prepare_response_headers(&brokered.headers, brokered.body.len());
            headers::annotate_response(&mut response_headers, brokered.addr.as_deref(), brokered.fail_count, brokered.rest_count);
            let mut builder = Response::builder().status(brokered.status);
            *builder.headers_mut().unwrap() = response_headers;
            builder.body(Body::from(brokered.body)).unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap()
            })
        }
        // the brokering leg always answers errors with 500 (spec §4.7),
        // unlike the admin JSON API's per-class status mapping
        Err(e) => e.into_gateway_response(),
    }
}
