//! Request lifecycle engine.
//!
//! # Responsibilities
//! - Admit each request through the concurrency gate
//! - Resolve its service token (request header over startup default)
//! - Forward it upstream under the call timeout, rewriting proxy headers
//! - Measure the send/wait/receive phases on the monotonic clock
//! - Assemble the archive record and schedule it for egress, detached
//!   from the client response path
//!
//! The engine owns no listener; the front ends hand it requests together
//! with a [`Peer`] describing where the connection came from.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::dns::{DnsError, ResolverPool};
use crate::egress::EgressChannel;
use crate::har::{self, ArchiveInput, HarBuilder, RequestEntry, ResponseEntry, Timings};
use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::proxy::gate::{ConcurrencyGate, InFlightGuard};
use crate::proxy::meter;

/// Tenant header consumed by the proxy; never forwarded or archived.
pub static SERVICE_TOKEN: HeaderName = HeaderName::from_static("service-token");

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Shared, pooled client for upstream calls; follows `http://` and
/// `https://` request URIs alike.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Build the shared upstream client.
pub fn upstream_client() -> std::io::Result<UpstreamClient> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Where a client connection came from, as seen by a front end.
#[derive(Debug, Clone)]
pub enum Peer {
    Inet(SocketAddr),
    Unix(String),
    Unknown,
}

impl Peer {
    /// Printable client address for the archive record.
    pub fn client_ip(&self) -> String {
        match self {
            Peer::Inet(addr) => addr.ip().to_string(),
            Peer::Unix(path) => format!("sock:{path}"),
            Peer::Unknown => String::new(),
        }
    }
}

/// The per-request state machine, shared by both front ends.
pub struct LifecycleEngine {
    gate: Arc<ConcurrencyGate>,
    dns: Arc<ResolverPool>,
    egress: EgressChannel,
    client: UpstreamClient,
    default_token: Option<String>,
    call_timeout: Duration,
    debug_har: bool,
}

/// Everything captured at entry that the finalizer will need.
struct RequestContext {
    t0: Instant,
    started: String,
    client_ip: String,
    token: Option<String>,
    request: RequestEntry,
}

/// Deferred tail of one request: runs when the client has consumed the
/// response body, releases the gate, then emits the datapoint.
struct Finalize {
    ctx: RequestContext,
    guard: Option<InFlightGuard>,
    response: ResponseEntry,
    send_ms: u64,
    wait_ms: u64,
    receive_fixed: bool,
    emit: bool,
    req_len: Option<oneshot::Receiver<u64>>,
    res_len: oneshot::Receiver<u64>,
    dns: Option<JoinHandle<Result<String, DnsError>>>,
}

impl LifecycleEngine {
    pub fn new(
        config: &ProxyConfig,
        dns: Arc<ResolverPool>,
        egress: EgressChannel,
        client: UpstreamClient,
    ) -> Self {
        Self {
            gate: Arc::new(ConcurrencyGate::new(config.concurrency_limit)),
            dns,
            egress,
            client,
            default_token: config.default_token.clone(),
            call_timeout: config.call_timeout,
            debug_har: config.debug,
        }
    }

    /// Current number of requests inside the engine.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Drive one request through the lifecycle.
    ///
    /// Returns the client-facing response immediately; archival, egress and
    /// gate release complete on a detached task bounded by the response body.
    pub async fn handle(self: &Arc<Self>, peer: Peer, req: Request<Body>) -> Response<Body> {
        let t0 = Instant::now();
        let started = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let client_ip = peer.client_ip();

        let token = resolve_token(req.headers(), self.default_token.as_deref());
        let ctx = RequestContext {
            t0,
            started,
            client_ip,
            token,
            request: RequestEntry {
                method: req.method().to_string(),
                url: req.uri().to_string(),
                headers: har::collect_headers_except(req.headers(), &SERVICE_TOKEN),
                body_size: 0,
            },
        };

        let Some(guard) = self.gate.try_admit() else {
            tracing::warn!(
                in_flight = self.gate.in_flight(),
                limit = self.gate.limit(),
                url = %ctx.request.url,
                "request rejected: concurrency ceiling reached"
            );
            return self.fail(ProxyError::Overloaded, ctx, None, None, None, 0, 0);
        };

        if ctx.token.is_none() {
            return self.fail(
                ProxyError::MissingToken,
                ctx,
                Some(guard),
                None,
                None,
                elapsed_ms(t0),
                0,
            );
        }

        // A forward proxy needs an absolute URI to name the upstream.
        let host = match (req.uri().scheme(), req.uri().host()) {
            (Some(_), Some(host)) => host.to_string(),
            _ => {
                return self.fail(
                    ProxyError::Upstream("request URI must be absolute".to_string()),
                    ctx,
                    Some(guard),
                    None,
                    None,
                    elapsed_ms(t0),
                    0,
                );
            }
        };

        // Resolve the upstream address for the archive record off the hot
        // path; the client response never waits for it.
        let dns = {
            let pool = Arc::clone(&self.dns);
            tokio::spawn(async move { pool.resolve(&host).await })
        };

        // Tee the request body so its length is metered while it flows
        // upstream; nothing is buffered beyond the chunk in flight.
        let (parts, body) = req.into_parts();
        let (metered_req, req_len) = meter::tee(body.into_data_stream());

        let mut outbound = match Request::builder()
            .method(parts.method)
            .uri(parts.uri)
            .body(Body::from_stream(metered_req))
        {
            Ok(outbound) => outbound,
            Err(error) => {
                return self.fail(
                    ProxyError::Upstream(error.to_string()),
                    ctx,
                    Some(guard),
                    Some(req_len),
                    Some(dns),
                    elapsed_ms(t0),
                    0,
                );
            }
        };
        let headers = outbound.headers_mut();
        for (name, value) in parts.headers.iter() {
            headers.append(name, value.clone());
        }
        headers.remove(&SERVICE_TOKEN);
        // The upstream client derives Host from the URI.
        headers.remove(HOST);
        append_forwarded_for(headers, &ctx.client_ip);

        let send_ms = elapsed_ms(t0);
        let upstream = match tokio::time::timeout(self.call_timeout, self.client.request(outbound))
            .await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(error)) => {
                let wait_ms = elapsed_ms(t0).saturating_sub(send_ms);
                return self.fail(
                    ProxyError::Upstream(error.to_string()),
                    ctx,
                    Some(guard),
                    Some(req_len),
                    Some(dns),
                    send_ms,
                    wait_ms,
                );
            }
            Err(_) => {
                let wait_ms = elapsed_ms(t0).saturating_sub(send_ms);
                return self.fail(
                    ProxyError::Timeout,
                    ctx,
                    Some(guard),
                    Some(req_len),
                    Some(dns),
                    send_ms,
                    wait_ms,
                );
            }
        };
        let wait_ms = elapsed_ms(t0).saturating_sub(send_ms);

        // The body is re-streamed chunked; the upstream length no longer
        // describes what the client will see framed on the wire.
        let (mut res_parts, res_body) = upstream.into_parts();
        res_parts.headers.remove(CONTENT_LENGTH);

        let response_entry = ResponseEntry {
            status: res_parts.status.as_u16(),
            headers: har::collect_headers(&res_parts.headers),
            body_size: 0,
        };
        let (metered_res, res_len) = meter::tee(Body::new(res_body).into_data_stream());

        tracing::debug!(
            status = response_entry.status,
            wait_ms,
            url = %ctx.request.url,
            "upstream responded"
        );
        metrics::record_request("ok");

        self.spawn_finalizer(Finalize {
            ctx,
            guard: Some(guard),
            response: response_entry,
            send_ms,
            wait_ms,
            receive_fixed: false,
            emit: true,
            req_len: Some(req_len),
            res_len,
            dns: Some(dns),
        });

        Response::from_parts(res_parts, Body::from_stream(metered_res))
    }

    /// Render a failure to the client and still run the finalizer, so the
    /// gate releases after the error body and, for attributable failures, a
    /// datapoint with `receive = 0` is emitted.
    #[allow(clippy::too_many_arguments)]
    fn fail(
        self: &Arc<Self>,
        error: ProxyError,
        ctx: RequestContext,
        guard: Option<InFlightGuard>,
        req_len: Option<oneshot::Receiver<u64>>,
        dns: Option<JoinHandle<Result<String, DnsError>>>,
        send_ms: u64,
        wait_ms: u64,
    ) -> Response<Body> {
        let status = error.status();
        tracing::warn!(
            kind = error.kind(),
            status = status.as_u16(),
            url = %ctx.request.url,
            "request failed"
        );
        metrics::record_request(error.kind());

        let emit = error.emits_datapoint() && ctx.token.is_some();
        let text = error.to_string();
        let (metered, res_len) =
            meter::tee(futures_util::stream::iter([Ok::<_, Infallible>(Bytes::from(text))]));

        let mut response = Response::new(Body::from_stream(metered));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );

        let response_entry = ResponseEntry {
            status: status.as_u16(),
            headers: har::collect_headers(response.headers()),
            body_size: 0,
        };
        self.spawn_finalizer(Finalize {
            ctx,
            guard,
            response: response_entry,
            send_ms,
            wait_ms,
            receive_fixed: true,
            emit,
            req_len,
            res_len,
            dns,
        });
        response
    }

    fn spawn_finalizer(self: &Arc<Self>, fin: Finalize) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut fin = fin;
            let res_len = fin.res_len.await.unwrap_or(0);
            let receive_ms = if fin.receive_fixed {
                0
            } else {
                elapsed_ms(fin.ctx.t0).saturating_sub(fin.send_ms + fin.wait_ms)
            };
            // The client has consumed the response: release the gate before
            // anything else waits.
            drop(fin.guard.take());

            if !fin.emit {
                if let Some(dns) = fin.dns {
                    dns.abort();
                }
                return;
            }
            let Some(token) = fin.ctx.token else { return };

            let req_len = match fin.req_len {
                Some(rx) => rx.await.unwrap_or(0),
                None => 0,
            };
            let server_ip = match fin.dns {
                Some(handle) => match handle.await {
                    Ok(Ok(address)) => address,
                    Ok(Err(error)) => {
                        tracing::debug!(%error, "dns resolution failed for archive record");
                        har::RESOLVE_FAILED.to_string()
                    }
                    Err(_) => har::RESOLVE_FAILED.to_string(),
                },
                None => har::RESOLVE_FAILED.to_string(),
            };

            let mut request = fin.ctx.request;
            request.body_size = req_len;
            let mut response = fin.response;
            response.body_size = res_len;

            let input = ArchiveInput {
                started_date_time: fin.ctx.started,
                client_ip: fin.ctx.client_ip,
                server_ip,
                request,
                response,
                timings: Timings {
                    send: fin.send_ms,
                    wait: fin.wait_ms,
                    receive: receive_ms,
                },
            };
            let message = HarBuilder::new(token).build(&input);
            if engine.debug_har {
                tracing::debug!(datapoint = %message, "datapoint emitted");
            }
            metrics::record_datapoint_emitted();
            engine.egress.dispatch(message);
        });
    }
}

fn resolve_token(headers: &HeaderMap, default_token: Option<&str>) -> Option<String> {
    headers
        .get(&SERVICE_TOKEN)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .or_else(|| default_token.map(str::to_owned))
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    if client_ip.is_empty() {
        return;
    }
    let value = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(&X_FORWARDED_FOR, value);
    }
}

fn elapsed_ms(t0: Instant) -> u64 {
    t0.elapsed().as_millis() as u64
}
