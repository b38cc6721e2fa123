//! Shared utilities for integration testing: the proxy under test, mock
//! upstreams, and a mock analytics collector.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use har_proxy::config::ProxyConfig;
use har_proxy::dns::ResolverPool;
use har_proxy::egress::EgressChannel;
use har_proxy::net;
use har_proxy::proxy::engine::{upstream_client, LifecycleEngine};

/// Spawn the proxy on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Arc<LifecycleEngine>) {
    let dns = Arc::new(ResolverPool::new(2));
    let egress = EgressChannel::connect(config.collector.clone());
    let client = upstream_client().expect("upstream client");
    let engine = Arc::new(LifecycleEngine::new(&config, dns, egress, client));
    let router = net::build_router(engine.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(async move {
        let _ = net::serve_http(listener, router).await;
    });
    (addr, engine)
}

/// What a mock upstream saw for one request.
pub struct CapturedRequest {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Start a programmable mock upstream.
///
/// `behavior` receives the request body and produces (status, response
/// body); every request's headers and body are also pushed on the returned
/// channel.
pub async fn start_upstream<F, Fut>(
    behavior: F,
) -> (SocketAddr, mpsc::UnboundedReceiver<CapturedRequest>)
where
    F: Fn(Vec<u8>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = (StatusCode, Vec<u8>)> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().fallback(move |req: Request<Body>| {
        let behavior = behavior.clone();
        let tx = tx.clone();
        async move {
            let (parts, body) = req.into_parts();
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .unwrap_or_default()
                .to_vec();
            let _ = tx.send(CapturedRequest {
                headers: parts.headers,
                body: bytes.clone(),
            });
            let (status, response_body) = behavior(bytes).await;
            let mut response = Response::new(Body::from(response_body));
            *response.status_mut() = status;
            response
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, rx)
}

/// Start a mock collector; decoded HAR frames arrive as JSON values.
pub async fn start_collector() -> (SocketAddr, mpsc::UnboundedReceiver<serde_json::Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind collector");
    let addr = listener.local_addr().expect("collector addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = frames.next().await {
                    if let Ok(value) = serde_json::from_slice(&frame) {
                        let _ = tx.send(value);
                    }
                }
            });
        }
    });
    (addr, rx)
}

/// A client that routes every request through the proxy under test, so
/// request URIs arrive in absolute form.
pub fn proxy_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).expect("proxy url"))
        .build()
        .expect("reqwest client")
}

/// Wait for the in-flight counter to drain back to zero.
pub async fn wait_for_idle(engine: &Arc<LifecycleEngine>) {
    for _ in 0..100 {
        if engine.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("in-flight counter did not return to zero");
}

/// Receive the next datapoint, bounded.
pub async fn next_datapoint(
    datapoints: &mut mpsc::UnboundedReceiver<serde_json::Value>,
) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), datapoints.recv())
        .await
        .expect("datapoint within deadline")
        .expect("collector channel open")
}
