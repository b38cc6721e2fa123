//! HTTP and HTTPS front ends.
//!
//! # Responsibilities
//! - Build the shared router; both listeners serve the same one, so they
//!   share one engine, one gate, one resolver pool, one egress channel
//! - Bind the plaintext listener (fatal on failure)
//! - Bind the TLS listener from cert.pem / key.pem (best-effort)
//! - Catch request panics and render them as a 500

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, Response, StatusCode};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::proxy::engine::{LifecycleEngine, Peer};

/// Build the router both front ends serve.
pub fn build_router(engine: Arc<LifecycleEngine>) -> Router {
    Router::new()
        .route("/", any(forward))
        .route("/{*path}", any(forward))
        .with_state(engine)
        .layer(CatchPanicLayer::custom(render_panic))
        .layer(TraceLayer::new_for_http())
}

/// Serve plaintext HTTP until shutdown. A bind or accept failure here is
/// fatal to the process.
pub async fn serve_http(listener: TcpListener, router: Router) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP front end listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("ctrl-c handler unavailable; running until killed");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutting down front ends");
    })
    .await
}

/// Serve HTTPS using cert.pem / key.pem from the working directory.
pub async fn serve_https(port: u16, router: Router) -> std::io::Result<()> {
    let tls = RustlsConfig::from_pem_file("cert.pem", "key.pem").await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(address = %addr, "HTTPS front end listening");

    axum_server::bind_rustls(addr, tls)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

async fn forward(
    State(engine): State<Arc<LifecycleEngine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    engine.handle(Peer::Inet(addr), request).await
}

/// A panicking request renders as an internal failure. The in-flight
/// guard's Drop has already run by the time this executes, so the gate
/// cannot leak.
fn render_panic(_err: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    let mut response = Response::new(Body::from("Upstream request failed: internal error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
