use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use har_proxy::config::{Cli, ProxyConfig};
use har_proxy::dns::{self, ResolverPool};
use har_proxy::egress::EgressChannel;
use har_proxy::net;
use har_proxy::observability;
use har_proxy::proxy::engine::{upstream_client, LifecycleEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::from(Cli::parse());

    observability::init_tracing(config.debug);

    // Both TLS stacks (front-end termination, upstream connector) resolve the
    // process-level crypto provider; install it once before either starts.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    tracing::info!(
        http_port = config.http_port,
        https_port = ?config.https_port,
        concurrency_limit = config.concurrency_limit,
        call_timeout_secs = config.call_timeout.as_secs_f64(),
        collector = %config.collector,
        "har-proxy starting"
    );

    if let Some(addr) = config.metrics_addr {
        observability::metrics::init_metrics(addr);
    }

    let resolver_pool = Arc::new(ResolverPool::new(dns::DEFAULT_POOL_SIZE));
    let egress = EgressChannel::connect(config.collector.clone());
    let client = upstream_client()?;
    let engine = Arc::new(LifecycleEngine::new(&config, resolver_pool, egress, client));
    let router = net::build_router(engine);

    // The HTTPS front end is best-effort: a bad or missing cert.pem/key.pem
    // leaves the HTTP front end running alone.
    if let Some(https_port) = config.https_port {
        let https_router = router.clone();
        tokio::spawn(async move {
            if let Err(error) = net::serve_https(https_port, https_router).await {
                tracing::error!(%error, "HTTPS front end failed; continuing with HTTP only");
            }
        });
    }

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.http_port))).await?;
    net::serve_http(listener, router).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
