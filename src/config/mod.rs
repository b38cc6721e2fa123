//! CLI schema and runtime configuration.
//!
//! All tunables enter through the command line; there are no config files.
//! `ProxyConfig` is the resolved form handed to the lifecycle engine and the
//! front ends, and is constructed directly by tests.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Well-known endpoint of the analytics collector.
pub const DEFAULT_COLLECTOR: &str = "server.apianalytics.com:5000";

/// Default ceiling on in-flight requests.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 300;

/// Default deadline for one upstream call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(6);

/// Command-line interface for the proxy binary.
#[derive(Parser, Debug)]
#[command(name = "har-proxy")]
#[command(about = "Transparent HTTP/HTTPS forward proxy that archives every exchange", long_about = None)]
pub struct Cli {
    /// Listen port for plaintext HTTP.
    pub port: u16,

    /// Default service token for requests that carry none.
    pub service_token: Option<String>,

    /// Enable the HTTPS listener on this port (expects cert.pem and key.pem
    /// in the working directory).
    #[arg(long)]
    pub https: Option<u16>,

    /// Log each emitted HAR datapoint.
    #[arg(long)]
    pub debug: bool,

    /// Maximum number of in-flight requests.
    #[arg(short = 'c', long = "concurrency", default_value_t = DEFAULT_CONCURRENCY_LIMIT)]
    pub concurrency: usize,

    /// Upstream call timeout in seconds.
    #[arg(short = 't', long = "timeout", default_value_t = 6.0)]
    pub timeout: f64,

    /// Analytics collector endpoint (host:port).
    #[arg(long, default_value = DEFAULT_COLLECTOR)]
    pub collector: String,

    /// Expose Prometheus metrics on this address (e.g. 0.0.0.0:9090).
    #[arg(long)]
    pub metrics: Option<SocketAddr>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port for the plaintext HTTP front end.
    pub http_port: u16,

    /// Optional port for the HTTPS front end.
    pub https_port: Option<u16>,

    /// Startup service token; per-request headers override it.
    pub default_token: Option<String>,

    /// Ceiling on in-flight requests.
    pub concurrency_limit: usize,

    /// Deadline for one upstream call.
    pub call_timeout: Duration,

    /// Analytics collector endpoint.
    pub collector: String,

    /// Optional Prometheus exposition address.
    pub metrics_addr: Option<SocketAddr>,

    /// Log each emitted HAR datapoint.
    pub debug: bool,
}

impl From<Cli> for ProxyConfig {
    fn from(cli: Cli) -> Self {
        Self {
            http_port: cli.port,
            https_port: cli.https,
            default_token: cli.service_token.filter(|t| !t.is_empty()),
            concurrency_limit: cli.concurrency,
            call_timeout: Duration::try_from_secs_f64(cli.timeout)
                .unwrap_or(DEFAULT_CALL_TIMEOUT),
            collector: cli.collector,
            metrics_addr: cli.metrics,
            debug: cli.debug,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            https_port: None,
            default_token: None,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            collector: DEFAULT_COLLECTOR.to_string(),
            metrics_addr: None,
            debug: false,
        }
    }
}
