//! Bounded DNS resolver pool.
//!
//! # Responsibilities
//! - Hold a fixed set of resolvers; one lookup per resolver at a time
//! - Bound every lookup by a hard deadline
//! - Retry a failed lookup at most once
//! - Render the first A/AAAA answer as a printable address

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Resolvers kept in the pool.
pub const DEFAULT_POOL_SIZE: usize = 2;

/// Deadline for a single lookup attempt.
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(2500);

/// Lookup failure, after the single retry has been spent.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("No answer")]
    NoAnswer,

    #[error("Not ipv4/ipv6")]
    NotIp,

    #[error("Lookup timed out")]
    Timeout,

    #[error("{0}")]
    Resolve(String),
}

/// A bounded pool of resolvers.
///
/// Checkout waits on a semaphore when every resolver is busy; a checked-out
/// resolver is returned to the pool when its guard drops, never while its
/// lookup is still in flight.
pub struct ResolverPool {
    idle: Mutex<VecDeque<TokioAsyncResolver>>,
    slots: Semaphore,
}

impl ResolverPool {
    /// Build a pool of `size` resolvers from the system configuration.
    pub fn new(size: usize) -> Self {
        let idle = (0..size).map(|_| system_resolver()).collect();
        Self {
            idle: Mutex::new(idle),
            slots: Semaphore::new(size),
        }
    }

    /// Resolve a hostname to a printable address, retrying at most once.
    pub async fn resolve(&self, hostname: &str) -> Result<String, DnsError> {
        match self.lookup(hostname).await {
            Ok(address) => Ok(address),
            Err(first) => {
                tracing::debug!(hostname, error = %first, "dns lookup failed; retrying once");
                self.lookup(hostname).await
            }
        }
    }

    async fn lookup(&self, hostname: &str) -> Result<String, DnsError> {
        let resolver = self.checkout().await;
        let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, resolver.get().lookup_ip(hostname))
            .await
            .map_err(|_| DnsError::Timeout)?
            .map_err(|error| match error.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => DnsError::NoAnswer,
                _ => DnsError::Resolve(error.to_string()),
            })?;

        if let Some(address) = lookup.iter().next() {
            return Ok(address.to_string());
        }
        // Records came back, but none of them carried an address.
        if lookup.as_lookup().record_iter().next().is_some() {
            Err(DnsError::NotIp)
        } else {
            Err(DnsError::NoAnswer)
        }
    }

    async fn checkout(&self) -> PooledResolver<'_> {
        let permit = self
            .slots
            .acquire()
            .await
            .expect("resolver pool semaphore closed unexpectedly");
        let resolver = self
            .idle
            .lock()
            .expect("resolver pool mutex poisoned")
            .pop_front()
            .expect("permit held with no idle resolver");
        PooledResolver {
            pool: self,
            resolver: Some(resolver),
            _permit: permit,
        }
    }
}

fn system_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}

struct PooledResolver<'a> {
    pool: &'a ResolverPool,
    resolver: Option<TokioAsyncResolver>,
    _permit: SemaphorePermit<'a>,
}

impl PooledResolver<'_> {
    fn get(&self) -> &TokioAsyncResolver {
        self.resolver.as_ref().expect("resolver checked out")
    }
}

impl Drop for PooledResolver<'_> {
    fn drop(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            self.pool
                .idle
                .lock()
                .expect("resolver pool mutex poisoned")
                .push_back(resolver);
        }
    }
}
