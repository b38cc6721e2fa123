//! HAR datapoint model and builder.
//!
//! # Responsibilities
//! - Hold the immutable capture of one request/response exchange
//! - Serialise it, keyed by a service token, into the collector envelope
//!
//! The builder is a pure transform; nothing here performs I/O.

use axum::http::{HeaderMap, HeaderName};
use serde::Serialize;

/// Recorded in place of the upstream address when resolution failed.
pub const RESOLVE_FAILED: &str = "<error>";

/// One archived header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Archived view of the client request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEntry {
    pub method: String,
    pub url: String,
    pub headers: Vec<Header>,
    pub body_size: u64,
}

/// Archived view of the upstream (or error) response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEntry {
    pub status: u16,
    pub headers: Vec<Header>,
    pub body_size: u64,
}

/// The three measured phases, in integer milliseconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Timings {
    pub send: u64,
    pub wait: u64,
    pub receive: u64,
}

/// Captured record of one exchange; immutable once fully populated.
#[derive(Debug, Clone)]
pub struct ArchiveInput {
    pub started_date_time: String,
    pub client_ip: String,
    pub server_ip: String,
    pub request: RequestEntry,
    pub response: ResponseEntry,
    pub timings: Timings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    service_token: &'a str,
    started_date_time: &'a str,
    #[serde(rename = "clientIPAddress")]
    client_ip_address: &'a str,
    #[serde(rename = "serverIPAddress")]
    server_ip_address: &'a str,
    request: &'a RequestEntry,
    response: &'a ResponseEntry,
    timings: &'a Timings,
}

/// Serialises archive inputs under one tenant's service token.
#[derive(Debug, Clone)]
pub struct HarBuilder {
    service_token: String,
}

impl HarBuilder {
    pub fn new(service_token: impl Into<String>) -> Self {
        Self {
            service_token: service_token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.service_token
    }

    /// Produce the HAR message string for one archive input.
    pub fn build(&self, input: &ArchiveInput) -> String {
        let envelope = Envelope {
            service_token: &self.service_token,
            started_date_time: &input.started_date_time,
            client_ip_address: &input.client_ip,
            server_ip_address: &input.server_ip,
            request: &input.request,
            response: &input.response,
            timings: &input.timings,
        };
        serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Flatten a header map into archive entries.
pub fn collect_headers(map: &HeaderMap) -> Vec<Header> {
    map.iter()
        .map(|(name, value)| Header {
            name: name.as_str().to_string(),
            value: value.to_str().unwrap_or_default().to_string(),
        })
        .collect()
}

/// Flatten a header map, omitting one header by name.
pub fn collect_headers_except(map: &HeaderMap, skip: &HeaderName) -> Vec<Header> {
    map.iter()
        .filter(|(name, _)| name.as_str() != skip.as_str())
        .map(|(name, value)| Header {
            name: name.as_str().to_string(),
            value: value.to_str().unwrap_or_default().to_string(),
        })
        .collect()
}
