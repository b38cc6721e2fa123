//! Request lifecycle: admission control, body metering, upstream dispatch.

pub mod engine;
pub mod error;
pub mod gate;
pub mod meter;

pub use engine::{LifecycleEngine, Peer};
pub use error::ProxyError;
pub use gate::ConcurrencyGate;
