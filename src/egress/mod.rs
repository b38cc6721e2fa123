//! Push channel to the analytics collector.
//!
//! # Responsibilities
//! - Own the single long-lived collector connection for the process
//! - Serialise datapoints into length-prefixed frames, one per message
//! - Bound every send by a wall-clock deadline; drop and log on expiry
//! - Never block the client-facing response path

use bytes::Bytes;
use futures_util::SinkExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::observability::metrics;

/// Deadline for one datapoint to reach the collector.
pub const SEND_DEADLINE: Duration = Duration::from_secs(20);

const QUEUE_DEPTH: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

struct Job {
    payload: Bytes,
    done: oneshot::Sender<()>,
}

/// Handle to the process-wide egress writer task.
#[derive(Clone)]
pub struct EgressChannel {
    tx: mpsc::Sender<Job>,
}

impl EgressChannel {
    /// Open the push channel. The spawned writer task owns the collector
    /// connection for the life of the process and serialises all frames.
    pub fn connect(collector: String) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(write_loop(collector, rx));
        Self { tx }
    }

    /// Queue one datapoint and watch its completion on a detached task.
    ///
    /// If the datapoint has not reached the collector within
    /// [`SEND_DEADLINE`] it is abandoned: the writer skips it and an
    /// `EgressTimeout` entry is logged. A full queue drops the datapoint
    /// immediately.
    pub fn dispatch(&self, message: String) {
        let (done, completed) = oneshot::channel();
        let job = Job {
            payload: Bytes::from(message),
            done,
        };
        if self.tx.try_send(job).is_err() {
            metrics::record_datapoint_dropped("queue_full");
            tracing::warn!("egress queue full; datapoint dropped");
            return;
        }
        tokio::spawn(async move {
            match tokio::time::timeout(SEND_DEADLINE, completed).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    metrics::record_datapoint_dropped("writer_gone");
                    tracing::warn!("egress writer dropped datapoint before delivery");
                }
                Err(_) => {
                    metrics::record_datapoint_dropped("egress_timeout");
                    tracing::warn!(
                        kind = "EgressTimeout",
                        "datapoint egress exceeded deadline; dropped"
                    );
                }
            }
        });
    }
}

/// Single writer over the collector connection.
///
/// Dropping the deadline observer's receiver marks a job abandoned; the
/// writer checks for that before every connect and write, so a saturated
/// collector cannot make a dropped datapoint arrive late.
async fn write_loop(collector: String, mut rx: mpsc::Receiver<Job>) {
    // Initial connect at startup; failures fall back to the per-job
    // reconnect path.
    let mut conn: Option<Framed<TcpStream, LengthDelimitedCodec>> = None;
    if let Ok(Ok(stream)) =
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&collector)).await
    {
        tracing::debug!(%collector, "egress connected");
        conn = Some(Framed::new(stream, LengthDelimitedCodec::new()));
    }
    while let Some(job) = rx.recv().await {
        loop {
            if job.done.is_closed() {
                break;
            }
            if conn.is_none() {
                match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&collector)).await {
                    Ok(Ok(stream)) => {
                        tracing::debug!(%collector, "egress connected");
                        conn = Some(Framed::new(stream, LengthDelimitedCodec::new()));
                    }
                    Ok(Err(error)) => {
                        tracing::debug!(%collector, %error, "egress connect failed; backing off");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(%collector, "egress connect timed out; backing off");
                        continue;
                    }
                }
            }
            let Some(framed) = conn.as_mut() else {
                continue;
            };
            match framed.send(job.payload.clone()).await {
                Ok(()) => {
                    let _ = job.done.send(());
                    break;
                }
                Err(error) => {
                    tracing::debug!(%error, "egress write failed; reconnecting");
                    conn = None;
                }
            }
        }
    }
}
