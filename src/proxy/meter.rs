//! Byte metering for streamed bodies.
//!
//! # Responsibilities
//! - Forward body chunks unchanged while summing their lengths
//! - Report the total once, on end-of-stream or on drop
//! - Never materialise the body

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::oneshot;

/// Wrap a body stream in a meter.
///
/// The receiver resolves with the byte total when the stream ends or is
/// dropped, so a client that disconnects mid-body still produces a count.
pub fn tee<S>(inner: S) -> (MeteredStream<S>, oneshot::Receiver<u64>) {
    let (done, total) = oneshot::channel();
    (
        MeteredStream {
            inner,
            total: 0,
            done: Some(done),
        },
        total,
    )
}

/// A body stream that counts the bytes flowing through it.
#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    total: u64,
    done: Option<oneshot::Sender<u64>>,
}

impl<S> MeteredStream<S> {
    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self.total);
        }
    }
}

impl<S, E> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.total += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                self.finish();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for MeteredStream<S> {
    fn drop(&mut self) {
        self.finish();
    }
}
