//! Byte-counting stream wrapper for HTTP request bodies.
//!
//! The WebDAV backend hands the compressed stream to reqwest, so the
//! compressed size can only be measured on the wire.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};
use tracing::trace;

/// Shared byte counter, readable after the stream was consumed.
pub type ByteCounter = Arc<AtomicU64>;

pub struct CountingStream<S> {
    inner: S,
    counter: ByteCounter,
    label: String,
    last_report: Instant,
    report_interval: Duration,
}

impl<S> CountingStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, label: impl Into<String>) -> (Self, ByteCounter) {
        let counter = ByteCounter::default();
        let stream = Self {
            inner,
            counter: Arc::clone(&counter),
            label: label.into(),
            last_report: Instant::now(),
            report_interval: Duration::from_secs(5),
        };
        (stream, counter)
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let total = self.counter.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;

                let now = Instant::now();
                if now.duration_since(self.last_report) >= self.report_interval {
                    trace!("{}: {} sent", self.label, super::progress::format_bytes(total));
                    self.last_report = now;
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}
