//! Byte-counting stream tap.
//!
//! Wraps a [`ByteStream`] handed to a consumer that writes chunk by chunk (an
//! object upload). A chunk counts as written once the consumer asks for the
//! next one, so cumulative bytes are reported at that point and once more when
//! the source ends. The same boundary is where cancellation is observed: the
//! tap yields an `Interrupted` error instead of the next chunk.

use bytes::Bytes;
use ferry_storage::ByteStream;
use futures::stream::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

use crate::executor::TaskObserver;

pub struct CountingStream {
    inner: ByteStream,
    cancel: CancellationToken,
    observer: Option<Arc<dyn TaskObserver>>,
    /// Length of the chunk most recently handed out, not yet reported
    pending: u64,
    total: u64,
    done: bool,
}

impl CountingStream {
    /// `observer` receives cumulative byte counts; `None` counts silently.
    pub fn new(
        inner: ByteStream,
        cancel: CancellationToken,
        observer: Option<Arc<dyn TaskObserver>>,
    ) -> Self {
        Self {
            inner,
            cancel,
            observer,
            pending: 0,
            total: 0,
            done: false,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn settle(&mut self) {
        if self.pending == 0 {
            return;
        }
        self.total += self.pending;
        self.pending = 0;
        if let Some(observer) = &self.observer {
            observer.progress(self.total);
        }
    }
}

impl Stream for CountingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        this.settle();
        if this.cancel.is_cancelled() {
            this.done = true;
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "transfer cancelled",
            ))));
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.pending = chunk.len() as u64;
                tracing::trace!(bytes = this.pending, total = this.total, "chunk");
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
