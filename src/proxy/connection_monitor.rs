//! Detects a reply body going away and runs cleanup callbacks exactly once.
//!
//! An SSE reply is an mpsc-fed stream handed to hyper. When the client
//! disconnects mid-stream, hyper drops the body; the wrapper below turns
//! that drop into the conversation's close handler. Callbacks also run
//! after a normal end of stream; they are expected to check whether the
//! reply they belong to is still the current one and no-op otherwise.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_util::Stream;

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Shared close-state of one reply.
#[derive(Clone)]
pub struct ConnectionMonitor {
    closed: Arc<AtomicBool>,
    callbacks: Arc<Mutex<Vec<CloseCallback>>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a callback to run when the reply closes.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
    }

    /// Runs the registered callbacks. Idempotent.
    pub fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<CloseCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream adapter: rendered SSE frames in, body bytes out, close
/// notification on drop.
pub struct MonitoredStream<S> {
    inner: S,
    monitor: ConnectionMonitor,
}

impl<S> MonitoredStream<S> {
    pub fn new(inner: S, monitor: ConnectionMonitor) -> Self {
        Self { inner, monitor }
    }
}

impl<S> Stream for MonitoredStream<S>
where
    S: Stream<Item = String> + Unpin,
{
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.monitor.is_closed() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(Bytes::from(frame)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for MonitoredStream<S> {
    fn drop(&mut self) {
        // Fires on client disconnect and on normal completion alike; the
        // callbacks decide whether there is anything left to clean up.
        self.monitor.mark_closed();
    }
}
