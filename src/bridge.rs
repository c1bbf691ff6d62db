//! Async iterator bridge between call lifecycles and their consumers.
//!
//! A call lifecycle runs in its own task and pushes [`CallEvent`]s into an
//! [`EventSink`]. The consumer pulls them from the matching [`CallStream`],
//! which implements [`futures::Stream`]. Events are buffered until pulled.
//!
//! Once the sink is closed, either by a terminal status or by cancellation,
//! further pushes are no-ops and the stream ends after draining. A cancelled
//! stream ends immediately, even with events still buffered.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::models::CallEvent;

// =============================================================================
// Producer side
// =============================================================================

struct SinkInner {
    sender: Mutex<Option<mpsc::UnboundedSender<CallEvent>>>,
    cancelled: AtomicBool,
}

/// Producer handle for one call's events.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink {
            inner: Arc::new(SinkInner {
                sender: Mutex::new(Some(tx)),
                cancelled: AtomicBool::new(false),
            }),
        };
        (sink, rx)
    }

    /// Buffer an event. Returns false once the sink is closed.
    pub fn push(&self, event: CallEvent) -> bool {
        match self.inner.sender.lock().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Stop accepting events. Buffered events stay readable.
    pub fn close(&self) {
        self.inner.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        self.close();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Control seam
// =============================================================================

/// Protocol-specific side of a call that the consumer can act on.
///
/// Implemented per lifecycle so cancellation notifies the server the way the
/// call's protocol expects.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Tell the server the call was abandoned. Failures are logged, never raised.
    async fn cancel(&self);

    /// Server-issued event id, once known.
    fn event_id(&self) -> Option<String>;
}

/// Clonable handle that cancels a call from any task.
#[derive(Clone)]
pub struct CancelHandle {
    sink: EventSink,
    control: Arc<dyn CallControl>,
}

impl CancelHandle {
    /// Close the stream and notify the server. Repeated calls do nothing.
    pub async fn cancel(&self) {
        if self.sink.cancel() {
            self.control.cancel().await;
        }
    }

    pub fn event_id(&self) -> Option<String> {
        self.control.event_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.sink.is_cancelled()
    }
}

// =============================================================================
// Consumer side
// =============================================================================

/// Events of one submitted call, in the order they were produced.
///
/// # Example
///
/// ```ignore
/// let mut call = client.submit(CallRequest::new("/predict", vec!["hi".into()]))?;
/// while let Some(event) = call.next().await {
///     if let CallEvent::Data(data) = event {
///         println!("{}", data.data);
///     }
/// }
/// ```
pub struct CallStream {
    events: mpsc::UnboundedReceiver<CallEvent>,
    handle: CancelHandle,
}

impl CallStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<CallEvent>,
        sink: EventSink,
        control: Arc<dyn CallControl>,
    ) -> Self {
        Self {
            events,
            handle: CancelHandle { sink, control },
        }
    }

    /// Cancel the call. The stream yields nothing afterwards.
    pub async fn cancel(&self) {
        self.handle.cancel().await;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn event_id(&self) -> Option<String> {
        self.handle.event_id()
    }
}

impl Stream for CallStream {
    type Item = CallEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CallEvent>> {
        let this = self.get_mut();
        if this.handle.is_cancelled() {
            return Poll::Ready(None);
        }
        this.events.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Status, StatusEvent};
    use chrono::Utc;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingControl {
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl CallControl for CountingControl {
        async fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn event_id(&self) -> Option<String> {
            Some("evt-1".to_string())
        }
    }

    fn status_event() -> CallEvent {
        CallEvent::Status(StatusEvent {
            endpoint: "/predict".into(),
            fn_index: 0,
            time: Utc::now(),
            status: Status::pending(true),
        })
    }

    #[tokio::test]
    async fn test_events_buffer_until_pulled() {
        let (sink, rx) = EventSink::channel();
        let control = Arc::new(CountingControl::default());
        let mut stream = CallStream::new(rx, sink.clone(), control);

        assert!(sink.push(status_event()));
        assert!(sink.push(status_event()));
        sink.close();
        assert!(!sink.push(status_event()));

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_notifies_once() {
        let (sink, rx) = EventSink::channel();
        let control = Arc::new(CountingControl::default());
        let mut stream = CallStream::new(rx, sink.clone(), control.clone());

        sink.push(status_event());
        let handle = stream.cancel_handle();
        handle.cancel().await;
        stream.cancel().await;

        assert!(stream.next().await.is_none());
        assert!(!sink.push(status_event()));
        assert_eq!(control.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(stream.event_id().as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_consumer() {
        let (sink, rx) = EventSink::channel();
        let control = Arc::new(CountingControl::default());
        let mut stream = CallStream::new(rx, sink, control);
        let handle = stream.cancel_handle();

        let consumer = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        handle.cancel().await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }
}
