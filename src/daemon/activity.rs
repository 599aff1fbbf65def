//! Activity tracking for the idle-timeout supervisor.
//!
//! Every read and write on a client connection records one activity event.
//! Events carry no data: the supervisor only needs to know whether at least
//! one happened since its deadline was last armed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Anything that can be told "some connection just did I/O".
pub trait ActivitySink: Send + Sync {
    /// Records one activity event. Must not block.
    fn record(&self);
}

/// Producer half of the activity channel. Cheap to clone, one per connection.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    tx: mpsc::Sender<()>,
}

/// Consumer half of the activity channel, owned by the supervisor.
#[derive(Debug)]
pub struct ActivityMonitor {
    rx: mpsc::Receiver<()>,
}

/// Creates a connected tracker/monitor pair.
///
/// The channel holds a single pending event; further events recorded before
/// the monitor wakes up are folded into it.
pub fn channel() -> (ActivityTracker, ActivityMonitor) {
    let (tx, rx) = mpsc::channel(1);
    (ActivityTracker { tx }, ActivityMonitor { rx })
}

impl ActivitySink for ActivityTracker {
    fn record(&self) {
        // Full means an event is already pending, closed means the supervisor
        // is gone. Neither needs reporting.
        let _ = self.tx.try_send(());
    }
}

impl ActivityMonitor {
    /// Waits for the next activity event.
    ///
    /// Returns `None` once every tracker has been dropped.
    pub async fn next(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// A connection wrapper that reports every successful read and write.
#[derive(Debug)]
pub struct ActivityStream<S, A> {
    inner: S,
    sink: A,
}

impl<S, A> ActivityStream<S, A> {
    /// Wraps `inner`, reporting its traffic to `sink`.
    pub fn new(inner: S, sink: A) -> Self {
        Self { inner, sink }
    }
}

impl<S, A> AsyncRead for ActivityStream<S, A>
where
    S: AsyncRead + Unpin,
    A: ActivitySink + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.sink.record();
        }
        poll
    }
}

impl<S, A> AsyncWrite for ActivityStream<S, A>
where
    S: AsyncWrite + Unpin,
    A: ActivitySink + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(_)) = poll {
            this.sink.record();
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct CountingSink(Arc<AtomicUsize>);

    impl CountingSink {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl ActivitySink for CountingSink {
        fn record(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_each_read_and_write_is_recorded() {
        let (local, mut remote) = duplex(64);
        let sink = CountingSink::default();
        let mut stream = ActivityStream::new(local, sink.clone());

        stream.write_all(b"ping").await.unwrap();
        assert_eq!(sink.count(), 1);

        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        remote.write_all(b"pong").await.unwrap();

        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_flush_is_not_activity() {
        let (local, _remote) = duplex(64);
        let sink = CountingSink::default();
        let mut stream = ActivityStream::new(local, sink.clone());
        stream.flush().await.unwrap();
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_activity() {
        let (local, remote) = duplex(64);
        drop(remote);
        let sink = CountingSink::default();
        let mut stream = ActivityStream::new(local, sink.clone());
        assert!(stream.write_all(b"lost").await.is_err());
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_tracker_folds_bursts_into_one_pending_event() {
        let (tracker, mut monitor) = channel();
        for _ in 0..10 {
            tracker.record();
        }
        assert_eq!(monitor.next().await, Some(()));
        let second = timeout(Duration::from_millis(20), monitor.next()).await;
        assert!(second.is_err(), "burst should collapse into a single event");
    }

    #[tokio::test]
    async fn test_monitor_ends_when_trackers_are_dropped() {
        let (tracker, mut monitor) = channel();
        let clone = tracker.clone();
        drop(tracker);
        drop(clone);
        assert_eq!(monitor.next().await, None);
    }

    #[test]
    fn test_record_without_monitor_does_not_panic() {
        let (tracker, monitor) = channel();
        drop(monitor);
        tracker.record();
    }
}
