//! Idle timeouts for streamed bodies.
//!
//! A backend exchange is only cut off when nothing moves for the configured
//! timeout. Large uploads and long responses that keep making progress run
//! for as long as they need.

use std::{
    io,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::Duration,
};

use futures_util::stream::Stream;
use tokio::time::{Instant, Sleep};

#[derive(Debug, thiserror::Error)]
#[error("no data received from backend within {0:?}")]
pub struct IdleTimeoutError(pub Duration);

/// Yields the inner stream's items and fails with [`io::ErrorKind::TimedOut`]
/// once no item has arrived for `timeout`. Ends after the first error.
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    terminated: bool,
}

impl<S> IdleTimeoutStream<S>
where
    S: Stream + Unpin,
{
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            terminated: false,
        }
    }
}

impl<S, T> Stream for IdleTimeoutStream<S>
where
    S: Stream<Item = Result<T, io::Error>> + Unpin,
{
    type Item = Result<T, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                let deadline = Instant::now() + self.timeout;
                self.sleep.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.terminated = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => match self.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.terminated = true;
                    tracing::warn!(
                        timeout_ms = self.timeout.as_millis() as u64,
                        "backend response stalled; closing stream"
                    );
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        IdleTimeoutError(self.timeout),
                    ))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Last time an upload made progress, shared between the request body
/// stream and the task waiting for response headers.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle_deadline(&self, timeout: Duration) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + timeout
    }
}
