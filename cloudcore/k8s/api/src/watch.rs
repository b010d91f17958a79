use futures::prelude::*;
pub use kube::runtime::watcher::{Error, Event};
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

const RETRY_DELAY: time::Duration = time::Duration::from_secs(1);

type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Event<T>, Error>> + Send + 'static>>;

/// Wraps a watch event stream, retrying past errors.
pub struct Watch<T> {
    span: tracing::Span,
    rx: EventStream<T>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>, Error>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    pub fn new(rx: EventStream<T>) -> Watch<T> {
        Self {
            rx,
            span: tracing::Span::current(),
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the next event, or `None` once the underlying stream ends. Errors are logged and
    /// polling resumes after a second, by which time the watcher has re-listed.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            match self.rx.next().instrument(self.span.clone()).await? {
                Ok(ev) => return Some(ev),
                Err(error) => {
                    info!(parent: &self.span, %error, "Watch failed; retrying");
                    time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

impl<T: Send + 'static> Watch<T> {
    /// Converts the watch into a stream of events, with errors logged and retried.
    pub fn into_events(self) -> impl Stream<Item = Event<T>> + Send + 'static {
        stream::unfold(self, |mut watch| async move {
            let ev = watch.recv().await?;
            Some((ev, watch))
        })
    }
}
