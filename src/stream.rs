//! Stream adapter for [`Watcher`].
//!
//! A [`WatchStream`] yields the channel's current value when first polled
//! (if it has one) and then every changed value. It ends when the channel
//! is disposed.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures_util::{Stream, future::BoxFuture};

use crate::{error::RecvError, watch::Watcher};

async fn mk_fut<V: Clone + Send + Sync + 'static>(
    watcher: Watcher<V>,
) -> (Result<(), RecvError>, Watcher<V>) {
    let result = watcher.changed().await;
    (result, watcher)
}

/// A stream of a channel's values.
pub struct WatchStream<V> {
    inner: BoxFuture<'static, (Result<(), RecvError>, Watcher<V>)>,
}

impl<V: Clone + Send + Sync + 'static> WatchStream<V> {
    /// Creates a stream that yields the current value first.
    ///
    /// ```
    /// use futures_util::StreamExt;
    /// use statecast::{Handler, Topic, TypedStore, stream::WatchStream};
    ///
    /// struct Status;
    /// impl Topic for Status {
    ///     type Value = &'static str;
    /// }
    ///
    /// # async fn doc() {
    /// let store = TypedStore::new();
    /// store.dispatch::<Status>("online").unwrap();
    /// let mut stream = WatchStream::new(store.watch::<Status>());
    /// assert_eq!(stream.next().await, Some("online"));
    /// # }
    /// ```
    pub fn new(watcher: Watcher<V>) -> Self {
        Self {
            inner: Box::pin(async move { (Ok(()), watcher) }),
        }
    }

    /// Creates a stream that waits for the next change before yielding.
    pub fn from_changes(watcher: Watcher<V>) -> Self {
        Self {
            inner: Box::pin(mk_fut(watcher)),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Stream for WatchStream<V> {
    type Item = V;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let (result, mut watcher) = ready!(self.inner.as_mut().poll(cx));
            let received = match result {
                Ok(()) => watcher.current_and_update(),
                Err(_) => {
                    self.inner = Box::pin(mk_fut(watcher));
                    return Poll::Ready(None);
                }
            };
            self.inner = Box::pin(mk_fut(watcher));
            // An unset channel has nothing to yield yet.
            if let Some(value) = received {
                return Poll::Ready(Some(value));
            }
        }
    }
}

impl<V> fmt::Debug for WatchStream<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream").finish()
    }
}

impl<V: Clone + Send + Sync + 'static> From<Watcher<V>> for WatchStream<V> {
    fn from(watcher: Watcher<V>) -> Self {
        Self::new(watcher)
    }
}
