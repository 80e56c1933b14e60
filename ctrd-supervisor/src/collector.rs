//! Event collector.
//!
//! Fans in the event streams of every shim into one bounded channel and fans
//! that channel out to a dynamic set of subscribers. Each subscriber has its
//! own buffer; a subscriber that falls behind is dropped with
//! [`Error::Lagged`] instead of stalling the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use ctrd_shim::Event;

use crate::error::{Error, Result};
use crate::shim::EventStream;

/// Capacity of the channel shared by all shim drain tasks.
pub const EVENT_BUFFER: usize = 2048;

/// Events buffered per subscriber before it is considered lagging.
pub const SUBSCRIBER_BUFFER: usize = 1024;

struct Subscriber {
    tx: mpsc::Sender<Event>,
    error: Arc<Mutex<Option<Error>>>,
}

struct Inner {
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Inner {
    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        lock(&self.sender).clone()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        lock(&self.subscribers)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

impl Collector {
    /// Start the collector. It runs until `token` is cancelled.
    pub fn new(token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let inner = Arc::new(Inner {
            sender: Mutex::new(Some(tx)),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            token,
        });

        tokio::spawn(publish_loop(inner.clone(), rx));
        tokio::spawn(wait_done(inner.clone()));

        Self { inner }
    }

    /// Drain `events` from the shim serving `id` into the shared channel.
    /// The drain task ends quietly when the stream does.
    pub fn collect(&self, id: &str, mut events: EventStream) -> Result<()> {
        let tx = self.inner.sender().ok_or(Error::Shutdown)?;
        let token = self.inner.token.clone();
        let id = id.to_string();

        self.inner.tracker.spawn(async move {
            debug!(id = %id, "collecting shim events");
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    next = events.next() => match next {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            debug!(id = %id, error = %e, "shim event stream failed");
                            break;
                        }
                        None => break,
                    },
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(event) => if sent.is_err() {
                        break;
                    },
                }
            }
            debug!(id = %id, "stopped collecting shim events");
        });

        Ok(())
    }

    /// Inject an event that did not come from a shim stream.
    pub async fn publish(&self, event: Event) -> Result<()> {
        let tx = self.inner.sender().ok_or(Error::Shutdown)?;
        tx.send(event).await.map_err(|_| Error::Shutdown)
    }

    /// Register a new subscriber. It receives every event published from
    /// now on until it is dropped, falls behind, or the collector stops.
    pub fn subscribe(&self) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let error = Arc::new(Mutex::new(None));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            // Checked under the subscriber lock so the publisher's final
            // clear cannot miss this entry
            let mut subscribers = self.inner.subscribers();
            if self.inner.sender().is_none() {
                return Err(Error::Shutdown);
            }
            subscribers.insert(
                id,
                Subscriber {
                    tx,
                    error: error.clone(),
                },
            );
        }
        debug!(subscriber = id, "event subscriber registered");

        Ok(Subscription {
            id,
            rx,
            error,
            collector: Arc::downgrade(&self.inner),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// True once shutdown has closed the shared channel.
    pub fn is_closed(&self) -> bool {
        self.inner.sender().is_none()
    }
}

async fn publish_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        let mut subscribers = inner.subscribers();
        subscribers.retain(|id, sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, "event subscriber lagged, dropping it");
                *lock(&sub.error) = Some(Error::Lagged);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "event subscriber went away");
                false
            }
        });
    }

    // Dropping the senders ends every subscription
    inner.subscribers().clear();
    info!("event publisher stopped");
}

async fn wait_done(inner: Arc<Inner>) {
    inner.token.cancelled().await;

    inner.tracker.close();
    inner.tracker.wait().await;

    // Last sender gone: the publisher drains what is left and exits
    lock(&inner.sender).take();
    debug!("event collector shut down");
}

/// One consumer of the collector's events. Dropping it unregisters.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    error: Arc<Mutex<Option<Error>>>,
    collector: Weak<Inner>,
}

impl Subscription {
    /// Next event. After the last buffered event this yields the
    /// subscriber's terminal error, if it had one, and then `None`.
    pub async fn recv(&mut self) -> Option<Result<Event>> {
        match self.rx.recv().await {
            Some(event) => Some(Ok(event)),
            None => lock(&self.error).take().map(Err),
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<Event>> + Send + 'static {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.collector.upgrade() {
            inner.subscribers().remove(&self.id);
            debug!(subscriber = self.id, "event subscriber unregistered");
        }
    }
}
