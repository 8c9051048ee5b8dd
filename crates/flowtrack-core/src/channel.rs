//! Process-wide notification channel.
//!
//! The application shell owns one `NotificationChannel` and points it at a
//! single inbound source with [`NotificationChannel::connect`]. Any number of
//! trackers subscribe to it; each subscription is a [`Subscription`] disposer
//! that removes its handler when dropped.

use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::RawNotificationEnvelope;

type Handler = Arc<dyn Fn(&RawNotificationEnvelope) + Send + Sync>;

/// Shared handle to the push-notification stream. Clones refer to the same channel.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    handlers: RwLock<Vec<(Uuid, Handler)>>,
    connection: Mutex<Option<Connection>>,
    connected: watch::Sender<bool>,
}

struct Connection {
    id: Uuid,
    pump: JoinHandle<()>,
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationChannel {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                handlers: RwLock::new(Vec::new()),
                connection: Mutex::new(None),
                connected,
            }),
        }
    }

    /// Install `handler` for every envelope delivered from now on.
    ///
    /// The handler stays installed until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RawNotificationEnvelope) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.inner
            .handlers
            .write()
            .expect("notification handler lock poisoned")
            .push((id, Arc::new(handler)));
        debug!(subscription = %id, "notification handler installed");
        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `envelope` to every current subscriber. Returns how many
    /// handlers saw it.
    pub fn publish(&self, envelope: &RawNotificationEnvelope) -> usize {
        self.inner.publish(envelope)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .expect("notification handler lock poisoned")
            .len()
    }

    /// Start pumping `source` into the channel.
    ///
    /// At most one source is active: a previous connection is aborted before
    /// the new one starts. Must be called from within a tokio runtime.
    pub fn connect<S>(&self, source: S) -> Result<()>
    where
        S: Stream<Item = RawNotificationEnvelope> + Send + 'static,
    {
        let runtime = Handle::try_current()?;
        let id = Uuid::new_v4();
        let weak = Arc::downgrade(&self.inner);

        let mut slot = self
            .inner
            .connection
            .lock()
            .expect("notification connection lock poisoned");
        if let Some(previous) = slot.take() {
            info!(connection = %previous.id, "replacing notification connection");
            previous.pump.abort();
        }

        self.inner.connected.send_replace(true);
        let pump = runtime.spawn(pump(source, weak, id));
        *slot = Some(Connection { id, pump });
        info!(connection = %id, "notification channel connected");
        Ok(())
    }

    /// Stop the active source, if any. Subscribers stay installed.
    pub fn disconnect(&self) {
        let previous = self
            .inner
            .connection
            .lock()
            .expect("notification connection lock poisoned")
            .take();
        if let Some(previous) = previous {
            previous.pump.abort();
            self.inner.connected.send_replace(false);
            info!(connection = %previous.id, "notification channel disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Resolves once no source is connected (the source ended or was
    /// disconnected). Resolves immediately when nothing is connected.
    pub async fn closed(&self) {
        let mut rx = self.inner.connected.subscribe();
        let _ = rx.wait_for(|connected| !*connected).await;
    }
}

impl ChannelInner {
    fn publish(&self, envelope: &RawNotificationEnvelope) -> usize {
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .expect("notification handler lock poisoned")
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler(envelope);
        }
        handlers.len()
    }

    fn remove(&self, id: Uuid) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .expect("notification handler lock poisoned");
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    fn finish_connection(&self, id: Uuid) {
        let mut slot = self
            .connection
            .lock()
            .expect("notification connection lock poisoned");
        if slot.as_ref().is_some_and(|current| current.id == id) {
            *slot = None;
            self.connected.send_replace(false);
        }
    }
}

async fn pump<S>(source: S, channel: Weak<ChannelInner>, id: Uuid)
where
    S: Stream<Item = RawNotificationEnvelope> + Send + 'static,
{
    tokio::pin!(source);
    while let Some(envelope) = source.next().await {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let delivered = channel.publish(&envelope);
        debug!(connection = %id, delivered, "envelope delivered");
    }
    if let Some(channel) = channel.upgrade() {
        info!(connection = %id, "notification source ended");
        channel.finish_connection(id);
    }
}

/// Disposer for a channel handler. Dropping it removes the handler.
#[must_use = "dropping a Subscription immediately removes its handler"]
pub struct Subscription {
    id: Uuid,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            if channel.remove(self.id) {
                debug!(subscription = %self.id, "notification handler removed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
