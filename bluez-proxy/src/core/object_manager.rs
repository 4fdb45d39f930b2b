//! Shared object-manager subscriptions.
//!
//! Every proxy that wants hierarchy events registers here instead of
//! subscribing on its own. Per (connection, service) pair there is at most
//! one bus subscription; a fan-out task copies each event to the channel of
//! every listener. When the last listener leaves, the subscription is torn
//! down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};

use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::api::models::{BusSignal, ObjectManagerEvent, ProxyError, SignalSpec};
use crate::core::client::Client;
use crate::dbus::SignalStream;

/// Identifies one deduplicated subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Id of the bus connection, see [`BusTransport::id`](crate::dbus::BusTransport::id).
    pub connection: String,
    /// Well-known name of the peer whose object manager is watched.
    pub service: String,
}

#[derive(Debug, Default)]
struct ListenerSet {
    /// Set once the fan-out task has exited; no listener may join after.
    closed: bool,
    senders: HashMap<u64, UnboundedSender<Arc<ObjectManagerEvent>>>,
}

type Listeners = Arc<StdMutex<ListenerSet>>;

fn lock(listeners: &Listeners) -> MutexGuard<'_, ListenerSet> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Subscription {
    listeners: Listeners,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Tracks object-manager subscriptions and their listeners.
///
/// Use [`global`](Self::global) for the process-wide instance, or
/// [`new`](Self::new) to give a group of proxies their own.
#[derive(Debug, Default)]
pub struct ObjectManagerRegistry {
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
    next_id: AtomicU64,
}

static GLOBAL: OnceLock<Arc<ObjectManagerRegistry>> = OnceLock::new();

impl ObjectManagerRegistry {
    /// An empty registry, independent of [`global`](Self::global).
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Adds a listener for the object manager of `client`'s peer.
    ///
    /// The first listener for a key opens the bus subscription; later ones
    /// share it. A subscription whose stream was lost is replaced.
    ///
    /// # Errors
    ///
    /// Whatever the client reports when connecting or subscribing.
    pub async fn register(&self, client: &Client) -> Result<ObjectManagerSignal> {
        let key = SubscriptionKey {
            connection: client.connection_id().await?,
            service: client.config().name().to_string(),
        };

        let mut subscriptions = self.subscriptions.lock().await;
        loop {
            let listeners = match subscriptions.get(&key) {
                Some(existing) => Arc::clone(&existing.listeners),
                None => {
                    let subscription = Self::subscribe(&key, client).await?;
                    let listeners = Arc::clone(&subscription.listeners);
                    subscriptions.insert(key.clone(), subscription);
                    listeners
                }
            };

            let mut set = lock(&listeners);
            if set.closed {
                drop(set);
                debug!(
                    "Replacing lost object manager subscription for {}",
                    key.service
                );
                subscriptions.remove(&key);
                continue;
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = unbounded_channel();
            set.senders.insert(id, tx);
            debug!(
                "Registered object manager listener {id} for {} ({} total)",
                key.service,
                set.senders.len()
            );
            drop(set);
            return Ok(ObjectManagerSignal::new(id, key, listeners, rx));
        }
    }

    async fn subscribe(key: &SubscriptionKey, client: &Client) -> Result<Subscription> {
        let stream = client
            .subscribe(SignalSpec::ObjectManager {
                service: key.service.clone(),
            })
            .await?;

        let listeners = Listeners::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fan_out(
            key.clone(),
            stream,
            Arc::clone(&listeners),
            cancel.clone(),
        ));
        debug!(
            "Opened object manager subscription for {} on {}",
            key.service, key.connection
        );

        Ok(Subscription {
            listeners,
            cancel,
            task,
        })
    }

    /// Removes a listener. The last one out cancels the bus subscription
    /// and waits for its task to finish.
    ///
    /// Unknown or already removed listeners are ignored.
    pub async fn unregister(&self, signal: &ObjectManagerSignal) {
        let key = signal.key();
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(subscription) = subscriptions.get(key) else {
            return;
        };

        let now_empty = {
            let mut set = lock(&subscription.listeners);
            if set.senders.remove(&signal.id()).is_some() {
                debug!(
                    "Unregistered object manager listener {} for {}",
                    signal.id(),
                    key.service
                );
            }
            set.senders.is_empty()
        };
        if !now_empty {
            return;
        }

        if let Some(subscription) = subscriptions.remove(key) {
            subscription.cancel.cancel();
            if let Err(e) = subscription.task.await {
                warn!("Object manager task for {} failed: {e}", key.service);
            }
            debug!("Closed object manager subscription for {}", key.service);
        }
    }

    /// Number of live bus subscriptions. Lost ones are not counted.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .values()
            .filter(|subscription| !lock(&subscription.listeners).closed)
            .count()
    }

    /// Number of listeners sharing the subscription for `key`.
    pub async fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.subscriptions
            .lock()
            .await
            .get(key)
            .map_or(0, |subscription| lock(&subscription.listeners).senders.len())
    }
}

async fn fan_out(
    key: SubscriptionKey,
    mut stream: SignalStream,
    listeners: Listeners,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(BusSignal::ObjectManager(event)) => {
                    let event = Arc::new(event);
                    lock(&listeners).senders.retain(|id, tx| {
                        let delivered = tx.send(Arc::clone(&event)).is_ok();
                        if !delivered {
                            debug!("Dropping object manager listener {id}: receiver gone");
                        }
                        delivered
                    });
                }
                Some(other) => debug!("Ignoring unexpected signal {other:?}"),
                None => {
                    warn!(
                        "Object manager subscription for {} on {} was lost",
                        key.service, key.connection
                    );
                    break;
                }
            },
        }
    }

    // Dropping the senders closes every listener channel.
    let mut set = lock(&listeners);
    set.closed = true;
    set.senders.clear();
}

#[derive(Debug)]
struct SignalInner {
    id: u64,
    key: SubscriptionKey,
    listeners: Listeners,
    rx: Mutex<UnboundedReceiver<Arc<ObjectManagerEvent>>>,
    cancel: CancellationToken,
    cancelling: AtomicBool,
    receivers: AtomicUsize,
    observed: Notify,
}

/// One listener's view of a shared object-manager subscription.
///
/// Clones share the same channel. Events arrive in bus order.
#[derive(Debug, Clone)]
pub struct ObjectManagerSignal {
    inner: Arc<SignalInner>,
}

impl ObjectManagerSignal {
    fn new(
        id: u64,
        key: SubscriptionKey,
        listeners: Listeners,
        rx: UnboundedReceiver<Arc<ObjectManagerEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id,
                key,
                listeners,
                rx: Mutex::new(rx),
                cancel: CancellationToken::new(),
                cancelling: AtomicBool::new(false),
                receivers: AtomicUsize::new(0),
                observed: Notify::new(),
            }),
        }
    }

    /// Registry-assigned listener id, unique within one registry.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The subscription this listener belongs to.
    pub fn key(&self) -> &SubscriptionKey {
        &self.inner.key
    }

    /// Whether `other` is a handle on the same channel.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether [`CancelSignal::cancel`](crate::CancelSignal::cancel) has
    /// woken this listener.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether the bus subscription behind this listener has ended.
    pub fn is_lost(&self) -> bool {
        lock(&self.inner.listeners).closed
    }

    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` once the listener has been cancelled; callers
    /// should stop reading then.
    ///
    /// # Errors
    ///
    /// [`ProxyError::SubscriptionLost`] if the bus subscription ended.
    pub async fn recv(&self) -> Result<Option<Arc<ObjectManagerEvent>>> {
        let inner = &self.inner;
        let _pending = PendingReceive::enter(inner);

        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => Ok(None),
            event = async { inner.rx.lock().await.recv().await } => {
                event.map(Some).ok_or(ProxyError::SubscriptionLost)
            }
        }
    }

    /// Marks the listener as being cancelled. Only the first caller gets
    /// `true`.
    pub(crate) fn begin_cancel(&self) -> bool {
        !self.inner.cancelling.swap(true, Ordering::SeqCst)
    }

    /// Wakes every pending [`recv`](Self::recv) with `Ok(None)` and waits
    /// until all of them have returned.
    pub(crate) async fn wake_receivers(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        while inner.receivers.load(Ordering::SeqCst) > 0 {
            inner.observed.notified().await;
        }
    }
}

/// Counts one pending [`ObjectManagerSignal::recv`]. Released on every
/// exit path, including the future being dropped mid-await.
struct PendingReceive<'a>(&'a SignalInner);

impl<'a> PendingReceive<'a> {
    fn enter(inner: &'a SignalInner) -> Self {
        inner.receivers.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for PendingReceive<'_> {
    fn drop(&mut self) {
        self.0.receivers.fetch_sub(1, Ordering::SeqCst);
        if self.0.cancel.is_cancelled() {
            self.0.observed.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{BusKind, ConnectionConfig};
    use crate::dbus::mock::MockBus;
    use crate::types::constants::interface;
    use std::time::Duration;
    use zvariant::OwnedObjectPath;

    fn client(bus: &Arc<MockBus>) -> Client {
        let config =
            ConnectionConfig::new("org.bluez", interface::PROFILE1, "/p", BusKind::System).unwrap();
        Client::new(config, bus.connector())
    }

    fn removed(path: &str) -> ObjectManagerEvent {
        ObjectManagerEvent::InterfacesRemoved {
            object_path: OwnedObjectPath::try_from(path).unwrap(),
            interfaces: vec![interface::PROFILE1.into()],
        }
    }

    #[tokio::test]
    async fn listeners_share_one_subscription() {
        let bus = MockBus::new();
        let registry = ObjectManagerRegistry::new();
        let client = client(&bus);

        let first = registry.register(&client).await.unwrap();
        let second = registry.register(&client).await.unwrap();
        assert_eq!(bus.subscribe_calls(), 1);
        assert_eq!(registry.subscription_count().await, 1);
        assert_eq!(registry.listener_count(first.key()).await, 2);
        assert!(!first.same_channel(&second));

        registry.unregister(&first).await;
        assert_eq!(bus.live_subscriptions(), 1);
        registry.unregister(&second).await;
        assert_eq!(registry.subscription_count().await, 0);
        assert_eq!(bus.live_subscriptions(), 0);

        // A second unregister is ignored.
        registry.unregister(&second).await;
    }

    #[tokio::test]
    async fn events_fan_out_in_order() {
        let bus = MockBus::new();
        let registry = ObjectManagerRegistry::new();
        let client = client(&bus);
        let first = registry.register(&client).await.unwrap();
        let second = registry.register(&client).await.unwrap();

        assert_eq!(bus.emit_object_manager("org.bluez", removed("/a")), 1);
        assert_eq!(bus.emit_object_manager("org.bluez", removed("/b")), 1);

        for signal in [&first, &second] {
            let a = signal.recv().await.unwrap().unwrap();
            let b = signal.recv().await.unwrap().unwrap();
            assert_eq!(a.object_path().as_str(), "/a");
            assert_eq!(b.object_path().as_str(), "/b");
        }
    }

    #[tokio::test]
    async fn lost_stream_closes_listeners_and_is_replaced() {
        let bus = MockBus::new();
        let registry = ObjectManagerRegistry::new();
        let client = client(&bus);
        let signal = registry.register(&client).await.unwrap();

        bus.drop_subscriptions();
        assert!(matches!(
            signal.recv().await,
            Err(ProxyError::SubscriptionLost)
        ));
        assert!(signal.is_lost());
        assert_eq!(registry.subscription_count().await, 0);

        let again = registry.register(&client).await.unwrap();
        assert_eq!(bus.subscribe_calls(), 2);
        assert_eq!(registry.listener_count(again.key()).await, 1);
    }

    #[tokio::test]
    async fn subscribe_failure_propagates() {
        let bus = MockBus::new();
        bus.fail_subscriptions(true);
        let registry = ObjectManagerRegistry::new();

        let err = registry.register(&client(&bus)).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(registry.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn cancelled_signal_yields_none() {
        let bus = MockBus::new();
        let registry = ObjectManagerRegistry::new();
        let signal = registry.register(&client(&bus)).await.unwrap();

        assert!(signal.begin_cancel());
        assert!(!signal.begin_cancel());
        signal.wake_receivers().await;
        assert!(signal.is_cancelled());
        assert!(signal.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_recv_does_not_block_cancellation() {
        let bus = MockBus::new();
        let registry = ObjectManagerRegistry::new();
        let signal = registry.register(&client(&bus)).await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(20), signal.recv()).await;
        assert!(timed_out.is_err());

        assert!(signal.begin_cancel());
        let woke = tokio::time::timeout(Duration::from_secs(2), signal.wake_receivers()).await;
        assert!(woke.is_ok());
    }

    #[test]
    fn global_is_shared() {
        let a = ObjectManagerRegistry::global();
        let b = ObjectManagerRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
