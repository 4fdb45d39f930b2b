//! Generic remote-object proxy.
//!
//! [`ObjectProxy`] binds a [`Client`] to one object and interface and adds
//! what every typed proxy needs on top of plain calls: a property cache
//! kept in sync from `PropertiesChanged`, and a memoized listener on the
//! peer's object manager. Typed proxies such as [`Profile1`](crate::Profile1)
//! wrap one and only add their method stubs.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zvariant::{OwnedObjectPath, OwnedValue};

use crate::Result;
use crate::api::models::{
    BusKind, BusSignal, CallArgs, CallFlags, ConnectionConfig, ManagedObjects, ProxyState, Reply,
    SignalSpec,
};
use crate::core::client::Client;
use crate::core::object_manager::{ObjectManagerRegistry, ObjectManagerSignal};
use crate::core::properties::PropertyCache;
use crate::dbus::{Connector, SignalStream, ZbusConnector};
use crate::types::method_table::InterfaceSpec;

/// A typed proxy for one remote interface.
pub trait RemoteInterface: Sized {
    /// Name and method table of the interface.
    const SPEC: InterfaceSpec;

    fn from_proxy(proxy: ObjectProxy) -> Self;

    fn proxy(&self) -> &ObjectProxy;
}

/// Configures and builds a typed proxy.
///
/// Defaults: system bus, [`ZbusConnector::new`] (the process-wide shared
/// connection), and the process-wide [`ObjectManagerRegistry`].
pub struct ProxyBuilder<T> {
    service: String,
    path: String,
    bus: BusKind,
    connector: Option<Arc<dyn Connector>>,
    registry: Option<Arc<ObjectManagerRegistry>>,
    _interface: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ProxyBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyBuilder")
            .field("service", &self.service)
            .field("path", &self.path)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl<T: RemoteInterface> ProxyBuilder<T> {
    /// Starts a builder for the object at `path` owned by `service`. Names
    /// are checked in [`build`](Self::build).
    pub fn new(service: &str, path: &str) -> Self {
        Self {
            service: service.to_string(),
            path: path.to_string(),
            bus: BusKind::default(),
            connector: None,
            registry: None,
            _interface: PhantomData,
        }
    }

    /// Talks to the session bus instead of the system bus, or back.
    #[must_use]
    pub fn bus(mut self, bus: BusKind) -> Self {
        self.bus = bus;
        self
    }

    /// Uses `connector` to open the transport instead of the system bus.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Registers object-manager listeners with `registry` instead of the
    /// process-wide one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ObjectManagerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates the names and builds the proxy. Nothing is sent yet.
    ///
    /// # Errors
    ///
    /// `InvalidName` or `InvalidPath` for malformed input.
    pub fn build(self) -> Result<T> {
        let config = ConnectionConfig::new(&self.service, T::SPEC.name, &self.path, self.bus)?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(ZbusConnector::new()));
        let registry = self.registry.unwrap_or_else(ObjectManagerRegistry::global);

        Ok(T::from_proxy(ObjectProxy::new(
            Client::new(config, connector),
            registry,
        )))
    }
}

#[derive(Debug)]
struct PropertyWatch {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type SignalSlot = Arc<Mutex<Option<ObjectManagerSignal>>>;

/// One remote object seen through one interface.
#[derive(Debug)]
pub struct ObjectProxy {
    client: Client,
    properties: Arc<PropertyCache>,
    registry: Arc<ObjectManagerRegistry>,
    om_signal: SignalSlot,
    watch: Mutex<Option<PropertyWatch>>,
}

impl ObjectProxy {
    pub fn new(client: Client, registry: Arc<ObjectManagerRegistry>) -> Self {
        Self {
            client,
            properties: Arc::new(PropertyCache::new()),
            registry,
            om_signal: SignalSlot::default(),
            watch: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &OwnedObjectPath {
        self.client.config().path()
    }

    pub fn interface(&self) -> &str {
        self.client.config().interface()
    }

    /// The underlying client, for calls the typed proxy does not cover.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn registry(&self) -> &Arc<ObjectManagerRegistry> {
        &self.registry
    }

    pub async fn state(&self) -> ProxyState {
        self.client.state().await
    }

    pub fn properties(&self) -> &Arc<PropertyCache> {
        &self.properties
    }

    /// Calls `method` with no header flags.
    pub async fn call(&self, method: &str, args: CallArgs) -> Result<Reply> {
        self.client.call(method, CallFlags::empty(), args).await
    }

    pub async fn call_with_flags(
        &self,
        method: &str,
        flags: CallFlags,
        args: CallArgs,
    ) -> Result<Reply> {
        self.client.call(method, flags, args).await
    }

    /// Returns this proxy's object-manager listener, registering it on the
    /// first request.
    ///
    /// Later requests return the same channel until it is cancelled or its
    /// subscription is lost; either way the next request registers anew.
    pub async fn get_object_manager_signal(&self) -> Result<(ObjectManagerSignal, CancelSignal)> {
        let mut slot = self.om_signal.lock().await;
        let signal = match &*slot {
            Some(signal) if !signal.is_cancelled() && !signal.is_lost() => signal.clone(),
            previous => {
                if let Some(lost) = previous.as_ref().filter(|s| s.is_lost()) {
                    debug!(
                        "Replacing lost object-manager listener {} on {}",
                        lost.id(),
                        self.path().as_str()
                    );
                    self.registry.unregister(lost).await;
                }
                let signal = self.registry.register(&self.client).await?;
                *slot = Some(signal.clone());
                signal
            }
        };

        let cancel = CancelSignal {
            signal: signal.clone(),
            registry: Arc::clone(&self.registry),
            slot: Arc::clone(&self.om_signal),
        };
        Ok((signal, cancel))
    }

    /// Replaces the cache with a fresh `GetAll` of the interface.
    pub async fn refresh_properties(&self) -> Result<()> {
        let values = self.client.get_all_properties().await?;
        debug!(
            "Fetched {} properties of {} on {}",
            values.len(),
            self.interface(),
            self.path().as_str()
        );
        self.properties.replace(values).await;
        Ok(())
    }

    /// Reads a property, from the cache if present, otherwise from the peer.
    pub async fn get_property(&self, name: &str) -> Result<OwnedValue> {
        if let Some(value) = self.properties.get(name).await {
            return Ok(value);
        }
        let value = self.client.get_property(name).await?;
        self.properties.set(name, value.try_clone()?).await;
        Ok(value)
    }

    /// Writes a property on the peer, then in the cache.
    pub async fn set_property(&self, name: &str, value: OwnedValue) -> Result<()> {
        self.client.set_property(name, value.try_clone()?).await?;
        self.properties.set(name, value).await;
        Ok(())
    }

    /// Keeps the cache in sync with `PropertiesChanged` until
    /// [`close`](Self::close). Calling it again while the watch runs does
    /// nothing.
    pub async fn watch_properties(&self) -> Result<()> {
        let mut watch = self.watch.lock().await;
        if watch.as_ref().is_some_and(|w| !w.task.is_finished()) {
            return Ok(());
        }

        let config = self.client.config();
        let stream = self
            .client
            .subscribe(SignalSpec::PropertiesChanged {
                service: config.name().to_string(),
                path: config.path().clone(),
            })
            .await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatch_properties(
            config.interface().to_string(),
            stream,
            Arc::clone(&self.properties),
            cancel.clone(),
        ));
        *watch = Some(PropertyWatch { cancel, task });
        Ok(())
    }

    async fn stop_watch(&self) {
        let Some(watch) = self.watch.lock().await.take() else {
            return;
        };
        watch.cancel.cancel();
        if let Err(e) = watch.task.await {
            warn!("Property watch on {} failed: {e}", self.path().as_str());
        }
    }

    /// Calls `GetManagedObjects` on the peer's root object manager.
    pub async fn managed_objects(&self) -> Result<ManagedObjects> {
        self.client.managed_objects().await
    }

    /// Stops the property watch, drops the object-manager listener if one
    /// was taken, and disconnects the client.
    ///
    /// Safe to call more than once. Afterwards every call fails with
    /// `InvalidState(Closed)`.
    pub async fn close(&self) -> Result<()> {
        self.stop_watch().await;

        let memoized = self.om_signal.lock().await.take();
        if let Some(signal) = memoized {
            // A cancel interrupted after it started must still release the
            // registration, so teardown runs whatever `begin_cancel` reports.
            signal.begin_cancel();
            CancelSignal {
                signal,
                registry: Arc::clone(&self.registry),
                slot: Arc::clone(&self.om_signal),
            }
            .teardown()
            .await;
        }

        self.client.disconnect().await
    }
}

async fn dispatch_properties(
    interface: String,
    mut stream: SignalStream,
    cache: Arc<PropertyCache>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(BusSignal::PropertiesChanged(event)) if event.interface == interface => {
                    cache.apply(event).await;
                }
                Some(_) => {}
                None => {
                    warn!("PropertiesChanged subscription for {interface} was lost");
                    break;
                }
            },
        }
    }
}

/// Cancels one object-manager listener.
///
/// Cancelling wakes any task blocked in [`ObjectManagerSignal::recv`] with
/// `Ok(None)`, waits until it has returned, then unregisters the listener
/// and forgets it on the proxy. Only the first call has an effect; if that
/// call is dropped midway, [`ObjectProxy::close`] finishes the job.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    signal: ObjectManagerSignal,
    registry: Arc<ObjectManagerRegistry>,
    slot: SignalSlot,
}

impl CancelSignal {
    pub async fn cancel(&self) {
        if !self.signal.begin_cancel() {
            return;
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.signal.wake_receivers().await;
        self.registry.unregister(&self.signal).await;

        let mut slot = self.slot.lock().await;
        if slot
            .as_ref()
            .is_some_and(|memoized| memoized.same_channel(&self.signal))
        {
            *slot = None;
        }
    }
}
