//! In-memory bus for tests.
//!
//! [`MockBus`] implements [`BusTransport`] without any D-Bus daemon. It
//! records every method call, answers with configurable remote errors,
//! serves properties and managed objects from memory and lets a test push
//! signals to live subscriptions. It also counts how many subscriptions
//! are currently open, which is what the object-manager registry
//! guarantees are built on.
//!
//! # Example
//!
//! ```
//! use bluez_proxy::dbus::mock::MockBus;
//! use bluez_proxy::Profile1;
//!
//! # async fn example() -> bluez_proxy::Result<()> {
//! let bus = MockBus::new();
//! bus.fail_method("RequestDisconnection", "org.bluez.Error.Rejected");
//!
//! let profile = Profile1::builder("org.bluez", "/org/bluez/profile/0")
//!     .connector(bus.connector())
//!     .build()?;
//! profile.release().await?;
//! assert_eq!(bus.call_count(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::{Stream, StreamExt};
use log::debug;
use zvariant::{OwnedObjectPath, OwnedValue};

use crate::Result;
use crate::api::models::{
    BusKind, BusSignal, CallArgs, CallFlags, ConnectionConfig, ManagedObjects, ObjectManagerEvent,
    PropertiesChanged, ProxyError, Reply, SignalSpec, clone_properties,
};
use crate::dbus::transport::{BusTransport, Connector, SignalStream};

/// A method call as seen by the mock peer.
#[derive(Debug, PartialEq)]
pub struct RecordedCall {
    pub service: String,
    pub path: OwnedObjectPath,
    pub interface: String,
    pub method: String,
    pub flags: CallFlags,
    pub args: CallArgs,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    failures: HashMap<String, (String, Option<String>)>,
    unreachable: bool,
    fail_subscribe: bool,
    properties: HashMap<(String, String), HashMap<String, OwnedValue>>,
    managed: ManagedObjects,
    subscribers: Vec<(SignalSpec, UnboundedSender<BusSignal>)>,
    subscribe_calls: usize,
    connects: usize,
    disconnects: usize,
}

/// Decrements the live-subscription counter when a stream is dropped.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TrackedStream {
    rx: UnboundedReceiver<BusSignal>,
    _live: LiveGuard,
}

impl Stream for TrackedStream {
    type Item = BusSignal;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<BusSignal>> {
        self.rx.poll_next_unpin(cx)
    }
}

/// In-memory message bus. See the [module docs](self).
#[derive(Debug)]
pub struct MockBus {
    id: String,
    state: Mutex<MockState>,
    live: Arc<AtomicUsize>,
}

impl MockBus {
    /// Creates a bus whose connection id is `":mock.1"`.
    pub fn new() -> Arc<Self> {
        Self::with_id(":mock.1")
    }

    /// Creates a bus with the given connection id.
    pub fn with_id(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(MockState::default()),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// A connector handing out this bus for any bus kind.
    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            bus: Arc::clone(self),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A test that panicked while holding the lock already failed.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following call of `method` fail with the remote error `name`.
    pub fn fail_method(&self, method: &str, name: &str) {
        self.state()
            .failures
            .insert(method.to_string(), (name.to_string(), None));
    }

    /// Lets `method` succeed again.
    pub fn clear_failure(&self, method: &str) {
        self.state().failures.remove(method);
    }

    /// Makes every following operation fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Makes the next subscriptions fail with a transport error.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    /// Seeds a property of `interface` on `path`.
    pub fn insert_property(&self, path: &str, interface: &str, name: &str, value: OwnedValue) {
        self.state()
            .properties
            .entry((path.to_string(), interface.to_string()))
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Current value of a property, as the peer sees it.
    pub fn property(&self, path: &str, interface: &str, name: &str) -> Option<OwnedValue> {
        self.state()
            .properties
            .get(&(path.to_string(), interface.to_string()))
            .and_then(|props| props.get(name))
            .and_then(|v| v.try_clone().ok())
    }

    /// Replaces the tree returned by `GetManagedObjects`.
    pub fn set_managed_objects(&self, objects: ManagedObjects) {
        self.state().managed = objects;
    }

    /// Number of method calls received so far.
    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Removes and returns the recorded calls.
    pub fn take_calls(&self) -> Vec<RecordedCall> {
        std::mem::take(&mut self.state().calls)
    }

    /// Number of subscriptions whose stream is still alive.
    pub fn live_subscriptions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of `subscribe` requests ever made.
    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Delivers an object-manager event to every matching subscription.
    ///
    /// Returns how many subscriptions received it.
    pub fn emit_object_manager(&self, service: &str, event: ObjectManagerEvent) -> usize {
        self.emit(
            |spec| matches!(spec, SignalSpec::ObjectManager { service: s } if s == service),
            BusSignal::ObjectManager(event),
        )
    }

    /// Delivers a `PropertiesChanged` signal emitted by `path`.
    pub fn emit_properties_changed(&self, path: &str, event: PropertiesChanged) -> usize {
        self.emit(
            |spec| matches!(spec, SignalSpec::PropertiesChanged { path: p, .. } if p.as_str() == path),
            BusSignal::PropertiesChanged(event),
        )
    }

    fn emit(&self, wanted: impl Fn(&SignalSpec) -> bool, signal: BusSignal) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (spec, tx) in state.subscribers.iter().filter(|(spec, _)| wanted(spec)) {
            let Ok(copy) = signal.try_clone() else {
                continue;
            };
            if tx.unbounded_send(copy).is_ok() {
                delivered += 1;
            } else {
                debug!("Mock subscriber for {spec:?} went away");
            }
        }
        delivered
    }

    /// Ends every open subscription stream, as if the bus went away.
    pub fn drop_subscriptions(&self) {
        self.state().subscribers.clear();
    }

    fn check_reachable(state: &MockState) -> Result<()> {
        if state.unreachable {
            return Err(ProxyError::Transport(zbus::Error::Failure(
                "mock bus unreachable".into(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BusTransport for MockBus {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn call(
        &self,
        target: &ConnectionConfig,
        method: &str,
        flags: CallFlags,
        args: CallArgs,
    ) -> Result<Reply> {
        let mut state = self.state();
        Self::check_reachable(&state)?;

        state.calls.push(RecordedCall {
            service: target.name().to_string(),
            path: target.path().clone(),
            interface: target.interface().to_string(),
            method: method.to_string(),
            flags,
            args,
        });

        match state.failures.get(method) {
            Some((name, message)) => Err(ProxyError::remote(name.clone(), message.clone())),
            None => Ok(Reply::empty()),
        }
    }

    async fn get_property(&self, target: &ConnectionConfig, name: &str) -> Result<OwnedValue> {
        let state = self.state();
        Self::check_reachable(&state)?;

        let value = state
            .properties
            .get(&(target.path().as_str().to_string(), target.interface().to_string()))
            .and_then(|props| props.get(name))
            .ok_or_else(|| {
                ProxyError::remote(
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    Some(format!("no property {name}")),
                )
            })?;
        Ok(value.try_clone()?)
    }

    async fn set_property(
        &self,
        target: &ConnectionConfig,
        name: &str,
        value: OwnedValue,
    ) -> Result<()> {
        let mut state = self.state();
        Self::check_reachable(&state)?;

        state
            .properties
            .entry((target.path().as_str().to_string(), target.interface().to_string()))
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn get_all_properties(
        &self,
        target: &ConnectionConfig,
    ) -> Result<HashMap<String, OwnedValue>> {
        let state = self.state();
        Self::check_reachable(&state)?;

        match state
            .properties
            .get(&(target.path().as_str().to_string(), target.interface().to_string()))
        {
            Some(props) => clone_properties(props),
            None => Ok(HashMap::new()),
        }
    }

    async fn get_managed_objects(&self, _service: &str) -> Result<ManagedObjects> {
        let state = self.state();
        Self::check_reachable(&state)?;

        let mut objects = ManagedObjects::with_capacity(state.managed.len());
        for (object_path, interfaces) in &state.managed {
            let mut copy = HashMap::with_capacity(interfaces.len());
            for (iface, props) in interfaces {
                copy.insert(iface.clone(), clone_properties(props)?);
            }
            objects.insert(object_path.clone(), copy);
        }
        Ok(objects)
    }

    async fn subscribe(&self, spec: SignalSpec) -> Result<SignalStream> {
        let mut state = self.state();
        Self::check_reachable(&state)?;
        if state.fail_subscribe {
            return Err(ProxyError::Transport(zbus::Error::Failure(
                "mock subscription refused".into(),
            )));
        }

        let (tx, rx) = unbounded();
        state.subscribers.push((spec, tx));
        state.subscribe_calls += 1;
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(TrackedStream {
            rx,
            _live: LiveGuard(Arc::clone(&self.live)),
        }
        .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state().disconnects += 1;
        Ok(())
    }
}

#[derive(Debug)]
struct MockConnector {
    bus: Arc<MockBus>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _bus: BusKind) -> Result<Arc<dyn BusTransport>> {
        let mut state = self.bus.state();
        MockBus::check_reachable(&state)?;
        state.connects += 1;
        drop(state);
        Ok(Arc::clone(&self.bus) as Arc<dyn BusTransport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::constants::interface;
    use zvariant::Value;

    fn config(path: &str) -> ConnectionConfig {
        ConnectionConfig::new("org.bluez", interface::PROFILE1, path, BusKind::System).unwrap()
    }

    #[tokio::test]
    async fn records_calls_and_fails_on_demand() {
        let bus = MockBus::new();
        let target = config("/p");

        bus.call(&target, "Release", CallFlags::empty(), CallArgs::new())
            .await
            .unwrap();
        bus.fail_method("Release", "org.bluez.Error.Failed");
        let err = bus
            .call(&target, "Release", CallFlags::empty(), CallArgs::new())
            .await
            .unwrap_err();
        assert_eq!(err.remote_name(), Some("org.bluez.Error.Failed"));

        let calls = bus.take_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method, "Release");
        assert_eq!(calls[0].path.as_str(), "/p");
        assert_eq!(bus.call_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_bus_is_a_transport_error() {
        let bus = MockBus::new();
        bus.set_unreachable(true);
        let err = bus
            .call(&config("/p"), "Release", CallFlags::empty(), CallArgs::new())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(bus.connector().connect(BusKind::System).await.is_err());
    }

    #[tokio::test]
    async fn live_subscriptions_follow_stream_lifetime() {
        let bus = MockBus::new();
        let stream = bus
            .subscribe(SignalSpec::ObjectManager {
                service: "org.bluez".into(),
            })
            .await
            .unwrap();
        assert_eq!(bus.live_subscriptions(), 1);
        drop(stream);
        assert_eq!(bus.live_subscriptions(), 0);
        assert_eq!(bus.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn emitted_signals_reach_matching_streams() {
        let bus = MockBus::new();
        let mut stream = bus
            .subscribe(SignalSpec::ObjectManager {
                service: "org.bluez".into(),
            })
            .await
            .unwrap();

        let event = ObjectManagerEvent::InterfacesRemoved {
            object_path: OwnedObjectPath::try_from("/org/bluez/hci0").unwrap(),
            interfaces: vec!["org.bluez.Adapter1".into()],
        };
        assert_eq!(bus.emit_object_manager("org.other", event.try_clone().unwrap()), 0);
        assert_eq!(bus.emit_object_manager("org.bluez", event.try_clone().unwrap()), 1);

        assert_eq!(stream.next().await, Some(BusSignal::ObjectManager(event)));

        bus.drop_subscriptions();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn properties_round_trip_through_the_peer() {
        let bus = MockBus::new();
        let target = config("/p");
        let value = OwnedValue::try_from(Value::from(3u16)).unwrap();
        bus.set_property(&target, "Version", value).await.unwrap();

        let read = bus.get_property(&target, "Version").await.unwrap();
        assert_eq!(u16::try_from(read).unwrap(), 3);
        assert_eq!(bus.get_all_properties(&target).await.unwrap().len(), 1);
        assert!(bus.get_property(&target, "Missing").await.is_err());
    }
}
