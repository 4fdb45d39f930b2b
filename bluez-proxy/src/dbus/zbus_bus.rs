//! Transport over a real D-Bus connection, backed by `zbus`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use log::debug;
use serde::Serialize;
use tokio::sync::Mutex;
use zbus::fdo::{InterfacesAdded, InterfacesRemoved, ObjectManagerProxy, PropertiesProxy};
use zbus::message::{Flags, Type as MessageType};
use zbus::names::InterfaceName;
use zbus::proxy::CacheProperties;
use zbus::{Connection, Message, MessageStream};
use zvariant::{DynamicType, OwnedValue, Structure, StructureBuilder, Value};

use crate::Result;
use crate::api::models::{
    BusKind, BusSignal, CallArgs, CallFlags, ConnectionConfig, InterfaceMap, ManagedObjects,
    ObjectManagerEvent, PropertiesChanged, ProxyError, Reply, SignalSpec,
};
use crate::dbus::transport::{BusTransport, Connector, SignalStream};
use crate::try_log;
use crate::types::constants::path;

/// Opens `zbus` connections to the system or session bus.
///
/// By default a connector hands out one connection per bus kind and method
/// timeout, shared by the whole process, so proxies on the same peer share
/// one object-manager subscription. [`dedicated`](Self::dedicated) opens a
/// private connection per client instead, and
/// [`with_connection`](Self::with_connection) reuses a connection the caller
/// already has. Shared and given connections are never closed by a proxy.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use bluez_proxy::dbus::ZbusConnector;
///
/// let connector = ZbusConnector::new().with_method_timeout(Duration::from_secs(10));
/// assert_eq!(connector.method_timeout(), Some(Duration::from_secs(10)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ZbusConnector {
    mode: ConnectionMode,
    method_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
enum ConnectionMode {
    #[default]
    Shared,
    Dedicated,
    Given(Connection),
}

type SharedKey = (BusKind, Option<Duration>);

fn shared_connections() -> &'static Mutex<HashMap<SharedKey, Connection>> {
    static SHARED: OnceLock<Mutex<HashMap<SharedKey, Connection>>> = OnceLock::new();
    SHARED.get_or_init(Mutex::default)
}

impl ZbusConnector {
    /// Connector handing out the process-wide connection for each bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening a new connection for every client. Each one is
    /// closed when its proxy closes.
    pub fn dedicated() -> Self {
        Self {
            mode: ConnectionMode::Dedicated,
            method_timeout: None,
        }
    }

    /// Hands out `conn` to every client instead of opening new connections.
    ///
    /// The bus kind requested by the client is ignored.
    pub fn with_connection(conn: Connection) -> Self {
        Self {
            mode: ConnectionMode::Given(conn),
            method_timeout: None,
        }
    }

    /// Sets the reply timeout for method calls on connections this
    /// connector opens itself. A connection passed to
    /// [`with_connection`](Self::with_connection) keeps its own setting.
    #[must_use]
    pub fn with_method_timeout(mut self, timeout: Duration) -> Self {
        self.method_timeout = Some(timeout);
        self
    }

    pub fn method_timeout(&self) -> Option<Duration> {
        self.method_timeout
    }

    async fn open(&self, bus: BusKind) -> Result<Connection> {
        let builder = match bus {
            BusKind::System => zbus::connection::Builder::system()?,
            BusKind::Session => zbus::connection::Builder::session()?,
        };
        let builder = match self.method_timeout {
            Some(timeout) => builder.method_timeout(timeout),
            None => builder,
        };
        let conn = builder.build().await?;
        debug!("Opened {bus} bus connection");
        Ok(conn)
    }
}

#[async_trait]
impl Connector for ZbusConnector {
    async fn connect(&self, bus: BusKind) -> Result<Arc<dyn BusTransport>> {
        match &self.mode {
            ConnectionMode::Given(conn) => {
                debug!("Reusing caller's D-Bus connection");
                Ok(Arc::new(ZbusTransport::new(conn.clone(), false)))
            }
            ConnectionMode::Dedicated => {
                let conn = self.open(bus).await?;
                Ok(Arc::new(ZbusTransport::new(conn, true)))
            }
            ConnectionMode::Shared => {
                let mut shared = shared_connections().lock().await;
                let key = (bus, self.method_timeout);
                let conn = match shared.get(&key) {
                    Some(conn) => conn.clone(),
                    None => {
                        let conn = self.open(bus).await?;
                        shared.insert(key, conn.clone());
                        conn
                    }
                };
                Ok(Arc::new(ZbusTransport::new(conn, false)))
            }
        }
    }
}

/// [`BusTransport`] over a `zbus::Connection`.
#[derive(Debug, Clone)]
pub struct ZbusTransport {
    conn: Connection,
    owned: bool,
}

impl ZbusTransport {
    /// Wraps a connection. An `owned` connection is closed on disconnect;
    /// a borrowed one is left open for its other users.
    pub fn new(conn: Connection, owned: bool) -> Self {
        Self { conn, owned }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    async fn send_call<B>(
        &self,
        target: &ConnectionConfig,
        method: &str,
        flags: CallFlags,
        body: &B,
    ) -> Result<Reply>
    where
        B: Serialize + DynamicType + Sync,
    {
        if flags.is_empty() {
            let msg = self
                .conn
                .call_method(
                    Some(target.name()),
                    target.path().as_str(),
                    Some(target.interface()),
                    method,
                    body,
                )
                .await?;
            return Ok(Reply::from_message(msg));
        }

        let msg = method_call(target, method, flags, body)?;
        if flags.contains(CallFlags::NO_REPLY_EXPECTED) {
            self.conn.send(&msg).await?;
            return Ok(Reply::empty());
        }

        // Subscribe before sending so the reply cannot slip past us.
        let serial = msg.primary_header().serial_num();
        let mut replies = MessageStream::from(&self.conn);
        self.conn.send(&msg).await?;

        while let Some(reply) = replies.next().await {
            let reply = reply?;
            if reply.header().reply_serial() != Some(serial) {
                continue;
            }
            return match reply.message_type() {
                MessageType::Error => Err(zbus::Error::from(reply).into()),
                _ => Ok(Reply::from_message(reply)),
            };
        }

        Err(ProxyError::Transport(zbus::Error::Failure(
            "connection closed before reply".into(),
        )))
    }

    async fn properties_proxy(
        &self,
        service: &str,
        object_path: &str,
    ) -> Result<PropertiesProxy<'static>> {
        Ok(PropertiesProxy::builder(&self.conn)
            .destination(service.to_owned())?
            .path(object_path.to_owned())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    async fn object_manager(&self, service: &str) -> Result<ObjectManagerProxy<'static>> {
        Ok(ObjectManagerProxy::builder(&self.conn)
            .destination(service.to_owned())?
            .path(path::ROOT)?
            .build()
            .await?)
    }
}

/// Builds a method call to `target` carrying `flags` in its header.
fn method_call<B>(
    target: &ConnectionConfig,
    method: &str,
    flags: CallFlags,
    body: &B,
) -> Result<Message>
where
    B: Serialize + DynamicType,
{
    let mut builder = Message::method_call(target.path().as_str(), method)?
        .destination(target.name())?
        .interface(target.interface())?;
    for (ours, header) in [
        (CallFlags::NO_REPLY_EXPECTED, Flags::NoReplyExpected),
        (CallFlags::NO_AUTO_START, Flags::NoAutoStart),
        (
            CallFlags::ALLOW_INTERACTIVE_AUTHORIZATION,
            Flags::AllowInteractiveAuth,
        ),
    ] {
        if flags.contains(ours) {
            builder = builder.with_flags(header)?;
        }
    }
    Ok(builder.build(body)?)
}

/// Packs call arguments into one structure so they go out as separate
/// message arguments. `None` means the call takes no arguments.
fn call_body(args: CallArgs) -> Result<Option<Structure<'static>>> {
    if args.is_empty() {
        return Ok(None);
    }
    let mut builder = StructureBuilder::new();
    for value in args.into_values() {
        builder.push_value(value);
    }
    Ok(Some(builder.build()?))
}

fn interface_name(target: &ConnectionConfig) -> Result<InterfaceName<'_>> {
    InterfaceName::try_from(target.interface())
        .map_err(|e| ProxyError::InvalidName(e.to_string()))
}

#[async_trait]
impl BusTransport for ZbusTransport {
    fn id(&self) -> String {
        self.conn
            .unique_name()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "unnamed".to_string())
    }

    async fn call(
        &self,
        target: &ConnectionConfig,
        method: &str,
        flags: CallFlags,
        args: CallArgs,
    ) -> Result<Reply> {
        debug!(
            "Calling {}.{method} on {} ({})",
            target.interface(),
            target.path().as_str(),
            target.name()
        );

        match call_body(args)? {
            Some(body) => self.send_call(target, method, flags, &body).await,
            None => self.send_call(target, method, flags, &()).await,
        }
    }

    async fn get_property(&self, target: &ConnectionConfig, name: &str) -> Result<OwnedValue> {
        let props = self
            .properties_proxy(target.name(), target.path().as_str())
            .await?;
        Ok(props.get(interface_name(target)?, name).await?)
    }

    async fn set_property(
        &self,
        target: &ConnectionConfig,
        name: &str,
        value: OwnedValue,
    ) -> Result<()> {
        let props = self
            .properties_proxy(target.name(), target.path().as_str())
            .await?;
        props
            .set(interface_name(target)?, name, Value::from(value))
            .await?;
        Ok(())
    }

    async fn get_all_properties(
        &self,
        target: &ConnectionConfig,
    ) -> Result<HashMap<String, OwnedValue>> {
        let props = self
            .properties_proxy(target.name(), target.path().as_str())
            .await?;
        Ok(props.get_all(interface_name(target)?).await?)
    }

    async fn get_managed_objects(&self, service: &str) -> Result<ManagedObjects> {
        let om = self.object_manager(service).await?;
        let objects = om.get_managed_objects().await?;

        Ok(objects
            .into_iter()
            .map(|(object_path, interfaces)| {
                let interfaces: InterfaceMap = interfaces
                    .into_iter()
                    .map(|(iface, props)| (iface.to_string(), props))
                    .collect();
                (object_path, interfaces)
            })
            .collect())
    }

    async fn subscribe(&self, spec: SignalSpec) -> Result<SignalStream> {
        match spec {
            SignalSpec::ObjectManager { service } => {
                let om = self.object_manager(&service).await?;
                let added = om
                    .receive_interfaces_added()
                    .await?
                    .filter_map(|signal| future::ready(interfaces_added(&signal)));
                let removed = om
                    .receive_interfaces_removed()
                    .await?
                    .filter_map(|signal| future::ready(interfaces_removed(&signal)));
                debug!("Subscribed to object manager signals of {service}");
                Ok(stream::select(added, removed).boxed())
            }
            SignalSpec::PropertiesChanged { service, path } => {
                let props = self.properties_proxy(&service, path.as_str()).await?;
                let changed = props
                    .receive_properties_changed()
                    .await?
                    .filter_map(|signal| future::ready(properties_changed(&signal)));
                debug!("Subscribed to PropertiesChanged on {}", path.as_str());
                Ok(changed.boxed())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if self.owned {
            debug!("Closing D-Bus connection {}", self.id());
            self.conn.clone().close().await?;
        }
        Ok(())
    }
}

fn interfaces_added(signal: &InterfacesAdded) -> Option<BusSignal> {
    let args = try_log!(signal.args(), "Failed to parse InterfacesAdded");

    let mut interfaces = InterfaceMap::new();
    for (iface, props) in args.interfaces_and_properties() {
        let mut owned = HashMap::with_capacity(props.len());
        for (name, value) in props {
            let value = try_log!(value.try_to_owned(), "Failed to copy property value");
            owned.insert(name.to_string(), value);
        }
        interfaces.insert(iface.to_string(), owned);
    }

    Some(BusSignal::ObjectManager(
        ObjectManagerEvent::InterfacesAdded {
            object_path: args.object_path().clone().into(),
            interfaces,
        },
    ))
}

fn interfaces_removed(signal: &InterfacesRemoved) -> Option<BusSignal> {
    let args = try_log!(signal.args(), "Failed to parse InterfacesRemoved");

    Some(BusSignal::ObjectManager(
        ObjectManagerEvent::InterfacesRemoved {
            object_path: args.object_path().clone().into(),
            interfaces: args.interfaces().iter().map(|i| i.to_string()).collect(),
        },
    ))
}

fn properties_changed(signal: &zbus::fdo::PropertiesChanged) -> Option<BusSignal> {
    let args = try_log!(signal.args(), "Failed to parse PropertiesChanged");

    let mut changed = HashMap::with_capacity(args.changed_properties().len());
    for (name, value) in args.changed_properties() {
        let value = try_log!(value.try_to_owned(), "Failed to copy property value");
        changed.insert(name.to_string(), value);
    }

    Some(BusSignal::PropertiesChanged(PropertiesChanged {
        interface: args.interface_name().to_string(),
        changed,
        invalidated: args
            .invalidated_properties()
            .iter()
            .map(|name| name.to_string())
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::constants::interface;
    use crate::util::utils::{options_dict, owned_value};
    use zvariant::OwnedObjectPath;

    fn profile_target() -> ConnectionConfig {
        ConnectionConfig::new(
            "org.bluez",
            interface::PROFILE1,
            "/org/bluez/profile/hfp",
            BusKind::System,
        )
        .unwrap()
    }

    #[test]
    fn connector_defaults_to_shared() {
        let connector = ZbusConnector::new();
        assert!(connector.method_timeout().is_none());
        assert!(matches!(connector.mode, ConnectionMode::Shared));
        assert!(matches!(
            ZbusConnector::dedicated().mode,
            ConnectionMode::Dedicated
        ));
    }

    #[test]
    fn connector_timeout() {
        let connector = ZbusConnector::new().with_method_timeout(Duration::from_secs(5));
        assert_eq!(connector.method_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn new_connection_body_is_flattened() {
        let device = OwnedObjectPath::try_from("/org/bluez/hci0/dev_00_11_22_33_44_55").unwrap();
        let props: HashMap<String, OwnedValue> =
            HashMap::from([("Version".to_string(), owned_value(0x0105u16).unwrap())]);
        let args = CallArgs::new()
            .push(device.into_inner())
            .push(7i32)
            .push(options_dict(props));

        let body = call_body(args).unwrap().unwrap();
        let msg =
            method_call(&profile_target(), "NewConnection", CallFlags::empty(), &body).unwrap();

        assert_eq!(msg.body().signature().to_string_no_parens(), "oia{sv}");
        let header = msg.header();
        assert_eq!(header.member().unwrap().as_str(), "NewConnection");
        assert_eq!(header.interface().unwrap().as_str(), interface::PROFILE1);
        assert_eq!(header.destination().unwrap().as_str(), "org.bluez");
    }

    #[test]
    fn empty_args_send_an_empty_body() {
        assert!(call_body(CallArgs::new()).unwrap().is_none());
        let msg = method_call(&profile_target(), "Release", CallFlags::empty(), &()).unwrap();
        assert!(msg.body().signature().to_string_no_parens().is_empty());
    }

    #[test]
    fn call_flags_reach_the_header() {
        let target = profile_target();

        let plain = method_call(&target, "Release", CallFlags::empty(), &()).unwrap();
        assert!(plain.primary_header().flags().is_empty());

        let flags = CallFlags::NO_AUTO_START | CallFlags::NO_REPLY_EXPECTED;
        let msg = method_call(&target, "Release", flags, &()).unwrap();
        let header_flags = msg.primary_header().flags();
        assert!(header_flags.contains(Flags::NoAutoStart));
        assert!(header_flags.contains(Flags::NoReplyExpected));
        assert!(!header_flags.contains(Flags::AllowInteractiveAuth));

        let interactive = method_call(
            &target,
            "Release",
            CallFlags::ALLOW_INTERACTIVE_AUTHORIZATION,
            &(),
        )
        .unwrap();
        assert!(interactive
            .primary_header()
            .flags()
            .contains(Flags::AllowInteractiveAuth));
    }
}
