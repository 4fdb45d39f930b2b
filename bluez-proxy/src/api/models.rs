//! Types shared by every proxy: connection configuration, call arguments,
//! bus events and the crate error type.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use bitflags::bitflags;
use thiserror::Error;
use zbus::DBusError;
use zbus::names::{BusName, InterfaceName};
use zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::types::constants::{bluez_error, dbus_error};

/// Which message bus a proxy talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BusKind {
    /// The system-wide bus, where BlueZ lives.
    #[default]
    System,
    /// The per-login-session bus.
    Session,
}

impl Display for BusKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Identifies exactly one remote object/interface pair.
///
/// Names and the object path are validated when the config is built, so a
/// config that exists is always well-formed. It cannot be changed
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    name: String,
    iface: String,
    path: OwnedObjectPath,
    bus: BusKind,
}

impl ConnectionConfig {
    /// Builds a validated config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` if `name` is not a valid bus name or `iface` not
    /// a valid interface name, and `InvalidPath` for a malformed object path.
    pub fn new(name: &str, iface: &str, path: &str, bus: BusKind) -> Result<Self, ProxyError> {
        BusName::try_from(name)
            .map_err(|e| ProxyError::InvalidName(format!("bus name '{name}': {e}")))?;
        InterfaceName::try_from(iface)
            .map_err(|e| ProxyError::InvalidName(format!("interface '{iface}': {e}")))?;
        let path = OwnedObjectPath::try_from(path)
            .map_err(|e| ProxyError::InvalidPath(format!("'{path}': {e}")))?;

        Ok(Self {
            name: name.to_string(),
            iface: iface.to_string(),
            path,
            bus,
        })
    }

    /// Returns a config for another interface on another path of the same peer.
    pub fn retarget(&self, iface: &str, path: &str) -> Result<Self, ProxyError> {
        Self::new(&self.name, iface, path, self.bus)
    }

    /// Destination bus name of the peer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interface the proxy is bound to.
    pub fn interface(&self) -> &str {
        &self.iface
    }

    /// Object path the proxy is bound to.
    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    pub fn bus(&self) -> BusKind {
        self.bus
    }
}

bitflags! {
    /// Header flags for an outgoing method call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallFlags: u8 {
        /// The caller does not wait for a reply.
        const NO_REPLY_EXPECTED = 0x1;
        /// The bus must not launch the destination to deliver the call.
        const NO_AUTO_START = 0x2;
        /// The peer may prompt the user for authorization.
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

/// Ordered argument list of a method call.
///
/// This is the one place where arguments lose their static types: each
/// typed proxy method pushes its parameters here and the transport
/// marshals them as the message body.
#[derive(Debug, Default, PartialEq)]
pub struct CallArgs(Vec<Value<'static>>);

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one argument.
    pub fn push<V: Into<Value<'static>>>(mut self, value: V) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value<'static>> {
        self.0.get(index)
    }

    /// Concatenated D-Bus signature of all arguments.
    pub fn signature(&self) -> String {
        self.0
            .iter()
            .map(|v| v.value_signature().to_string())
            .collect()
    }

    pub fn into_values(self) -> Vec<Value<'static>> {
        self.0
    }
}

/// Reply to a method call.
///
/// Empty when the call was sent with [`CallFlags::NO_REPLY_EXPECTED`] or
/// answered by a transport that does not produce wire messages.
#[derive(Debug, Default)]
pub struct Reply(Option<zbus::Message>);

impl Reply {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn from_message(msg: zbus::Message) -> Self {
        Self(Some(msg))
    }

    pub fn message(&self) -> Option<&zbus::Message> {
        self.0.as_ref()
    }

    /// Decodes the reply body.
    ///
    /// # Errors
    ///
    /// `InvalidReply` if there is no reply message or the body does not
    /// match `T`.
    pub fn deserialize<T>(&self) -> Result<T, ProxyError>
    where
        T: serde::de::DeserializeOwned + zvariant::Type,
    {
        let msg = self
            .0
            .as_ref()
            .ok_or_else(|| ProxyError::InvalidReply("no reply message".into()))?;
        msg.body()
            .deserialize()
            .map_err(|e| ProxyError::InvalidReply(e.to_string()))
    }
}

/// Lifecycle state of a proxy and its bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Constructed; no transport opened yet.
    Unconnected,
    /// A transport has been opened.
    Connected,
    /// `close()` was called. Terminal.
    Closed,
}

impl Display for ProxyState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => write!(f, "unconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Interface name → property name → value, as carried by `InterfacesAdded`.
pub type InterfaceMap = HashMap<String, HashMap<String, OwnedValue>>;

/// Result of `GetManagedObjects`: object path → interfaces on that object.
pub type ManagedObjects = HashMap<OwnedObjectPath, InterfaceMap>;

/// A hierarchy change announced by a peer's object manager.
#[derive(Debug, PartialEq)]
pub enum ObjectManagerEvent {
    /// Interfaces (with their properties) appeared on an object.
    InterfacesAdded {
        object_path: OwnedObjectPath,
        interfaces: InterfaceMap,
    },
    /// Interfaces were removed from an object.
    InterfacesRemoved {
        object_path: OwnedObjectPath,
        interfaces: Vec<String>,
    },
}

impl ObjectManagerEvent {
    /// Path of the object the event is about.
    pub fn object_path(&self) -> &OwnedObjectPath {
        match self {
            Self::InterfacesAdded { object_path, .. } => object_path,
            Self::InterfacesRemoved { object_path, .. } => object_path,
        }
    }

    /// Returns `true` if the event mentions `iface`.
    pub fn concerns(&self, iface: &str) -> bool {
        match self {
            Self::InterfacesAdded { interfaces, .. } => interfaces.contains_key(iface),
            Self::InterfacesRemoved { interfaces, .. } => interfaces.iter().any(|i| i == iface),
        }
    }

    pub fn try_clone(&self) -> Result<Self, ProxyError> {
        Ok(match self {
            Self::InterfacesAdded {
                object_path,
                interfaces,
            } => {
                let mut cloned = InterfaceMap::with_capacity(interfaces.len());
                for (iface, props) in interfaces {
                    cloned.insert(iface.clone(), clone_properties(props)?);
                }
                Self::InterfacesAdded {
                    object_path: object_path.clone(),
                    interfaces: cloned,
                }
            }
            Self::InterfacesRemoved {
                object_path,
                interfaces,
            } => Self::InterfacesRemoved {
                object_path: object_path.clone(),
                interfaces: interfaces.clone(),
            },
        })
    }
}

/// Body of an `org.freedesktop.DBus.Properties.PropertiesChanged` signal.
#[derive(Debug, PartialEq)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: HashMap<String, OwnedValue>,
    pub invalidated: Vec<String>,
}

impl PropertiesChanged {
    pub fn try_clone(&self) -> Result<Self, ProxyError> {
        Ok(Self {
            interface: self.interface.clone(),
            changed: clone_properties(&self.changed)?,
            invalidated: self.invalidated.clone(),
        })
    }
}

pub(crate) fn clone_properties(
    props: &HashMap<String, OwnedValue>,
) -> Result<HashMap<String, OwnedValue>, ProxyError> {
    props
        .iter()
        .map(|(k, v)| Ok((k.clone(), v.try_clone()?)))
        .collect()
}

/// What a signal subscription should match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalSpec {
    /// `InterfacesAdded`/`InterfacesRemoved` from the object manager at the
    /// root of `service`.
    ObjectManager { service: String },
    /// `PropertiesChanged` emitted by `path` on `service`.
    PropertiesChanged {
        service: String,
        path: OwnedObjectPath,
    },
}

/// A signal delivered by a transport subscription.
#[derive(Debug, PartialEq)]
pub enum BusSignal {
    ObjectManager(ObjectManagerEvent),
    PropertiesChanged(PropertiesChanged),
}

impl BusSignal {
    pub fn try_clone(&self) -> Result<Self, ProxyError> {
        Ok(match self {
            Self::ObjectManager(ev) => Self::ObjectManager(ev.try_clone()?),
            Self::PropertiesChanged(ev) => Self::PropertiesChanged(ev.try_clone()?),
        })
    }
}

/// Errors BlueZ documents for profile operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluezError {
    Rejected,
    Canceled,
    InvalidArguments,
    AlreadyExists,
    DoesNotExist,
    NotSupported,
    NotAuthorized,
    Failed,
    /// Any other error name, kept verbatim.
    Other(String),
}

impl From<&str> for BluezError {
    fn from(name: &str) -> Self {
        match name {
            bluez_error::REJECTED => Self::Rejected,
            bluez_error::CANCELED => Self::Canceled,
            bluez_error::INVALID_ARGUMENTS => Self::InvalidArguments,
            bluez_error::ALREADY_EXISTS => Self::AlreadyExists,
            bluez_error::DOES_NOT_EXIST => Self::DoesNotExist,
            bluez_error::NOT_SUPPORTED => Self::NotSupported,
            bluez_error::NOT_AUTHORIZED => Self::NotAuthorized,
            bluez_error::FAILED => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Display for BluezError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected"),
            Self::Canceled => write!(f, "canceled"),
            Self::InvalidArguments => write!(f, "invalid arguments"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::DoesNotExist => write!(f, "does not exist"),
            Self::NotSupported => write!(f, "not supported"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::Failed => write!(f, "failed"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Errors returned by proxies and bus clients.
///
/// Transport failures and errors named by the peer are kept apart so that
/// callers can tell "BlueZ said no" from "the bus is gone".
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The connection is unusable, the call timed out or the bus is unreachable.
    #[error("transport error: {0}")]
    Transport(zbus::Error),

    /// The peer answered with a named D-Bus error.
    #[error("remote error {name}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Remote {
        name: String,
        message: Option<String>,
    },

    /// The operation is not allowed in the proxy's current state.
    #[error("invalid state: proxy is {0}")]
    InvalidState(ProxyState),

    /// An event channel closed because its bus subscription went away.
    #[error("signal subscription lost")]
    SubscriptionLost,

    /// A bus or interface name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// An object path failed validation.
    #[error("invalid object path: {0}")]
    InvalidPath(String),

    /// A value could not be converted or duplicated.
    #[error("variant error: {0}")]
    Variant(#[from] zvariant::Error),

    /// A reply did not have the expected shape.
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}

impl ProxyError {
    /// Builds a remote error from its name and optional message.
    pub fn remote(name: impl Into<String>, message: Option<String>) -> Self {
        Self::Remote {
            name: name.into(),
            message,
        }
    }

    /// Name of the remote error, if this is one.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            Self::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Classifies a remote error against the names BlueZ documents.
    pub fn bluez_error(&self) -> Option<BluezError> {
        self.remote_name().map(BluezError::from)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// Error replies synthesized by the bus daemon (no reply, unknown service)
// are transport failures even though they arrive as named errors.
impl From<zbus::Error> for ProxyError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, reply) => {
                if dbus_error::is_transport(name.as_str()) {
                    return Self::Transport(zbus::Error::MethodError(name, message, reply));
                }
                Self::Remote {
                    name: name.to_string(),
                    message,
                }
            }
            zbus::Error::FDO(fdo) => Self::from(*fdo),
            other => Self::Transport(other),
        }
    }
}

impl From<zbus::fdo::Error> for ProxyError {
    fn from(err: zbus::fdo::Error) -> Self {
        match err {
            zbus::fdo::Error::ZBus(inner) => Self::from(inner),
            other if dbus_error::is_transport(other.name().as_str()) => {
                Self::Transport(zbus::Error::FDO(Box::new(other)))
            }
            other => Self::Remote {
                name: other.name().to_string(),
                message: other.description().map(str::to_string),
            },
        }
    }
}
