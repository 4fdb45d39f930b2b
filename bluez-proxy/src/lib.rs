//! Typed proxies for BlueZ profile objects over D-Bus.
//!
//! Each proxy stands for one remote object implementing one interface and
//! offers:
//!
//! - Typed method calls forwarded over the bus
//! - A lockable cache of the object's properties, kept in sync from
//!   `PropertiesChanged`
//! - Object-tree discovery through `org.freedesktop.DBus.ObjectManager`,
//!   with one shared subscription per connection and peer
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use bluez_proxy::Profile1;
//! use zvariant::OwnedObjectPath;
//!
//! # async fn example() -> bluez_proxy::Result<()> {
//! let profile = Profile1::new("org.example.Headset", "/org/example/profile")?;
//!
//! let (events, cancel) = profile.get_object_manager_signal().await?;
//! tokio::spawn(async move {
//!     while let Ok(Some(event)) = events.recv().await {
//!         println!("{} changed", event.object_path().as_str());
//!     }
//! });
//!
//! let device = OwnedObjectPath::try_from("/org/bluez/hci0/dev_00_11_22_33_44_55")?;
//! profile.request_disconnection(device).await?;
//!
//! cancel.cancel().await;
//! profile.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! All operations return `Result<T, ProxyError>`. Errors named by the peer,
//! such as `org.bluez.Error.Rejected`, arrive as [`ProxyError::Remote`]
//! with the name untouched, so they can be told apart from transport
//! failures.
//!
//! # Testing
//!
//! [`dbus::mock::MockBus`] is an in-memory transport. Pass its connector
//! to a proxy builder to exercise code without a bus daemon.
//!
//! # Logging
//!
//! This crate uses the [`log`](https://docs.rs/log) facade for logging. To see
//! log output, add a logging implementation like `env_logger`.

pub mod api;
pub mod core;
pub mod dbus;
pub mod types;
mod util;

pub use api::models::{
    BluezError, BusKind, CallArgs, CallFlags, ConnectionConfig, ManagedObjects,
    ObjectManagerEvent, PropertiesChanged, ProxyError, ProxyState, Reply,
};
pub use api::profile::Profile1;
pub use api::profile_manager::ProfileManager1;
pub use crate::core::object_manager::{ObjectManagerRegistry, ObjectManagerSignal, SubscriptionKey};
pub use crate::core::properties::{PropertyCache, PropertyMap};
pub use crate::core::proxy::{CancelSignal, ObjectProxy, ProxyBuilder, RemoteInterface};
pub use util::utils::owned_value;

/// A specialized `Result` type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
