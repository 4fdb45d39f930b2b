//! Proxy for `org.bluez.Profile1`.
//!
//! BlueZ calls this interface on the object an application registered with
//! [`ProfileManager1::register_profile`](crate::ProfileManager1::register_profile).
//! The proxy is the calling side of that contract: it is what a test
//! harness or a bridging service uses to drive a profile implementation
//! over the bus.

use std::collections::HashMap;
use std::sync::Arc;

use zvariant::{OwnedObjectPath, OwnedValue};

use crate::Result;
use crate::api::models::{CallArgs, ManagedObjects, ProxyState};
use crate::core::client::Client;
use crate::core::object_manager::ObjectManagerSignal;
use crate::core::properties::PropertyCache;
use crate::core::proxy::{CancelSignal, ObjectProxy, ProxyBuilder, RemoteInterface};
use crate::types::method_table::{self, InterfaceSpec, MethodSpec};
use crate::util::utils::options_dict;

/// Typed handle on a remote `org.bluez.Profile1` object.
///
/// # Example
///
/// ```no_run
/// use std::collections::HashMap;
/// use bluez_proxy::Profile1;
/// use zvariant::OwnedObjectPath;
///
/// # async fn example() -> bluez_proxy::Result<()> {
/// let profile = Profile1::new("org.example.Headset", "/org/example/profile")?;
/// let device = OwnedObjectPath::try_from("/org/bluez/hci0/dev_00_11_22_33_44_55")?;
///
/// match profile.new_connection(device, 7, HashMap::new()).await {
///     Ok(()) => println!("connection accepted"),
///     Err(e) if e.remote_name() == Some("org.bluez.Error.Rejected") => {
///         println!("profile rejected the connection")
///     }
///     Err(e) => return Err(e),
/// }
/// profile.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Profile1 {
    proxy: ObjectProxy,
}

impl RemoteInterface for Profile1 {
    const SPEC: InterfaceSpec = method_table::PROFILE1;

    fn from_proxy(proxy: ObjectProxy) -> Self {
        Self { proxy }
    }

    fn proxy(&self) -> &ObjectProxy {
        &self.proxy
    }
}

impl Profile1 {
    /// `Release`, `NewConnection` and `RequestDisconnection`.
    pub const METHODS: &'static [MethodSpec] = method_table::PROFILE1.methods;

    /// Binds a proxy to `object_path` on `service_name` over the system bus.
    ///
    /// No connection is opened until the first call.
    ///
    /// # Errors
    ///
    /// `InvalidName` or `InvalidPath` for malformed input.
    pub fn new(service_name: &str, object_path: &str) -> Result<Self> {
        Self::builder(service_name, object_path).build()
    }

    /// Builder for a proxy on another bus, connector or registry.
    pub fn builder(service_name: &str, object_path: &str) -> ProxyBuilder<Self> {
        ProxyBuilder::new(service_name, object_path)
    }

    /// Object path of the remote profile.
    pub fn path(&self) -> &OwnedObjectPath {
        self.proxy.path()
    }

    /// Always `org.bluez.Profile1`.
    pub fn interface(&self) -> &str {
        self.proxy.interface()
    }

    /// The underlying client, for calls this type does not wrap.
    pub fn client(&self) -> &Client {
        self.proxy.client()
    }

    /// Whether the proxy is unconnected, connected or closed.
    pub async fn state(&self) -> ProxyState {
        self.proxy.state().await
    }

    /// Cached property values. Filled by
    /// [`refresh_properties`](Self::refresh_properties), property reads and
    /// [`watch_properties`](Self::watch_properties).
    pub fn properties(&self) -> &Arc<PropertyCache> {
        self.proxy.properties()
    }

    /// See [`ObjectProxy::refresh_properties`].
    pub async fn refresh_properties(&self) -> Result<()> {
        self.proxy.refresh_properties().await
    }

    /// See [`ObjectProxy::get_property`].
    pub async fn get_property(&self, name: &str) -> Result<OwnedValue> {
        self.proxy.get_property(name).await
    }

    /// See [`ObjectProxy::set_property`].
    pub async fn set_property(&self, name: &str, value: OwnedValue) -> Result<()> {
        self.proxy.set_property(name, value).await
    }

    /// See [`ObjectProxy::watch_properties`].
    pub async fn watch_properties(&self) -> Result<()> {
        self.proxy.watch_properties().await
    }

    /// See [`ObjectProxy::managed_objects`].
    pub async fn managed_objects(&self) -> Result<ManagedObjects> {
        self.proxy.managed_objects().await
    }

    /// See [`ObjectProxy::get_object_manager_signal`].
    pub async fn get_object_manager_signal(&self) -> Result<(ObjectManagerSignal, CancelSignal)> {
        self.proxy.get_object_manager_signal().await
    }

    /// See [`ObjectProxy::close`]. Independent of any remote `Release`.
    pub async fn close(&self) -> Result<()> {
        self.proxy.close().await
    }

    /// Tells the profile it has been unregistered.
    ///
    /// The profile can clean up here; BlueZ has already dropped it.
    pub async fn release(&self) -> Result<()> {
        self.proxy.call("Release", CallArgs::new()).await?;
        Ok(())
    }

    /// Hands a new connection on `device` to the profile.
    ///
    /// `fd` is the connected socket; `fd_properties` carries the optional
    /// `Version` and `Features` entries.
    ///
    /// # Errors
    ///
    /// `org.bluez.Error.Rejected` or `org.bluez.Error.Canceled` as
    /// [`ProxyError::Remote`](crate::ProxyError::Remote).
    pub async fn new_connection(
        &self,
        device: OwnedObjectPath,
        fd: i32,
        fd_properties: HashMap<String, OwnedValue>,
    ) -> Result<()> {
        let args = CallArgs::new()
            .push(device.into_inner())
            .push(fd)
            .push(options_dict(fd_properties));
        self.proxy.call("NewConnection", args).await?;
        Ok(())
    }

    /// Asks the profile to disconnect from `device`.
    ///
    /// # Errors
    ///
    /// `org.bluez.Error.Rejected` or `org.bluez.Error.Canceled` as
    /// [`ProxyError::Remote`](crate::ProxyError::Remote).
    pub async fn request_disconnection(&self, device: OwnedObjectPath) -> Result<()> {
        let args = CallArgs::new().push(device.into_inner());
        self.proxy.call("RequestDisconnection", args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProxyError;
    use crate::api::models::BluezError;
    use crate::dbus::mock::MockBus;
    use crate::types::constants::{bluez_error, interface};
    use crate::util::utils::owned_value;

    const DEVICE: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";

    fn profile(bus: &Arc<MockBus>) -> Profile1 {
        Profile1::builder("org.bluez", "/org/bluez/profile/0")
            .connector(bus.connector())
            .build()
            .unwrap()
    }

    fn device() -> OwnedObjectPath {
        OwnedObjectPath::try_from(DEVICE).unwrap()
    }

    #[test]
    fn binds_to_profile_interface() {
        let profile = Profile1::new("org.bluez", "/org/bluez/profile/0").unwrap();
        assert_eq!(profile.interface(), interface::PROFILE1);
        assert_eq!(profile.path().as_str(), "/org/bluez/profile/0");
        assert!(Profile1::new("org.bluez", "").is_err());
        assert!(Profile1::new("", "/p").is_err());
    }

    #[tokio::test]
    async fn new_connection_marshals_table_signature() {
        let bus = MockBus::new();
        let profile = profile(&bus);
        let mut props = HashMap::new();
        props.insert("Version".to_string(), owned_value(0x0102u16).unwrap());

        profile.new_connection(device(), 7, props).await.unwrap();

        let calls = bus.take_calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.method, "NewConnection");
        assert_eq!(call.interface, interface::PROFILE1);
        assert_eq!(call.path.as_str(), "/org/bluez/profile/0");
        let spec = Profile1::SPEC.method("NewConnection").unwrap();
        assert_eq!(call.args.signature(), spec.signature);
    }

    #[tokio::test]
    async fn rejection_surfaces_verbatim() {
        let bus = MockBus::new();
        bus.fail_method("RequestDisconnection", bluez_error::REJECTED);
        let profile = profile(&bus);

        let err = profile.request_disconnection(device()).await.unwrap_err();
        assert_eq!(err.remote_name(), Some(bluez_error::REJECTED));
        assert_eq!(err.bluez_error(), Some(BluezError::Rejected));
        assert!(
            Profile1::SPEC
                .method("RequestDisconnection")
                .unwrap()
                .declares(bluez_error::REJECTED)
        );
        assert_eq!(bus.call_count(), 1);
    }

    #[tokio::test]
    async fn release_sends_no_arguments() {
        let bus = MockBus::new();
        let profile = profile(&bus);
        profile.release().await.unwrap();

        let calls = bus.take_calls();
        assert_eq!(calls[0].method, "Release");
        assert!(calls[0].args.is_empty());
    }

    #[tokio::test]
    async fn calls_after_close_fail() {
        let bus = MockBus::new();
        let profile = profile(&bus);
        profile.release().await.unwrap();
        profile.close().await.unwrap();

        let err = profile.release().await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidState(ProxyState::Closed)));
        assert_eq!(profile.state().await, ProxyState::Closed);
    }

    #[tokio::test]
    async fn properties_without_reaching_for_the_proxy() {
        let bus = MockBus::new();
        let profile = profile(&bus);
        bus.insert_property(
            "/org/bluez/profile/0",
            interface::PROFILE1,
            "Version",
            owned_value(0x0105u16).unwrap(),
        );

        profile.refresh_properties().await.unwrap();
        assert_eq!(profile.properties().get_as::<u16>("Version").await, Some(0x0105));
        let version = profile.get_property("Version").await.unwrap();
        assert_eq!(u16::try_from(version).unwrap(), 0x0105);

        profile
            .set_property("Version", owned_value(0x0106u16).unwrap())
            .await
            .unwrap();
        let remote = bus
            .property("/org/bluez/profile/0", interface::PROFILE1, "Version")
            .unwrap();
        assert_eq!(u16::try_from(remote).unwrap(), 0x0106);

        profile.watch_properties().await.unwrap();
        assert_eq!(bus.subscribe_calls(), 1);
        assert!(profile.managed_objects().await.unwrap().is_empty());
        profile.close().await.unwrap();
    }

    #[test]
    fn methods_table_matches_interface() {
        let names: Vec<_> = Profile1::METHODS.iter().map(|m| m.name).collect();
        assert_eq!(names, ["Release", "NewConnection", "RequestDisconnection"]);
    }
}
