//! Proxy for `org.bluez.ProfileManager1`, exported by BlueZ at `/org/bluez`.

use std::collections::HashMap;

use zvariant::{OwnedObjectPath, OwnedValue};

use crate::Result;
use crate::api::models::{CallArgs, ProxyState};
use crate::core::client::Client;
use crate::core::proxy::{ObjectProxy, ProxyBuilder, RemoteInterface};
use crate::types::constants::{path, service};
use crate::types::method_table::{self, InterfaceSpec, MethodSpec};
use crate::util::utils::options_dict;

/// Registers and unregisters profile implementations with BlueZ.
///
/// # Example
///
/// ```no_run
/// use std::collections::HashMap;
/// use bluez_proxy::{ProfileManager1, owned_value};
/// use zvariant::OwnedObjectPath;
///
/// # async fn example() -> bluez_proxy::Result<()> {
/// let manager = ProfileManager1::new()?;
/// let profile = OwnedObjectPath::try_from("/org/example/profile")?;
///
/// let mut options = HashMap::new();
/// if let Some(name) = owned_value("Serial Port") {
///     options.insert("Name".to_string(), name);
/// }
/// manager
///     .register_profile(profile.clone(), "00001101-0000-1000-8000-00805f9b34fb", options)
///     .await?;
/// manager.unregister_profile(profile).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProfileManager1 {
    proxy: ObjectProxy,
}

impl RemoteInterface for ProfileManager1 {
    const SPEC: InterfaceSpec = method_table::PROFILE_MANAGER1;

    fn from_proxy(proxy: ObjectProxy) -> Self {
        Self { proxy }
    }

    fn proxy(&self) -> &ObjectProxy {
        &self.proxy
    }
}

impl ProfileManager1 {
    /// `RegisterProfile` and `UnregisterProfile`.
    pub const METHODS: &'static [MethodSpec] = method_table::PROFILE_MANAGER1.methods;

    /// Binds to the BlueZ daemon on the system bus.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Builder bound to `org.bluez` at `/org/bluez`.
    pub fn builder() -> ProxyBuilder<Self> {
        ProxyBuilder::new(service::BLUEZ, path::BLUEZ)
    }

    pub fn path(&self) -> &OwnedObjectPath {
        self.proxy.path()
    }

    pub fn interface(&self) -> &str {
        self.proxy.interface()
    }

    pub fn client(&self) -> &Client {
        self.proxy.client()
    }

    pub async fn state(&self) -> ProxyState {
        self.proxy.state().await
    }

    pub async fn close(&self) -> Result<()> {
        self.proxy.close().await
    }

    /// Registers the `Profile1` object at `profile` for `uuid`.
    ///
    /// # Errors
    ///
    /// `org.bluez.Error.InvalidArguments` or
    /// `org.bluez.Error.AlreadyExists` as a remote error.
    pub async fn register_profile(
        &self,
        profile: OwnedObjectPath,
        uuid: &str,
        options: HashMap<String, OwnedValue>,
    ) -> Result<()> {
        let args = CallArgs::new()
            .push(profile.into_inner())
            .push(uuid.to_string())
            .push(options_dict(options));
        self.proxy.call("RegisterProfile", args).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// `org.bluez.Error.DoesNotExist` if nothing is registered at `profile`.
    pub async fn unregister_profile(&self, profile: OwnedObjectPath) -> Result<()> {
        let args = CallArgs::new().push(profile.into_inner());
        self.proxy.call("UnregisterProfile", args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbus::mock::MockBus;
    use crate::types::constants::{bluez_error, interface};
    use crate::util::utils::owned_value;

    const SPP: &str = "00001101-0000-1000-8000-00805f9b34fb";

    #[tokio::test]
    async fn register_profile_targets_bluez_root() {
        let bus = MockBus::new();
        let manager = ProfileManager1::builder()
            .connector(bus.connector())
            .build()
            .unwrap();

        let mut options = HashMap::new();
        options.insert("Name".to_string(), owned_value("Serial").unwrap());
        let profile = OwnedObjectPath::try_from("/org/example/spp").unwrap();
        manager
            .register_profile(profile, SPP, options)
            .await
            .unwrap();

        let calls = bus.take_calls();
        assert_eq!(calls[0].service, service::BLUEZ);
        assert_eq!(calls[0].path.as_str(), path::BLUEZ);
        assert_eq!(calls[0].interface, interface::PROFILE_MANAGER1);
        assert_eq!(
            calls[0].args.signature(),
            ProfileManager1::SPEC.method("RegisterProfile").unwrap().signature
        );
    }

    #[tokio::test]
    async fn unregister_unknown_profile() {
        let bus = MockBus::new();
        bus.fail_method("UnregisterProfile", bluez_error::DOES_NOT_EXIST);
        let manager = ProfileManager1::builder()
            .connector(bus.connector())
            .build()
            .unwrap();

        let err = manager
            .unregister_profile(OwnedObjectPath::try_from("/nope").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.remote_name(), Some(bluez_error::DOES_NOT_EXIST));
        assert!(ProfileManager1::METHODS[1].declares(bluez_error::DOES_NOT_EXIST));
    }
}
