//! The bus client bound to one remote object/interface pair.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::Mutex;
use zvariant::OwnedValue;

use crate::Result;
use crate::api::models::{
    CallArgs, CallFlags, ConnectionConfig, ManagedObjects, ProxyError, ProxyState, Reply,
    SignalSpec,
};
use crate::dbus::{BusTransport, Connector, SignalStream};

#[derive(Debug)]
enum ClientState {
    Unconnected,
    Connected(Arc<dyn BusTransport>),
    Closed,
}

/// Forwards calls and property access for one [`ConnectionConfig`].
///
/// The transport is opened on first use, so building a client never
/// touches the bus and an unreachable peer only shows up on the first
/// call. Once [`disconnect`](Self::disconnect) has run, every operation
/// fails with [`ProxyError::InvalidState`].
#[derive(Debug)]
pub struct Client {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ClientState>,
}

impl Client {
    /// Binds a client to `config`. `connector` opens the transport on the
    /// first call.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            state: Mutex::new(ClientState::Unconnected),
        }
    }

    /// Service, interface, path and bus this client talks to.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn state(&self) -> ProxyState {
        match &*self.state.lock().await {
            ClientState::Unconnected => ProxyState::Unconnected,
            ClientState::Connected(_) => ProxyState::Connected,
            ClientState::Closed => ProxyState::Closed,
        }
    }

    /// Returns the open transport, connecting first if needed.
    ///
    /// # Errors
    ///
    /// `InvalidState` after disconnect; whatever the connector reports if
    /// the bus cannot be reached.
    pub async fn transport(&self) -> Result<Arc<dyn BusTransport>> {
        let mut state = self.state.lock().await;
        match &*state {
            ClientState::Connected(transport) => Ok(Arc::clone(transport)),
            ClientState::Closed => Err(ProxyError::InvalidState(ProxyState::Closed)),
            ClientState::Unconnected => {
                let transport = self.connector.connect(self.config.bus()).await?;
                debug!(
                    "Connected client for {} on {} ({})",
                    self.config.interface(),
                    self.config.path().as_str(),
                    transport.id()
                );
                *state = ClientState::Connected(Arc::clone(&transport));
                Ok(transport)
            }
        }
    }

    /// Identity of the underlying connection, connecting first if needed.
    pub async fn connection_id(&self) -> Result<String> {
        Ok(self.transport().await?.id())
    }

    /// Calls `method` on the bound interface.
    ///
    /// Sends exactly one request. Named peer errors come back as
    /// [`ProxyError::Remote`] with the name untouched.
    pub async fn call(&self, method: &str, flags: CallFlags, args: CallArgs) -> Result<Reply> {
        let transport = self.transport().await?;
        transport.call(&self.config, method, flags, args).await
    }

    /// Reads one property of the bound interface with `Properties.Get`.
    pub async fn get_property(&self, name: &str) -> Result<OwnedValue> {
        let transport = self.transport().await?;
        transport.get_property(&self.config, name).await
    }

    /// Writes one property of the bound interface with `Properties.Set`.
    pub async fn set_property(&self, name: &str, value: OwnedValue) -> Result<()> {
        let transport = self.transport().await?;
        transport.set_property(&self.config, name, value).await
    }

    /// Reads every property of the bound interface with `Properties.GetAll`.
    pub async fn get_all_properties(&self) -> Result<HashMap<String, OwnedValue>> {
        let transport = self.transport().await?;
        transport.get_all_properties(&self.config).await
    }

    /// Fetches the whole object tree managed by the peer.
    pub async fn managed_objects(&self) -> Result<ManagedObjects> {
        let transport = self.transport().await?;
        transport.get_managed_objects(self.config.name()).await
    }

    /// Opens a signal stream matching `spec`. The stream ends if the
    /// connection goes away.
    pub async fn subscribe(&self, spec: SignalSpec) -> Result<SignalStream> {
        let transport = self.transport().await?;
        transport.subscribe(spec).await
    }

    /// Releases the connection. Later calls fail with `InvalidState`.
    ///
    /// Calling this more than once is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, ClientState::Closed);
        match previous {
            ClientState::Connected(transport) => {
                debug!(
                    "Disconnecting client for {} on {}",
                    self.config.interface(),
                    self.config.path().as_str()
                );
                transport.disconnect().await
            }
            ClientState::Unconnected | ClientState::Closed => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::BusKind;
    use crate::dbus::mock::MockBus;
    use crate::types::constants::interface;

    fn client(bus: &Arc<MockBus>) -> Client {
        let config =
            ConnectionConfig::new("org.bluez", interface::PROFILE1, "/p", BusKind::System).unwrap();
        Client::new(config, bus.connector())
    }

    #[tokio::test]
    async fn connects_lazily() {
        let bus = MockBus::new();
        let client = client(&bus);
        assert_eq!(client.state().await, ProxyState::Unconnected);
        assert_eq!(bus.connects(), 0);

        client
            .call("Release", CallFlags::empty(), CallArgs::new())
            .await
            .unwrap();
        assert_eq!(client.state().await, ProxyState::Connected);

        client
            .call("Release", CallFlags::empty(), CallArgs::new())
            .await
            .unwrap();
        assert_eq!(bus.connects(), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_surfaces_on_first_call() {
        let bus = MockBus::new();
        bus.set_unreachable(true);
        let client = client(&bus);

        let err = client
            .call("Release", CallFlags::empty(), CallArgs::new())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(client.state().await, ProxyState::Unconnected);
    }

    #[tokio::test]
    async fn closed_client_rejects_calls() {
        let bus = MockBus::new();
        let client = client(&bus);
        client.connection_id().await.unwrap();

        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert_eq!(bus.disconnects(), 1);

        let err = client
            .call("Release", CallFlags::empty(), CallArgs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidState(ProxyState::Closed)));
        assert_eq!(bus.call_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_without_connecting() {
        let bus = MockBus::new();
        let client = client(&bus);
        client.disconnect().await.unwrap();
        assert_eq!(client.state().await, ProxyState::Closed);
        assert_eq!(bus.disconnects(), 0);
    }
}
