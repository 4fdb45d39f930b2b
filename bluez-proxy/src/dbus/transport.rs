//! The boundary between the proxy core and a concrete message bus.
//!
//! The core only ever talks to a [`BusTransport`]. Anything that can place
//! a method call, read and write properties and stream signals can stand
//! in for the real system bus.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use zvariant::OwnedValue;

use crate::Result;
use crate::api::models::{
    BusKind, BusSignal, CallArgs, CallFlags, ConnectionConfig, ManagedObjects, Reply, SignalSpec,
};

/// Stream of signals produced by one subscription.
///
/// Dropping the stream cancels the subscription. The stream ending on its
/// own means the subscription was lost.
pub type SignalStream = BoxStream<'static, BusSignal>;

/// An open connection to a message bus.
#[async_trait]
pub trait BusTransport: Send + Sync + Debug {
    /// Identity of the underlying connection.
    ///
    /// Two transports sharing one bus connection return the same id.
    fn id(&self) -> String;

    /// Sends one method call to `target` and waits for the reply.
    ///
    /// Exactly one request is sent; nothing is retried.
    async fn call(
        &self,
        target: &ConnectionConfig,
        method: &str,
        flags: CallFlags,
        args: CallArgs,
    ) -> Result<Reply>;

    /// Reads one property of `target`'s interface.
    async fn get_property(&self, target: &ConnectionConfig, name: &str) -> Result<OwnedValue>;

    /// Writes one property of `target`'s interface.
    async fn set_property(
        &self,
        target: &ConnectionConfig,
        name: &str,
        value: OwnedValue,
    ) -> Result<()>;

    /// Reads all properties of `target`'s interface.
    async fn get_all_properties(
        &self,
        target: &ConnectionConfig,
    ) -> Result<HashMap<String, OwnedValue>>;

    /// Calls `GetManagedObjects` on the object manager at the root of `service`.
    async fn get_managed_objects(&self, service: &str) -> Result<ManagedObjects>;

    /// Starts a signal subscription.
    async fn subscribe(&self, spec: SignalSpec) -> Result<SignalStream>;

    /// Releases this handle on the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// Opens transports for a given bus.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self, bus: BusKind) -> Result<Arc<dyn BusTransport>>;
}
