//! Bus transports.
//!
//! [`BusTransport`] and [`Connector`] are the only things the proxy core
//! knows about the message bus. [`ZbusConnector`] talks to the real system
//! or session bus through `zbus`; [`mock`] is an in-memory stand-in used by
//! the test suite.

pub mod mock;
mod transport;
mod zbus_bus;

pub use transport::{BusTransport, Connector, SignalStream};
pub use zbus_bus::{ZbusConnector, ZbusTransport};
