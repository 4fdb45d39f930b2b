//! Constants for the BlueZ and freedesktop D-Bus interfaces.
//!
//! Interface names, well-known paths and the error names BlueZ returns
//! from profile methods.

/// Well-known bus names.
pub mod service {
    pub const BLUEZ: &str = "org.bluez";
}

/// D-Bus interface names.
pub mod interface {
    pub const PROFILE1: &str = "org.bluez.Profile1";
    pub const PROFILE_MANAGER1: &str = "org.bluez.ProfileManager1";
    pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
}

/// Well-known object paths.
pub mod path {
    /// Root of the BlueZ object tree, where its object manager lives.
    pub const ROOT: &str = "/";
    /// Object exporting `org.bluez.ProfileManager1`.
    pub const BLUEZ: &str = "/org/bluez";
}

/// Error names returned by BlueZ method calls.
pub mod bluez_error {
    pub const REJECTED: &str = "org.bluez.Error.Rejected";
    pub const CANCELED: &str = "org.bluez.Error.Canceled";
    pub const INVALID_ARGUMENTS: &str = "org.bluez.Error.InvalidArguments";
    pub const ALREADY_EXISTS: &str = "org.bluez.Error.AlreadyExists";
    pub const DOES_NOT_EXIST: &str = "org.bluez.Error.DoesNotExist";
    pub const NOT_SUPPORTED: &str = "org.bluez.Error.NotSupported";
    pub const NOT_AUTHORIZED: &str = "org.bluez.Error.NotAuthorized";
    pub const FAILED: &str = "org.bluez.Error.Failed";
}

/// Errors the message bus daemon or the local library reports on behalf of
/// a peer. They describe the transport, not an answer from the peer.
pub mod dbus_error {
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
    pub const TIMED_OUT: &str = "org.freedesktop.DBus.Error.TimedOut";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    pub const NO_SERVER: &str = "org.freedesktop.DBus.Error.NoServer";
    pub const NO_NETWORK: &str = "org.freedesktop.DBus.Error.NoNetwork";
    pub const NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    pub const ADDRESS_IN_USE: &str = "org.freedesktop.DBus.Error.AddressInUse";
    pub const BAD_ADDRESS: &str = "org.freedesktop.DBus.Error.BadAddress";
    pub const IO_ERROR: &str = "org.freedesktop.DBus.Error.IOError";
    pub const SPAWN_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.Failed";

    pub const ALL: &[&str] = &[
        NO_REPLY,
        TIMEOUT,
        TIMED_OUT,
        SERVICE_UNKNOWN,
        NAME_HAS_NO_OWNER,
        DISCONNECTED,
        NO_SERVER,
        NO_NETWORK,
        NO_MEMORY,
        LIMITS_EXCEEDED,
        ADDRESS_IN_USE,
        BAD_ADDRESS,
        IO_ERROR,
        SPAWN_FAILED,
    ];

    /// Whether `name` is one of the bus-side errors above.
    pub fn is_transport(name: &str) -> bool {
        ALL.contains(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bluez_errors_share_namespace() {
        for name in [
            bluez_error::REJECTED,
            bluez_error::CANCELED,
            bluez_error::INVALID_ARGUMENTS,
            bluez_error::ALREADY_EXISTS,
            bluez_error::DOES_NOT_EXIST,
            bluez_error::NOT_SUPPORTED,
            bluez_error::NOT_AUTHORIZED,
            bluez_error::FAILED,
        ] {
            assert!(name.starts_with("org.bluez.Error."), "{name}");
        }
    }

    #[test]
    fn bus_errors_are_not_bluez_errors() {
        for name in dbus_error::ALL {
            assert!(name.starts_with("org.freedesktop.DBus.Error."), "{name}");
            assert!(dbus_error::is_transport(name));
        }
        assert!(!dbus_error::is_transport(bluez_error::REJECTED));
        assert!(!dbus_error::is_transport(
            "org.freedesktop.DBus.Error.UnknownMethod"
        ));
    }

    #[test]
    fn profile_interfaces_live_under_bluez() {
        assert!(interface::PROFILE1.starts_with(service::BLUEZ));
        assert!(interface::PROFILE_MANAGER1.starts_with(service::BLUEZ));
    }
}
