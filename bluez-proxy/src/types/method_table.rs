//! Method tables for the remote interfaces this crate proxies.
//!
//! Each remote interface is described once as a fixed table of methods:
//! the member name, the D-Bus argument signature and the error names the
//! peer documents for it. The typed proxies in [`crate::api`] are written
//! against these tables, and callers can use them to check whether a
//! remote error was part of a method's contract.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::types::constants::{bluez_error, interface};

/// Describes one method of a remote interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    /// Member name as sent on the bus.
    pub name: &'static str,
    /// D-Bus signature of the input arguments, without enclosing parens.
    pub signature: &'static str,
    /// Error names the peer may return from this method.
    pub errors: &'static [&'static str],
}

impl MethodSpec {
    /// Returns `true` if `error_name` is one of the documented errors.
    pub fn declares(&self, error_name: &str) -> bool {
        self.errors.contains(&error_name)
    }
}

/// Describes a remote interface and its method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub name: &'static str,
    pub methods: &'static [MethodSpec],
}

impl InterfaceSpec {
    /// Looks up a method by member name.
    pub fn method(&self, name: &str) -> Option<&'static MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }
}

const PROFILE_ERRORS: &[&str] = &[bluez_error::REJECTED, bluez_error::CANCELED];

/// `org.bluez.Profile1`, implemented by the application and called by BlueZ.
pub const PROFILE1: InterfaceSpec = InterfaceSpec {
    name: interface::PROFILE1,
    methods: &[
        MethodSpec {
            name: "Release",
            signature: "",
            errors: &[],
        },
        MethodSpec {
            name: "NewConnection",
            signature: "oia{sv}",
            errors: PROFILE_ERRORS,
        },
        MethodSpec {
            name: "RequestDisconnection",
            signature: "o",
            errors: PROFILE_ERRORS,
        },
    ],
};

/// `org.bluez.ProfileManager1`, exported by BlueZ at `/org/bluez`.
pub const PROFILE_MANAGER1: InterfaceSpec = InterfaceSpec {
    name: interface::PROFILE_MANAGER1,
    methods: &[
        MethodSpec {
            name: "RegisterProfile",
            signature: "osa{sv}",
            errors: &[bluez_error::INVALID_ARGUMENTS, bluez_error::ALREADY_EXISTS],
        },
        MethodSpec {
            name: "UnregisterProfile",
            signature: "o",
            errors: &[bluez_error::DOES_NOT_EXIST],
        },
    ],
};

static INTERFACE_REGISTRY: OnceLock<HashMap<&'static str, InterfaceSpec>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, InterfaceSpec> {
    INTERFACE_REGISTRY.get_or_init(|| {
        [PROFILE1, PROFILE_MANAGER1]
            .into_iter()
            .map(|spec| (spec.name, spec))
            .collect()
    })
}

/// Looks up the method table of a known interface.
///
/// Returns `None` for interfaces this crate has no table for.
pub fn interface_spec(name: &str) -> Option<&'static InterfaceSpec> {
    registry().get(name)
}

/// Looks up a single method of a known interface.
pub fn method_spec(interface: &str, method: &str) -> Option<&'static MethodSpec> {
    interface_spec(interface).and_then(|spec| spec.method(method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile1_lists_all_methods() {
        let names: Vec<_> = PROFILE1.methods.iter().map(|m| m.name).collect();
        assert_eq!(names, ["Release", "NewConnection", "RequestDisconnection"]);
    }

    #[test]
    fn lookup_by_interface_and_member() {
        let m = method_spec(interface::PROFILE1, "NewConnection").unwrap();
        assert_eq!(m.signature, "oia{sv}");
        assert!(m.declares(bluez_error::REJECTED));
        assert!(m.declares(bluez_error::CANCELED));
        assert!(!m.declares(bluez_error::FAILED));
    }

    #[test]
    fn release_declares_no_errors() {
        let m = method_spec(interface::PROFILE1, "Release").unwrap();
        assert!(m.errors.is_empty());
        assert!(m.signature.is_empty());
    }

    #[test]
    fn unknown_lookups_return_none() {
        assert!(interface_spec("org.bluez.Adapter1").is_none());
        assert!(method_spec(interface::PROFILE1, "Connect").is_none());
    }

    #[test]
    fn profile_manager_table() {
        let spec = interface_spec(interface::PROFILE_MANAGER1).unwrap();
        assert_eq!(spec.methods.len(), 2);
        assert!(
            spec.method("RegisterProfile")
                .unwrap()
                .declares(bluez_error::ALREADY_EXISTS)
        );
    }
}
