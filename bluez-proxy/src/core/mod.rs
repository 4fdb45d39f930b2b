//! Core proxy machinery.
//!
//! The bus client, the property cache, the object-manager registry and the
//! generic [`ObjectProxy`](proxy::ObjectProxy) that ties them together.
//! Typed interface proxies in [`crate::api`] are thin wrappers around it.

pub mod client;
pub mod object_manager;
pub mod properties;
pub mod proxy;
