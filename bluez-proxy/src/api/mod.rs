//! Public API module.
//!
//! Shared models and the typed proxies for the BlueZ profile interfaces.

pub mod models;
pub mod profile;
pub mod profile_manager;
