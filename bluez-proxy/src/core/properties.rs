//! Cached view of a remote interface's properties.
//!
//! The values live in a plain [`PropertyMap`] that can be serialized and
//! compared; the lock lives in [`PropertyCache`] around it. Scoped access
//! through [`PropertyCache::read`] and [`PropertyCache::write`] replaces
//! explicit lock/unlock pairs: a reader that needs several fields to agree
//! holds one read guard for the whole read, and every update coming from a
//! `PropertiesChanged` signal is applied under one write guard.

use std::collections::HashMap;
use std::collections::hash_map::Iter;

use log::debug;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zvariant::OwnedValue;

use crate::api::models::PropertiesChanged;

/// Property name → last observed value.
#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PropertyMap(HashMap<String, OwnedValue>);

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&OwnedValue> {
        self.0.get(name)
    }

    /// Returns a copy of `name` converted to `T`.
    ///
    /// `None` if the property is missing or has another type.
    pub fn get_as<T>(&self, name: &str) -> Option<T>
    where
        T: TryFrom<OwnedValue>,
    {
        let value = self.0.get(name)?.try_clone().ok()?;
        T::try_from(value).ok()
    }

    /// Stores `value`, returning the previous one.
    pub fn set(&mut self, name: impl Into<String>, value: OwnedValue) -> Option<OwnedValue> {
        self.0.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<OwnedValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, OwnedValue> {
        self.0.iter()
    }
}

impl From<HashMap<String, OwnedValue>> for PropertyMap {
    fn from(map: HashMap<String, OwnedValue>) -> Self {
        Self(map)
    }
}

/// Lockable property snapshot owned by one proxy.
///
/// Any number of readers may hold [`read`](Self::read) guards at once;
/// [`write`](Self::write) is exclusive. The cache is only as fresh as the
/// last signal or explicit fetch.
#[derive(Debug, Default)]
pub struct PropertyCache {
    values: RwLock<PropertyMap>,
}

impl PropertyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for a consistent multi-field read.
    pub async fn read(&self) -> RwLockReadGuard<'_, PropertyMap> {
        self.values.read().await
    }

    /// Exclusive access for a multi-field update.
    pub async fn write(&self) -> RwLockWriteGuard<'_, PropertyMap> {
        self.values.write().await
    }

    /// Returns a copy of the cached value of `name`.
    pub async fn get(&self, name: &str) -> Option<OwnedValue> {
        self.read().await.get(name)?.try_clone().ok()
    }

    pub async fn get_as<T>(&self, name: &str) -> Option<T>
    where
        T: TryFrom<OwnedValue>,
    {
        self.read().await.get_as(name)
    }

    /// Updates the cache only; nothing is sent to the peer.
    pub async fn set(&self, name: impl Into<String>, value: OwnedValue) {
        self.write().await.set(name, value);
    }

    pub async fn len(&self) -> usize {
        self.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.read().await.is_empty()
    }

    /// Replaces the whole snapshot, as after a bulk fetch.
    pub(crate) async fn replace(&self, values: HashMap<String, OwnedValue>) {
        *self.write().await = PropertyMap::from(values);
    }

    /// Applies one `PropertiesChanged` signal in a single write.
    ///
    /// Only named fields change; invalidated ones are dropped since their
    /// new value is unknown.
    pub(crate) async fn apply(&self, event: PropertiesChanged) {
        let mut values = self.write().await;
        debug!(
            "Applying {} changed and {} invalidated properties of {}",
            event.changed.len(),
            event.invalidated.len(),
            event.interface
        );
        for (name, value) in event.changed {
            values.set(name, value);
        }
        for name in &event.invalidated {
            values.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::utils::owned_value;

    fn changed(fields: &[(&str, u16)], invalidated: &[&str]) -> PropertiesChanged {
        PropertiesChanged {
            interface: "org.bluez.Profile1".into(),
            changed: fields
                .iter()
                .map(|(k, v)| (k.to_string(), owned_value(*v).unwrap()))
                .collect(),
            invalidated: invalidated.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn get_and_set() {
        let cache = PropertyCache::new();
        assert!(cache.get("Version").await.is_none());

        cache.set("Version", owned_value(0x0102u16).unwrap()).await;
        assert_eq!(cache.get_as::<u16>("Version").await, Some(0x0102));
        assert_eq!(cache.get_as::<String>("Version").await, None);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn apply_overwrites_only_named_fields() {
        let cache = PropertyCache::new();
        cache
            .replace(changed(&[("Version", 1), ("Features", 2)], &[]).changed)
            .await;

        cache.apply(changed(&[("Features", 9)], &[])).await;

        let values = cache.read().await;
        assert_eq!(values.get_as::<u16>("Version"), Some(1));
        assert_eq!(values.get_as::<u16>("Features"), Some(9));
    }

    #[tokio::test]
    async fn apply_drops_invalidated_fields() {
        let cache = PropertyCache::new();
        cache.set("Version", owned_value(1u16).unwrap()).await;
        cache.apply(changed(&[], &["Version"])).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn write_guard_is_exclusive() {
        let cache = PropertyCache::new();
        let guard = cache.write().await;
        assert!(cache.values.try_read().is_err());
        drop(guard);
        let first = cache.read().await;
        let second = cache.read().await;
        assert!(first.is_empty() && second.is_empty());
    }

    #[test]
    fn property_map_basic_operations() {
        let mut map = PropertyMap::new();
        map.set("Version", owned_value(1u16).unwrap());
        assert!(map.contains("Version"));
        assert_eq!(map.iter().count(), 1);
        assert_eq!(map.remove("Version").map(|v| u16::try_from(v).unwrap()), Some(1));
    }
}
