//! In-memory route table: read-many / write-rare map from route key to the
//! JSON descriptor carried by the registry.

use std::collections::HashMap;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use tracing::warn;

use crate::descriptor::{FunctionDescriptor, route_key};

const MIN_CAPACITY: usize = 8;

/// Shared route state. All mutations take the write lock; lookups take the
/// read lock, so a sync upsert is atomic with respect to request routing.
pub struct RouteTable {
    map: RwLock<HashMap<String, String>>,
}

impl RouteTable {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity.max(MIN_CAPACITY))),
        }
    }

    /// Borrow the value for `key`. The borrow lives as long as the returned
    /// guard, which holds the shared lock.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<MappedRwLockReadGuard<'_, str>> {
        RwLockReadGuard::try_map(self.map.read(), |m| m.get(key).map(String::as_str)).ok()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.write().insert(key.to_owned(), value.to_owned());
    }

    /// Upsert a batch under a single write-lock acquisition.
    pub fn set_all<'a>(&self, rows: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut map = self.map.write();
        for (k, v) in rows {
            map.insert(k.to_owned(), v.to_owned());
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.map.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Resolve `(method, uri)` to a typed descriptor. A stored value that
    /// fails to decode, or decodes without a module and handler, is treated
    /// as no route.
    #[must_use]
    pub fn lookup(&self, method: &str, uri: &str) -> Option<FunctionDescriptor> {
        let key = route_key(method, uri);
        let value = self.get(&key)?;
        let mut descriptor: FunctionDescriptor = match serde_json::from_str(&value) {
            Ok(d) => d,
            Err(err) => {
                warn!(%key, %err, "malformed descriptor in route table");
                return None;
            }
        };
        if !descriptor.is_complete() {
            warn!(%key, "descriptor missing module or handler");
            return None;
        }
        drop(value);
        descriptor.method = method.to_owned();
        descriptor.uri = uri.to_owned();
        descriptor.enforce_caps();
        Some(descriptor)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }
}
