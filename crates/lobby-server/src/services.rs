//! Registry of advertised service resources.
//!
//! At most one record exists per `(resource type, owner)`. Records carry an
//! opaque payload the hub never inspects.

use lobby_core::Identity;
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A resource advertised by its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRecord {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub owner: Identity,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Outcome of [`ServiceRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// The owner already holds a record of this type; nothing changed.
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    resource_type: String,
    owner: Identity,
}

impl ServiceKey {
    fn new(resource_type: &str, owner: &Identity) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            owner: owner.clone(),
        }
    }
}

/// Per-owner service records keyed by `(type, owner)`.
#[derive(Default)]
pub struct ServiceRegistry {
    records: RwLock<HashMap<ServiceKey, ServiceRecord>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner`'s resource of `resource_type` unless one already exists.
    pub async fn register(&self, owner: Identity, resource_type: String, data: Value) -> Registration {
        let mut records = self.records.write().await;
        match records.entry(ServiceKey::new(&resource_type, &owner)) {
            Entry::Occupied(_) => {
                info!(owner = %owner, resource_type = %resource_type, "owner already has a server of this type");
                Registration::AlreadyExists
            }
            Entry::Vacant(slot) => {
                debug!(owner = %owner, resource_type = %resource_type, "server registered");
                slot.insert(ServiceRecord {
                    resource_type,
                    owner,
                    data,
                });
                Registration::Created
            }
        }
    }

    /// Remove `owner`'s resource of `resource_type`. Absent records are a no-op.
    pub async fn unregister(&self, owner: &Identity, resource_type: &str) -> bool {
        let removed = self
            .records
            .write()
            .await
            .remove(&ServiceKey::new(resource_type, owner))
            .is_some();
        if removed {
            debug!(owner = %owner, resource_type, "server removed");
        } else {
            debug!(owner = %owner, resource_type, "no server of this type to remove");
        }
        removed
    }

    pub async fn find(&self, resource_type: &str, owner: &Identity) -> Option<ServiceRecord> {
        self.records
            .read()
            .await
            .get(&ServiceKey::new(resource_type, owner))
            .cloned()
    }

    /// All records of one type, ordered by owner.
    pub async fn list(&self, resource_type: &str) -> Vec<ServiceRecord> {
        let records = self.records.read().await;
        let mut matching: Vec<ServiceRecord> = records
            .values()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.owner.cmp(&b.owner));
        matching
    }

    /// Drop every record held by `owner`; returns how many were removed.
    pub async fn remove_owner(&self, owner: &Identity) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|key, _| &key.owner != owner);
        let removed = before - records.len();
        if removed > 0 {
            info!(owner = %owner, removed, "removed servers of departed owner");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
