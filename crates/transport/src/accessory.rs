//! Accessory descriptors, events and picker filters

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Opaque identifier the OS assigns to one attachment of an accessory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable snapshot of one physically attached accessory
///
/// A fresh descriptor is produced every time the registry re-enumerates;
/// holders never see it change underneath them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryDescriptor {
    pub connection_id: ConnectionId,
    pub connected: bool,
    pub manufacturer: String,
    pub name: String,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub dock_type: String,
    /// Protocol strings the accessory advertises (e.g. `com.yubico.ylp`)
    pub protocol_strings: BTreeSet<String>,
}

impl AccessoryDescriptor {
    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.protocol_strings.contains(protocol)
    }
}

/// Attach/detach notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessoryEvent {
    Attached(AccessoryDescriptor),
    Detached(ConnectionId),
}

impl AccessoryEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            AccessoryEvent::Attached(descriptor) => descriptor.connection_id,
            AccessoryEvent::Detached(id) => *id,
        }
    }
}

type Predicate = dyn Fn(&AccessoryDescriptor) -> bool + Send + Sync;

/// Predicate restricting which accessories the picker offers
#[derive(Clone)]
pub struct AccessoryFilter {
    predicate: Arc<Predicate>,
    description: String,
}

impl AccessoryFilter {
    /// Accept every accessory
    pub fn any() -> Self {
        Self::custom("any", |_| true)
    }

    /// Accept accessories whose name contains `needle` (case-insensitive)
    pub fn name_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        let lowered = needle.to_lowercase();
        Self::custom(format!("name contains {:?}", needle), move |d| {
            d.name.to_lowercase().contains(&lowered)
        })
    }

    /// Accept accessories advertising `protocol`
    pub fn supports_protocol(protocol: impl Into<String>) -> Self {
        let protocol = protocol.into();
        let description = format!("supports {}", protocol);
        Self::custom(description, move |d| d.supports_protocol(&protocol))
    }

    pub fn custom<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&AccessoryDescriptor) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            description: description.into(),
        }
    }

    /// Both filters must accept
    pub fn and(self, other: AccessoryFilter) -> Self {
        let description = format!("{} and {}", self.description, other.description);
        let (a, b) = (self.predicate, other.predicate);
        Self {
            predicate: Arc::new(move |d| a(d) && b(d)),
            description,
        }
    }

    pub fn matches(&self, descriptor: &AccessoryDescriptor) -> bool {
        (self.predicate)(descriptor)
    }
}

impl fmt::Debug for AccessoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessoryFilter")
            .field(&self.description)
            .finish()
    }
}

impl Default for AccessoryFilter {
    fn default() -> Self {
        Self::any()
    }
}
