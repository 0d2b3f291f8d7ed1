//! Registry of attached accessories
//!
//! The registry is the single owner of the attached-accessory set. It only
//! changes when the provider delivers an event (or on re-enumeration);
//! callers get snapshots.

use crate::accessory::{AccessoryDescriptor, AccessoryEvent, AccessoryFilter, ConnectionId};
use crate::error::TransportError;
use crate::provider::SharedAccessoryProvider;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Capacity of the attach/detach broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One attached accessory
pub(crate) struct AttachedAccessory {
    /// Only strong reference; stream sessions hold weak ones
    pub(crate) descriptor: Arc<AccessoryDescriptor>,
    /// Flips to `false` on detach
    pub(crate) liveness: watch::Sender<bool>,
}

/// Registry of attached accessories
pub struct AccessoryRegistry {
    provider: SharedAccessoryProvider,
    accessories: DashMap<ConnectionId, AttachedAccessory>,
    /// Exclusive (accessory, protocol) claims held by open stream sessions
    claims: DashMap<(ConnectionId, String), ()>,
    events: broadcast::Sender<AccessoryEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl AccessoryRegistry {
    pub fn new(provider: SharedAccessoryProvider) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            provider,
            accessories: DashMap::new(),
            claims: DashMap::new(),
            events,
            pump: Mutex::new(None),
        })
    }

    /// Snapshot of attached accessories, ordered by connection ID
    pub fn list_connected_accessories(&self) -> Vec<AccessoryDescriptor> {
        let mut list: Vec<AccessoryDescriptor> = self
            .accessories
            .iter()
            .map(|entry| (*entry.descriptor).clone())
            .collect();
        list.sort_by_key(|d| d.connection_id);
        list
    }

    /// Current descriptor of one accessory
    pub fn get(&self, id: ConnectionId) -> Option<AccessoryDescriptor> {
        self.accessories.get(&id).map(|entry| (*entry.descriptor).clone())
    }

    pub fn is_attached(&self, id: ConnectionId) -> bool {
        self.accessories.contains_key(&id)
    }

    /// Subscribe to attach/detach events applied after this call
    pub fn subscribe(&self) -> broadcast::Receiver<AccessoryEvent> {
        self.events.subscribe()
    }

    pub fn is_registered(&self) -> bool {
        self.pump.lock().is_some()
    }

    /// Start receiving attach/detach events from the provider
    ///
    /// Calling this while already registered is a no-op. Must be called from
    /// within a tokio runtime.
    pub fn register_for_notifications(self: &Arc<Self>) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            trace!("Already registered for accessory notifications");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.provider.register_for_notifications(tx);

        // Enumerate after registering so nothing slips between the two
        self.refresh();

        let registry: Weak<Self> = Arc::downgrade(self);
        *pump = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.apply(event);
            }
            debug!("Accessory notification pump stopped");
        }));

        debug!("Registered for accessory notifications");
    }

    /// Stop receiving events; no-op when not registered
    pub fn unregister_for_notifications(&self) {
        let Some(handle) = self.pump.lock().take() else {
            trace!("Not registered for accessory notifications");
            return;
        };

        self.provider.unregister_for_notifications();
        handle.abort();
        debug!("Unregistered from accessory notifications");
    }

    /// Re-enumerate from the provider and reconcile the attached set
    ///
    /// Accessories that vanished are treated as detached; new or changed
    /// accessories are announced as attached.
    pub fn refresh(&self) -> Vec<AccessoryDescriptor> {
        let reported = self.provider.connected_accessories();
        let reported_ids: HashSet<ConnectionId> =
            reported.iter().map(|d| d.connection_id).collect();

        let vanished: Vec<ConnectionId> = self
            .accessories
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !reported_ids.contains(id))
            .collect();

        for id in vanished {
            self.apply(AccessoryEvent::Detached(id));
        }
        for descriptor in reported {
            self.apply(AccessoryEvent::Attached(descriptor));
        }

        self.list_connected_accessories()
    }

    /// Present the picker and wait for the user's choice
    pub async fn show_picker_with_filter(
        &self,
        filter: &AccessoryFilter,
    ) -> Result<AccessoryDescriptor, TransportError> {
        debug!("Showing accessory picker ({:?})", filter);
        let chosen = self.provider.show_picker(filter).await?;
        if !filter.matches(&chosen) {
            return Err(TransportError::PickerFailed(format!(
                "accessory {} does not match {:?}",
                chosen.connection_id, filter
            )));
        }
        info!(
            "Picker selected accessory {} ({})",
            chosen.connection_id, chosen.name
        );
        Ok(chosen)
    }

    /// Apply one provider event to the attached set and rebroadcast it
    ///
    /// Detach events for accessories that are not attached (duplicates,
    /// late deliveries) are dropped, and so are attach events that repeat
    /// the descriptor already on record.
    pub(crate) fn apply(&self, event: AccessoryEvent) {
        match event {
            AccessoryEvent::Attached(mut descriptor) => {
                descriptor.connected = true;
                let id = descriptor.connection_id;
                let descriptor = Arc::new(descriptor);

                let changed = match self.accessories.entry(id) {
                    Entry::Occupied(mut entry) => {
                        // Unchanged snapshots keep their identity so weak holders stay valid
                        if *entry.get().descriptor == *descriptor {
                            false
                        } else {
                            entry.get_mut().descriptor = descriptor.clone();
                            trace!("Refreshed descriptor for accessory {}", id);
                            true
                        }
                    }
                    Entry::Vacant(entry) => {
                        let (liveness, _) = watch::channel(true);
                        entry.insert(AttachedAccessory {
                            descriptor: descriptor.clone(),
                            liveness,
                        });
                        info!("Accessory {} attached: {}", id, descriptor.name);
                        true
                    }
                };

                if changed {
                    let _ = self
                        .events
                        .send(AccessoryEvent::Attached((*descriptor).clone()));
                }
            }
            AccessoryEvent::Detached(id) => {
                let Some((_, attached)) = self.accessories.remove(&id) else {
                    trace!("Ignoring detach for unknown accessory {}", id);
                    return;
                };

                attached.liveness.send_replace(false);
                info!("Accessory {} detached", id);
                let _ = self.events.send(AccessoryEvent::Detached(id));
            }
        }
    }

    pub(crate) fn provider(&self) -> &SharedAccessoryProvider {
        &self.provider
    }

    /// Descriptor handle and liveness signal for an attached accessory
    pub(crate) fn attachment(
        &self,
        id: ConnectionId,
    ) -> Option<(Arc<AccessoryDescriptor>, watch::Receiver<bool>)> {
        self.accessories
            .get(&id)
            .map(|entry| (entry.descriptor.clone(), entry.liveness.subscribe()))
    }

    /// Take the exclusive claim on `protocol` for an accessory
    pub(crate) fn claim(
        self: &Arc<Self>,
        accessory: ConnectionId,
        protocol: &str,
    ) -> Result<ProtocolClaim, TransportError> {
        let key = (accessory, protocol.to_string());
        match self.claims.entry(key.clone()) {
            Entry::Occupied(_) => Err(TransportError::AccessoryBusy {
                accessory,
                protocol: protocol.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(());
                trace!("Claimed {} on accessory {}", protocol, accessory);
                Ok(ProtocolClaim {
                    registry: Arc::downgrade(self),
                    key,
                })
            }
        }
    }

    /// Number of protocol claims currently held
    pub fn open_claims(&self) -> usize {
        self.claims.len()
    }
}

impl Drop for AccessoryRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().take() {
            self.provider.unregister_for_notifications();
            handle.abort();
        }
    }
}

/// Exclusive claim on one protocol of one accessory, released on drop
#[derive(Debug)]
pub(crate) struct ProtocolClaim {
    registry: Weak<AccessoryRegistry>,
    key: (ConnectionId, String),
}

impl Drop for ProtocolClaim {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.claims.remove(&self.key);
            trace!("Released {} on accessory {}", self.key.1, self.key.0);
        }
    }
}
