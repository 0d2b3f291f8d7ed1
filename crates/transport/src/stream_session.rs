//! One open protocol on one accessory
//!
//! A `StreamSession` owns the inbound/outbound streams of a single
//! (accessory, protocol) pair. It holds only a weak reference to the
//! accessory descriptor and a liveness signal from the registry, so a detach
//! invalidates it without the session keeping anything alive.

use crate::accessory::{AccessoryDescriptor, ConnectionId};
use crate::error::TransportError;
use crate::provider::StreamPair;
use crate::registry::{AccessoryRegistry, ProtocolClaim};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, trace, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct StreamSession {
    id: u64,
    accessory_id: ConnectionId,
    accessory: Weak<AccessoryDescriptor>,
    protocol: String,
    /// `None` once closed
    io: AsyncMutex<Option<StreamPair>>,
    liveness: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    /// First failure that left the stream in an unknown state
    fault: watch::Sender<Option<TransportError>>,
    claim: Mutex<Option<ProtocolClaim>>,
}

impl StreamSession {
    /// Open `protocol` on an attached accessory
    ///
    /// Fails with `AccessoryDetached` if the accessory is gone (before or
    /// while the streams are being opened), `NoSuchProtocol` if it does not
    /// advertise the protocol and `AccessoryBusy` if another session already
    /// holds it. The protocol claim is released on every failure path.
    pub async fn open(
        registry: &Arc<AccessoryRegistry>,
        accessory: &AccessoryDescriptor,
        protocol: &str,
    ) -> Result<Arc<Self>, TransportError> {
        let accessory_id = accessory.connection_id;
        let (descriptor, liveness) = registry
            .attachment(accessory_id)
            .ok_or(TransportError::AccessoryDetached(accessory_id))?;

        if !descriptor.supports_protocol(protocol) {
            return Err(TransportError::NoSuchProtocol {
                accessory: accessory_id,
                protocol: protocol.to_string(),
            });
        }

        let claim = registry.claim(accessory_id, protocol)?;
        let weak = Arc::downgrade(&descriptor);
        drop(descriptor);

        let streams = registry
            .provider()
            .open_streams(accessory_id, protocol)
            .await?;

        if !*liveness.borrow() {
            debug!(
                "Accessory {} detached while opening {}",
                accessory_id, protocol
            );
            return Err(TransportError::AccessoryDetached(accessory_id));
        }

        let (shutdown, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            accessory_id,
            accessory: weak,
            protocol: protocol.to_string(),
            io: AsyncMutex::new(Some(streams)),
            liveness,
            shutdown,
            closed: AtomicBool::new(false),
            fault: watch::Sender::new(None),
            claim: Mutex::new(Some(claim)),
        });

        debug!(
            "Opened stream session {} ({} on accessory {})",
            session.id, protocol, accessory_id
        );
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Descriptor of the accessory, while it is still attached
    pub fn accessory(&self) -> Option<Arc<AccessoryDescriptor>> {
        self.accessory.upgrade()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.accessory_id
    }

    pub fn protocol_string(&self) -> &str {
        &self.protocol
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_attached(&self) -> bool {
        *self.liveness.borrow()
    }

    /// Open, attached and in a known stream state
    pub fn is_valid(&self) -> bool {
        !self.is_closed() && self.is_attached() && !self.is_desynchronized()
    }

    /// Release both streams and the protocol claim
    ///
    /// Idempotent. An in-flight transmit is woken and fails with
    /// `TransportClosed`; later use fails with `SessionClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            trace!("Stream session {} already closed", self.id);
            return;
        }

        self.shutdown.send_replace(true);

        // Waits for any in-flight exchange to observe the shutdown
        let streams = self.io.lock().await.take();
        drop(streams);
        let claim = self.claim.lock().take();
        drop(claim);

        debug!(
            "Closed stream session {} ({} on accessory {})",
            self.id, self.protocol, self.accessory_id
        );
    }

    /// Fail if the session can no longer carry traffic
    pub(crate) fn check_usable(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        if !self.is_attached() {
            return Err(TransportError::TransportClosed);
        }
        if self.is_desynchronized() {
            return Err(TransportError::Desynchronized);
        }
        Ok(())
    }

    /// Resolves once the session is closed or its accessory detaches
    pub(crate) async fn wait_invalidated(&self) -> TransportError {
        let mut liveness = self.liveness.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            _ = liveness.wait_for(|alive| !*alive) => {}
            _ = shutdown.wait_for(|closed| *closed) => {}
        }

        TransportError::TransportClosed
    }

    pub(crate) fn io(&self) -> &AsyncMutex<Option<StreamPair>> {
        &self.io
    }

    pub(crate) fn mark_desynchronized(&self, cause: &TransportError) {
        let marked = self.fault.send_if_modified(|fault| {
            if fault.is_some() {
                return false;
            }
            *fault = Some(cause.clone());
            true
        });
        if marked {
            warn!("Stream session {} desynchronized: {}", self.id, cause);
        }
    }

    pub fn is_desynchronized(&self) -> bool {
        self.fault.borrow().is_some()
    }

    /// The failure that desynchronized the stream, if any
    pub fn fault(&self) -> Option<TransportError> {
        self.fault.borrow().clone()
    }

    /// Observe the stream's fault; the channel closes when the session is dropped
    pub fn watch_fault(&self) -> watch::Receiver<Option<TransportError>> {
        self.fault.subscribe()
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("accessory", &self.accessory_id)
            .field("protocol", &self.protocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}
