//! Seams to the OS accessory subsystem

use crate::accessory::{AccessoryDescriptor, AccessoryEvent, AccessoryFilter, ConnectionId};
use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedSender;

/// Readable half of an open protocol channel
pub type InboundStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of an open protocol channel
pub type OutboundStream = Box<dyn AsyncWrite + Send + Unpin>;

/// The two raw streams of one open protocol on one accessory
pub struct StreamPair {
    pub inbound: InboundStream,
    pub outbound: OutboundStream,
}

impl StreamPair {
    pub fn new<R, W>(inbound: R, outbound: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inbound: Box::new(inbound),
            outbound: Box::new(outbound),
        }
    }
}

impl fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamPair { .. }")
    }
}

/// Picker outcomes other than a chosen accessory
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PickerError {
    #[error("Picker dismissed by the user")]
    Cancelled,

    #[error("Picker failed: {0}")]
    Failed(String),
}

impl From<PickerError> for TransportError {
    fn from(e: PickerError) -> Self {
        match e {
            PickerError::Cancelled => TransportError::PickerCancelled,
            PickerError::Failed(reason) => TransportError::PickerFailed(reason),
        }
    }
}

/// OS-level accessory discovery and stream provider
///
/// Implementations deliver attach/detach events into the sink handed to
/// `register_for_notifications`. Duplicate or late detach events are
/// allowed; the registry ignores them.
#[async_trait]
pub trait AccessoryProvider: Send + Sync {
    /// Accessories the OS currently reports as connected
    fn connected_accessories(&self) -> Vec<AccessoryDescriptor>;

    /// Start delivering events into `sink`, replacing any previous sink
    fn register_for_notifications(&self, sink: UnboundedSender<AccessoryEvent>);

    /// Stop delivering events
    fn unregister_for_notifications(&self);

    /// Present the user-facing chooser restricted to accessories matching `filter`
    async fn show_picker(&self, filter: &AccessoryFilter)
    -> Result<AccessoryDescriptor, PickerError>;

    /// Open the input/output streams of `protocol` on an accessory
    async fn open_streams(
        &self,
        accessory: ConnectionId,
        protocol: &str,
    ) -> Result<StreamPair, TransportError>;
}

pub type SharedAccessoryProvider = Arc<dyn AccessoryProvider>;
