//! Transport error taxonomy

use crate::accessory::ConnectionId;
use std::io;
use std::time::Duration;
use thiserror::Error;
use ykacc_protocol::{ApduError, ApplicationKind, FrameError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Accessory {accessory} does not support protocol {protocol}")]
    NoSuchProtocol {
        accessory: ConnectionId,
        protocol: String,
    },

    #[error("Protocol {protocol} is already open on accessory {accessory}")]
    AccessoryBusy {
        accessory: ConnectionId,
        protocol: String,
    },

    #[error("Accessory {0} is not attached")]
    AccessoryDetached(ConnectionId),

    #[error("Session closed")]
    SessionClosed,

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Accessory picker cancelled")]
    PickerCancelled,

    #[error("Accessory picker failed: {0}")]
    PickerFailed(String),

    #[error("Another command is in flight on this interface")]
    InterfaceBusy,

    #[error("Stream state unknown after an earlier failure; reopen the session")]
    Desynchronized,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Application {kind} not available (SW {sw:04X})")]
    ApplicationNotAvailable { kind: ApplicationKind, sw: u16 },

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Failures after which the stream session can no longer be trusted
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::TransportClosed
                | TransportError::Timeout(_)
                | TransportError::Desynchronized
                | TransportError::MalformedResponse(_)
                | TransportError::Io(_)
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => TransportError::TransportClosed,
            _ => TransportError::Io(e.to_string()),
        }
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        TransportError::MalformedResponse(e.to_string())
    }
}

impl From<ApduError> for TransportError {
    fn from(e: ApduError) -> Self {
        match e {
            ApduError::ResponseTooShort(_) => TransportError::MalformedResponse(e.to_string()),
            ApduError::DataTooLarge { .. } | ApduError::LeTooLarge { .. } => {
                TransportError::InvalidCommand(e.to_string())
            }
        }
    }
}
