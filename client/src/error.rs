//! Connection-level errors

use std::time::Duration;
use thiserror::Error;
use ykacc_protocol::ApplicationKind;
use ykacc_transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("No accessory supporting {protocol} attached within {waited:?}")]
    NoAccessory { protocol: String, waited: Duration },

    #[error("{active} session is active; {requested} rejected by switch policy")]
    SessionKindConflict {
        active: ApplicationKind,
        requested: ApplicationKind,
    },

    #[error("Host device cannot use accessory keys")]
    UnsupportedHost,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Application session invalidated")]
    SessionInvalidated,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectionError {
    /// Failures that tear the connection down
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ConnectionError::Transport(e) if e.is_transport_failure())
    }
}
