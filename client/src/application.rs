//! Typed application sessions (PIV, OATH, ...)

use crate::error::ConnectionError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use ykacc_protocol::{Apdu, ApduResponse, ApplicationKind};
use ykacc_transport::{SmartCardInterface, TransportError};

/// A selected on-device application on the current connection
///
/// Becomes invalid when it is replaced, released, or its connection fails;
/// every call after that fails with `SessionInvalidated`.
#[derive(Debug)]
pub struct ApplicationSession {
    kind: ApplicationKind,
    interface: Arc<SmartCardInterface>,
    select_response: ApduResponse,
    valid: AtomicBool,
}

impl ApplicationSession {
    pub(crate) fn new(
        kind: ApplicationKind,
        interface: Arc<SmartCardInterface>,
        select_response: ApduResponse,
    ) -> Self {
        Self {
            kind,
            interface,
            select_response,
            valid: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> ApplicationKind {
        self.kind
    }

    /// Response to the SELECT that opened this session
    pub fn select_response(&self) -> &ApduResponse {
        &self.select_response
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) && self.interface.session().is_valid()
    }

    /// Send an APDU to the application, following GET RESPONSE chains
    pub async fn send(&self, apdu: &Apdu) -> Result<ApduResponse, ConnectionError> {
        self.ensure_valid()?;
        let result = self.interface.execute(apdu).await;
        self.observe(result)
    }

    /// Send raw command bytes and return the raw response
    pub async fn transmit(&self, command: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.ensure_valid()?;
        let result = self.interface.transmit(command).await;
        self.observe(result)
    }

    pub(crate) fn invalidate(&self) -> bool {
        let was_valid = self.valid.swap(false, Ordering::AcqRel);
        if was_valid {
            debug!("{} session invalidated", self.kind);
        }
        was_valid
    }

    fn ensure_valid(&self) -> Result<(), ConnectionError> {
        if self.valid.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ConnectionError::SessionInvalidated)
        }
    }

    /// The stream's fault watch tells the façade to tear down
    fn observe<T>(&self, result: Result<T, TransportError>) -> Result<T, ConnectionError> {
        result.map_err(|e| {
            if e.is_transport_failure() {
                warn!("{} session transport failure: {}", self.kind, e);
            }
            e.into()
        })
    }
}
