//! APDU exchange over a stream session
//!
//! Each command is framed, written in full, and answered by exactly one
//! response frame before the next command may start. The I/O lock of the
//! stream session is held for the whole exchange, so bytes of two commands
//! never interleave on the wire.

use crate::error::TransportError;
use crate::provider::StreamPair;
use crate::stream_session::StreamSession;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::MutexGuard;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};
use ykacc_protocol::{
    Apdu, ApduResponse, ApplicationKind, FrameDecoder, InboundFrame, MAX_FRAME_PAYLOAD,
    encode_command, sw,
};

/// What a second caller does while a command is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Queue behind the in-flight command
    #[default]
    Wait,
    /// Fail immediately with `InterfaceBusy`
    FailFast,
}

#[derive(Debug, Clone)]
pub struct SmartCardConfig {
    /// Deadline for one command, re-armed by each wait extension
    pub response_timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub max_wait_extensions: u32,
    /// Upper bound on GET RESPONSE rounds for one command
    pub max_get_response_rounds: u32,
    /// Read buffer size for the inbound stream
    pub read_chunk_size: usize,
    /// Largest response payload accepted
    pub max_response_size: usize,
}

impl Default for SmartCardConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            busy_policy: BusyPolicy::Wait,
            max_wait_extensions: 12,
            max_get_response_rounds: 16,
            read_chunk_size: 512,
            max_response_size: MAX_FRAME_PAYLOAD,
        }
    }
}

/// Command/response channel bound to one stream session
#[derive(Debug)]
pub struct SmartCardInterface {
    session: Arc<StreamSession>,
    config: SmartCardConfig,
}

type IoGuard<'a> = MutexGuard<'a, Option<StreamPair>>;

impl SmartCardInterface {
    pub fn new(session: Arc<StreamSession>, config: SmartCardConfig) -> Self {
        Self { session, config }
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    pub fn config(&self) -> &SmartCardConfig {
        &self.config
    }

    /// Send raw command bytes and return the raw response bytes
    ///
    /// The response is the payload of the first response frame; status words
    /// are not interpreted.
    pub async fn transmit(&self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.acquire().await?;
        let response = self.exchange_locked(&mut guard, command).await?;
        Ok(response.to_vec())
    }

    /// Send an APDU and collect the full response
    ///
    /// `61xx` statuses are followed with GET RESPONSE and the data is
    /// concatenated. The interface stays locked across the whole chain.
    pub async fn execute(&self, apdu: &Apdu) -> Result<ApduResponse, TransportError> {
        let command = apdu.encode()?;
        let mut guard = self.acquire().await?;

        let raw = self.exchange_locked(&mut guard, &command).await?;
        let mut response = ApduResponse::parse(&raw)?;
        let mut data = std::mem::take(&mut response.data);

        let mut rounds = 0;
        while let Some(available) = response.more_data_available() {
            rounds += 1;
            if rounds > self.config.max_get_response_rounds {
                return Err(TransportError::MalformedResponse(format!(
                    "GET RESPONSE chain exceeded {} rounds",
                    self.config.max_get_response_rounds
                )));
            }

            trace!("SW 61{:02X}, fetching remaining response data", available);
            let mut get_response = Apdu::get_response(available);
            get_response.cla = apdu.cla;
            let raw = self
                .exchange_locked(&mut guard, &get_response.encode()?)
                .await?;
            response = ApduResponse::parse(&raw)?;
            data.append(&mut response.data);
        }

        response.data = data;
        Ok(response)
    }

    /// SELECT an on-device application by AID
    pub async fn select(&self, kind: ApplicationKind) -> Result<ApduResponse, TransportError> {
        let response = self.execute(&Apdu::select(kind.aid())).await?;
        if response.sw() != sw::SUCCESS {
            debug!("SELECT {} failed with SW {:04X}", kind, response.sw());
            return Err(TransportError::ApplicationNotAvailable {
                kind,
                sw: response.sw(),
            });
        }

        debug!("Selected {} application", kind);
        Ok(response)
    }

    /// Take the session's I/O lock according to the busy policy
    async fn acquire(&self) -> Result<IoGuard<'_>, TransportError> {
        self.session.check_usable()?;

        let guard = match self.config.busy_policy {
            BusyPolicy::Wait => {
                tokio::select! {
                    guard = self.session.io().lock() => guard,
                    err = self.session.wait_invalidated() => return Err(err),
                }
            }
            BusyPolicy::FailFast => self
                .session
                .io()
                .try_lock()
                .map_err(|_| TransportError::InterfaceBusy)?,
        };

        // State may have changed while queued
        self.session.check_usable()?;
        if guard.is_none() {
            return Err(TransportError::SessionClosed);
        }
        Ok(guard)
    }

    /// One framed command/response exchange under the I/O lock
    ///
    /// Any failure after the first byte is written leaves the stream in an
    /// unknown state, so the session is marked desynchronized. The same
    /// holds when the caller drops the future mid-exchange.
    async fn exchange_locked(
        &self,
        guard: &mut IoGuard<'_>,
        command: &[u8],
    ) -> Result<Bytes, TransportError> {
        let frame =
            encode_command(command).map_err(|e| TransportError::InvalidCommand(e.to_string()))?;
        let pair = guard.as_mut().ok_or(TransportError::SessionClosed)?;

        trace!("TX: {}", hex::encode_upper(command));

        let in_flight = InFlight::arm(&self.session);
        let result = tokio::select! {
            biased;
            err = self.session.wait_invalidated() => Err(err),
            result = self.exchange(pair, &frame) => result,
        };
        in_flight.disarm();

        match result {
            Ok(response) => {
                trace!("RX: {}", hex::encode_upper(&response));
                Ok(response)
            }
            Err(e) => {
                self.session.mark_desynchronized(&e);
                Err(e)
            }
        }
    }

    async fn exchange(&self, pair: &mut StreamPair, frame: &[u8]) -> Result<Bytes, TransportError> {
        let timeout = self.config.response_timeout;
        let mut deadline = Instant::now() + timeout;

        let mut written = 0;
        while written < frame.len() {
            let n = timeout_at(deadline, pair.outbound.write(&frame[written..]))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;
            if n == 0 {
                return Err(TransportError::TransportClosed);
            }
            written += n;
        }
        timeout_at(deadline, pair.outbound.flush())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; self.config.read_chunk_size.max(1)];
        let mut extensions = 0u32;

        loop {
            while let Some(frame) = decoder.next_frame() {
                match InboundFrame::from_frame(frame)? {
                    InboundFrame::WaitExtension => {
                        extensions += 1;
                        if extensions > self.config.max_wait_extensions {
                            debug!(
                                "Giving up after {} wait extensions",
                                self.config.max_wait_extensions
                            );
                            return Err(TransportError::Timeout(timeout));
                        }
                        trace!("Wait extension {}, deadline re-armed", extensions);
                        deadline = Instant::now() + timeout;
                    }
                    InboundFrame::Response(payload) => {
                        if decoder.buffered() > 0 {
                            return Err(TransportError::MalformedResponse(format!(
                                "{} bytes trailing the response",
                                decoder.buffered()
                            )));
                        }
                        return Ok(payload);
                    }
                }
            }

            if let Some(len) = decoder.announced_len() {
                if len > self.config.max_response_size {
                    return Err(TransportError::MalformedResponse(format!(
                        "response of {} bytes exceeds limit of {}",
                        len, self.config.max_response_size
                    )));
                }
            }

            let n = timeout_at(deadline, pair.inbound.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;
            if n == 0 {
                return Err(TransportError::TransportClosed);
            }
            decoder.extend(&buf[..n]);
        }
    }
}

/// Marks the session desynchronized if an exchange is dropped before it
/// reaches a response or an error
struct InFlight<'a> {
    session: &'a StreamSession,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn arm(session: &'a StreamSession) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Exchange abandoned with a command in flight");
            self.session
                .mark_desynchronized(&TransportError::Desynchronized);
        }
    }
}
