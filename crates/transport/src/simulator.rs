//! In-process accessory provider
//!
//! `SimulatedProvider` stands in for the OS accessory subsystem. Each opened
//! protocol is a `tokio::io::duplex` pipe whose far end is served by a device
//! task that decodes command frames and plays back scripted replies: whole
//! or chunked responses, wait extensions, delays and hangs.

use crate::accessory::{AccessoryDescriptor, AccessoryEvent, AccessoryFilter, ConnectionId};
use crate::error::TransportError;
use crate::provider::{AccessoryProvider, PickerError, StreamPair};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use ykacc_protocol::{
    ApplicationKind, FrameDecoder, INS_SELECT, encode_response, encode_wait_extension, kind, sw,
};

/// Protocol string advertised by simulated keys
pub const YUBICO_PROTOCOL: &str = "com.yubico.ylp";

const PIPE_CAPACITY: usize = 4096;
const CHUNK_GAP: Duration = Duration::from_millis(2);

/// How a response frame is split on the wire
#[derive(Debug, Clone, Copy)]
enum Chunking {
    Whole,
    Even(usize),
    Random,
}

#[derive(Debug, Clone)]
enum Step {
    Frame { payload: Vec<u8>, chunking: Chunking },
    Raw(Vec<u8>),
    WaitExtension,
    Sleep(Duration),
    Hang,
}

/// Scripted device behaviour for one command
#[derive(Debug, Clone)]
pub struct Reply {
    steps: Vec<Step>,
}

impl Reply {
    /// Answer with one response frame carrying `data` (including SW1 SW2)
    pub fn response(data: impl Into<Vec<u8>>) -> Self {
        Self::framed(data.into(), Chunking::Whole)
    }

    /// Answer with one response frame split into `chunks` separate writes
    pub fn chunked(data: impl Into<Vec<u8>>, chunks: usize) -> Self {
        Self::framed(data.into(), Chunking::Even(chunks.max(1)))
    }

    /// Answer with one response frame split at random points
    pub fn random_chunks(data: impl Into<Vec<u8>>) -> Self {
        Self::framed(data.into(), Chunking::Random)
    }

    /// Write bytes verbatim, without framing
    pub fn raw(wire: impl Into<Vec<u8>>) -> Self {
        Self {
            steps: vec![Step::Raw(wire.into())],
        }
    }

    /// Never answer
    pub fn hang() -> Self {
        Self {
            steps: vec![Step::Hang],
        }
    }

    /// Delay the whole reply
    pub fn after(mut self, delay: Duration) -> Self {
        self.steps.insert(0, Step::Sleep(delay));
        self
    }

    /// Precede the reply with `count` wait extensions, `interval` apart
    pub fn with_wait_extensions(mut self, count: usize, interval: Duration) -> Self {
        let mut steps = Vec::with_capacity(count * 2 + self.steps.len());
        for _ in 0..count {
            steps.push(Step::Sleep(interval));
            steps.push(Step::WaitExtension);
        }
        steps.append(&mut self.steps);
        self.steps = steps;
        self
    }

    fn framed(payload: Vec<u8>, chunking: Chunking) -> Self {
        Self {
            steps: vec![Step::Frame { payload, chunking }],
        }
    }
}

/// Produces the device's reply to one decoded command
pub trait Responder: Send + Sync {
    fn respond(&self, command: &[u8]) -> Reply;
}

impl<F> Responder for F
where
    F: Fn(&[u8]) -> Reply + Send + Sync,
{
    fn respond(&self, command: &[u8]) -> Reply {
        self(command)
    }
}

/// Applet behaviour of a stock key: SELECT of a known AID succeeds
pub fn default_responder(command: &[u8]) -> Reply {
    if command.len() >= 5 && command[1] == INS_SELECT && command[2] == 0x04 {
        let lc = command[4] as usize;
        let aid = command.get(5..5 + lc).unwrap_or_default();
        let known = ApplicationKind::ALL.iter().any(|k| k.aid() == aid);
        let status = if known { sw::SUCCESS } else { sw::FILE_NOT_FOUND };
        return Reply::response(status.to_be_bytes());
    }
    Reply::response(sw::INS_NOT_SUPPORTED.to_be_bytes())
}

/// A simulated accessory: descriptor plus device behaviour
#[derive(Clone)]
pub struct SimulatedAccessory {
    pub descriptor: AccessoryDescriptor,
    responder: Arc<dyn Responder>,
}

impl SimulatedAccessory {
    /// A YubiKey 5Ci advertising the Yubico protocol
    pub fn yubikey(id: u64) -> Self {
        Self {
            descriptor: AccessoryDescriptor {
                connection_id: ConnectionId(id),
                connected: true,
                manufacturer: "Yubico".to_string(),
                name: "YubiKey 5Ci".to_string(),
                model_number: "5Ci".to_string(),
                serial_number: format!("{:08}", 10_000_000 + id),
                firmware_revision: "5.4.3".to_string(),
                hardware_revision: "1".to_string(),
                dock_type: String::new(),
                protocol_strings: [YUBICO_PROTOCOL.to_string()].into_iter().collect(),
            },
            responder: Arc::new(default_responder),
        }
    }

    pub fn with_responder<R: Responder + 'static>(mut self, responder: R) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.protocol_strings = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }
}

impl std::fmt::Debug for SimulatedAccessory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAccessory")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

struct Attached {
    accessory: SimulatedAccessory,
    /// Flips to `true` on detach; device tasks stop
    unplugged: watch::Sender<bool>,
}

#[derive(Default)]
struct SimState {
    accessories: Mutex<BTreeMap<ConnectionId, Attached>>,
    sink: Mutex<Option<UnboundedSender<AccessoryEvent>>>,
    picker: Mutex<VecDeque<Result<ConnectionId, PickerError>>>,
    received: Mutex<HashMap<ConnectionId, Vec<Vec<u8>>>>,
    opened: AtomicUsize,
}

/// Accessory provider backed by in-memory pipes
#[derive(Clone, Default)]
pub struct SimulatedProvider {
    state: Arc<SimState>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in an accessory; replaces any accessory with the same ID
    pub fn attach(&self, accessory: SimulatedAccessory) {
        let descriptor = accessory.descriptor.clone();
        let (unplugged, _) = watch::channel(false);
        let previous = self.state.accessories.lock().insert(
            descriptor.connection_id,
            Attached {
                accessory,
                unplugged,
            },
        );
        if let Some(previous) = previous {
            previous.unplugged.send_replace(true);
        }

        debug!("Simulated accessory {} attached", descriptor.connection_id);
        self.emit(AccessoryEvent::Attached(descriptor));
    }

    /// Unplug an accessory: open streams end and a detach event is emitted
    pub fn detach(&self, id: ConnectionId) {
        let removed = self.state.accessories.lock().remove(&id);
        if let Some(attached) = removed {
            attached.unplugged.send_replace(true);
            debug!("Simulated accessory {} detached", id);
        }
        self.emit(AccessoryEvent::Detached(id));
    }

    /// Deliver a detach event without changing any state
    pub fn emit_detach(&self, id: ConnectionId) {
        self.emit(AccessoryEvent::Detached(id));
    }

    /// Queue the outcome of the next picker presentation
    pub fn script_picker(&self, outcome: Result<ConnectionId, PickerError>) {
        self.state.picker.lock().push_back(outcome);
    }

    /// Commands received by an accessory since the last call
    pub fn take_received(&self, id: ConnectionId) -> Vec<Vec<u8>> {
        self.state.received.lock().remove(&id).unwrap_or_default()
    }

    /// Number of successful `open_streams` calls
    pub fn open_count(&self) -> usize {
        self.state.opened.load(Ordering::Acquire)
    }

    fn emit(&self, event: AccessoryEvent) {
        if let Some(sink) = self.state.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }
}

#[async_trait]
impl AccessoryProvider for SimulatedProvider {
    fn connected_accessories(&self) -> Vec<AccessoryDescriptor> {
        self.state
            .accessories
            .lock()
            .values()
            .map(|a| a.accessory.descriptor.clone())
            .collect()
    }

    fn register_for_notifications(&self, sink: UnboundedSender<AccessoryEvent>) {
        *self.state.sink.lock() = Some(sink);
    }

    fn unregister_for_notifications(&self) {
        self.state.sink.lock().take();
    }

    async fn show_picker(
        &self,
        filter: &AccessoryFilter,
    ) -> Result<AccessoryDescriptor, PickerError> {
        let scripted = self.state.picker.lock().pop_front();
        let accessories = self.state.accessories.lock();

        match scripted {
            Some(Ok(id)) => accessories
                .get(&id)
                .map(|a| a.accessory.descriptor.clone())
                .ok_or_else(|| PickerError::Failed(format!("accessory {} not attached", id))),
            Some(Err(e)) => Err(e),
            None => accessories
                .values()
                .map(|a| &a.accessory.descriptor)
                .find(|d| filter.matches(d))
                .cloned()
                .ok_or_else(|| PickerError::Failed("no matching accessory".to_string())),
        }
    }

    async fn open_streams(
        &self,
        accessory: ConnectionId,
        protocol: &str,
    ) -> Result<StreamPair, TransportError> {
        let (responder, unplugged) = {
            let accessories = self.state.accessories.lock();
            let attached = accessories
                .get(&accessory)
                .ok_or(TransportError::AccessoryDetached(accessory))?;
            if !attached.accessory.descriptor.supports_protocol(protocol) {
                return Err(TransportError::NoSuchProtocol {
                    accessory,
                    protocol: protocol.to_string(),
                });
            }
            (
                attached.accessory.responder.clone(),
                attached.unplugged.subscribe(),
            )
        };

        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let (host_read, host_write) = tokio::io::split(host);
        let (device_read, device_write) = tokio::io::split(device);

        let task = DeviceTask {
            id: accessory,
            responder,
            unplugged,
            state: self.state.clone(),
        };
        tokio::spawn(task.run(device_read, device_write));

        self.state.opened.fetch_add(1, Ordering::AcqRel);
        trace!("Simulated streams opened for {} on {}", protocol, accessory);
        Ok(StreamPair::new(host_read, host_write))
    }
}

struct DeviceTask {
    id: ConnectionId,
    responder: Arc<dyn Responder>,
    unplugged: watch::Receiver<bool>,
    state: Arc<SimState>,
}

impl DeviceTask {
    async fn run(mut self, mut reader: ReadHalf<DuplexStream>, mut writer: WriteHalf<DuplexStream>) {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = self.unplugged.wait_for(|gone| *gone) => break,
            };
            decoder.extend(&buf[..n]);

            while let Some(frame) = decoder.next_frame() {
                if frame.kind != kind::APDU {
                    warn!("Simulated device ignoring frame kind 0x{:02x}", frame.kind);
                    continue;
                }

                self.state
                    .received
                    .lock()
                    .entry(self.id)
                    .or_default()
                    .push(frame.payload.to_vec());

                let reply = self.responder.respond(&frame.payload);
                if !self.play(reply, &mut reader, &mut writer).await {
                    trace!("Simulated device {} stopped", self.id);
                    return;
                }
            }
        }

        trace!("Simulated device {} stream ended", self.id);
    }

    /// Returns `false` once the device should stop serving
    async fn play(
        &mut self,
        reply: Reply,
        reader: &mut ReadHalf<DuplexStream>,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> bool {
        for step in reply.steps {
            match step {
                Step::Sleep(delay) => {
                    if !self.sleep(delay).await {
                        return false;
                    }
                }
                Step::Hang => {
                    // Swallow input until the host or the cable goes away
                    let mut sink = [0u8; 256];
                    loop {
                        tokio::select! {
                            read = reader.read(&mut sink) => match read {
                                Ok(0) | Err(_) => return false,
                                Ok(_) => {}
                            },
                            _ = self.unplugged.wait_for(|gone| *gone) => return false,
                        }
                    }
                }
                Step::WaitExtension => {
                    if writer.write_all(&encode_wait_extension()).await.is_err() {
                        return false;
                    }
                }
                Step::Raw(wire) => {
                    if writer.write_all(&wire).await.is_err() {
                        return false;
                    }
                }
                Step::Frame { payload, chunking } => {
                    let wire = match encode_response(&payload) {
                        Ok(wire) => wire,
                        Err(e) => {
                            warn!("Simulated device cannot frame response: {}", e);
                            return false;
                        }
                    };
                    for piece in split_wire(&wire, chunking) {
                        if writer.write_all(piece).await.is_err() {
                            return false;
                        }
                        if writer.flush().await.is_err() {
                            return false;
                        }
                        if !self.sleep(CHUNK_GAP).await {
                            return false;
                        }
                    }
                }
            }
        }
        writer.flush().await.is_ok()
    }

    async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.unplugged.wait_for(|gone| *gone) => false,
        }
    }
}

fn split_wire(wire: &[u8], chunking: Chunking) -> Vec<&[u8]> {
    match chunking {
        Chunking::Whole => vec![wire],
        Chunking::Even(chunks) => {
            let size = wire.len().div_ceil(chunks).max(1);
            wire.chunks(size).collect()
        }
        Chunking::Random => {
            let mut pieces = Vec::new();
            let mut rest = wire;
            while !rest.is_empty() {
                let (head, tail) = rest.split_at(fastrand::usize(1..=rest.len()));
                pieces.push(head);
                rest = tail;
            }
            pieces
        }
    }
}
