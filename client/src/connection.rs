//! Connection façade
//!
//! Turns "give me a PIV session" into a ready command channel. The façade
//! owns at most one physical connection (stream session + smart-card
//! interface) and at most one application session on it. Requests are
//! serialized on an internal lock; completions are always delivered from a
//! spawned task.
//!
//! ```text
//! Idle -> Connecting -> Ready -> SessionActive(kind)
//!   ^                     |            |
//!   +------ Closing <-----+------------+   (release, detach, transport failure)
//! ```

use crate::application::ApplicationSession;
use crate::capabilities::SharedCapabilities;
use crate::config::ClientConfig;
use crate::error::ConnectionError;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use ykacc_protocol::ApplicationKind;
use ykacc_transport::{
    AccessoryDescriptor, AccessoryEvent, AccessoryRegistry, ConnectionId, SmartCardInterface,
    StreamSession, TransportError,
};

/// Capacity of the session event broadcast channel
pub const SESSION_EVENT_CAPACITY: usize = 32;

/// What happens when a different application is requested while one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSwitchPolicy {
    /// Invalidate the active session and select the new application on the same stream
    #[default]
    Replace,
    /// Fail the request with `SessionKindConflict`
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    SessionActive(ApplicationKind),
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::SessionActive(kind) => write!(f, "{} session active", kind),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    Released,
    Replaced,
    AccessoryDetached,
    TransportFailure(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Invalidated {
        kind: ApplicationKind,
        reason: InvalidationReason,
    },
}

/// Completion of `request_application_session`
pub struct PendingSession {
    rx: oneshot::Receiver<Result<Arc<ApplicationSession>, ConnectionError>>,
}

impl Future for PendingSession {
    type Output = Result<Arc<ApplicationSession>, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ConnectionError::Cancelled)))
    }
}

/// Transport failure on the stream of one connection generation
#[derive(Debug, Clone)]
struct FailureNotice {
    generation: u64,
    error: TransportError,
}

struct ActiveConnection {
    generation: u64,
    accessory: AccessoryDescriptor,
    stream: Arc<StreamSession>,
    interface: Arc<SmartCardInterface>,
    session: Option<Arc<ApplicationSession>>,
    fault_monitor: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    connection: Option<ActiveConnection>,
    generation: u64,
}

enum WatchAction {
    Detached(ConnectionId),
    Failure(FailureNotice),
    Resync,
}

pub struct ConnectionFacade {
    registry: Arc<AccessoryRegistry>,
    capabilities: SharedCapabilities,
    config: ClientConfig,
    inner: AsyncMutex<Inner>,
    /// Lock-free view of the current connection
    current: Mutex<Option<(AccessoryDescriptor, Arc<SmartCardInterface>)>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    failures: mpsc::UnboundedSender<FailureNotice>,
    /// Bumped to cancel outstanding requests
    cancel: watch::Sender<u64>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionFacade {
    /// Create a façade on top of a registry
    ///
    /// Registers the registry for notifications and starts the detach
    /// watcher, so it must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<AccessoryRegistry>,
        capabilities: SharedCapabilities,
        config: ClientConfig,
    ) -> Arc<Self> {
        registry.register_for_notifications();

        let (state, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(0);

        let facade = Arc::new(Self {
            registry,
            capabilities,
            config,
            inner: AsyncMutex::new(Inner::default()),
            current: Mutex::new(None),
            state,
            events,
            failures,
            cancel,
            watcher: Mutex::new(None),
        });

        let watcher = Self::spawn_watcher(&facade, failures_rx);
        *facade.watcher.lock() = Some(watcher);
        facade
    }

    pub fn registry(&self) -> &Arc<AccessoryRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Raw APDU channel of the current connection
    pub fn smart_card_interface(&self) -> Option<Arc<SmartCardInterface>> {
        self.current.lock().as_ref().map(|(_, interface)| interface.clone())
    }

    /// Accessory the current connection runs on
    pub fn current_accessory(&self) -> Option<AccessoryDescriptor> {
        self.current.lock().as_ref().map(|(accessory, _)| accessory.clone())
    }

    /// Request a session to an on-device application
    ///
    /// Same kind while active resolves to the existing session. The result
    /// is delivered from a spawned task; `release_session` cancels requests
    /// still in progress.
    pub fn request_application_session(self: &Arc<Self>, kind: ApplicationKind) -> PendingSession {
        let (tx, rx) = oneshot::channel();
        let facade = self.clone();
        let mut cancelled = self.cancel.subscribe();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = facade.establish(kind) => result,
                _ = cancelled.changed() => {
                    debug!("{} session request cancelled", kind);
                    Err(ConnectionError::Cancelled)
                }
            };
            let _ = tx.send(result);
        });

        PendingSession { rx }
    }

    /// Callback flavour of `request_application_session`
    ///
    /// `completion` runs exactly once, on a spawned task.
    pub fn request_application_session_with<F>(self: &Arc<Self>, kind: ApplicationKind, completion: F)
    where
        F: FnOnce(Result<Arc<ApplicationSession>, ConnectionError>) + Send + 'static,
    {
        let pending = self.request_application_session(kind);
        tokio::spawn(async move {
            completion(pending.await);
        });
    }

    /// Close the application session and its stream; idempotent
    pub async fn release_session(&self) {
        self.cancel.send_modify(|epoch| *epoch = epoch.wrapping_add(1));

        let mut inner = self.inner.lock().await;
        match inner.connection.take() {
            Some(connection) => {
                self.set_state(ConnectionState::Closing);
                self.teardown(connection, InvalidationReason::Released).await;
                info!("Session released");
            }
            None => {
                self.current.lock().take();
                trace!("Nothing to release");
            }
        }
        self.set_state(ConnectionState::Idle);
    }

    async fn establish(
        &self,
        kind: ApplicationKind,
    ) -> Result<Arc<ApplicationSession>, ConnectionError> {
        if !self.capabilities.supports_accessory_transport() {
            warn!(
                "Host {} ({}) cannot use accessory keys",
                self.capabilities.device_model(),
                self.capabilities.system_version()
            );
            return Err(ConnectionError::UnsupportedHost);
        }

        let mut inner = self.inner.lock().await;

        let connection = match inner.connection.take() {
            Some(connection) if connection.stream.is_valid() => connection,
            stale => {
                if let Some(stale) = stale {
                    debug!("Dropping stale connection {}", stale.generation);
                    let reason = InvalidationReason::TransportFailure(TransportError::TransportClosed);
                    self.teardown(stale, reason).await;
                }

                inner.generation += 1;
                self.set_state(ConnectionState::Connecting);
                match self.connect(inner.generation).await {
                    Ok(connection) => {
                        self.set_state(ConnectionState::Ready);
                        connection
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Idle);
                        return Err(e);
                    }
                }
            }
        };
        let connection = inner.connection.insert(connection);

        if let Some(active) = connection.session.clone() {
            if active.is_valid() && active.kind() == kind {
                trace!("Reusing active {} session", kind);
                return Ok(active);
            }

            if active.is_valid() && self.config.session.switch_policy == SessionSwitchPolicy::Reject
            {
                return Err(ConnectionError::SessionKindConflict {
                    active: active.kind(),
                    requested: kind,
                });
            }

            connection.session = None;
            if active.invalidate() {
                self.emit(active.kind(), InvalidationReason::Replaced);
            }
            self.set_state(ConnectionState::Ready);
        }

        let interface = connection.interface.clone();

        match interface.select(kind).await {
            Ok(response) => {
                let session = Arc::new(ApplicationSession::new(kind, interface, response));
                if let Some(connection) = inner.connection.as_mut() {
                    connection.session = Some(session.clone());
                }
                self.set_state(ConnectionState::SessionActive(kind));
                info!("{} session active", kind);
                Ok(session)
            }
            Err(e) if e.is_transport_failure() => {
                if let Some(connection) = inner.connection.take() {
                    self.set_state(ConnectionState::Closing);
                    self.teardown(connection, InvalidationReason::TransportFailure(e.clone()))
                        .await;
                }
                self.set_state(ConnectionState::Idle);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn connect(&self, generation: u64) -> Result<ActiveConnection, ConnectionError> {
        let accessory = self.find_accessory().await?;
        let protocol = &self.config.accessory.protocol;

        let stream = StreamSession::open(&self.registry, &accessory, protocol).await?;
        let interface = Arc::new(SmartCardInterface::new(
            stream.clone(),
            self.config.smart_card.to_interface_config(),
        ));

        let fault_monitor = self.spawn_fault_monitor(generation, &stream);

        *self.current.lock() = Some((accessory.clone(), interface.clone()));
        info!(
            "Connected to {} ({}) over {}",
            accessory.name, accessory.connection_id, protocol
        );

        Ok(ActiveConnection {
            generation,
            accessory,
            stream,
            interface,
            session: None,
            fault_monitor,
        })
    }

    /// Forward the first fault of a stream to the watcher
    ///
    /// Covers every user of the stream: application sessions, the raw
    /// interface and transmits dropped mid-exchange.
    fn spawn_fault_monitor(&self, generation: u64, stream: &StreamSession) -> JoinHandle<()> {
        let mut fault = stream.watch_fault();
        let failures = self.failures.clone();

        tokio::spawn(async move {
            let error = match fault.wait_for(Option::is_some).await {
                Ok(fault) => fault.clone(),
                // Stream session dropped
                Err(_) => return,
            };
            if let Some(error) = error {
                let _ = failures.send(FailureNotice { generation, error });
            }
        })
    }

    /// First attached accessory matching the configuration, waiting for one
    /// to attach if necessary
    async fn find_accessory(&self) -> Result<AccessoryDescriptor, ConnectionError> {
        let filter = self.config.accessory.filter();
        let find_attached = || {
            self.registry
                .list_connected_accessories()
                .into_iter()
                .find(|d| filter.matches(d))
        };

        // Subscribe before the snapshot so an attach in between is not lost
        let mut events = self.registry.subscribe();
        if let Some(accessory) = find_attached() {
            return Ok(accessory);
        }

        let waited = self.config.accessory.connect_timeout();
        let no_accessory = || ConnectionError::NoAccessory {
            protocol: self.config.accessory.protocol.clone(),
            waited,
        };
        debug!("No matching accessory attached, waiting up to {:?}", waited);

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(AccessoryEvent::Attached(accessory)) if filter.matches(&accessory) => {
                        return Ok(accessory);
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => {
                        if let Some(accessory) = find_attached() {
                            return Ok(accessory);
                        }
                    }
                    Err(RecvError::Closed) => return Err(no_accessory()),
                }
            }
        };

        tokio::time::timeout(waited, wait)
            .await
            .unwrap_or_else(|_| Err(no_accessory()))
    }

    async fn teardown(&self, connection: ActiveConnection, reason: InvalidationReason) {
        connection.fault_monitor.abort();
        if let Some(session) = connection.session {
            if session.invalidate() {
                self.emit(session.kind(), reason.clone());
            }
        }

        {
            let mut current = self.current.lock();
            if current
                .as_ref()
                .is_some_and(|(_, interface)| Arc::ptr_eq(interface, &connection.interface))
            {
                *current = None;
            }
        }

        connection.stream.close().await;
        debug!(
            "Connection {} to {} torn down ({:?})",
            connection.generation, connection.accessory.connection_id, reason
        );
    }

    fn emit(&self, kind: ApplicationKind, reason: InvalidationReason) {
        let _ = self.events.send(SessionEvent::Invalidated { kind, reason });
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Connection state -> {}", next);
        }
    }

    fn spawn_watcher(
        facade: &Arc<Self>,
        mut failures: mpsc::UnboundedReceiver<FailureNotice>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(facade);
        let mut accessory_events = facade.registry.subscribe();

        tokio::spawn(async move {
            loop {
                let action = tokio::select! {
                    event = accessory_events.recv() => match event {
                        Ok(AccessoryEvent::Detached(id)) => WatchAction::Detached(id),
                        Ok(AccessoryEvent::Attached(_)) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Missed {} accessory events, resynchronizing", skipped);
                            WatchAction::Resync
                        }
                        Err(RecvError::Closed) => break,
                    },
                    notice = failures.recv() => match notice {
                        Some(notice) => WatchAction::Failure(notice),
                        None => break,
                    },
                };

                let Some(facade) = weak.upgrade() else {
                    break;
                };
                facade.handle(action).await;
            }
            trace!("Connection watcher stopped");
        })
    }

    async fn handle(&self, action: WatchAction) {
        let mut inner = self.inner.lock().await;
        let Some(connection) = inner.connection.as_ref() else {
            return;
        };

        let reason = match action {
            WatchAction::Detached(id) if id == connection.accessory.connection_id => {
                warn!("Accessory {} detached, tearing down connection", id);
                InvalidationReason::AccessoryDetached
            }
            WatchAction::Failure(notice) if notice.generation == connection.generation => {
                warn!("Transport failure, tearing down connection: {}", notice.error);
                InvalidationReason::TransportFailure(notice.error)
            }
            WatchAction::Resync if !self.registry.is_attached(connection.accessory.connection_id) => {
                InvalidationReason::AccessoryDetached
            }
            _ => return,
        };

        if let Some(connection) = inner.connection.take() {
            self.set_state(ConnectionState::Closing);
            self.teardown(connection, reason).await;
            self.set_state(ConnectionState::Idle);
        }
    }
}

impl Drop for ConnectionFacade {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StaticCapabilities;
    use std::time::Duration;
    use ykacc_transport::simulator::{SimulatedAccessory, SimulatedProvider};

    fn facade_with(sim: &SimulatedProvider, config: ClientConfig) -> Arc<ConnectionFacade> {
        let registry = AccessoryRegistry::new(Arc::new(sim.clone()));
        ConnectionFacade::new(
            registry,
            Arc::new(StaticCapabilities::simulated()),
            config,
        )
    }

    fn quick_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.accessory.connect_timeout_ms = 100;
        config
    }

    #[tokio::test]
    async fn test_request_reaches_session_active() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let facade = facade_with(&sim, quick_config());
        assert_eq!(facade.state(), ConnectionState::Idle);

        let session = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap();
        assert_eq!(session.kind(), ApplicationKind::Piv);
        assert!(session.is_valid());
        assert_eq!(
            facade.state(),
            ConnectionState::SessionActive(ApplicationKind::Piv)
        );
        assert!(facade.smart_card_interface().is_some());
        assert_eq!(
            facade.current_accessory().map(|a| a.connection_id),
            Some(ConnectionId(1))
        );
    }

    #[tokio::test]
    async fn test_same_kind_reuses_session() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let facade = facade_with(&sim, quick_config());

        let first = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap();
        let second = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sim.open_count(), 1);
    }

    #[tokio::test]
    async fn test_no_accessory() {
        let sim = SimulatedProvider::new();
        let facade = facade_with(&sim, quick_config());

        let err = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NoAccessory { .. }));
        assert_eq!(facade.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_waits_for_attach() {
        let sim = SimulatedProvider::new();
        let mut config = ClientConfig::default();
        config.accessory.connect_timeout_ms = 2_000;
        let facade = facade_with(&sim, config);

        let pending = facade.request_application_session(ApplicationKind::Oath);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sim.attach(SimulatedAccessory::yubikey(7));

        let session = pending.await.unwrap();
        assert_eq!(session.kind(), ApplicationKind::Oath);
    }

    #[tokio::test]
    async fn test_unsupported_host() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let registry = AccessoryRegistry::new(Arc::new(sim.clone()));
        let facade = ConnectionFacade::new(
            registry,
            Arc::new(StaticCapabilities::new("9.0", "iPhone8")),
            quick_config(),
        );

        let err = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::UnsupportedHost);
        assert_eq!(sim.open_count(), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let facade = facade_with(&sim, quick_config());
        let mut events = facade.subscribe_events();

        let session = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap();
        facade.release_session().await;
        facade.release_session().await;

        assert_eq!(facade.state(), ConnectionState::Idle);
        assert!(!session.is_valid());
        assert!(facade.smart_card_interface().is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Invalidated {
                kind: ApplicationKind::Piv,
                reason: InvalidationReason::Released,
            }
        );
        assert_eq!(
            session.transmit(&[0x00, 0x01, 0x00, 0x00]).await.unwrap_err(),
            ConnectionError::SessionInvalidated
        );
        assert_eq!(facade.registry().open_claims(), 0);
    }

    #[tokio::test]
    async fn test_switch_policy_replace() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let facade = facade_with(&sim, quick_config());
        let mut events = facade.subscribe_events();

        let piv = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap();
        let oath = facade
            .request_application_session(ApplicationKind::Oath)
            .await
            .unwrap();

        assert!(!piv.is_valid());
        assert!(oath.is_valid());
        assert_eq!(sim.open_count(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Invalidated {
                kind: ApplicationKind::Piv,
                reason: InvalidationReason::Replaced,
            }
        );
    }

    #[tokio::test]
    async fn test_switch_policy_reject() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let mut config = quick_config();
        config.session.switch_policy = SessionSwitchPolicy::Reject;
        let facade = facade_with(&sim, config);

        let piv = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap();
        let err = facade
            .request_application_session(ApplicationKind::Oath)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ConnectionError::SessionKindConflict {
                active: ApplicationKind::Piv,
                requested: ApplicationKind::Oath,
            }
        );
        assert!(piv.is_valid());
    }

    #[tokio::test]
    async fn test_application_not_available_keeps_connection() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1).with_responder(
            |_: &[u8]| ykacc_transport::simulator::Reply::response(vec![0x6A, 0x82]),
        ));
        let facade = facade_with(&sim, quick_config());

        let err = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConnectionError::Transport(TransportError::ApplicationNotAvailable {
                kind: ApplicationKind::Piv,
                sw: 0x6A82,
            })
        );
        assert_eq!(facade.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_detach_returns_to_idle() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let facade = facade_with(&sim, quick_config());
        let mut events = facade.subscribe_events();

        let session = facade
            .request_application_session(ApplicationKind::Piv)
            .await
            .unwrap();
        sim.detach(ConnectionId(1));

        let mut state = facade.watch_state();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ConnectionState::Idle),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(!session.is_valid());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Invalidated {
                kind: ApplicationKind::Piv,
                reason: InvalidationReason::AccessoryDetached,
            }
        );
    }

    #[tokio::test]
    async fn test_release_cancels_pending_request() {
        let sim = SimulatedProvider::new();
        let mut config = ClientConfig::default();
        config.accessory.connect_timeout_ms = 10_000;
        let facade = facade_with(&sim, config);

        let pending = facade.request_application_session(ApplicationKind::Piv);
        tokio::time::sleep(Duration::from_millis(20)).await;
        facade.release_session().await;

        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ConnectionError::Cancelled);
        assert_eq!(facade.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_callback_invoked_once() {
        let sim = SimulatedProvider::new();
        sim.attach(SimulatedAccessory::yubikey(1));
        let facade = facade_with(&sim, quick_config());

        let (tx, rx) = oneshot::channel();
        facade.request_application_session_with(ApplicationKind::Management, move |result| {
            let _ = tx.send(result.map(|s| s.kind()));
        });

        assert_eq!(rx.await.unwrap(), Ok(ApplicationKind::Management));
    }
}
