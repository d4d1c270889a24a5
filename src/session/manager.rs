//! Session-Manager - serialisierte Anruf-Verwaltung
//!
//! Der Manager erzwingt die Invariante "höchstens eine aktive Session"
//! und fährt den Zustandsautomaten. Alle Mutationen laufen durch eine
//! einzige Treiber-Task: Kommandos der Präsentationsschicht (mit
//! Oneshot-Antwort) und [`PeerEvent`]s des Substrats werden in einer
//! Select-Schleife strikt nacheinander verarbeitet. Timeouts sind
//! Fristen innerhalb derselben Schleife, kein Timer kann nach einem
//! Übergang verspätet feuern.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::call::CallSession;
use super::events::{SessionEndReason, SessionEvent, SessionPhase};
use crate::config::CallConfig;
use crate::media::LocalMedia;
use crate::peer::{
    CallHandle, CallId, ConnectFailure, PeerConnectionService, PeerEvent, PeerId,
    PeerServiceError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    /// Es ist bereits eine Session aktiv; die bestehende bleibt unberührt
    #[error("A call session is already active")]
    Busy,

    /// Keine gültige Registrierung beim Broker
    #[error("Not registered with the broker")]
    RegistrationFailed,

    /// Kein eingehender Anruf wartet auf eine Entscheidung
    #[error("No incoming call awaiting a decision")]
    NoPendingOffer,

    /// Fehler des Verbindungs-Substrats
    #[error(transparent)]
    Service(#[from] PeerServiceError),

    /// Die Treiber-Task läuft nicht mehr
    #[error("Session manager is shut down")]
    Shutdown,
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Kommandos der Präsentationsschicht; die Antwort kommt synchron über
/// den Oneshot-Kanal (Busy-Fehler sofort, nie verzögert)
enum Command {
    Dial {
        remote: PeerId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decide {
        accept: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ReRegister {
        desired: Option<PeerId>,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

// ============================================================================
// MANAGER HANDLE
// ============================================================================

/// Handle auf den Session-Manager
///
/// Billig klonbar; alle Klone sprechen mit derselben Treiber-Task.
#[derive(Clone)]
pub struct CallSessionManager {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<SessionEvent>,
    phase_rx: watch::Receiver<SessionPhase>,
    identity_rx: watch::Receiver<Option<PeerId>>,
}

impl CallSessionManager {
    /// Startet den Manager: bindet die Event-Queue, registriert beim
    /// Broker und spawnt die Treiber-Task
    ///
    /// Nimmt bereits akquirierte Medien entgegen; vor erfolgreicher
    /// Akquise kann es damit keinerlei Anruf-Aktion geben.
    pub async fn start(
        service: Arc<dyn PeerConnectionService>,
        media: LocalMedia,
        config: CallConfig,
    ) -> Result<Self, CallError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_capacity);
        let (peer_tx, peer_rx) = mpsc::channel(config.queue_capacity);
        service.bind_events(peer_tx);

        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
        let (identity_tx, identity_rx) = watch::channel(None);

        // Initiale Registrierung; Ausgang kommt als Opened/Errored Event
        service.register(config.desired_peer_id.clone()).await?;

        let driver = Driver {
            service,
            media,
            config,
            events: event_tx.clone(),
            phase_tx,
            identity_tx,
            registered: false,
            session: None,
            handle: None,
            awaiting_decision: false,
            deadline: None,
        };
        tokio::spawn(driver.run(cmd_rx, peer_rx));

        Ok(Self {
            cmd_tx,
            event_tx,
            phase_rx,
            identity_rx,
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Aktuelle Phase des Managers
    pub fn phase(&self) -> SessionPhase {
        self.phase_rx.borrow().clone()
    }

    /// Zugewiesene lokale Identität (falls registriert)
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.identity_rx.borrow().clone()
    }

    /// Startet einen ausgehenden Anruf
    pub async fn dial(&self, remote: PeerId) -> Result<(), CallError> {
        self.request(|reply| Command::Dial { remote, reply }).await
    }

    /// Entscheidet über den wartenden eingehenden Anruf
    pub async fn decide(&self, accept: bool) -> Result<(), CallError> {
        self.request(|reply| Command::Decide { accept, reply }).await
    }

    /// Beendet die aktive Session; ohne Session ein No-Op
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Hangup { reply }).await
    }

    /// Gibt die Registrierung frei und registriert neu; nur aus Idle
    pub async fn re_register(&self, desired: Option<PeerId>) -> Result<(), CallError> {
        self.request(|reply| Command::ReRegister { desired, reply })
            .await
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), CallError>>) -> Command,
    ) -> Result<(), CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| CallError::Shutdown)?;
        reply_rx.await.map_err(|_| CallError::Shutdown)?
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("phase", &self.phase())
            .field("local_peer_id", &self.local_peer_id())
            .finish()
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Laufende Frist für Wählen bzw. Klingeln
struct Deadline {
    call: CallId,
    at: Instant,
    reason: SessionEndReason,
}

/// Der einzige Mutator des Session-Zustands
struct Driver {
    service: Arc<dyn PeerConnectionService>,
    media: LocalMedia,
    config: CallConfig,
    events: broadcast::Sender<SessionEvent>,
    phase_tx: watch::Sender<SessionPhase>,
    identity_tx: watch::Sender<Option<PeerId>>,
    registered: bool,
    session: Option<CallSession>,
    /// Substrat-Handle der aktiven Session (bei Ringing: das wartende Offer)
    handle: Option<Box<dyn CallHandle>>,
    /// Genau eine Entscheidung konsumiert das wartende Offer
    awaiting_decision: bool,
    deadline: Option<Deadline>,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut peer_rx: mpsc::Receiver<PeerEvent>) {
        loop {
            let deadline_at = self.deadline.as_ref().map(|d| d.at);

            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                maybe_event = peer_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_peer_event(event).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline_at.unwrap_or_else(Instant::now)),
                        if deadline_at.is_some() => {
                    self.handle_deadline().await;
                }
            }
        }

        tracing::debug!("Session driver stopping");
        self.end_session(SessionEndReason::HungUp).await;
        self.service.teardown().await;
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { remote, reply } => {
                let _ = reply.send(self.start_outgoing(remote).await);
            }
            Command::Decide { accept, reply } => {
                let _ = reply.send(self.decide(accept).await);
            }
            Command::Hangup { reply } => {
                let _ = reply.send(self.hangup().await);
            }
            Command::ReRegister { desired, reply } => {
                let _ = reply.send(self.re_register(desired).await);
            }
        }
    }

    async fn start_outgoing(&mut self, remote: PeerId) -> Result<(), CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }
        if !self.registered {
            return Err(CallError::RegistrationFailed);
        }

        let handle = self.service.dial(&remote, &self.media).await?;
        let call = handle.id();
        tracing::info!("Outgoing call {} to {}", call, remote);

        self.session = Some(CallSession::outgoing(call, remote.clone()));
        self.handle = Some(handle);
        self.deadline = Some(Deadline {
            call,
            at: Instant::now() + self.config.dial_timeout,
            reason: SessionEndReason::DialTimeout,
        });
        self.set_phase(SessionPhase::Dialing { remote });
        Ok(())
    }

    async fn decide(&mut self, accept: bool) -> Result<(), CallError> {
        if !self.awaiting_decision {
            if !self.registered {
                return Err(CallError::RegistrationFailed);
            }
            return Err(CallError::NoPendingOffer);
        }
        self.awaiting_decision = false;

        if !accept {
            tracing::info!("Incoming call rejected locally");
            self.end_session(SessionEndReason::Rejected).await;
            return Ok(());
        }

        let accept_result = match self.handle.as_ref() {
            Some(handle) => handle.accept(&self.media).await,
            None => return Err(CallError::NoPendingOffer),
        };

        if let Err(e) = accept_result {
            tracing::error!("Accepting incoming call failed: {}", e);
            self.end_session(SessionEndReason::ConnectionFailed).await;
            return Err(CallError::Service(e));
        }

        // Nach dem Accept gilt die Wähl-Frist, bis die Medien da sind
        if let Some(session) = self.session.as_ref() {
            self.deadline = Some(Deadline {
                call: session.id(),
                at: Instant::now() + self.config.dial_timeout,
                reason: SessionEndReason::DialTimeout,
            });
        }
        Ok(())
    }

    async fn hangup(&mut self) -> Result<(), CallError> {
        match self.session.as_ref() {
            Some(session) if session.can_hangup() => {
                self.end_session(SessionEndReason::HungUp).await;
                Ok(())
            }
            // Auflegen ohne aktive Session ist bewusst ein No-Op
            _ => Ok(()),
        }
    }

    async fn re_register(&mut self, desired: Option<PeerId>) -> Result<(), CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }

        // Alte Identität zuerst freigeben
        self.registered = false;
        let _ = self.identity_tx.send(None);
        self.service.teardown().await;

        self.service.register(desired).await?;
        Ok(())
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Opened { assigned } => {
                tracing::info!("Identity assigned: {}", assigned);
                self.registered = true;
                let _ = self.identity_tx.send(Some(assigned.clone()));
                self.emit(SessionEvent::IdentityAssigned(assigned));
            }

            PeerEvent::Errored { reason } => {
                tracing::error!("Registration failed: {}", reason);
                self.registered = false;
                let _ = self.identity_tx.send(None);
                self.emit(SessionEvent::RegistrationFailed { reason });
            }

            PeerEvent::IncomingCall { from, handle } => {
                // Busy-Policy: das Angebot wird ohne Entscheidungspunkt
                // abgewiesen, die bestehende Session bleibt unberührt
                if self.session.is_some() || !self.registered {
                    tracing::info!("Refusing incoming call from {} while busy", from);
                    handle.shutdown().await;
                    return;
                }

                let call = handle.id();
                tracing::info!("Incoming call {} from {}", call, from);

                self.session = Some(CallSession::incoming(call, from.clone()));
                self.handle = Some(handle);
                self.awaiting_decision = true;
                self.deadline = Some(Deadline {
                    call,
                    at: Instant::now() + self.config.ring_timeout,
                    reason: SessionEndReason::RingTimeout,
                });
                self.set_phase(SessionPhase::Ringing {
                    remote: from.clone(),
                });
                self.emit(SessionEvent::IncomingCallOffered { from });
            }

            PeerEvent::StreamReady { call, media } => {
                if !self.is_active_call(call) {
                    tracing::debug!("Ignoring stream for stale call {}", call);
                    return;
                }
                if self.awaiting_decision {
                    tracing::warn!("Stream before decision for call {}, ignoring", call);
                    return;
                }

                let connected = {
                    let Some(session) = self.session.as_mut() else {
                        return;
                    };
                    let remote = session.remote_peer().clone();
                    match session.connect(media.clone()) {
                        Ok(()) => Some(remote),
                        Err(e) => {
                            tracing::warn!("Ignoring stream event: {}", e);
                            None
                        }
                    }
                };

                if let Some(remote) = connected {
                    tracing::info!("Call {} connected", call);
                    self.deadline = None;
                    self.set_phase(SessionPhase::Connected { remote });
                    self.emit(SessionEvent::RemoteMediaAvailable(media));
                }
            }

            PeerEvent::ConnectionFailed { call, reason } => {
                if !self.is_active_call(call) {
                    tracing::debug!("Ignoring failure for stale call {}", call);
                    return;
                }
                tracing::warn!("Call {} failed: {}", call, reason);

                let end = match reason {
                    ConnectFailure::Rejected { .. } => SessionEndReason::RemoteRejected,
                    ConnectFailure::Transport(_) => SessionEndReason::ConnectionFailed,
                };
                self.end_session(end).await;
            }

            PeerEvent::PeerDisconnected { call } => {
                if !self.is_active_call(call) {
                    tracing::debug!("Ignoring disconnect for stale call {}", call);
                    return;
                }
                self.end_session(SessionEndReason::PeerDisconnected).await;
            }
        }
    }

    async fn handle_deadline(&mut self) {
        let Some(deadline) = self.deadline.take() else {
            return;
        };
        if !self.is_active_call(deadline.call) {
            return;
        }

        tracing::info!("Call {} timed out: {}", deadline.call, deadline.reason);
        self.end_session(deadline.reason).await;
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn is_active_call(&self, call: CallId) -> bool {
        self.session.as_ref().map(|s| s.id()) == Some(call)
    }

    /// Terminiert die aktive Session, gibt Handle und Medien frei und
    /// kehrt nach Idle zurück; ohne Session ein No-Op
    async fn end_session(&mut self, reason: SessionEndReason) {
        self.deadline = None;
        self.awaiting_decision = false;

        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }

        if let Some(mut session) = self.session.take() {
            session.terminate();
            tracing::info!("Session {} ended: {}", session.id(), reason);
            self.set_phase(SessionPhase::Idle);
            self.emit(SessionEvent::SessionEnded { reason });
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        let _ = self.phase_tx.send(phase.clone());
        self.emit(SessionEvent::StateChanged(phase));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::RemoteMedia;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Mock-Substrat mit steuerbarem Event-Feed
    // ------------------------------------------------------------------

    struct MockHandle {
        id: CallId,
        remote: PeerId,
        accepted: Arc<AtomicBool>,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl CallHandle for MockHandle {
        fn id(&self) -> CallId {
            self.id
        }

        fn remote_peer(&self) -> &PeerId {
            &self.remote
        }

        async fn accept(&self, _media: &LocalMedia) -> Result<(), PeerServiceError> {
            self.accepted.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockService {
        sink: Mutex<Option<mpsc::Sender<PeerEvent>>>,
        dialed: Mutex<Vec<(PeerId, CallId)>>,
        registrations: Mutex<Vec<Option<PeerId>>>,
        teardowns: AtomicUsize,
    }

    impl MockService {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        async fn push(&self, event: PeerEvent) {
            let sink = self.sink.lock().clone().expect("no event sink bound");
            sink.send(event).await.expect("manager queue closed");
        }

        fn last_dialed_call(&self) -> CallId {
            self.dialed.lock().last().expect("no dial recorded").1
        }

        /// Baut ein eingehendes Anruf-Event mit beobachtbarem Handle
        fn incoming(&self, from: &str) -> (PeerEvent, CallId, Arc<AtomicUsize>, Arc<AtomicBool>) {
            let call = CallId::new();
            let shutdowns = Arc::new(AtomicUsize::new(0));
            let accepted = Arc::new(AtomicBool::new(false));
            let handle = MockHandle {
                id: call,
                remote: PeerId::new(from),
                accepted: Arc::clone(&accepted),
                shutdowns: Arc::clone(&shutdowns),
            };
            let event = PeerEvent::IncomingCall {
                from: PeerId::new(from),
                handle: Box::new(handle),
            };
            (event, call, shutdowns, accepted)
        }
    }

    #[async_trait::async_trait]
    impl PeerConnectionService for MockService {
        fn bind_events(&self, sink: mpsc::Sender<PeerEvent>) {
            *self.sink.lock() = Some(sink);
        }

        async fn register(&self, desired: Option<PeerId>) -> Result<(), PeerServiceError> {
            self.registrations.lock().push(desired);
            Ok(())
        }

        async fn dial(
            &self,
            remote: &PeerId,
            _media: &LocalMedia,
        ) -> Result<Box<dyn CallHandle>, PeerServiceError> {
            let call = CallId::new();
            self.dialed.lock().push((remote.clone(), call));
            Ok(Box::new(MockHandle {
                id: call,
                remote: remote.clone(),
                accepted: Arc::new(AtomicBool::new(false)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }))
        }

        async fn teardown(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn setup() -> (
        CallSessionManager,
        Arc<MockService>,
        broadcast::Receiver<SessionEvent>,
    ) {
        setup_with(CallConfig::default()).await
    }

    async fn setup_with(
        config: CallConfig,
    ) -> (
        CallSessionManager,
        Arc<MockService>,
        broadcast::Receiver<SessionEvent>,
    ) {
        let service = MockService::new();
        let manager = CallSessionManager::start(service.clone(), LocalMedia::stub(), config)
            .await
            .unwrap();
        let events = manager.subscribe();
        (manager, service, events)
    }

    async fn open(service: &MockService, id: &str) {
        service
            .push(PeerEvent::Opened {
                assigned: PeerId::new(id),
            })
            .await;
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    /// Wartet bis die Treiber-Task eine Bedingung hergestellt hat
    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not met in time");
    }

    fn assert_no_pending_events(rx: &mut broadcast::Receiver<SessionEvent>) {
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            other => panic!("unexpected pending event: {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_full_call_scenario() -> anyhow::Result<()> {
        let (manager, service, mut events) = setup().await;

        open(&service, "abc123").await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::IdentityAssigned(id) if id.as_str() == "abc123"
        ));
        assert_eq!(manager.local_peer_id(), Some(PeerId::new("abc123")));

        manager.dial(PeerId::new("xyz789")).await?;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionPhase::Dialing { remote }) if remote.as_str() == "xyz789"
        ));

        let call = service.last_dialed_call();
        service
            .push(PeerEvent::StreamReady {
                call,
                media: RemoteMedia::stub(call),
            })
            .await;

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionPhase::Connected { .. })
        ));
        match next_event(&mut events).await {
            SessionEvent::RemoteMediaAvailable(media) => assert_eq!(media.call(), call),
            other => panic!("expected remote media, got {:?}", other),
        }
        assert!(matches!(
            manager.phase(),
            SessionPhase::Connected { remote } if remote.as_str() == "xyz789"
        ));

        manager.hangup().await?;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionPhase::Idle)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionEnded {
                reason: SessionEndReason::HungUp
            }
        ));
        assert!(manager.phase().is_idle());
        Ok(())
    }

    #[tokio::test]
    async fn test_dial_while_busy_leaves_session_untouched() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;

        // Zweiter Wählversuch während Dialing
        let err = manager.dial(PeerId::new("other")).await.unwrap_err();
        assert!(matches!(err, CallError::Busy));
        assert!(matches!(
            manager.phase(),
            SessionPhase::Dialing { remote } if remote.as_str() == "xyz789"
        ));

        // Auch während Connected
        let call = service.last_dialed_call();
        service
            .push(PeerEvent::StreamReady {
                call,
                media: RemoteMedia::stub(call),
            })
            .await;
        let _ = next_event(&mut events).await;
        let _ = next_event(&mut events).await;

        let err = manager.dial(PeerId::new("other")).await.unwrap_err();
        assert!(matches!(err, CallError::Busy));
        assert!(matches!(manager.phase(), SessionPhase::Connected { .. }));
    }

    #[tokio::test]
    async fn test_dial_while_ringing_leaves_offer_pending() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        let (event, _call, shutdowns, accepted) = service.incoming("caller-1");
        service.push(event).await;
        let _ = next_event(&mut events).await; // Ringing
        let _ = next_event(&mut events).await; // Offered

        let err = manager.dial(PeerId::new("other")).await.unwrap_err();
        assert!(matches!(err, CallError::Busy));
        assert!(matches!(
            manager.phase(),
            SessionPhase::Ringing { remote } if remote.as_str() == "caller-1"
        ));

        // Die offene Entscheidung bleibt konsumierbar
        manager.decide(true).await.unwrap();
        assert!(accepted.load(Ordering::SeqCst));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_errored_before_opened_blocks_calls() {
        let (manager, service, mut events) = setup().await;

        service
            .push(PeerEvent::Errored {
                reason: "broker error 500: boom".to_string(),
            })
            .await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::RegistrationFailed { .. }
        ));
        assert!(manager.local_peer_id().is_none());

        let err = manager.dial(PeerId::new("xyz789")).await.unwrap_err();
        assert!(matches!(err, CallError::RegistrationFailed));

        let err = manager.decide(true).await.unwrap_err();
        assert!(matches!(err, CallError::RegistrationFailed));

        // Niemals ein IdentityAssigned
        assert_no_pending_events(&mut events);
    }

    #[tokio::test]
    async fn test_incoming_rejected_returns_to_idle() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        let (event, _call, shutdowns, accepted) = service.incoming("caller-1");
        service.push(event).await;

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionPhase::Ringing { remote }) if remote.as_str() == "caller-1"
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::IncomingCallOffered { from } if from.as_str() == "caller-1"
        ));

        manager.decide(false).await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionPhase::Idle)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionEnded {
                reason: SessionEndReason::Rejected
            }
        ));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!accepted.load(Ordering::SeqCst));

        // Kein RemoteMediaAvailable, keine weitere Entscheidung möglich
        assert_no_pending_events(&mut events);
        let err = manager.decide(false).await.unwrap_err();
        assert!(matches!(err, CallError::NoPendingOffer));
    }

    #[tokio::test]
    async fn test_incoming_accepted_connects_once() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        let (event, call, _shutdowns, accepted) = service.incoming("caller-1");
        service.push(event).await;
        let _ = next_event(&mut events).await; // Ringing
        let _ = next_event(&mut events).await; // Offered

        manager.decide(true).await.unwrap();
        assert!(accepted.load(Ordering::SeqCst));

        // Doppelte Entscheidung wird abgewiesen
        let err = manager.decide(true).await.unwrap_err();
        assert!(matches!(err, CallError::NoPendingOffer));

        service
            .push(PeerEvent::StreamReady {
                call,
                media: RemoteMedia::stub(call),
            })
            .await;

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionPhase::Connected { .. })
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::RemoteMediaAvailable(media) if media.call() == call
        ));
        assert_no_pending_events(&mut events);
    }

    #[tokio::test]
    async fn test_hangup_is_noop_without_session() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        // Auflegen aus Idle: Ok, kein Event
        manager.hangup().await.unwrap();
        assert_no_pending_events(&mut events);

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;
        let call = service.last_dialed_call();
        service
            .push(PeerEvent::StreamReady {
                call,
                media: RemoteMedia::stub(call),
            })
            .await;
        let _ = next_event(&mut events).await;
        let _ = next_event(&mut events).await;

        manager.hangup().await.unwrap();
        let _ = next_event(&mut events).await; // Idle
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionEnded {
                reason: SessionEndReason::HungUp
            }
        ));

        // Zweites Auflegen: No-Op, kein zweites SessionEnded
        manager.hangup().await.unwrap();
        assert_no_pending_events(&mut events);
    }

    #[tokio::test]
    async fn test_incoming_while_busy_is_refused_silently() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;

        let (event, _call, shutdowns, _) = service.incoming("caller-2");
        service.push(event).await;

        wait_until(|| shutdowns.load(Ordering::SeqCst) == 1).await;
        assert!(matches!(manager.phase(), SessionPhase::Dialing { .. }));
        // Kein Entscheidungspunkt wurde angeboten
        assert_no_pending_events(&mut events);
    }

    #[tokio::test]
    async fn test_stale_call_events_are_ignored() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;

        // Events für einen fremden Anruf ändern nichts
        let stale = CallId::new();
        service
            .push(PeerEvent::StreamReady {
                call: stale,
                media: RemoteMedia::stub(stale),
            })
            .await;
        service.push(PeerEvent::PeerDisconnected { call: stale }).await;

        let call = service.last_dialed_call();
        service
            .push(PeerEvent::StreamReady {
                call,
                media: RemoteMedia::stub(call),
            })
            .await;

        // Das erste beobachtbare Event ist der echte Verbindungsaufbau
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(SessionPhase::Connected { .. })
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::RemoteMediaAvailable(media) if media.call() == call
        ));
    }

    #[tokio::test]
    async fn test_remote_reject_ends_dialing_session() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;

        let call = service.last_dialed_call();
        service
            .push(PeerEvent::ConnectionFailed {
                call,
                reason: ConnectFailure::Rejected {
                    reason: Some("busy".to_string()),
                },
            })
            .await;

        let _ = next_event(&mut events).await; // Idle
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionEnded {
                reason: SessionEndReason::RemoteRejected
            }
        ));
        assert!(manager.phase().is_idle());
    }

    #[tokio::test]
    async fn test_peer_disconnect_ends_connected_session() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;
        let call = service.last_dialed_call();
        service
            .push(PeerEvent::StreamReady {
                call,
                media: RemoteMedia::stub(call),
            })
            .await;
        let _ = next_event(&mut events).await;
        let _ = next_event(&mut events).await;

        service.push(PeerEvent::PeerDisconnected { call }).await;

        let _ = next_event(&mut events).await; // Idle
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionEnded {
                reason: SessionEndReason::PeerDisconnected
            }
        ));
        assert!(manager.phase().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout_ends_session() {
        let mut config = CallConfig::default();
        config.dial_timeout = Duration::from_millis(100);
        let (manager, service, mut events) = setup_with(config).await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;

        // Keine Medien: die Wähl-Frist läuft ab
        let _ = next_event(&mut events).await; // Idle
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionEnded {
                reason: SessionEndReason::DialTimeout
            }
        ));
        assert!(manager.phase().is_idle());

        // Danach ist Wählen wieder möglich
        manager.dial(PeerId::new("xyz789")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_auto_rejects() {
        let mut config = CallConfig::default();
        config.ring_timeout = Duration::from_millis(100);
        let (manager, service, mut events) = setup_with(config).await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        let (event, _call, shutdowns, _) = service.incoming("caller-1");
        service.push(event).await;
        let _ = next_event(&mut events).await; // Ringing
        let _ = next_event(&mut events).await; // Offered

        let _ = next_event(&mut events).await; // Idle
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionEnded {
                reason: SessionEndReason::RingTimeout
            }
        ));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(manager.phase().is_idle());
    }

    #[tokio::test]
    async fn test_re_register_tears_down_first() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager
            .re_register(Some(PeerId::new("wunsch-id")))
            .await
            .unwrap();

        // Alte Identität ist weg, bis der Broker die neue bestätigt
        assert!(manager.local_peer_id().is_none());
        assert_eq!(service.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(
            *service.registrations.lock(),
            vec![None, Some(PeerId::new("wunsch-id"))]
        );

        open(&service, "neu456").await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::IdentityAssigned(id) if id.as_str() == "neu456"
        ));
        assert_eq!(manager.local_peer_id(), Some(PeerId::new("neu456")));
    }

    #[tokio::test]
    async fn test_re_register_rejected_while_in_call() {
        let (manager, service, mut events) = setup().await;
        open(&service, "abc123").await;
        let _ = next_event(&mut events).await;

        manager.dial(PeerId::new("xyz789")).await.unwrap();
        let _ = next_event(&mut events).await;

        let err = manager.re_register(None).await.unwrap_err();
        assert!(matches!(err, CallError::Busy));
        // Identität und Session bleiben bestehen
        assert_eq!(manager.local_peer_id(), Some(PeerId::new("abc123")));
        assert!(matches!(manager.phase(), SessionPhase::Dialing { .. }));
    }

    #[tokio::test]
    async fn test_event_storm_keeps_single_session() {
        let mut config = CallConfig::default();
        config.event_capacity = 4096;
        let (manager, service, mut events) = setup_with(config).await;
        open(&service, "abc123").await;

        let mut rng = StdRng::seed_from_u64(0xfe11);
        for _ in 0..200 {
            match rng.gen_range(0..6) {
                0 => {
                    let _ = manager.dial(PeerId::new("xyz789")).await;
                }
                1 => {
                    let _ = manager.decide(rng.gen_bool(0.5)).await;
                }
                2 => {
                    let _ = manager.hangup().await;
                }
                3 => {
                    let (event, _, _, _) = service.incoming("caller");
                    service.push(event).await;
                }
                4 => {
                    let call = if rng.gen_bool(0.5) {
                        service.dialed.lock().last().map(|(_, c)| *c)
                    } else {
                        None
                    }
                    .unwrap_or_else(CallId::new);
                    service
                        .push(PeerEvent::StreamReady {
                            call,
                            media: RemoteMedia::stub(call),
                        })
                        .await;
                }
                _ => {
                    let call = if rng.gen_bool(0.5) {
                        service.dialed.lock().last().map(|(_, c)| *c)
                    } else {
                        None
                    }
                    .unwrap_or_else(CallId::new);
                    service.push(PeerEvent::PeerDisconnected { call }).await;
                }
            }
        }

        // Anstehende Peer-Events vollständig abarbeiten lassen; danach
        // ist höchstens eine Session übrig
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = manager.decide(false).await;
        let _ = manager.hangup().await;
        wait_until(|| manager.phase().is_idle()).await;

        // Invariante über den gesamten Event-Strom: nie zwei lebende
        // Sessions gleichzeitig
        let mut live = 0usize;
        loop {
            match events.try_recv() {
                Ok(SessionEvent::StateChanged(SessionPhase::Dialing { .. }))
                | Ok(SessionEvent::StateChanged(SessionPhase::Ringing { .. })) => {
                    assert_eq!(live, 0, "second session created while one was active");
                    live = 1;
                }
                Ok(SessionEvent::StateChanged(SessionPhase::Connected { .. })) => {
                    assert_eq!(live, 1, "connected without a live session");
                }
                Ok(SessionEvent::RemoteMediaAvailable(_)) => {
                    assert_eq!(live, 1, "remote media without a live session");
                }
                Ok(SessionEvent::SessionEnded { .. }) => {
                    assert_eq!(live, 1, "session ended twice");
                    live = 0;
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(e) => panic!("event stream broken: {:?}", e),
            }
        }
        assert_eq!(live, 0);
    }
}
