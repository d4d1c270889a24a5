//! WebSocket/WebRTC Implementierung der Service-Schnittstelle
//!
//! Verwaltet die Verbindung zum Rendezvous-Broker:
//! - Registrierung und Heartbeat-Keeping
//! - SDP/ICE-Austausch über JSON-Nachrichten
//! - Eine WebRTC Peer Connection pro Anruf-Aushandlung

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::service::{
    CallHandle, CallId, ConnectFailure, PeerConnectionService, PeerEvent, PeerId,
    PeerServiceError, RemoteMedia,
};
use super::wire::*;
use crate::config::CallConfig;
use crate::media::LocalMedia;

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct LinkState {
    is_connected: bool,
    local_peer: Option<PeerId>,
}

/// Aktive Anruf-Aushandlung, Ziel für eingehende Answer/ICE-Nachrichten
struct PeerLink {
    call: CallId,
    pc: Arc<RTCPeerConnection>,
}

/// Von Service, Handles und Hintergrund-Tasks geteilter Zustand
struct Shared {
    state: RwLock<LinkState>,
    /// Verbindungs-Generation; Tasks abgelöster Verbindungen erkennen
    /// daran, dass sie nichts mehr anfassen dürfen
    generation: AtomicU64,
    /// Sender in den Write-Task (None = nicht verbunden)
    out_tx: RwLock<Option<mpsc::Sender<Message>>>,
    /// Event-Queue des Session-Managers
    event_sink: RwLock<Option<mpsc::Sender<PeerEvent>>>,
    /// Höchstens eine Aushandlung zur Zeit
    link: Mutex<Option<Arc<PeerLink>>>,
    ice_servers: Vec<RTCIceServer>,
}

impl Shared {
    fn emit(&self, event: PeerEvent) {
        let Some(sink) = self.event_sink.read().clone() else {
            discard_event(event);
            return;
        };
        match sink.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                // Volle Queue: blockierend nachreichen statt Events zu
                // verlieren
                tokio::spawn(async move {
                    if let Err(e) = sink.send(event).await {
                        discard_event(e.0);
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(event)) => discard_event(event),
        }
    }

    fn send_payload<T: serde::Serialize>(&self, payload: &T) -> Result<(), PeerServiceError> {
        let tx = self
            .out_tx
            .read()
            .clone()
            .ok_or(PeerServiceError::NotConnected)?;
        let msg = serde_json::to_string(payload)
            .map_err(|e| PeerServiceError::SendFailed(e.to_string()))?;
        tx.try_send(Message::Text(msg))
            .map_err(|e| PeerServiceError::SendFailed(e.to_string()))
    }

    fn local_peer(&self) -> Option<PeerId> {
        self.state.read().local_peer.clone()
    }

    fn current_link(&self, call: CallId) -> Option<Arc<PeerLink>> {
        self.link.lock().as_ref().filter(|l| l.call == call).cloned()
    }

    /// Entfernt den aktiven Link, falls er zum Anruf gehört
    fn take_link(&self, call: CallId) -> Option<Arc<PeerLink>> {
        let mut link = self.link.lock();
        if link.as_ref().map(|l| l.call) == Some(call) {
            link.take()
        } else {
            None
        }
    }
}

/// Schließt die Peer Connection im Hintergrund
fn close_link(link: Arc<PeerLink>) {
    tokio::spawn(async move {
        let _ = link.pc.close().await;
    });
}

/// Ein verworfenes IncomingCall darf sein Handle nicht offen zurücklassen
fn discard_event(event: PeerEvent) {
    if let PeerEvent::IncomingCall { from, handle } = event {
        tracing::warn!("No receiver for incoming call from {}, refusing", from);
        tokio::spawn(async move {
            handle.shutdown().await;
        });
    }
}

// ============================================================================
// BROKER SERVICE
// ============================================================================

/// [`PeerConnectionService`] über JSON-WebSocket-Broker und WebRTC
pub struct BrokerPeerService {
    config: CallConfig,
    shared: Arc<Shared>,
}

impl BrokerPeerService {
    pub fn new(config: CallConfig) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(LinkState::default()),
            generation: AtomicU64::new(0),
            out_tx: RwLock::new(None),
            event_sink: RwLock::new(None),
            link: Mutex::new(None),
            ice_servers: config.ice_servers.clone(),
        });

        Self { config, shared }
    }

    /// Prüft ob mit dem Broker verbunden
    pub fn is_connected(&self) -> bool {
        self.shared.state.read().is_connected
    }

    /// Gibt die zugewiesene Peer-ID zurück (falls registriert)
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.shared.local_peer()
    }
}

#[async_trait]
impl PeerConnectionService for BrokerPeerService {
    fn bind_events(&self, sink: mpsc::Sender<PeerEvent>) {
        *self.shared.event_sink.write() = Some(sink);
    }

    async fn register(&self, desired: Option<PeerId>) -> Result<(), PeerServiceError> {
        // Vorherige Registrierung zuerst freigeben
        self.teardown().await;

        let ws_url = broker_ws_url(&self.config.broker_url)?;
        tracing::info!("Connecting to rendezvous broker: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| PeerServiceError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Generation der neuen Verbindung; teardown() hat die alte
        // gerade entwertet
        let generation = self.shared.generation.load(Ordering::SeqCst);

        let (tx, mut rx) = mpsc::channel::<Message>(100);
        {
            let mut state = self.shared.state.write();
            state.is_connected = true;
            state.local_peer = None;
        }
        *self.shared.out_tx.write() = Some(tx);

        // Read-Task: Broker-Nachrichten parsen und verarbeiten
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => handle_server_message(server_msg, &shared).await,
                        Err(e) => tracing::warn!("Unparseable broker message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by broker");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            connection_lost(&shared, generation);
        });

        // Write-Task: ausgehende Nachrichten senden; nach einem
        // Close-Frame ist Schluss
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Heartbeat-Task: Verbindung gegen Idle-Timeouts offen halten
        let shared = Arc::clone(&self.shared);
        let heartbeat_interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;

                if shared.generation.load(Ordering::SeqCst) != generation
                    || !shared.state.read().is_connected
                {
                    break;
                }
                if let Some(peer) = shared.local_peer() {
                    if let Err(e) = shared.send_payload(&HeartbeatPayload::new(peer.to_string())) {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                        break;
                    }
                }
            }
        });

        // Registrierung senden; Ausgang kommt als Opened/Errored Event
        let payload = RegisterPayload::new(
            desired.map(|p| p.to_string()),
            self.config.auth_token.clone(),
        );
        self.shared.send_payload(&payload)
    }

    async fn dial(
        &self,
        remote: &PeerId,
        media: &LocalMedia,
    ) -> Result<Box<dyn CallHandle>, PeerServiceError> {
        let local = self
            .shared
            .local_peer()
            .ok_or(PeerServiceError::NotRegistered)?;

        let call = CallId::new();
        tracing::info!("Dialing {} (call {})", remote, call);

        let pc = build_peer_connection(&self.shared.ice_servers).await?;
        attach_local_tracks(&pc, media).await?;
        install_handlers(&pc, Arc::clone(&self.shared), call, remote.clone());

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

        *self.shared.link.lock() = Some(Arc::new(PeerLink {
            call,
            pc: Arc::clone(&pc),
        }));

        let payload = OfferPayload::new(
            local.to_string(),
            remote.to_string(),
            call.to_string(),
            offer.sdp,
        );
        if let Err(e) = self.shared.send_payload(&payload) {
            if let Some(link) = self.shared.take_link(call) {
                close_link(link);
            }
            return Err(e);
        }

        Ok(Box::new(BrokerCallHandle {
            shared: Arc::clone(&self.shared),
            call,
            remote: remote.clone(),
            pending_offer: Mutex::new(None),
        }))
    }

    async fn teardown(&self) {
        // Alte Tasks (Read, Heartbeat) sofort entwerten
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let link = { self.shared.link.lock().take() };
        if let Some(link) = link {
            let _ = link.pc.close().await;
        }

        // Close-Frame anstoßen; der Write-Task beendet sich danach selbst
        // und gibt den Socket frei
        let tx = self.shared.out_tx.write().take();
        if let Some(tx) = tx {
            let _ = tx.try_send(Message::Close(None));
        }

        let mut state = self.shared.state.write();
        state.is_connected = false;
        state.local_peer = None;
    }
}

impl std::fmt::Debug for BrokerPeerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPeerService")
            .field("broker_url", &self.config.broker_url)
            .field("state", &*self.shared.state.read())
            .finish()
    }
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Eine Anruf-Aushandlung über den Broker
///
/// Für eingehende Anrufe hält das Handle das Offer-SDP, bis genau eine
/// Entscheidung gefallen ist; die Peer Connection entsteht erst beim Accept.
struct BrokerCallHandle {
    shared: Arc<Shared>,
    call: CallId,
    remote: PeerId,
    /// SDP des eingehenden Offers; None bei ausgehenden Anrufen und
    /// nach erfolgtem Accept
    pending_offer: Mutex<Option<String>>,
}

#[async_trait]
impl CallHandle for BrokerCallHandle {
    fn id(&self) -> CallId {
        self.call
    }

    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    async fn accept(&self, media: &LocalMedia) -> Result<(), PeerServiceError> {
        let offer_sdp = self
            .pending_offer
            .lock()
            .take()
            .ok_or_else(|| PeerServiceError::Substrate("no pending offer".to_string()))?;
        let local = self
            .shared
            .local_peer()
            .ok_or(PeerServiceError::NotRegistered)?;

        tracing::info!("Accepting call {} from {}", self.call, self.remote);

        let pc = build_peer_connection(&self.shared.ice_servers).await?;

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

        attach_local_tracks(&pc, media).await?;
        install_handlers(&pc, Arc::clone(&self.shared), self.call, self.remote.clone());

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

        *self.shared.link.lock() = Some(Arc::new(PeerLink {
            call: self.call,
            pc,
        }));

        let payload = AnswerPayload::new(
            local.to_string(),
            self.remote.to_string(),
            self.call.to_string(),
            answer.sdp,
        );
        if let Err(e) = self.shared.send_payload(&payload) {
            if let Some(link) = self.shared.take_link(self.call) {
                close_link(link);
            }
            return Err(e);
        }

        Ok(())
    }

    async fn shutdown(&self) {
        // Offer noch offen: Ablehnung signalisieren, keine Verbindung entstanden
        if self.pending_offer.lock().take().is_some() {
            if let Some(local) = self.shared.local_peer() {
                let payload = RejectCallPayload::new(
                    local.to_string(),
                    self.remote.to_string(),
                    self.call.to_string(),
                    None,
                );
                if let Err(e) = self.shared.send_payload(&payload) {
                    tracing::warn!("Failed to send reject for call {}: {}", self.call, e);
                }
            }
            return;
        }

        // Laufende Verbindung schließen und Auflegen signalisieren
        if let Some(link) = self.shared.take_link(self.call) {
            let _ = link.pc.close().await;

            if let Some(local) = self.shared.local_peer() {
                let payload = HangupPayload::new(
                    local.to_string(),
                    self.remote.to_string(),
                    self.call.to_string(),
                );
                if let Err(e) = self.shared.send_payload(&payload) {
                    tracing::warn!("Failed to send hangup for call {}: {}", self.call, e);
                }
            }
        }
    }
}

// ============================================================================
// MESSAGE HANDLING
// ============================================================================

/// Verarbeitet eingehende Broker-Nachrichten
async fn handle_server_message(msg: ServerMessage, shared: &Arc<Shared>) {
    match msg {
        ServerMessage::Registered { peer_id, .. } => {
            tracing::info!("Registered with peer_id {}", peer_id);
            let assigned = PeerId::new(peer_id);
            shared.state.write().local_peer = Some(assigned.clone());
            shared.emit(PeerEvent::Opened { assigned });
        }

        ServerMessage::IncomingOffer {
            from_peer_id,
            call_id,
            sdp,
            ..
        } => {
            let Some(call) = CallId::parse(&call_id) else {
                tracing::warn!("Incoming offer with invalid call id: {}", call_id);
                return;
            };
            let from = PeerId::new(from_peer_id);
            tracing::info!("Incoming call {} from {}", call, from);

            let handle = BrokerCallHandle {
                shared: Arc::clone(shared),
                call,
                remote: from.clone(),
                pending_offer: Mutex::new(Some(sdp)),
            };
            shared.emit(PeerEvent::IncomingCall {
                from,
                handle: Box::new(handle),
            });
        }

        ServerMessage::IncomingAnswer { call_id, sdp, .. } => {
            let Some(link) = CallId::parse(&call_id).and_then(|c| shared.current_link(c)) else {
                tracing::debug!("Answer for unknown call {}", call_id);
                return;
            };

            let result = match RTCSessionDescription::answer(sdp) {
                Ok(answer) => link
                    .pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            if let Err(e) = result {
                tracing::error!("Failed to apply answer for call {}: {}", link.call, e);
                if let Some(link) = shared.take_link(link.call) {
                    let call = link.call;
                    close_link(link);
                    shared.emit(PeerEvent::ConnectionFailed {
                        call,
                        reason: ConnectFailure::Transport(e),
                    });
                }
            }
        }

        ServerMessage::IncomingIceCandidate {
            call_id, candidate, ..
        } => {
            let Some(link) = CallId::parse(&call_id).and_then(|c| shared.current_link(c)) else {
                tracing::debug!("ICE candidate for unknown call {}", call_id);
                return;
            };

            match serde_json::from_str::<RTCIceCandidateInit>(&candidate) {
                Ok(init) => {
                    if let Err(e) = link.pc.add_ice_candidate(init).await {
                        tracing::warn!("Failed to add ICE candidate: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Unparseable ICE candidate: {}", e),
            }
        }

        ServerMessage::CallRejected {
            call_id, reason, ..
        } => {
            if let Some(link) = CallId::parse(&call_id).and_then(|c| shared.take_link(c)) {
                tracing::info!("Call {} rejected by peer (reason: {:?})", link.call, reason);
                let call = link.call;
                close_link(link);
                shared.emit(PeerEvent::ConnectionFailed {
                    call,
                    reason: ConnectFailure::Rejected { reason },
                });
            }
        }

        ServerMessage::CallEnded { call_id, .. } => {
            if let Some(link) = CallId::parse(&call_id).and_then(|c| shared.take_link(c)) {
                tracing::info!("Call {} ended by peer", link.call);
                let call = link.call;
                close_link(link);
                shared.emit(PeerEvent::PeerDisconnected { call });
            }
        }

        ServerMessage::Error { code, message, .. } => {
            // Vor der Registrierung ist jeder Broker-Fehler ein
            // Registrierungs-Fehlschlag
            if shared.local_peer().is_none() {
                tracing::error!("Registration failed {}: {}", code, message);
                shared.emit(PeerEvent::Errored {
                    reason: format!("broker error {}: {}", code, message),
                });
            } else {
                tracing::error!("Broker error {}: {}", code, message);
            }
        }

        ServerMessage::Pong { .. } => {
            // Heartbeat-Antwort, nichts zu tun
        }
    }
}

/// Socket weg: Registrierung ist verloren, laufende Anrufe enden
///
/// Gilt nur für die aktuelle Verbindungs-Generation; der Read-Task einer
/// per Teardown abgelösten Verbindung meldet sich verspätet und darf eine
/// inzwischen frische Registrierung nicht anfassen.
fn connection_lost(shared: &Arc<Shared>, generation: u64) {
    if shared.generation.load(Ordering::SeqCst) != generation {
        tracing::debug!("Stale broker connection reaped (generation {})", generation);
        return;
    }

    let was_connected = {
        let mut state = shared.state.write();
        let was = state.is_connected;
        state.is_connected = false;
        state.local_peer = None;
        was
    };
    *shared.out_tx.write() = None;

    let link = { shared.link.lock().take() };
    if let Some(link) = link {
        let call = link.call;
        close_link(link);
        shared.emit(PeerEvent::PeerDisconnected { call });
    }

    if was_connected {
        shared.emit(PeerEvent::Errored {
            reason: "broker connection lost".to_string(),
        });
    }
}

// ============================================================================
// WEBRTC PLUMBING
// ============================================================================

/// Erstellt eine neue Peer Connection mit Standard-Codecs und Interceptors
async fn build_peer_connection(
    ice_servers: &[RTCIceServer],
) -> Result<Arc<RTCPeerConnection>, PeerServiceError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

    // Interceptors für RTCP, NACK etc.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers.to_vec(),
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

    Ok(Arc::new(pc))
}

/// Hängt die lokalen Audio/Video-Tracks an die Peer Connection
async fn attach_local_tracks(
    pc: &Arc<RTCPeerConnection>,
    media: &LocalMedia,
) -> Result<(), PeerServiceError> {
    pc.add_track(media.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

    pc.add_track(media.video_track() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| PeerServiceError::Substrate(e.to_string()))?;

    Ok(())
}

/// Registriert die Event Handler der Peer Connection
fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    shared: Arc<Shared>,
    call: CallId,
    remote: PeerId,
) {
    // ICE Candidates an die Gegenstelle weiterleiten
    let ice_shared = Arc::clone(&shared);
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if let Ok(json) = c.to_json() {
                if let Ok(candidate_str) = serde_json::to_string(&json) {
                    if let Some(local) = ice_shared.local_peer() {
                        let payload = IceCandidatePayload::new(
                            local.to_string(),
                            remote.to_string(),
                            call.to_string(),
                            candidate_str,
                        );
                        if let Err(e) = ice_shared.send_payload(&payload) {
                            tracing::warn!("Failed to send ICE candidate: {}", e);
                        }
                    }
                }
            }
        }
        Box::pin(async {})
    }));

    // Erster Remote-Track liefert die ausgehandelten Medien;
    // StreamReady feuert höchstens einmal pro Anruf
    let track_shared = Arc::clone(&shared);
    let stream_fired = Arc::new(Mutex::new(false));
    pc.on_track(Box::new(move |track, _, _| {
        let shared = Arc::clone(&track_shared);
        let fired = Arc::clone(&stream_fired);
        Box::pin(async move {
            {
                let mut fired = fired.lock();
                if *fired {
                    tracing::debug!("Additional remote track for call {}", call);
                    return;
                }
                *fired = true;
            }

            tracing::info!("Remote media ready for call {}", call);
            shared.emit(PeerEvent::StreamReady {
                call,
                media: RemoteMedia::new(call, vec![track]),
            });
        })
    }));

    // Verbindungsstatus auf Peer-Events abbilden
    let state_shared = Arc::clone(&shared);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state for call {}: {:?}", call, s);

        match s {
            RTCPeerConnectionState::Failed => {
                if let Some(link) = state_shared.take_link(call) {
                    close_link(link);
                    state_shared.emit(PeerEvent::ConnectionFailed {
                        call,
                        reason: ConnectFailure::Transport("peer connection failed".to_string()),
                    });
                }
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                // Nach lokalem Auflegen ist der Link bereits entfernt,
                // dann bleibt das hier still
                if let Some(link) = state_shared.take_link(call) {
                    close_link(link);
                    state_shared.emit(PeerEvent::PeerDisconnected { call });
                }
            }
            _ => {}
        }

        Box::pin(async {})
    }));
}

// ============================================================================
// URL HANDLING
// ============================================================================

/// Leitet die WebSocket-URL aus der Broker-Basis-URL ab
fn broker_ws_url(base: &str) -> Result<Url, PeerServiceError> {
    let mut url =
        Url::parse(base).map_err(|e| PeerServiceError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(PeerServiceError::ConnectionFailed(format!(
                "unsupported broker scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| PeerServiceError::ConnectionFailed("invalid broker url".to_string()))?;

    // Konfigurierten Pfad (z.B. Reverse-Proxy-Präfix) erhalten
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);

    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct RecordingHandle {
        call: CallId,
        remote: PeerId,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CallHandle for RecordingHandle {
        fn id(&self) -> CallId {
            self.call
        }

        fn remote_peer(&self) -> &PeerId {
            &self.remote
        }

        async fn accept(&self, _media: &LocalMedia) -> Result<(), PeerServiceError> {
            Ok(())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Versetzt den Service in den Zustand "verbunden und registriert"
    fn mark_registered(service: &BrokerPeerService, peer: &str) {
        let mut state = service.shared.state.write();
        state.is_connected = true;
        state.local_peer = Some(PeerId::new(peer));
    }

    #[test]
    fn test_broker_ws_url_https() {
        let url = broker_ws_url("https://broker.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://broker.example.com/ws");
    }

    #[test]
    fn test_broker_ws_url_http() {
        let url = broker_ws_url("http://localhost:8787").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8787/ws");
    }

    #[test]
    fn test_broker_ws_url_rejects_unknown_scheme() {
        assert!(broker_ws_url("ftp://broker.example.com").is_err());
        assert!(broker_ws_url("not a url").is_err());
    }

    #[test]
    fn test_broker_ws_url_keeps_path_prefix() {
        let url = broker_ws_url("https://broker.example.com/proxy").unwrap();
        assert_eq!(url.as_str(), "wss://broker.example.com/proxy/ws");

        let url = broker_ws_url("https://broker.example.com/proxy/").unwrap();
        assert_eq!(url.as_str(), "wss://broker.example.com/proxy/ws");
    }

    #[test]
    fn test_service_starts_unregistered() {
        let service = BrokerPeerService::new(CallConfig::default());
        assert!(!service.is_connected());
        assert!(service.local_peer_id().is_none());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let service = BrokerPeerService::new(CallConfig::default());
        service.teardown().await;
        service.teardown().await;
        assert!(!service.is_connected());
    }

    #[tokio::test]
    async fn test_dial_requires_registration() {
        let service = BrokerPeerService::new(CallConfig::default());
        let media = LocalMedia::stub();

        let result = service.dial(&PeerId::new("xyz789"), &media).await;
        assert!(matches!(result, Err(PeerServiceError::NotRegistered)));
    }

    #[tokio::test]
    async fn test_teardown_sends_close_and_bumps_generation() {
        let service = BrokerPeerService::new(CallConfig::default());
        let (tx, mut rx) = mpsc::channel::<Message>(8);
        *service.shared.out_tx.write() = Some(tx);
        mark_registered(&service, "abc123");
        let before = service.shared.generation.load(Ordering::SeqCst);

        service.teardown().await;

        assert!(matches!(rx.recv().await, Some(Message::Close(_))));
        assert!(service.shared.out_tx.read().is_none());
        assert!(service.shared.generation.load(Ordering::SeqCst) > before);
        assert!(!service.is_connected());
        assert!(service.local_peer_id().is_none());
    }

    #[tokio::test]
    async fn test_stale_connection_loss_keeps_new_registration() {
        let service = BrokerPeerService::new(CallConfig::default());
        let (sink, mut rx) = mpsc::channel(8);
        service.bind_events(sink);

        // Abgelöste Verbindung, danach eine frische Registrierung
        let stale = service.shared.generation.load(Ordering::SeqCst);
        service.shared.generation.fetch_add(1, Ordering::SeqCst);
        mark_registered(&service, "abc123");

        // Der verspätete Read-Task der alten Verbindung meldet sich
        connection_lost(&service.shared, stale);

        assert!(service.is_connected());
        assert_eq!(service.local_peer_id(), Some(PeerId::new("abc123")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_current_connection_loss_clears_registration() {
        let service = BrokerPeerService::new(CallConfig::default());
        let (sink, mut rx) = mpsc::channel(8);
        service.bind_events(sink);
        mark_registered(&service, "abc123");

        let current = service.shared.generation.load(Ordering::SeqCst);
        connection_lost(&service.shared, current);

        assert!(!service.is_connected());
        assert!(service.local_peer_id().is_none());
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Errored { .. })));
    }

    #[tokio::test]
    async fn test_emit_refuses_incoming_call_without_receiver() {
        let service = BrokerPeerService::new(CallConfig::default());
        let (sink, rx) = mpsc::channel(1);
        service.bind_events(sink);
        drop(rx);

        let shutdowns = Arc::new(AtomicUsize::new(0));
        service.shared.emit(PeerEvent::IncomingCall {
            from: PeerId::new("caller-1"),
            handle: Box::new(RecordingHandle {
                call: CallId::new(),
                remote: PeerId::new("caller-1"),
                shutdowns: Arc::clone(&shutdowns),
            }),
        });

        // Das Handle wird in einer eigenen Task geschlossen
        for _ in 0..500 {
            if shutdowns.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_queues_event_when_sink_is_full() {
        let service = BrokerPeerService::new(CallConfig::default());
        let (sink, mut rx) = mpsc::channel(1);
        service.bind_events(sink);

        service.shared.emit(PeerEvent::Opened {
            assigned: PeerId::new("abc123"),
        });
        let call = CallId::new();
        // Queue ist voll; das Event darf trotzdem nicht verloren gehen
        service.shared.emit(PeerEvent::PeerDisconnected { call });

        assert!(matches!(rx.recv().await, Some(PeerEvent::Opened { .. })));
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("queued event not delivered");
        assert!(matches!(second, Some(PeerEvent::PeerDisconnected { call: c }) if c == call));
    }
}
