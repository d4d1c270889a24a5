//! Service-Schnittstelle zum Verbindungs-Substrat
//!
//! Die Session-Schicht sieht vom Substrat nur diese Traits und Events.
//! Registrierung, Signaling und Medienaushandlung passieren dahinter;
//! Ergebnisse kommen asynchron als [`PeerEvent`] in die gebundene Queue.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::track::track_remote::TrackRemote;

use crate::media::LocalMedia;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Opaque Peer-Identität, vergeben vom Rendezvous-Broker
///
/// Gültig pro aktiver Registrierung; eine Neu-Registrierung gibt die
/// vorherige Identität erst frei und bekommt dann eine neue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifiziert eine einzelne Anruf-Aushandlung
///
/// Vergeben beim Erstellen eines [`CallHandle`]; der Session-Manager
/// verwirft damit verspätete Events bereits beendeter Anrufe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// REMOTE MEDIA
// ============================================================================

/// Handle auf die ausgehandelten Medien der Gegenstelle
///
/// Existiert auf einer Session nur im Connected-Zustand und wird bei
/// Terminierung freigegeben.
#[derive(Clone)]
pub struct RemoteMedia {
    call: CallId,
    tracks: Vec<Arc<TrackRemote>>,
}

impl RemoteMedia {
    pub fn new(call: CallId, tracks: Vec<Arc<TrackRemote>>) -> Self {
        Self { call, tracks }
    }

    /// Der Anruf, aus dessen Aushandlung diese Medien stammen
    pub fn call(&self) -> CallId {
        self.call
    }

    /// Remote-Tracks in Empfangsreihenfolge
    pub fn tracks(&self) -> &[Arc<TrackRemote>] {
        &self.tracks
    }

    /// Handle ohne echte Tracks, nur für Tests
    #[cfg(test)]
    pub(crate) fn stub(call: CallId) -> Self {
        Self {
            call,
            tracks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("call", &self.call)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerServiceError {
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Not registered with broker")]
    NotRegistered,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Substrate error: {0}")]
    Substrate(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Warum eine Aushandlung fehlgeschlagen ist
#[derive(Debug, Clone)]
pub enum ConnectFailure {
    /// Die Gegenstelle hat den Anruf abgelehnt
    Rejected { reason: Option<String> },
    /// Transport- oder Aushandlungsfehler
    Transport(String),
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { reason: Some(r) } => write!(f, "rejected by peer: {}", r),
            Self::Rejected { reason: None } => write!(f, "rejected by peer"),
            Self::Transport(e) => write!(f, "transport failure: {}", e),
        }
    }
}

/// Asynchrone Benachrichtigungen des Substrats an den Session-Manager
///
/// Alle Varianten mit `call` tragen die [`CallId`] des betroffenen Anrufs,
/// damit verspätete Events verworfen werden können.
pub enum PeerEvent {
    /// Registrierung erfolgreich, Identität zugewiesen
    Opened { assigned: PeerId },

    /// Registrierung fehlgeschlagen oder verloren
    Errored { reason: String },

    /// Eingehender Anruf; das Handle wartet auf genau eine Entscheidung
    IncomingCall {
        from: PeerId,
        handle: Box<dyn CallHandle>,
    },

    /// Medien ausgehandelt; feuert höchstens einmal pro Anruf
    StreamReady { call: CallId, media: RemoteMedia },

    /// Verbindungsaufbau gescheitert
    ConnectionFailed { call: CallId, reason: ConnectFailure },

    /// Die Gegenstelle hat aufgelegt oder die Verbindung verloren
    PeerDisconnected { call: CallId },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened { assigned } => f.debug_struct("Opened").field("assigned", assigned).finish(),
            Self::Errored { reason } => f.debug_struct("Errored").field("reason", reason).finish(),
            Self::IncomingCall { from, handle } => f
                .debug_struct("IncomingCall")
                .field("from", from)
                .field("call", &handle.id())
                .finish(),
            Self::StreamReady { call, media } => f
                .debug_struct("StreamReady")
                .field("call", call)
                .field("media", media)
                .finish(),
            Self::ConnectionFailed { call, reason } => f
                .debug_struct("ConnectionFailed")
                .field("call", call)
                .field("reason", reason)
                .finish(),
            Self::PeerDisconnected { call } => {
                f.debug_struct("PeerDisconnected").field("call", call).finish()
            }
        }
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine laufende Anruf-Aushandlung des Substrats
///
/// Unabhängig von der Session-Entität des Kerns; der Manager hält pro
/// aktiver Session höchstens ein Handle.
#[async_trait]
pub trait CallHandle: Send + Sync {
    fn id(&self) -> CallId;

    fn remote_peer(&self) -> &PeerId;

    /// Schließt die Aushandlung eines eingehenden Anrufs ab
    async fn accept(&self, media: &LocalMedia) -> Result<(), PeerServiceError>;

    /// Beendet die Aushandlung (Ablehnung, Busy-Abweisung oder Auflegen);
    /// idempotent
    async fn shutdown(&self);
}

/// Verbindungs-Substrat: Registrierung beim Broker und Anrufaufbau
///
/// Wird vom Kern konsumiert, nicht reimplementiert. Ergebnisse kommen
/// als [`PeerEvent`] in die per [`bind_events`](Self::bind_events)
/// registrierte Queue.
#[async_trait]
pub trait PeerConnectionService: Send + Sync {
    /// Registriert den einzigen Event-Beobachter (die Manager-Queue)
    fn bind_events(&self, sink: mpsc::Sender<PeerEvent>);

    /// Registriert beim Broker; Ausgang kommt als `Opened` oder `Errored`.
    /// `desired = None` lässt den Broker eine Identität vergeben.
    async fn register(&self, desired: Option<PeerId>) -> Result<(), PeerServiceError>;

    /// Startet einen ausgehenden Anruf; die Medien der Gegenstelle kommen
    /// später als `StreamReady`
    async fn dial(
        &self,
        remote: &PeerId,
        media: &LocalMedia,
    ) -> Result<Box<dyn CallHandle>, PeerServiceError>;

    /// Gibt die Registrierung frei; idempotent
    async fn teardown(&self);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_roundtrip() {
        let id = PeerId::new("abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id, PeerId::from("abc123"));
    }

    #[test]
    fn test_call_id_parse() {
        let id = CallId::new();
        let parsed = CallId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        assert!(CallId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_connect_failure_display() {
        let rejected = ConnectFailure::Rejected {
            reason: Some("busy".to_string()),
        };
        assert_eq!(rejected.to_string(), "rejected by peer: busy");

        let transport = ConnectFailure::Transport("ice failed".to_string());
        assert!(transport.to_string().contains("ice failed"));
    }
}
