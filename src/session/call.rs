//! Session-Entität und Zustandsautomat
//!
//! Eine [`CallSession`] existiert pro Anruf und durchläuft ihre Zustände
//! strikt seriell; ungültige Übergänge werden abgewiesen statt ignoriert.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::peer::{CallId, PeerId, RemoteMedia};

// ============================================================================
// TYPES
// ============================================================================

/// Richtung eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Zustand einer Session
///
/// "Kein Anruf" ist kein Session-Zustand, sondern die Abwesenheit einer
/// Session im Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ausgehend, wartet auf die Medien der Gegenstelle
    Dialing,
    /// Eingehend, wartet auf die Annahme-Entscheidung
    Ringing,
    /// Beidseitige Medien aktiv
    Connected,
    /// Beendet; die Session wird danach verworfen
    Terminated,
}

#[derive(Error, Debug, Clone, Copy)]
#[error("invalid session transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Eine einzelne Anruf-Session
///
/// Invariante des Managers: höchstens eine nicht-terminierte Session
/// existiert zu jedem Zeitpunkt.
#[derive(Debug)]
pub struct CallSession {
    id: CallId,
    direction: CallDirection,
    remote_peer: PeerId,
    state: SessionState,
    remote_media: Option<RemoteMedia>,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Neue ausgehende Session, startet im Zustand Dialing
    pub fn outgoing(id: CallId, remote_peer: PeerId) -> Self {
        Self::new(id, CallDirection::Outgoing, remote_peer, SessionState::Dialing)
    }

    /// Neue eingehende Session, startet im Zustand Ringing
    pub fn incoming(id: CallId, remote_peer: PeerId) -> Self {
        Self::new(id, CallDirection::Incoming, remote_peer, SessionState::Ringing)
    }

    fn new(id: CallId, direction: CallDirection, remote_peer: PeerId, state: SessionState) -> Self {
        Self {
            id,
            direction,
            remote_peer,
            state,
            remote_media: None,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Nur im Zustand Connected belegt
    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote_media.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Auflegen ist aus Dialing, Ringing und Connected gültig
    pub fn can_hangup(&self) -> bool {
        matches!(
            self.state,
            SessionState::Dialing | SessionState::Ringing | SessionState::Connected
        )
    }

    /// Bindet die ausgehandelten Medien und wechselt nach Connected
    pub fn connect(&mut self, media: RemoteMedia) -> Result<(), InvalidTransition> {
        match self.state {
            SessionState::Dialing | SessionState::Ringing => {
                self.state = SessionState::Connected;
                self.remote_media = Some(media);
                self.connected_at = Some(Utc::now());
                Ok(())
            }
            from => Err(InvalidTransition {
                from,
                to: SessionState::Connected,
            }),
        }
    }

    /// Terminiert die Session und gibt die Remote-Medien frei; idempotent
    pub fn terminate(&mut self) {
        self.state = SessionState::Terminated;
        self.remote_media = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================
