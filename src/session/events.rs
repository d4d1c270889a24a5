//! Events an die Präsentationsschicht
//!
//! Der Manager sendet [`SessionEvent`]s über einen Broadcast-Kanal;
//! [`SessionPhase`] ist der synchron abfragbare Schnappschuss.

use crate::peer::{PeerId, RemoteMedia};

// ============================================================================
// PHASE
// ============================================================================

/// Von außen sichtbare Phase des Managers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Keine Session aktiv
    #[default]
    Idle,
    /// Ausgehender Anruf im Aufbau
    Dialing { remote: PeerId },
    /// Eingehender Anruf wartet auf Entscheidung
    Ringing { remote: PeerId },
    /// Anruf aktiv
    Connected { remote: PeerId },
}

impl SessionPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Die Gegenstelle der aktiven Session, falls eine existiert
    pub fn remote(&self) -> Option<&PeerId> {
        match self {
            Self::Idle => None,
            Self::Dialing { remote } | Self::Ringing { remote } | Self::Connected { remote } => {
                Some(remote)
            }
        }
    }
}

// ============================================================================
// END REASONS
// ============================================================================

/// Warum eine Session beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    /// Lokales Auflegen
    HungUp,
    /// Eingehender Anruf lokal abgelehnt
    Rejected,
    /// Die Gegenstelle hat den Anruf abgelehnt
    RemoteRejected,
    /// Verbindungsaufbau gescheitert
    ConnectionFailed,
    /// Die Gegenstelle hat aufgelegt oder die Verbindung verloren
    PeerDisconnected,
    /// Keine Medien innerhalb des Wähl-Timeouts
    DialTimeout,
    /// Keine Entscheidung innerhalb des Klingel-Timeouts
    RingTimeout,
}

impl std::fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HungUp => "hung up",
            Self::Rejected => "rejected",
            Self::RemoteRejected => "rejected by peer",
            Self::ConnectionFailed => "connection failed",
            Self::PeerDisconnected => "peer disconnected",
            Self::DialTimeout => "dial timeout",
            Self::RingTimeout => "ring timeout",
        };
        f.write_str(s)
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Beobachtbare Zustandsänderungen des Session-Managers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Registrierung erfolgreich, lokale Identität zugewiesen
    IdentityAssigned(PeerId),

    /// Registrierung fehlgeschlagen oder verloren; bis zur nächsten
    /// erfolgreichen Registrierung sind keine Anrufe möglich
    RegistrationFailed { reason: String },

    /// Phasenwechsel des Managers
    StateChanged(SessionPhase),

    /// Eingehender Anruf wartet auf `decide(accept)`
    IncomingCallOffered { from: PeerId },

    /// Medien der Gegenstelle ausgehandelt; genau einmal pro
    /// verbundener Session
    RemoteMediaAvailable(RemoteMedia),

    /// Session beendet, Manager ist wieder Idle
    SessionEnded { reason: SessionEndReason },
}
