//! Message Types für das Broker-Protokoll
//!
//! JSON-Nachrichten zwischen Client und Rendezvous-Broker. Alle
//! anrufbezogenen Nachrichten tragen eine `callId`, damit beide Seiten
//! dieselbe Aushandlung referenzieren.

use chrono::Utc;
use serde::{Deserialize, Serialize};

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Registrierung beim Broker
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "desiredPeerId", skip_serializing_if = "Option::is_none")]
    pub desired_peer_id: Option<String>,
    #[serde(rename = "authToken", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub timestamp: i64,
}

impl RegisterPayload {
    pub fn new(desired_peer_id: Option<String>, auth_token: Option<String>) -> Self {
        Self {
            msg_type: "register",
            desired_peer_id,
            auth_token,
            timestamp: now_millis(),
        }
    }
}

/// SDP Offer senden
#[derive(Debug, Clone, Serialize)]
pub struct OfferPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub sdp: String,
    pub timestamp: i64,
}

impl OfferPayload {
    pub fn new(from_peer_id: String, to_peer_id: String, call_id: String, sdp: String) -> Self {
        Self {
            msg_type: "offer",
            from_peer_id,
            to_peer_id,
            call_id,
            sdp,
            timestamp: now_millis(),
        }
    }
}

/// SDP Answer senden
#[derive(Debug, Clone, Serialize)]
pub struct AnswerPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub sdp: String,
    pub timestamp: i64,
}

impl AnswerPayload {
    pub fn new(from_peer_id: String, to_peer_id: String, call_id: String, sdp: String) -> Self {
        Self {
            msg_type: "answer",
            from_peer_id,
            to_peer_id,
            call_id,
            sdp,
            timestamp: now_millis(),
        }
    }
}

/// ICE Candidate senden
#[derive(Debug, Clone, Serialize)]
pub struct IceCandidatePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub candidate: String,
    pub timestamp: i64,
}

impl IceCandidatePayload {
    pub fn new(
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
        candidate: String,
    ) -> Self {
        Self {
            msg_type: "ice_candidate",
            from_peer_id,
            to_peer_id,
            call_id,
            candidate,
            timestamp: now_millis(),
        }
    }
}

/// Anruf ablehnen
#[derive(Debug, Clone, Serialize)]
pub struct RejectCallPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: i64,
}

impl RejectCallPayload {
    pub fn new(
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
        reason: Option<String>,
    ) -> Self {
        Self {
            msg_type: "reject_call",
            from_peer_id,
            to_peer_id,
            call_id,
            reason,
            timestamp: now_millis(),
        }
    }
}

/// Anruf beenden
#[derive(Debug, Clone, Serialize)]
pub struct HangupPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub timestamp: i64,
}

impl HangupPayload {
    pub fn new(from_peer_id: String, to_peer_id: String, call_id: String) -> Self {
        Self {
            msg_type: "hangup",
            from_peer_id,
            to_peer_id,
            call_id,
            timestamp: now_millis(),
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub timestamp: i64,
}

impl HeartbeatPayload {
    pub fn new(peer_id: String) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
            timestamp: now_millis(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Broker-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        #[serde(rename = "peerId")]
        peer_id: String,
        timestamp: i64,
    },

    /// Eingehendes SDP Offer
    IncomingOffer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehendes SDP Answer
    IncomingAnswer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehender ICE Candidate
    IncomingIceCandidate {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        candidate: String,
        timestamp: i64,
    },

    /// Anruf wurde abgelehnt
    CallRejected {
        #[serde(rename = "byPeerId")]
        by_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        reason: Option<String>,
        timestamp: i64,
    },

    /// Anruf wurde beendet
    CallEnded {
        #[serde(rename = "byPeerId")]
        by_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong { timestamp: i64 },
}

// ============================================================================
// TESTS
// ============================================================================
