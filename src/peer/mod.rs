//! Peer Module - Anbindung an die P2P-Vermittlung
//!
//! Dieses Modul verwaltet:
//! - Die Service-Schnittstelle für Registrierung und Verbindungsaufbau
//! - Das Wire-Protokoll zum Rendezvous-Broker
//! - Die WebRTC/WebSocket Implementierung der Schnittstelle

mod broker;
mod service;
mod wire;

pub use broker::BrokerPeerService;
pub use service::{
    CallHandle, CallId, ConnectFailure, PeerConnectionService, PeerEvent, PeerId,
    PeerServiceError, RemoteMedia,
};
