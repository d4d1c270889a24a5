//! Fernruf - P2P Video Call Session Core
//!
//! Eine serverlose P2P Video-Call-Bibliothek mit:
//! - Rendezvous-Broker (WebSocket) für Identitäten und Signaling
//! - WebRTC für P2P Audio/Video-Verbindungen
//! - Genau einer aktiven Anruf-Session zur Zeit
//!
//! Der gesamte Zustand hängt an einem explizit konstruierten [`CallApp`]
//! Kontext-Objekt; es gibt keinen globalen Zustand.

pub mod config;
pub mod media;
pub mod peer;
pub mod session;

use std::sync::Arc;
use thiserror::Error;

pub use config::CallConfig;
pub use media::{LocalMedia, MediaCaptureProvider, MediaError};
pub use peer::{
    BrokerPeerService, CallId, ConnectFailure, PeerConnectionService, PeerEvent, PeerId,
    PeerServiceError, RemoteMedia,
};
pub use session::{
    CallDirection, CallError, CallSession, CallSessionManager, SessionEndReason, SessionEvent,
    SessionPhase, SessionState,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Media capture failed: {0}")]
    Media(#[from] MediaError),

    #[error("Call session setup failed: {0}")]
    Call(#[from] CallError),
}

// ============================================================================
// APPLICATION CONTEXT
// ============================================================================

/// Kontext-Objekt der Anwendung
///
/// Bündelt Capture-Provider, lokale Medien, Broker-Service und
/// Session-Manager; wird genau einmal konstruiert und explizit an die
/// Präsentationsschicht gereicht.
pub struct CallApp {
    capture: MediaCaptureProvider,
    media: LocalMedia,
    service: Arc<BrokerPeerService>,
    manager: CallSessionManager,
}

impl CallApp {
    /// Initialisiert den Kern: Medien akquirieren, Broker-Service
    /// aufbauen, Manager starten (registriert beim Broker)
    ///
    /// Schlägt die Medien-Akquise fehl, findet keinerlei Anruf-Aktion
    /// statt; der Aufrufer entscheidet über Abbruch oder erneuten Versuch.
    pub async fn init(config: CallConfig) -> Result<Self, AppError> {
        tracing::info!("Initializing call core...");

        let capture = MediaCaptureProvider::new();
        let media = capture.acquire()?;

        let service = Arc::new(BrokerPeerService::new(config.clone()));
        let manager =
            CallSessionManager::start(service.clone(), media.clone(), config).await?;

        tracing::info!("Call core ready");

        Ok(Self {
            capture,
            media,
            service,
            manager,
        })
    }

    /// Der Session-Manager (Wählen, Entscheiden, Auflegen, Events)
    pub fn manager(&self) -> &CallSessionManager {
        &self.manager
    }

    /// Die lokalen Medien (Mute, Input-Level)
    pub fn media(&self) -> &LocalMedia {
        &self.media
    }

    /// Der Capture-Provider; `acquire` nach Erfolg liefert dasselbe Handle
    pub fn capture(&self) -> &MediaCaptureProvider {
        &self.capture
    }

    /// Der Broker-Service (Verbindungsstatus)
    pub fn service(&self) -> &BrokerPeerService {
        &self.service
    }

    /// Gibt die Broker-Registrierung frei
    pub async fn shutdown(&self) {
        self.service.teardown().await;
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("manager", &self.manager)
            .field("service", &self.service)
            .finish()
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging für eingebettete Nutzung
///
/// `RUST_LOG` überschreibt die Default-Direktiven. Mehrfache Aufrufe
/// sind harmlos; nur der erste installiert den Subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fernruf=debug".parse().expect("valid directive"))
                .add_directive("webrtc=warn".parse().expect("valid directive")),
        )
        .try_init();
}
