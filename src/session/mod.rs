//! Session Module - Der Kern der Anruf-Verwaltung
//!
//! Dieses Modul verwaltet:
//! - Die Session-Entität mit ihrem Zustandsautomaten
//! - Den Session-Manager mit serialisierter Event-Schleife
//! - Die Events an die Präsentationsschicht

mod call;
mod events;
mod manager;

pub use call::{CallDirection, CallSession, InvalidTransition, SessionState};
pub use events::{SessionEndReason, SessionEvent, SessionPhase};
pub use manager::{CallError, CallSessionManager};
