//! Laufzeit-Konfiguration
//!
//! Bündelt alle einstellbaren Parameter an einer Stelle:
//! - Rendezvous-Broker URL (überschreibbar per Umgebungsvariable)
//! - Gewünschte Peer-ID und optionales Auth-Token
//! - ICE-Server (STUN/TURN)
//! - Timeouts für Wählen und Klingeln
//! - Kanal-Kapazitäten

use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::peer::PeerId;

// ============================================================================
// DEFAULTS
// ============================================================================

const DEFAULT_BROKER_URL: &str = "https://fernruf-signaling.kaufm.workers.dev";

/// Umgebungsvariable zum Überschreiben der Broker-URL
pub const BROKER_URL_ENV: &str = "FERNRUF_BROKER_URL";

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// CONFIG
// ============================================================================

/// Konfiguration für eine Anruf-Session
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Basis-URL des Rendezvous-Brokers (http/https, wird intern zu ws/wss)
    pub broker_url: String,
    /// Gewünschte Peer-ID bei der Registrierung (None = Broker vergibt eine)
    pub desired_peer_id: Option<PeerId>,
    /// Optionales Auth-Token für den Broker
    pub auth_token: Option<String>,
    /// ICE-Server für den Verbindungsaufbau
    pub ice_servers: Vec<RTCIceServer>,
    /// Maximale Wartezeit auf Medien nach dem Wählen
    pub dial_timeout: Duration,
    /// Maximale Wartezeit auf eine Entscheidung bei eingehendem Anruf
    pub ring_timeout: Duration,
    /// Intervall für Broker-Heartbeats
    pub heartbeat_interval: Duration,
    /// Kapazität der internen Kommando-Queue
    pub queue_capacity: usize,
    /// Kapazität des Session-Event-Kanals
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            desired_peer_id: None,
            auth_token: None,
            ice_servers: default_ice_servers(),
            dial_timeout: Duration::from_secs(30),
            ring_timeout: Duration::from_secs(45),
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 64,
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Erstellt eine Konfiguration mit Defaults, Broker-URL aus der Umgebung
    pub fn from_env() -> Self {
        let broker_url =
            std::env::var(BROKER_URL_ENV).unwrap_or_else(|_| DEFAULT_BROKER_URL.to_string());

        Self {
            broker_url,
            ..Default::default()
        }
    }

    /// Setzt optionale TURN-Server Credentials
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallConfig::default();

        assert!(config.broker_url.starts_with("https://"));
        assert!(config.desired_peer_id.is_none());
        assert!(config.auth_token.is_none());
        assert_eq!(config.dial_timeout, Duration::from_secs(30));
        assert_eq!(config.ring_timeout, Duration::from_secs(45));
        assert!(!config.ice_servers.is_empty());
    }

    #[test]
    fn test_add_turn_server() {
        let mut config = CallConfig::default();
        let before = config.ice_servers.len();

        config.add_turn_server(
            "turn:turn.example.com:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        );

        assert_eq!(config.ice_servers.len(), before + 1);
        let turn = config.ice_servers.last().unwrap();
        assert_eq!(turn.username, "user");
        assert_eq!(turn.credential, "secret");
    }
}
