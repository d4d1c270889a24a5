//! Media Module - Lokale Medienquellen
//!
//! Dieses Modul verwaltet:
//! - Mikrofon Capture über cpal
//! - Lokale RTP-Tracks (Opus Audio, VP8 Video)
//! - Einmalige Geräte-Akquise mit geteiltem Handle

mod capture;

pub use capture::{LocalMedia, MediaCaptureProvider, MediaError, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
