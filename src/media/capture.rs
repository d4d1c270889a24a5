//! Media Capture - Mikrofon und lokale Tracks
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Die Geräte werden genau
//! einmal geöffnet; alle Sessions teilen sich dasselbe [`LocalMedia`] Handle.
//! Opus-Encoding kann später hinzugefügt werden wenn vcpkg konfiguriert ist.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Media access denied: {0}")]
    AccessDenied(String),

    #[error("No usable capture device found")]
    DeviceUnavailable,

    #[error("Unsupported capture configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build capture stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start capture stream: {0}")]
    StreamStart(String),
}

impl MediaError {
    fn from_build_error(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => MediaError::DeviceUnavailable,
            cpal::BuildStreamError::StreamConfigNotSupported => {
                MediaError::UnsupportedConfig(e.to_string())
            }
            // Verweigerte Mikrofon-Berechtigungen melden die OS-Backends
            // als backend-spezifischen Fehler
            cpal::BuildStreamError::BackendSpecific { err } => {
                MediaError::AccessDenied(err.to_string())
            }
            other => MediaError::StreamBuild(other.to_string()),
        }
    }

    fn from_play_error(e: cpal::PlayStreamError) -> Self {
        match e {
            cpal::PlayStreamError::DeviceNotAvailable => MediaError::DeviceUnavailable,
            other => MediaError::StreamStart(other.to_string()),
        }
    }
}

// ============================================================================
// RESAMPLING
// ============================================================================

/// Einfaches Linear-Resampling zwischen zwei Sample-Raten
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Hält den cpal-Stream am Leben
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container.
/// Der Stream wird nach dem Start nur noch gehalten und beim Drop beendet.
struct StreamHolder(#[allow(dead_code)] Option<Stream>);

unsafe impl Send for StreamHolder {}
unsafe impl Sync for StreamHolder {}

struct CaptureInner {
    _stream: StreamHolder,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Mute-Status
    is_muted: Arc<Mutex<bool>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,

    /// Lokaler Audio-Track (Opus RTP)
    audio_track: Arc<TrackLocalStaticRTP>,

    /// Lokaler Video-Track (VP8 RTP), Frames liefert der Embedder
    video_track: Arc<TrackLocalStaticRTP>,
}

/// Geteiltes Handle auf die lokalen Medienquellen
///
/// Klonen ist billig, alle Klone zeigen auf denselben Capture-Stream.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<CaptureInner>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("muted", &self.is_muted())
            .finish()
    }
}

impl LocalMedia {
    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.inner.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Setzt den Mute-Status
    pub fn set_muted(&self, muted: bool) {
        *self.inner.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        *self.inner.is_muted.lock()
    }

    /// Gibt den aktuellen Input-Level zurück (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.inner.input_level.lock()
    }

    /// Lokaler Audio-Track zum Anhängen an eine Peer Connection
    pub fn audio_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.inner.audio_track)
    }

    /// Lokaler Video-Track zum Anhängen an eine Peer Connection
    pub fn video_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.inner.video_track)
    }

    /// Medien-Handle ohne echte Geräte, nur für Tests
    #[cfg(test)]
    pub(crate) fn stub() -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                _stream: StreamHolder(None),
                capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
                is_muted: Arc::new(Mutex::new(false)),
                input_level: Arc::new(Mutex::new(0.0)),
                audio_track: make_audio_track(),
                video_track: make_video_track(),
            }),
        }
    }
}

fn make_audio_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        "audio".to_string(),
        "fernruf".to_string(),
    ))
}

fn make_video_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_string(),
        "fernruf".to_string(),
    ))
}

// ============================================================================
// CAPTURE PROVIDER
// ============================================================================

/// Provider für die lokalen Medienquellen
///
/// Die erste erfolgreiche Akquise öffnet Mikrofon und Tracks, jede weitere
/// gibt dasselbe Handle zurück. Ein Fehlschlag belegt den Slot nicht,
/// der nächste Aufruf versucht es erneut.
pub struct MediaCaptureProvider {
    slot: OnceCell<LocalMedia>,
}

impl MediaCaptureProvider {
    /// Erstellt einen neuen Provider (öffnet noch keine Geräte)
    pub fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    /// Akquiriert die lokalen Medien (idempotent)
    pub fn acquire(&self) -> Result<LocalMedia, MediaError> {
        self.slot
            .get_or_try_init(open_local_media)
            .map(|media| media.clone())
    }

    /// Gibt das Handle zurück falls bereits akquiriert
    pub fn current(&self) -> Option<LocalMedia> {
        self.slot.get().cloned()
    }
}

impl Default for MediaCaptureProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Öffnet Mikrofon und lokale Tracks
fn open_local_media() -> Result<LocalMedia, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::DeviceUnavailable)?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
    let is_muted = Arc::new(Mutex::new(false));
    let input_level = Arc::new(Mutex::new(0.0f32));

    let callback_buffer = Arc::clone(&capture_buffer);
    let callback_muted = Arc::clone(&is_muted);
    let callback_level = Arc::clone(&input_level);
    let source_sample_rate = config.sample_rate.0;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let muted = *callback_muted.lock();

                // Audio Level berechnen (RMS)
                let rms: f32 =
                    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                *callback_level.lock() = rms.min(1.0);

                if muted {
                    return;
                }

                let samples = resample_linear(data, source_sample_rate, SAMPLE_RATE);

                // In Ring-Buffer schreiben
                let mut buffer = callback_buffer.lock();
                for sample in samples {
                    let _ = buffer.try_push(sample);
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(MediaError::from_build_error)?;

    stream.play().map_err(MediaError::from_play_error)?;

    tracing::info!(
        "Local media acquired: {}Hz, {} channel(s)",
        SAMPLE_RATE,
        CHANNELS
    );

    Ok(LocalMedia {
        inner: Arc::new(CaptureInner {
            _stream: StreamHolder(Some(stream)),
            capture_buffer,
            is_muted,
            input_level,
            audio_track: make_audio_track(),
            video_track: make_video_track(),
        }),
    })
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    // Priorität: 48kHz > andere Raten, F32 > andere Formate
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    // Versuche exakt 48kHz zu finden
    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    // Fallback auf beste verfügbare Konfiguration
    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            let rate = if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
            {
                target_rate
            } else {
                config.max_sample_rate()
            };
            return Ok(config.with_sample_rate(rate).into());
        }
    }

    // Nehme erste verfügbare Konfiguration
    if let Some(config) = configs.first() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(MediaError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
