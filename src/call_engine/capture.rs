//! Media Capture - lokale Audioquelle (Mikrofon)
//!
//! `acquire()` fordert die Quelle an, `AudioSource::stop()` gibt sie wieder
//! frei. Fehler werden nie automatisch wiederholt.
//!
//! Mit dem Feature `cpal-capture` wird das Standard-Eingabegerät über cpal
//! geöffnet, sonst steht nur die stille Quelle zur Verfügung.

use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No audio input device found")]
    DeviceNotFound,

    #[error("Audio capture failed: {0}")]
    Other(String),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine erworbene lokale Audioquelle
///
/// `stop()` muss mehrfach aufrufbar sein.
pub trait AudioSource: Send {
    /// Track-Label für die Peer Connection
    fn label(&self) -> &str;

    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

/// Fordert lokale Audioquellen an
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn AudioSource>, CaptureError>;
}

// ============================================================================
// SILENT CAPTURE
// ============================================================================

/// Quelle ohne Gerät (Headless-Betrieb, nur Empfang)
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentCapture;

#[derive(Debug)]
pub struct SilentSource {
    live: bool,
}

impl AudioSource for SilentSource {
    fn label(&self) -> &str {
        "silence"
    }

    fn stop(&mut self) {
        if self.live {
            tracing::debug!("Silent audio source stopped");
        }
        self.live = false;
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

#[async_trait]
impl MediaCapture for SilentCapture {
    async fn acquire(&self) -> Result<Box<dyn AudioSource>, CaptureError> {
        Ok(Box::new(SilentSource { live: true }))
    }
}

// ============================================================================
// CPAL CAPTURE
// ============================================================================

#[cfg(feature = "cpal-capture")]
pub use cpal_backend::{CpalCapture, CpalSource, SAMPLE_RATE};

#[cfg(feature = "cpal-capture")]
mod cpal_backend {
    use super::{AudioSource, CaptureError, MediaCapture};
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};

    /// Sample Rate (48kHz ist der Standard für Opus)
    pub const SAMPLE_RATE: u32 = 48000;

    /// Öffnet das Standard-Eingabegerät
    #[derive(Debug, Clone, Copy, Default)]
    pub struct CpalCapture;

    /// Laufender Mikrofon-Stream
    ///
    /// Hält das Gerät offen, solange die Session die Quelle besitzt.
    pub struct CpalSource {
        stream: Option<Stream>,
    }

    // Stream ist nicht Send; er wird nur vom Worker-Task besessen und
    // ausschließlich dort gedroppt.
    unsafe impl Send for CpalSource {}

    impl AudioSource for CpalSource {
        fn label(&self) -> &str {
            "microphone"
        }

        fn stop(&mut self) {
            if self.stream.take().is_some() {
                tracing::info!("Microphone stream stopped");
            }
        }

        fn is_live(&self) -> bool {
            self.stream.is_some()
        }
    }

    impl Drop for CpalSource {
        fn drop(&mut self) {
            self.stop();
        }
    }

    #[async_trait]
    impl MediaCapture for CpalCapture {
        async fn acquire(&self) -> Result<Box<dyn AudioSource>, CaptureError> {
            // cpal blockiert beim Öffnen des Geräts
            let source = tokio::task::block_in_place(open_default_input)?;
            Ok(Box::new(source))
        }
    }

    fn open_default_input() -> Result<CpalSource, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::DeviceNotFound)?;

        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        // Samples fließen über den Track der Peer Connection, nicht über uns
        let stream = device
            .build_input_stream(
                &config,
                move |_data: &[f32], _: &cpal::InputCallbackInfo| {},
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        stream.play().map_err(|e| CaptureError::Other(e.to_string()))?;

        Ok(CpalSource {
            stream: Some(stream),
        })
    }

    fn map_build_error(err: cpal::BuildStreamError) -> CaptureError {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => CaptureError::DeviceNotFound,
            cpal::BuildStreamError::BackendSpecific { err }
                if err.description.to_lowercase().contains("permission") =>
            {
                CaptureError::PermissionDenied
            }
            other => CaptureError::Other(other.to_string()),
        }
    }

    fn find_best_input_config(device: &Device) -> Result<StreamConfig, CaptureError> {
        let configs = device.supported_input_configs().map_err(|e| match e {
            cpal::SupportedStreamConfigsError::DeviceNotAvailable => CaptureError::DeviceNotFound,
            other => CaptureError::Other(other.to_string()),
        })?;

        select_best_config(configs.collect())
    }

    /// Priorität: 48kHz F32 > F32 mit bester Rate > erste Konfiguration
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, CaptureError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);
        let supports_target =
            |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

        if let Some(config) = configs
            .iter()
            .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }

        if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
            return Ok(config.with_max_sample_rate().into());
        }

        configs
            .first()
            .map(|c| c.with_max_sample_rate().into())
            .ok_or_else(|| CaptureError::Other("No suitable audio configuration found".into()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use cpal::{SampleRate, SupportedBufferSize};

        fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
            SupportedStreamConfigRange::new(
                channels,
                SampleRate(min),
                SampleRate(max),
                SupportedBufferSize::Unknown,
                format,
            )
        }

        #[test]
        fn test_prefers_48k_float() {
            let config = select_best_config(vec![
                range(2, 44100, 44100, SampleFormat::I16),
                range(1, 8000, 96000, SampleFormat::F32),
            ])
            .unwrap();
            assert_eq!(config.sample_rate, SampleRate(SAMPLE_RATE));
            assert_eq!(config.channels, 1);
        }

        #[test]
        fn test_falls_back_to_float_max_rate() {
            let config = select_best_config(vec![
                range(1, 8000, 16000, SampleFormat::I16),
                range(2, 8000, 44100, SampleFormat::F32),
            ])
            .unwrap();
            assert_eq!(config.sample_rate, SampleRate(44100));
            assert_eq!(config.channels, 2);
        }

        #[test]
        fn test_no_configs_is_an_error() {
            assert!(matches!(
                select_best_config(Vec::new()),
                Err(CaptureError::Other(_))
            ));
        }

        #[test]
        fn test_unavailable_device_maps_to_not_found() {
            assert_eq!(
                map_build_error(cpal::BuildStreamError::DeviceNotAvailable),
                CaptureError::DeviceNotFound
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_silent_source_stop_is_idempotent() {
        let mut source = SilentCapture.acquire().await.unwrap();
        assert!(source.is_live());
        source.stop();
        source.stop();
        assert!(!source.is_live());
    }
}
