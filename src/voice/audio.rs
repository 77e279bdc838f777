//! Local Audio I/O Module
//!
//! Provides audio capture and playback using:
//! - cpal: Cross-platform audio I/O (microphone input)
//! - rodio: Decoding and playback to the default output device
//! - hound: WAV encoding for transcription uploads
//!
//! # Architecture
//!
//! ```text
//! Microphone → MicrophoneSource → AudioFrame → (noise, VAD) → STT
//!
//! Speaker ← AudioSink ← temporary WAV ← TTS
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use tracing::debug;

use crate::error::{PlaybackError, SpeechError};

/// Default sample rate for the input pipeline
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Frame length delivered by capture sources (20ms at 16kHz)
pub const DEFAULT_FRAME_SIZE: usize = 320;

/// A block of mono f32 samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Frame duration in milliseconds
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Plays an audio file to completion.
///
/// Implementations block the caller until the device has drained.
pub trait AudioSink: Send + Sync {
    fn play_file(&self, path: &Path) -> Result<(), PlaybackError>;
}

/// Source of input frames for a session.
#[async_trait]
pub trait AudioSource: Send {
    /// Wait for the next frame; `None` once the source is exhausted.
    async fn next_frame(&mut self) -> Option<AudioFrame>;

    /// Return a frame only if one is already buffered.
    fn try_next_frame(&mut self) -> Option<AudioFrame>;
}

/// Plays WAV files on the default output device with rodio
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioSink;

impl RodioSink {
    pub fn new() -> Self {
        Self
    }
}

impl AudioSink for RodioSink {
    #[cfg(feature = "voice")]
    fn play_file(&self, path: &Path) -> Result<(), PlaybackError> {
        let (_stream, handle) = rodio::OutputStream::try_default()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        let sink = rodio::Sink::try_new(&handle).map_err(|e| PlaybackError::Device(e.to_string()))?;

        let file = std::fs::File::open(path).map_err(PlaybackError::TempFile)?;
        let source = rodio::Decoder::new(std::io::BufReader::new(file)).map_err(|e| {
            PlaybackError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        sink.append(source);
        debug!("Playing {:?}", path);
        sink.sleep_until_end();
        Ok(())
    }

    #[cfg(not(feature = "voice"))]
    fn play_file(&self, _path: &Path) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unavailable)
    }
}

/// Replays a fixed list of frames, then reports exhaustion
#[derive(Debug, Default)]
pub struct ScriptedSource {
    frames: VecDeque<AudioFrame>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    /// Split a sample buffer into fixed-size frames
    pub fn from_samples(samples: &[f32], sample_rate: u32, frame_size: usize) -> Self {
        let frames = samples
            .chunks(frame_size.max(1))
            .map(|chunk| AudioFrame::new(chunk.to_vec(), sample_rate))
            .collect();
        Self { frames }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl AudioSource for ScriptedSource {
    async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    fn try_next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }
}

#[cfg(feature = "voice")]
pub use capture::MicrophoneSource;

#[cfg(feature = "voice")]
mod capture {
    use super::{downmix, frame_from_pcm16, resample_linear, AudioFrame, AudioSource};
    use crate::error::SpeechError;
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::{error, info};

    /// Captures the default input device.
    ///
    /// The cpal stream is not `Send`, so it lives on a dedicated capture
    /// thread; frames are handed over through a channel.
    pub struct MicrophoneSource {
        rx: mpsc::UnboundedReceiver<AudioFrame>,
        stop: Arc<AtomicBool>,
    }

    impl MicrophoneSource {
        /// Open the default microphone, delivering mono frames at `target_rate`
        pub fn open(target_rate: u32) -> Result<Self, SpeechError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel();
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = stop.clone();

            std::thread::Builder::new()
                .name("mic-capture".to_string())
                .spawn(move || {
                    let stream = match build_stream(tx, target_rate) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    while !stop_flag.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    drop(stream);
                    info!("Audio input stopped");
                })
                .map_err(|e| SpeechError::Capture(e.to_string()))?;

            ready_rx
                .recv()
                .map_err(|_| SpeechError::Capture("capture thread exited".to_string()))??;

            Ok(Self { rx, stop })
        }
    }

    impl Drop for MicrophoneSource {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioSource for MicrophoneSource {
        async fn next_frame(&mut self) -> Option<AudioFrame> {
            self.rx.recv().await
        }

        fn try_next_frame(&mut self) -> Option<AudioFrame> {
            self.rx.try_recv().ok()
        }
    }

    fn build_stream(
        tx: mpsc::UnboundedSender<AudioFrame>,
        target_rate: u32,
    ) -> Result<cpal::Stream, SpeechError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| {
                SpeechError::Capture("No input device available (microphone not found)".to_string())
            })?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using input device: {}", device_name);

        let supported = device
            .default_input_config()
            .map_err(|e| SpeechError::Capture(e.to_string()))?;
        let channels = supported.channels();
        let device_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.config();

        info!(
            "Input config: {}Hz, {} channels, {:?}",
            device_rate,
            channels,
            supported.sample_format()
        );

        let err_fn = |err| error!("Audio input error: {}", err);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    let samples = resample_linear(&mono, device_rate, target_rate);
                    let _ = tx.send(AudioFrame::new(samples, target_rate));
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(frame_from_pcm16(data, channels, device_rate, target_rate));
                },
                err_fn,
                None,
            ),
            format => {
                return Err(SpeechError::Capture(format!("Unsupported sample format: {:?}", format)))
            }
        }
        .map_err(|e| SpeechError::Capture(e.to_string()))?;

        stream.play().map_err(|e| SpeechError::Capture(e.to_string()))?;
        info!("Audio input started");
        Ok(stream)
    }
}

/// Average interleaved channels into mono
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Build a mono frame at `target_rate` from interleaved 16-bit PCM
pub fn frame_from_pcm16(
    data: &[i16],
    channels: u16,
    sample_rate: u32,
    target_rate: u32,
) -> AudioFrame {
    let as_f32: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
    let mono = downmix(&as_f32, channels);
    AudioFrame::new(resample_linear(&mono, sample_rate, target_rate), target_rate)
}

/// Resample to a different sample rate (simple linear interpolation)
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    let mut out = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = (src_idx.floor() as usize).min(samples.len() - 1);
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;
        out.push(samples[idx_floor] * (1.0 - frac) + samples[idx_ceil] * frac);
    }

    out
}

/// Convert f32 samples to 16-bit PCM
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Encode mono f32 samples as an in-memory 16-bit WAV file
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, SpeechError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| SpeechError::Encode(e.to_string()))?;
        for sample in f32_to_pcm16(samples) {
            writer
                .write_sample(sample)
                .map_err(|e| SpeechError::Encode(e.to_string()))?;
        }
        writer.finalize().map_err(|e| SpeechError::Encode(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Describe the default input device
#[cfg(feature = "voice")]
pub fn default_input_info() -> String {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    match host.default_input_device() {
        Some(device) => {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            match device.default_input_config() {
                Ok(config) => format!(
                    "{}: {}Hz, {} channels",
                    name,
                    config.sample_rate().0,
                    config.channels()
                ),
                Err(_) => name,
            }
        }
        None => "No default input device".to_string(),
    }
}

/// Describe the default output device
#[cfg(feature = "voice")]
pub fn default_output_info() -> String {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    match host.default_output_device() {
        Some(device) => {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            match device.default_output_config() {
                Ok(config) => format!(
                    "{}: {}Hz, {} channels",
                    name,
                    config.sample_rate().0,
                    config.channels()
                ),
                Err(_) => name,
            }
        }
        None => "No default output device".to_string(),
    }
}

#[cfg(not(feature = "voice"))]
pub fn default_input_info() -> String {
    "Audio capture disabled (built without the `voice` feature)".to_string()
}

#[cfg(not(feature = "voice"))]
pub fn default_output_info() -> String {
    "Audio playback disabled (built without the `voice` feature)".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let stereo = vec![0.5, -0.5, 1.0, 0.0];
        assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5]);
        assert_eq!(downmix(&stereo, 1), stereo);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples = vec![0.0, 0.5, -0.5, 0.0];
        let resampled = resample_linear(&samples, 16000, 8000);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resample_linear(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_frame_from_pcm16_downmixes_and_resamples() {
        let stereo_32k: Vec<i16> = [i16::MAX, 0].repeat(640);
        let frame = frame_from_pcm16(&stereo_32k, 2, 32000, 16000);
        assert_eq!(frame.sample_rate, 16000);
        assert_eq!(frame.samples.len(), 320);
        assert!(frame.samples.iter().all(|&s| (s - 0.5).abs() < 1e-4));
    }

    #[test]
    fn test_encode_wav_header_and_length() {
        let wav = encode_wav(&[0.0, 0.5, -0.5], 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte header plus three 16-bit samples
        assert_eq!(wav.len(), 44 + 6);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 320], 16000);
        assert!((frame.duration_ms() - 20.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_scripted_source_drains_in_order() {
        let samples: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let mut source = ScriptedSource::from_samples(&samples, 16000, 4);
        assert_eq!(source.remaining(), 3);

        let first = source.next_frame().await.unwrap();
        assert_eq!(first.samples, vec![0.0, 1.0, 2.0, 3.0]);
        let second = source.try_next_frame().unwrap();
        assert_eq!(second.samples, vec![4.0, 5.0, 6.0, 7.0]);
        let third = source.next_frame().await.unwrap();
        assert_eq!(third.samples, vec![8.0, 9.0]);
        assert!(source.next_frame().await.is_none());
    }
}
