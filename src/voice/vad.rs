//! Voice Activity Detection (VAD) Module
//!
//! Speech detection with either the Silero ONNX model or an energy detector
//! with an adaptive noise floor.
//!
//! # Architecture
//!
//! ```text
//! Audio Stream → windows → Silero probability / energy vs. noise floor
//!              → Onset / Hangover → Segments
//! ```
//!
//! [`VadModel`] holds the immutable detector (including the ONNX session).
//! It is loaded once per worker process and shared read-only; each session
//! owns a [`VadStream`] carrying the mutable detection state.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::config::{VadBackend, VadSettings};
use crate::error::SpeechError;

/// Energy detector window length in milliseconds
pub const WINDOW_MS: u32 = 10;

/// Consecutive speech windows required to confirm speech onset
pub const DEFAULT_ONSET_FRAMES: usize = 3;

/// Audio kept from before the onset so word starts are not clipped
pub const PRE_ROLL_MS: u32 = 200;

const MIN_NOISE_FLOOR: f32 = 1e-4;
const INITIAL_NOISE_FLOOR: f32 = 1e-3;
const ADAPTATION_RATE: f32 = 0.05;

/// Detector parameters, derived from [`VadSettings`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    pub sample_rate: u32,
    /// Window size in samples
    pub frame_size: usize,
    pub window_ms: u32,
    /// Energy above the noise floor that counts as speech, in dB
    pub threshold_db: f32,
    pub onset_frames: usize,
    /// Silent windows after speech before the segment is closed
    pub hangover_frames: usize,
    /// Shorter segments are discarded as clicks or breaths
    pub min_speech_frames: usize,
    pub pre_roll_frames: usize,
}

impl VadConfig {
    /// Parameters for windows of `frame_size` samples
    pub fn with_frame_size(settings: &VadSettings, frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        let window_ms =
            ((frame_size as u64 * 1000) / settings.sample_rate.max(1) as u64).max(1) as u32;
        Self {
            sample_rate: settings.sample_rate,
            frame_size,
            window_ms,
            threshold_db: settings.threshold_db,
            onset_frames: DEFAULT_ONSET_FRAMES,
            hangover_frames: (settings.min_silence_ms / window_ms).max(1) as usize,
            min_speech_frames: (settings.min_speech_ms / window_ms).max(1) as usize,
            pre_roll_frames: (PRE_ROLL_MS / window_ms) as usize,
        }
    }
}

impl From<&VadSettings> for VadConfig {
    fn from(settings: &VadSettings) -> Self {
        Self::with_frame_size(settings, (settings.sample_rate * WINDOW_MS / 1000) as usize)
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::from(&VadSettings::default())
    }
}

enum Detector {
    Energy,
    #[cfg(feature = "voice")]
    Silero {
        session: silero::SileroSession,
        speech_probability: f32,
    },
}

/// Shared, read-only voice activity model
pub struct VadModel {
    config: VadConfig,
    threshold_ratio: f32,
    detector: Detector,
}

impl std::fmt::Debug for VadModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadModel")
            .field("config", &self.config)
            .field("backend", &self.backend())
            .finish()
    }
}

impl VadModel {
    /// Load the detector. Runs once per worker process.
    ///
    /// A Silero model that cannot be loaded falls back to the energy detector.
    pub fn load(settings: &VadSettings) -> Self {
        let model = match settings.backend {
            VadBackend::Energy => Self::energy(settings),
            VadBackend::Silero => Self::load_silero(settings).unwrap_or_else(|e| {
                warn!("{}; using the energy detector", e);
                Self::energy(settings)
            }),
        };
        info!(
            "Loaded {:?} VAD: {}Hz, {} sample windows",
            model.backend(),
            model.config.sample_rate,
            model.config.frame_size
        );
        model
    }

    /// Energy detector with explicit parameters
    pub fn with_config(config: VadConfig) -> Self {
        Self {
            config,
            threshold_ratio: 10f32.powf(config.threshold_db / 20.0),
            detector: Detector::Energy,
        }
    }

    fn energy(settings: &VadSettings) -> Self {
        Self::with_config(VadConfig::from(settings))
    }

    #[cfg(feature = "voice")]
    fn load_silero(settings: &VadSettings) -> Result<Self, SpeechError> {
        if settings.sample_rate != silero::SAMPLE_RATE {
            return Err(SpeechError::VadModel(format!(
                "Silero needs {}Hz input, configured {}Hz",
                silero::SAMPLE_RATE,
                settings.sample_rate
            )));
        }
        let path = silero::model_path()?;
        let session = silero::SileroSession::open(&path)?;
        let config = VadConfig::with_frame_size(settings, silero::WINDOW_SIZE);
        Ok(Self {
            config,
            threshold_ratio: 10f32.powf(config.threshold_db / 20.0),
            detector: Detector::Silero {
                session,
                speech_probability: settings.speech_probability,
            },
        })
    }

    #[cfg(not(feature = "voice"))]
    fn load_silero(_settings: &VadSettings) -> Result<Self, SpeechError> {
        Err(SpeechError::VadModel("Silero needs the voice feature".to_string()))
    }

    pub fn backend(&self) -> VadBackend {
        match self.detector {
            Detector::Energy => VadBackend::Energy,
            #[cfg(feature = "voice")]
            Detector::Silero { .. } => VadBackend::Silero,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Start an independent detection stream over this model
    pub fn stream(self: &Arc<Self>) -> VadStream {
        VadStream::new(self.clone())
    }
}

/// VAD state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected
    Silence,
    /// Possibly starting speech (in onset period)
    MaybeSpeech,
    /// Speech confirmed
    Speech,
    /// Speech ending (in hangover period)
    SpeechEnding,
}

/// A completed utterance
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SpeechSegment {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechEnded(SpeechSegment),
}

/// Per-session detection state over a shared [`VadModel`]
pub struct VadStream {
    model: Arc<VadModel>,
    state: VadState,
    /// Recurrent state of the Silero model for this stream
    #[cfg(feature = "voice")]
    silero_state: Vec<f32>,
    noise_floor: f32,
    /// Samples not yet forming a full window
    pending: Vec<f32>,
    pre_roll: VecDeque<Vec<f32>>,
    onset: Vec<Vec<f32>>,
    speech: Vec<f32>,
    speech_frames: usize,
    silence_frames: usize,
    /// Windows since the last window classified as speech
    frames_since_speech: usize,
    heard_speech: bool,
}

impl VadStream {
    pub fn new(model: Arc<VadModel>) -> Self {
        Self {
            model,
            state: VadState::Silence,
            #[cfg(feature = "voice")]
            silero_state: silero::initial_state(),
            noise_floor: INITIAL_NOISE_FLOOR,
            pending: Vec::new(),
            pre_roll: VecDeque::new(),
            onset: Vec::new(),
            speech: Vec::new(),
            speech_frames: 0,
            silence_frames: 0,
            frames_since_speech: 0,
            heard_speech: false,
        }
    }

    /// Feed samples, returning the events they completed
    pub fn push(&mut self, samples: &[f32]) -> Vec<VadEvent> {
        let frame_size = self.model.config.frame_size;
        self.pending.extend_from_slice(samples);

        let mut events = Vec::new();
        while self.pending.len() >= frame_size {
            let window: Vec<f32> = self.pending.drain(..frame_size).collect();
            if let Some(event) = self.process_window(window) {
                events.push(event);
            }
        }
        events
    }

    /// Close any open segment, e.g. when the input ends
    pub fn flush(&mut self) -> Option<VadEvent> {
        self.pending.clear();
        match self.state {
            VadState::Speech | VadState::SpeechEnding => self.close_segment(),
            VadState::MaybeSpeech | VadState::Silence => {
                self.onset.clear();
                self.state = VadState::Silence;
                None
            }
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// True while an utterance is open
    pub fn is_speaking(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::SpeechEnding)
    }

    /// Milliseconds of audio since speech was last heard
    pub fn trailing_silence_ms(&self) -> u64 {
        if !self.heard_speech {
            return 0;
        }
        (self.frames_since_speech as u64) * self.model.config.window_ms as u64
    }

    pub fn noise_floor_db(&self) -> f32 {
        20.0 * self.noise_floor.log10().max(-100.0)
    }

    fn process_window(&mut self, window: Vec<f32>) -> Option<VadEvent> {
        let config = self.model.config;
        let energy = calculate_energy(&window);
        let threshold = self.noise_floor * self.model.threshold_ratio;
        let is_speech = self.classify(&window, energy > threshold);

        if !is_speech && !self.is_speaking() {
            self.noise_floor = (self.noise_floor * (1.0 - ADAPTATION_RATE)
                + energy * ADAPTATION_RATE)
                .max(MIN_NOISE_FLOOR);
        }

        if is_speech {
            self.frames_since_speech = 0;
            self.heard_speech = true;
        } else {
            self.frames_since_speech += 1;
        }

        trace!("energy={:.5} floor={:.5} speech={}", energy, self.noise_floor, is_speech);

        match self.state {
            VadState::Silence | VadState::MaybeSpeech => {
                if is_speech {
                    self.onset.push(window);
                    if self.onset.len() >= config.onset_frames {
                        self.state = VadState::Speech;
                        self.speech = self.pre_roll.drain(..).flatten().collect();
                        for frame in self.onset.drain(..) {
                            self.speech.extend_from_slice(&frame);
                        }
                        self.speech_frames = config.onset_frames;
                        self.silence_frames = 0;
                        debug!("Speech started");
                        return Some(VadEvent::SpeechStarted);
                    }
                    self.state = VadState::MaybeSpeech;
                } else {
                    for frame in self.onset.drain(..) {
                        self.pre_roll.push_back(frame);
                    }
                    self.pre_roll.push_back(window);
                    while self.pre_roll.len() > config.pre_roll_frames {
                        self.pre_roll.pop_front();
                    }
                    self.state = VadState::Silence;
                }
                None
            }
            VadState::Speech | VadState::SpeechEnding => {
                self.speech.extend_from_slice(&window);
                if is_speech {
                    self.speech_frames += 1;
                    self.silence_frames = 0;
                    self.state = VadState::Speech;
                    None
                } else {
                    self.silence_frames += 1;
                    self.state = VadState::SpeechEnding;
                    if self.silence_frames >= config.hangover_frames {
                        self.close_segment()
                    } else {
                        None
                    }
                }
            }
        }
    }

    /// Speech decision for one window; `energy_says` is the energy verdict
    #[cfg(feature = "voice")]
    fn classify(&mut self, window: &[f32], energy_says: bool) -> bool {
        match &self.model.detector {
            Detector::Energy => energy_says,
            Detector::Silero {
                session,
                speech_probability,
            } => match session.probability(window, &mut self.silero_state) {
                Ok(p) => p >= *speech_probability,
                Err(e) => {
                    warn!("VAD inference error: {}", e);
                    false
                }
            },
        }
    }

    #[cfg(not(feature = "voice"))]
    fn classify(&mut self, _window: &[f32], energy_says: bool) -> bool {
        energy_says
    }

    fn close_segment(&mut self) -> Option<VadEvent> {
        let config = self.model.config;
        let trailing = self.silence_frames * config.frame_size;
        let mut samples = std::mem::take(&mut self.speech);
        samples.truncate(samples.len().saturating_sub(trailing));
        let long_enough = self.speech_frames >= config.min_speech_frames;

        self.state = VadState::Silence;
        self.speech_frames = 0;
        self.silence_frames = 0;

        if long_enough {
            debug!("Speech ended ({} samples)", samples.len());
            Some(VadEvent::SpeechEnded(SpeechSegment {
                samples,
                sample_rate: config.sample_rate,
            }))
        } else {
            debug!("Discarded {} samples of short noise", samples.len());
            None
        }
    }
}

/// Silero VAD v5 on ONNX Runtime
#[cfg(feature = "voice")]
mod silero {
    use crate::error::SpeechError;
    use ort::session::Session;
    use ort::value::Value;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tracing::info;

    pub const SILERO_VAD_URL: &str =
        "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";
    pub const MODEL_FILENAME: &str = "silero_vad.onnx";
    pub const SAMPLE_RATE: u32 = 16000;
    /// 32ms at 16kHz
    pub const WINDOW_SIZE: usize = 512;
    /// Hidden state tensor (2, 1, 128)
    const STATE_LEN: usize = 2 * 128;

    pub fn initial_state() -> Vec<f32> {
        vec![0.0; STATE_LEN]
    }

    fn model_err(e: impl std::fmt::Display) -> SpeechError {
        SpeechError::VadModel(e.to_string())
    }

    pub fn model_path() -> Result<PathBuf, SpeechError> {
        let dir = crate::config::data_dir().map_err(model_err)?.join("models");
        let path = dir.join(MODEL_FILENAME);
        if !path.is_file() {
            return Err(SpeechError::VadModel(format!("{} not found", path.display())));
        }
        Ok(path)
    }

    /// One ONNX session shared by every stream; inference takes the lock
    pub struct SileroSession {
        session: Mutex<Session>,
    }

    impl SileroSession {
        pub fn open(path: &Path) -> Result<Self, SpeechError> {
            let session = Session::builder()
                .map_err(model_err)?
                .with_intra_threads(1)
                .map_err(model_err)?
                .commit_from_file(path)
                .map_err(model_err)?;
            info!("Silero VAD loaded from {}", path.display());
            Ok(Self {
                session: Mutex::new(session),
            })
        }

        /// Speech probability of `window`, advancing the caller's `state`
        pub fn probability(&self, window: &[f32], state: &mut [f32]) -> Result<f32, SpeechError> {
            let input =
                Value::from_array(([1usize, window.len()], window.to_vec())).map_err(model_err)?;
            let state_in = Value::from_array(([2usize, 1usize, 128usize], state.to_vec()))
                .map_err(model_err)?;
            let sr = Value::from_array(([1usize], vec![SAMPLE_RATE as i64])).map_err(model_err)?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| SpeechError::VadModel("session lock poisoned".to_string()))?;
            let outputs = session
                .run(ort::inputs![input, state_in, sr])
                .map_err(model_err)?;

            let (_, prob) = outputs[0].try_extract_tensor::<f32>().map_err(model_err)?;
            let (_, next_state) = outputs[1].try_extract_tensor::<f32>().map_err(model_err)?;
            if next_state.len() == state.len() {
                state.copy_from_slice(next_state);
            }
            Ok(prob.first().copied().unwrap_or(0.0))
        }
    }
}

/// Download the Silero model into the data directory if it is missing.
/// Runs before prewarm so loading the model never touches the network.
#[cfg(feature = "voice")]
pub async fn ensure_silero_model() -> Result<std::path::PathBuf, SpeechError> {
    let dir = crate::config::data_dir()
        .map_err(|e| SpeechError::VadModel(e.to_string()))?
        .join("models");
    let path = dir.join(silero::MODEL_FILENAME);
    if path.is_file() {
        return Ok(path);
    }

    info!("Downloading Silero VAD model to {}", path.display());
    let response = reqwest::get(silero::SILERO_VAD_URL).await?;
    if !response.status().is_success() {
        return Err(SpeechError::VadModel(format!(
            "model download failed: HTTP {}",
            response.status()
        )));
    }
    let bytes = response.bytes().await?;

    let io_err = |e: std::io::Error| SpeechError::VadModel(e.to_string());
    tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
    let partial = dir.join(format!("{}.part", silero::MODEL_FILENAME));
    tokio::fs::write(&partial, &bytes).await.map_err(io_err)?;
    tokio::fs::rename(&partial, &path).await.map_err(io_err)?;
    info!("Silero VAD model downloaded ({} bytes)", bytes.len());
    Ok(path)
}

/// Calculate RMS energy of a frame
fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy_settings() -> VadSettings {
        VadSettings {
            backend: VadBackend::Energy,
            ..VadSettings::default()
        }
    }

    fn model() -> Arc<VadModel> {
        Arc::new(VadModel::load(&energy_settings()))
    }

    #[test]
    fn test_config_from_settings() {
        let config = VadConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_size, 160);
        assert_eq!(config.window_ms, 10);
        assert_eq!(config.hangover_frames, 55);
        assert_eq!(config.min_speech_frames, 10);
    }

    #[test]
    fn test_calculate_energy() {
        assert_eq!(calculate_energy(&[0.0; 160]), 0.0);
        assert!((calculate_energy(&[0.5; 160]) - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_silence_emits_nothing() {
        let mut stream = model().stream();
        assert!(stream.push(&vec![0.0f32; 16000]).is_empty());
        assert_eq!(stream.state(), VadState::Silence);
        assert_eq!(stream.trailing_silence_ms(), 0);
    }

    #[test]
    fn test_utterance_start_and_end() {
        let mut stream = model().stream();
        let mut events = stream.push(&vec![0.0f32; 3200]);
        events.extend(stream.push(&vec![0.5f32; 8000]));
        assert_eq!(events, vec![VadEvent::SpeechStarted]);
        assert!(stream.is_speaking());

        let events = stream.push(&vec![0.0f32; 16000]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            VadEvent::SpeechEnded(segment) => {
                // Speech plus pre-roll, trailing hangover trimmed
                assert!(segment.samples.len() >= 8000);
                assert!(segment.samples.len() <= 8000 + 3200);
                assert_eq!(segment.sample_rate, 16000);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!stream.is_speaking());
        assert!(stream.trailing_silence_ms() >= 550);
    }

    #[test]
    fn test_short_click_is_discarded() {
        let mut stream = model().stream();
        stream.push(&vec![0.0f32; 1600]);
        // 40ms burst: passes onset, fails minimum speech duration
        let mut events = stream.push(&vec![0.5f32; 640]);
        events.extend(stream.push(&vec![0.0f32; 16000]));
        assert_eq!(events, vec![VadEvent::SpeechStarted]);
    }

    #[test]
    fn test_flush_closes_open_segment() {
        let mut stream = model().stream();
        stream.push(&vec![0.5f32; 4800]);
        assert!(stream.is_speaking());
        assert!(matches!(stream.flush(), Some(VadEvent::SpeechEnded(_))));
        assert!(stream.flush().is_none());
    }

    #[test]
    fn test_streams_share_model_but_not_state() {
        let model = model();
        let mut a = model.stream();
        let b = model.stream();
        a.push(&vec![0.5f32; 4800]);
        assert!(a.is_speaking());
        assert!(!b.is_speaking());
        assert_eq!(Arc::strong_count(&model), 3);
    }

    #[test]
    fn test_partial_windows_are_buffered() {
        let mut stream = model().stream();
        for _ in 0..100 {
            stream.push(&[0.5f32; 50]);
        }
        assert!(stream.is_speaking());
    }

    #[test]
    fn test_silero_window_config() {
        let config = VadConfig::with_frame_size(&VadSettings::default(), 512);
        assert_eq!(config.window_ms, 32);
        assert_eq!(config.hangover_frames, 17);
        assert_eq!(config.min_speech_frames, 3);
        assert_eq!(config.pre_roll_frames, 6);
    }

    #[test]
    fn test_energy_backend_selected() {
        assert_eq!(model().backend(), VadBackend::Energy);
    }

    #[test]
    fn test_unusable_silero_falls_back_to_energy() {
        let settings = VadSettings {
            backend: VadBackend::Silero,
            sample_rate: 8000,
            ..VadSettings::default()
        };
        let model = VadModel::load(&settings);
        assert_eq!(model.backend(), VadBackend::Energy);
        assert_eq!(model.config().frame_size, 80);
    }
}
