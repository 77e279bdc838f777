//! Voice session
//!
//! An [`AgentSession`] owns one conversation: room input runs through noise
//! suppression and VAD, finished utterances are transcribed, turn detection
//! decides when the user is done, the chat engine answers and the reply is
//! spoken through the TTS adapter. Utterances play strictly one at a time in
//! the order they were requested.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::room::RoomHandle;
use crate::agent::ContextChatEngine;
use crate::error::JobError;
use crate::voice::audio::{resample_linear, AudioFrame, AudioSource};
use crate::voice::noise::NoiseSuppressor;
use crate::voice::stt::SpeechToText;
use crate::voice::tts::TtsAdapter;
use crate::voice::turn::TurnDetector;
use crate::voice::vad::{VadEvent, VadModel, VadStream};

/// Persona of the agent
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub instructions: String,
}

impl Agent {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }
}

/// Room-level input options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomInputOptions {
    pub noise_cancellation: bool,
}

impl Default for RoomInputOptions {
    fn default() -> Self {
        Self {
            noise_cancellation: true,
        }
    }
}

/// The five pluggable capabilities a session is built from
pub struct SessionComponents {
    pub vad: Arc<VadModel>,
    pub stt: Arc<dyn SpeechToText>,
    pub llm: ContextChatEngine,
    pub tts: TtsAdapter,
    pub turn_detection: TurnDetector,
}

/// Outcome of a `say` request
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechHandle {
    pub id: uuid::Uuid,
    pub text: String,
    pub allow_interruptions: bool,
    /// True if user speech cancelled the utterance before playback
    pub interrupted: bool,
}

impl SpeechHandle {
    pub fn played(&self) -> bool {
        !self.interrupted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub user_turns: usize,
    pub agent_utterances: usize,
    pub interrupted_utterances: usize,
}

pub struct AgentSession {
    vad_model: Arc<VadModel>,
    vad: VadStream,
    stt: Arc<dyn SpeechToText>,
    llm: ContextChatEngine,
    tts: TtsAdapter,
    turn: TurnDetector,
    input: Option<Box<dyn AudioSource>>,
    noise: Option<NoiseSuppressor>,
    pending_events: VecDeque<VadEvent>,
    /// User speech transcribed but not answered yet
    transcript: String,
    started: bool,
    summary: SessionSummary,
}

impl AgentSession {
    pub fn new(components: SessionComponents) -> Self {
        let vad = components.vad.stream();
        Self {
            vad_model: components.vad,
            vad,
            stt: components.stt,
            llm: components.llm,
            tts: components.tts,
            turn: components.turn_detection,
            input: None,
            noise: None,
            pending_events: VecDeque::new(),
            transcript: String::new(),
            started: false,
            summary: SessionSummary::default(),
        }
    }

    /// Attach the session to `room` and apply the agent persona
    pub async fn start(
        &mut self,
        room: &mut dyn RoomHandle,
        agent: Agent,
        options: RoomInputOptions,
    ) -> Result<(), JobError> {
        self.llm.set_instructions(agent.instructions);
        self.input = room.audio_input()?;
        self.noise = options
            .noise_cancellation
            .then(|| NoiseSuppressor::new(self.vad_model.config().sample_rate));
        self.started = true;

        info!(
            "Session started in {} (noise cancellation {})",
            room.name(),
            if options.noise_cancellation { "on" } else { "off" }
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn summary(&self) -> SessionSummary {
        self.summary
    }

    pub fn chat_engine(&self) -> &ContextChatEngine {
        &self.llm
    }

    /// Speak `text`, waiting for playback to finish.
    ///
    /// Input that arrived while the utterance was queued is processed first;
    /// with `allow_interruptions`, user speech in it cancels the utterance.
    /// Once playback has begun it runs to completion, and whatever the input
    /// picked up meanwhile is dropped.
    pub async fn say(
        &mut self,
        text: &str,
        allow_interruptions: bool,
    ) -> Result<SpeechHandle, JobError> {
        if !self.started {
            return Err(JobError::SessionNotStarted);
        }

        let mut handle = SpeechHandle {
            id: uuid::Uuid::new_v4(),
            text: text.to_string(),
            allow_interruptions,
            interrupted: false,
        };

        let speaking = self.user_is_speaking();
        if allow_interruptions && speaking {
            info!("Utterance {} interrupted before playback", handle.id);
            handle.interrupted = true;
            self.summary.interrupted_utterances += 1;
            return Ok(handle);
        }

        debug!("Saying \"{}\"", text);
        let played = self.tts.play(text).await;
        self.discard_playback_input();
        played?;
        self.llm.record_assistant(text);
        self.summary.agent_utterances += 1;
        Ok(handle)
    }

    /// Run the conversation until room input ends
    pub async fn run(&mut self) -> Result<SessionSummary, JobError> {
        if !self.started {
            return Err(JobError::SessionNotStarted);
        }

        loop {
            while let Some(event) = self.pending_events.pop_front() {
                self.handle_event(event).await?;
            }
            self.maybe_respond().await?;

            let frame = match self.input.as_mut() {
                Some(input) => input.next_frame().await,
                None => None,
            };
            let Some(frame) = frame else { break };

            let events = self.process_frame(frame);
            self.pending_events.extend(events);
        }

        if let Some(event) = self.vad.flush() {
            self.handle_event(event).await?;
        }
        if !self.transcript.trim().is_empty() {
            self.respond().await?;
        }

        info!(
            "Session ended: {} user turns, {} utterances",
            self.summary.user_turns, self.summary.agent_utterances
        );
        Ok(self.summary)
    }

    /// Drain buffered input without blocking and report whether the user is
    /// talking
    fn user_is_speaking(&mut self) -> bool {
        let mut started = false;
        while let Some(frame) = self.input.as_mut().and_then(|input| input.try_next_frame()) {
            let events = self.process_frame(frame);
            started |= events.iter().any(|e| matches!(e, VadEvent::SpeechStarted));
            self.pending_events.extend(events);
        }
        started || self.vad.is_speaking()
    }

    /// Input captured while the agent was talking is its own voice coming
    /// back; it never becomes a user turn
    fn discard_playback_input(&mut self) {
        let mut dropped = 0usize;
        while self.input.as_mut().and_then(|input| input.try_next_frame()).is_some() {
            dropped += 1;
        }
        self.vad = self.vad_model.stream();
        if let Some(noise) = self.noise.as_mut() {
            noise.reset();
        }
        if dropped > 0 {
            debug!("Dropped {} input frames captured during playback", dropped);
        }
    }

    fn process_frame(&mut self, frame: AudioFrame) -> Vec<VadEvent> {
        let rate = self.vad_model.config().sample_rate;
        let mut samples = if frame.sample_rate == rate {
            frame.samples
        } else {
            resample_linear(&frame.samples, frame.sample_rate, rate)
        };
        if let Some(noise) = self.noise.as_mut() {
            noise.process(&mut samples);
        }
        self.vad.push(&samples)
    }

    async fn handle_event(&mut self, event: VadEvent) -> Result<(), JobError> {
        match event {
            VadEvent::SpeechStarted => debug!("User started speaking"),
            VadEvent::SpeechEnded(segment) => {
                let text = self.stt.transcribe(&segment.samples, segment.sample_rate).await?;
                if !text.is_empty() {
                    if !self.transcript.is_empty() {
                        self.transcript.push(' ');
                    }
                    self.transcript.push_str(&text);
                }
            }
        }
        Ok(())
    }

    async fn maybe_respond(&mut self) -> Result<(), JobError> {
        if self.transcript.is_empty() || self.vad.is_speaking() {
            return Ok(());
        }
        let silence = Duration::from_millis(self.vad.trailing_silence_ms());
        if self.turn.is_turn_complete(&self.transcript, silence) {
            self.respond().await?;
        }
        Ok(())
    }

    async fn respond(&mut self) -> Result<(), JobError> {
        let message = std::mem::take(&mut self.transcript);
        info!("User: \"{}\"", message);
        self.summary.user_turns += 1;

        let reply = self.llm.chat(&message).await?;
        if !reply.trim().is_empty() {
            self.say(&reply, true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::MockChatModel;
    use crate::error::{ConnectionError, PlaybackError, SpeechError};
    use crate::index::{HashEmbedder, Node, VectorIndex};
    use crate::voice::audio::{AudioSink, ScriptedSource};
    use crate::voice::tts::MockSynthesisBackend;
    use crate::voice::vad::VadConfig;
    use crate::worker::room::Participant;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingSink {
        plays: Mutex<usize>,
    }

    impl AudioSink for CountingSink {
        fn play_file(&self, _path: &Path) -> Result<(), PlaybackError> {
            *self.plays.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct FixedStt(&'static str);

    #[async_trait]
    impl SpeechToText for FixedStt {
        async fn transcribe(&self, _samples: &[f32], _rate: u32) -> Result<String, SpeechError> {
            Ok(self.0.to_string())
        }
    }

    struct ScriptedRoom {
        input: Option<Box<dyn AudioSource>>,
    }

    impl ScriptedRoom {
        fn new(source: impl AudioSource + 'static) -> Self {
            Self {
                input: Some(Box::new(source)),
            }
        }
    }

    #[async_trait]
    impl RoomHandle for ScriptedRoom {
        fn name(&self) -> &str {
            "test-room"
        }

        async fn wait_for_participant(&mut self) -> Result<Participant, ConnectionError> {
            Ok(Participant {
                identity: "user".to_string(),
                name: "User".to_string(),
                sid: "PA_1".to_string(),
            })
        }

        fn audio_input(&mut self) -> Result<Option<Box<dyn AudioSource>>, SpeechError> {
            Ok(self.input.take())
        }

        async fn disconnect(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    /// Room input shared with the speaker, like a microphone next to it
    #[derive(Clone, Default)]
    struct SharedInput(Arc<Mutex<VecDeque<AudioFrame>>>);

    impl SharedInput {
        fn push_samples(&self, samples: &[f32]) {
            let mut queue = self.0.lock().unwrap();
            for chunk in samples.chunks(320) {
                queue.push_back(AudioFrame::new(chunk.to_vec(), 16000));
            }
        }
    }

    #[async_trait]
    impl AudioSource for SharedInput {
        async fn next_frame(&mut self) -> Option<AudioFrame> {
            self.0.lock().unwrap().pop_front()
        }

        fn try_next_frame(&mut self) -> Option<AudioFrame> {
            self.0.lock().unwrap().pop_front()
        }
    }

    /// Every playback is picked up again by the shared input
    struct EchoingSink {
        input: SharedInput,
        plays: Mutex<usize>,
    }

    impl AudioSink for EchoingSink {
        fn play_file(&self, _path: &Path) -> Result<(), PlaybackError> {
            *self.plays.lock().unwrap() += 1;
            let mut echo = tone(8000);
            echo.extend(vec![0.0f32; 16000]);
            self.input.push_samples(&echo);
            Ok(())
        }
    }

    async fn session(model: MockChatModel, sink: Arc<dyn AudioSink>) -> AgentSession {
        session_with_stt(model, sink, "What is the answer?").await
    }

    async fn session_with_stt(
        model: MockChatModel,
        sink: Arc<dyn AudioSink>,
        heard: &'static str,
    ) -> AgentSession {
        let embedder = HashEmbedder::new(32);
        let node = Node {
            id: "n".to_string(),
            document_id: "n.txt".to_string(),
            text: "the answer is forty two".to_string(),
        };
        let index = Arc::new(VectorIndex::build(vec![node], 1, &embedder).await.unwrap());
        let llm = ContextChatEngine::new(index, Arc::new(embedder), Arc::new(model), 1);

        let mut backend = MockSynthesisBackend::new();
        backend.expect_synthesize().returning(|_| Ok(vec![1, 2, 3]));
        let tts = TtsAdapter::new(Arc::new(backend), sink);

        AgentSession::new(SessionComponents {
            vad: Arc::new(VadModel::with_config(VadConfig::default())),
            stt: Arc::new(FixedStt(heard)),
            llm,
            tts,
            turn_detection: TurnDetector::default(),
        })
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.4 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
            .collect()
    }

    fn speech_then_silence() -> ScriptedSource {
        let mut samples = vec![0.0f32; 3200];
        samples.extend(tone(8000));
        samples.extend(vec![0.0f32; 32000]);
        ScriptedSource::from_samples(&samples, 16000, 320)
    }

    #[tokio::test]
    async fn test_say_requires_start() {
        let sink = Arc::new(CountingSink::default());
        let mut session = session(MockChatModel::new(), sink).await;
        assert!(matches!(
            session.say("hi", true).await,
            Err(JobError::SessionNotStarted)
        ));
    }

    #[tokio::test]
    async fn test_conversation_turn() {
        let sink = Arc::new(CountingSink::default());
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .times(1)
            .withf(|messages| {
                messages.last().map(|m| m.content.as_str()) == Some("What is the answer?")
            })
            .returning(|_| Ok("Forty two.".to_string()));

        let mut session = session(model, sink.clone()).await;
        let mut room = ScriptedRoom::new(speech_then_silence());
        session
            .start(
                &mut room,
                Agent::new("Be brief."),
                RoomInputOptions {
                    noise_cancellation: false,
                },
            )
            .await
            .unwrap();

        let summary = session.run().await.unwrap();
        assert_eq!(summary.user_turns, 1);
        assert_eq!(summary.agent_utterances, 1);
        assert_eq!(*sink.plays.lock().unwrap(), 1);
        assert_eq!(session.chat_engine().instructions(), "Be brief.");
    }

    #[tokio::test]
    async fn test_user_speech_interrupts_queued_utterance() {
        let sink = Arc::new(CountingSink::default());
        let mut session = session(MockChatModel::new(), sink.clone()).await;
        let mut room = ScriptedRoom::new(ScriptedSource::from_samples(&tone(4800), 16000, 320));
        session
            .start(&mut room, Agent::new("x"), RoomInputOptions::default())
            .await
            .unwrap();

        let handle = session.say("Hello!", true).await.unwrap();
        assert!(handle.interrupted);
        assert_eq!(*sink.plays.lock().unwrap(), 0);
        assert_eq!(session.summary().interrupted_utterances, 1);
    }

    #[tokio::test]
    async fn test_uninterruptible_utterance_always_plays() {
        let sink = Arc::new(CountingSink::default());
        let mut session = session(MockChatModel::new(), sink.clone()).await;
        let mut room = ScriptedRoom::new(ScriptedSource::from_samples(&tone(4800), 16000, 320));
        session
            .start(&mut room, Agent::new("x"), RoomInputOptions::default())
            .await
            .unwrap();

        let handle = session.say("Hello!", false).await.unwrap();
        assert!(handle.played());
        assert_eq!(*sink.plays.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_greeting_echo_is_not_a_user_turn() {
        let input = SharedInput::default();
        let sink = Arc::new(EchoingSink {
            input: input.clone(),
            plays: Mutex::new(0),
        });
        let mut model = MockChatModel::new();
        model.expect_complete().times(0);

        let greeting = "Hey there! How can I help you today?";
        let mut session = session_with_stt(model, sink.clone(), greeting).await;
        let mut room = ScriptedRoom::new(input.clone());
        session
            .start(&mut room, Agent::new("x"), RoomInputOptions::default())
            .await
            .unwrap();

        let handle = session.say(greeting, true).await.unwrap();
        assert!(handle.played());
        assert!(input.0.lock().unwrap().is_empty());

        let summary = session.run().await.unwrap();
        assert_eq!(summary.user_turns, 0);
        assert_eq!(summary.agent_utterances, 1);
        assert_eq!(*sink.plays.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reply_echo_does_not_trigger_another_reply() {
        let input = SharedInput::default();
        let mut speech = vec![0.0f32; 3200];
        speech.extend(tone(8000));
        speech.extend(vec![0.0f32; 32000]);
        input.push_samples(&speech);

        let sink = Arc::new(EchoingSink {
            input: input.clone(),
            plays: Mutex::new(0),
        });
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .times(1)
            .returning(|_| Ok("Forty two.".to_string()));

        let mut session = session(model, sink.clone()).await;
        let mut room = ScriptedRoom::new(input.clone());
        session
            .start(
                &mut room,
                Agent::new("x"),
                RoomInputOptions {
                    noise_cancellation: false,
                },
            )
            .await
            .unwrap();

        let summary = session.run().await.unwrap();
        assert_eq!(summary.user_turns, 1);
        assert_eq!(summary.agent_utterances, 1);
        assert_eq!(*sink.plays.lock().unwrap(), 1);
    }
}
