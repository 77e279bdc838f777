//! End-to-end tests for the voice assistant entrypoint with fake room,
//! synthesis backend and audio sink

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use voice_assistant::agent::{ChatMessage, ChatModel};
use voice_assistant::assistant::{AssistantResources, VoiceAssistant};
use voice_assistant::config::{Config, DEFAULT_GREETING};
use voice_assistant::error::{
    ConnectionError, JobError, LlmError, PlaybackError, SpeechError, SynthesisError,
};
use voice_assistant::index::{HashEmbedder, Node, VectorIndex};
use voice_assistant::voice::audio::{AudioSink, AudioSource};
use voice_assistant::voice::stt::SpeechToText;
use voice_assistant::voice::tts::{SynthesisBackend, SynthesisRequest};
use voice_assistant::worker::{
    AutoSubscribe, JobState, Participant, RoomConnector, RoomHandle, Worker,
};

const AUDIO: &[u8] = b"RIFF-fake-wav-payload";

#[derive(Default)]
struct RecordingBackend {
    requests: Mutex<Vec<SynthesisRequest>>,
}

#[async_trait]
impl SynthesisBackend for RecordingBackend {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(AUDIO.to_vec())
    }
}

/// Records each played file's path and contents at playback time
#[derive(Default)]
struct RecordingSink {
    played: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl AudioSink for RecordingSink {
    fn play_file(&self, path: &Path) -> Result<(), PlaybackError> {
        let bytes = std::fs::read(path).map_err(PlaybackError::TempFile)?;
        self.played.lock().unwrap().push((path.to_path_buf(), bytes));
        Ok(())
    }
}

struct SilentStt;

#[async_trait]
impl SpeechToText for SilentStt {
    async fn transcribe(&self, _samples: &[f32], _sample_rate: u32) -> Result<String, SpeechError> {
        Ok(String::new())
    }
}

struct UnusedModel;

#[async_trait]
impl ChatModel for UnusedModel {
    fn model(&self) -> &str {
        "unused"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        Err(LlmError::InvalidResponse("no conversation expected".to_string()))
    }
}

struct FakeRoom {
    waits: Arc<AtomicUsize>,
}

#[async_trait]
impl RoomHandle for FakeRoom {
    fn name(&self) -> &str {
        "fake-room"
    }

    async fn wait_for_participant(&mut self) -> Result<Participant, ConnectionError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(Participant {
            identity: "caller".to_string(),
            name: "Caller".to_string(),
            sid: "PA_caller".to_string(),
        })
    }

    fn audio_input(&mut self) -> Result<Option<Box<dyn AudioSource>>, SpeechError> {
        Ok(None)
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

struct FakeConnector {
    fail: bool,
    connects: AtomicUsize,
    waits: Arc<AtomicUsize>,
    subscriptions: Mutex<Vec<AutoSubscribe>>,
}

impl FakeConnector {
    fn new(fail: bool) -> Self {
        Self {
            fail,
            connects: AtomicUsize::new(0),
            waits: Arc::new(AtomicUsize::new(0)),
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RoomConnector for FakeConnector {
    async fn connect(
        &self,
        room: &str,
        auto_subscribe: AutoSubscribe,
    ) -> Result<Box<dyn RoomHandle>, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().push(auto_subscribe);
        if self.fail {
            return Err(ConnectionError::Unreachable {
                room: room.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeRoom {
            waits: self.waits.clone(),
        }))
    }
}

struct Harness {
    backend: Arc<RecordingBackend>,
    sink: Arc<RecordingSink>,
    connector: Arc<FakeConnector>,
    worker: Worker,
}

async fn harness(fail_connect: bool) -> Harness {
    let embedder = Arc::new(HashEmbedder::new(64));
    let node = Node {
        id: "faq#0".to_string(),
        document_id: "faq.txt".to_string(),
        text: "We are open every day".to_string(),
    };
    let index = VectorIndex::build(vec![node], 1, embedder.as_ref()).await.unwrap();

    let backend = Arc::new(RecordingBackend::default());
    let sink = Arc::new(RecordingSink::default());
    let resources = AssistantResources {
        index: Arc::new(index),
        embedder,
        chat_model: Arc::new(UnusedModel),
        stt: Arc::new(SilentStt),
        synthesis: backend.clone(),
        sink: sink.clone(),
    };

    let connector = Arc::new(FakeConnector::new(fail_connect));
    let options = VoiceAssistant::worker_options(Config::default(), resources);
    let worker = Worker::new(options, connector.clone());

    Harness {
        backend,
        sink,
        connector,
        worker,
    }
}

#[tokio::test]
async fn test_greeting_is_synthesized_and_played_once() {
    let h = harness(false).await;

    let outcome = h.worker.run_job("support").await;
    assert!(outcome.error.is_none(), "job failed: {:?}", outcome.error);
    assert_eq!(outcome.final_state, JobState::Ended);
    assert_eq!(
        outcome.transitions,
        vec![
            JobState::Connecting,
            JobState::WaitingForParticipant,
            JobState::SessionActive,
            JobState::Ended
        ]
    );

    let requests = h.backend.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text, "Hey there! How can I help you today?");
    assert_eq!(requests[0].text, DEFAULT_GREETING);
    assert_eq!(requests[0].language, "en-US");
    assert_eq!(requests[0].voice, "en-US-Wavenet-D");
    assert_eq!(requests[0].speaking_rate, 1.0);

    let played = h.sink.played.lock().unwrap();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].1, AUDIO);
    assert!(!played[0].0.exists(), "temporary audio file was not removed");

    assert_eq!(h.connector.waits.load(Ordering::SeqCst), 1);
    assert_eq!(
        *h.connector.subscriptions.lock().unwrap(),
        vec![AutoSubscribe::AudioOnly]
    );
}

#[tokio::test]
async fn test_failed_connect_never_waits_or_speaks() {
    let h = harness(true).await;

    let outcome = h.worker.run_job("support").await;
    assert_eq!(outcome.final_state, JobState::Failed);
    assert_eq!(outcome.transitions, vec![JobState::Connecting, JobState::Failed]);
    assert!(matches!(
        outcome.error,
        Some(JobError::Connection(ConnectionError::Unreachable { .. }))
    ));

    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.waits.load(Ordering::SeqCst), 0);
    assert!(h.backend.requests.lock().unwrap().is_empty());
    assert!(h.sink.played.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_jobs_share_prewarmed_vad() {
    let h = harness(false).await;
    let vad = h.worker.process().vad.clone();

    h.worker.run_job("one").await;
    h.worker.run_job("two").await;

    assert!(Arc::ptr_eq(&vad, &h.worker.process().vad));
    assert_eq!(h.backend.requests.lock().unwrap().len(), 2);
}
