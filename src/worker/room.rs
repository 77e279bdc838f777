//! Room connection
//!
//! The worker joins rooms on a LiveKit server. The Room Service API makes
//! sure the room exists (and validates the URL and credentials), then the
//! agent joins as a participant with its own access token and listens to
//! the caller's microphone track. The `console` command swaps the room for
//! the local microphone.

use async_trait::async_trait;
use livekit_api::access_token::{AccessToken, VideoGrants};
use livekit_api::services::room::{CreateRoomOptions, RoomClient};
use std::time::Duration;
use tracing::debug;

use crate::config::RoomConfig;
use crate::error::{ConnectionError, SpeechError};
use crate::voice::audio::AudioSource;

#[cfg(feature = "voice")]
pub use media::{LiveKitRoom, LocalConnector, LocalRoom, RoomAudioSource};

/// Which tracks the agent subscribes to after joining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoSubscribe {
    #[default]
    AudioOnly,
    SubscribeAll,
    SubscribeNone,
}

impl AutoSubscribe {
    pub fn subscribes_audio(self) -> bool {
        matches!(self, AutoSubscribe::AudioOnly | AutoSubscribe::SubscribeAll)
    }
}

/// A remote participant in the room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub identity: String,
    pub name: String,
    pub sid: String,
}

#[async_trait]
pub trait RoomConnector: Send + Sync {
    /// Join `room`. Fails if the room service cannot be reached.
    async fn connect(
        &self,
        room: &str,
        auto_subscribe: AutoSubscribe,
    ) -> Result<Box<dyn RoomHandle>, ConnectionError>;
}

/// A joined room
#[async_trait]
pub trait RoomHandle: Send {
    fn name(&self) -> &str;

    /// Block until a participant other than the agent is present
    async fn wait_for_participant(&mut self) -> Result<Participant, ConnectionError>;

    /// Input audio for the session; `None` when audio is not subscribed
    fn audio_input(&mut self) -> Result<Option<Box<dyn AudioSource>>, SpeechError>;

    async fn disconnect(&mut self) -> Result<(), ConnectionError>;
}

/// The Room Service API speaks HTTP on the same host as the signalling URL
pub fn service_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        url.to_string()
    }
}

/// Grants for joining `room`; subscribing is only granted when the
/// participant subscribes to something
pub fn join_grants(room: &str, auto_subscribe: AutoSubscribe) -> VideoGrants {
    VideoGrants {
        room_join: true,
        room: room.to_string(),
        can_publish: true,
        can_subscribe: auto_subscribe != AutoSubscribe::SubscribeNone,
        can_publish_data: true,
        ..Default::default()
    }
}

/// Mint a join token for `identity`
pub fn mint_participant_token(
    config: &RoomConfig,
    identity: &str,
    name: &str,
    grants: VideoGrants,
) -> Result<String, ConnectionError> {
    if config.api_key.is_empty() || config.api_secret.is_empty() {
        return Err(ConnectionError::NotConfigured(
            "set LIVEKIT_API_KEY and LIVEKIT_API_SECRET".to_string(),
        ));
    }

    AccessToken::with_api_key(&config.api_key, &config.api_secret)
        .with_identity(identity)
        .with_name(name)
        .with_grants(grants)
        .with_ttl(Duration::from_secs(config.token_ttl_secs))
        .to_jwt()
        .map_err(|e| ConnectionError::Token(e.to_string()))
}

/// Connector for a LiveKit server
pub struct LiveKitConnector {
    config: RoomConfig,
}

impl LiveKitConnector {
    pub fn new(config: RoomConfig) -> Result<Self, ConnectionError> {
        if config.url.is_empty() {
            return Err(ConnectionError::NotConfigured("set LIVEKIT_URL".to_string()));
        }
        Ok(Self { config })
    }

    #[cfg(feature = "voice")]
    async fn join(
        &self,
        room: &str,
        token: &str,
        auto_subscribe: AutoSubscribe,
    ) -> Result<Box<dyn RoomHandle>, ConnectionError> {
        let joined = LiveKitRoom::join(&self.config.url, room, token, auto_subscribe).await?;
        Ok(Box::new(joined))
    }

    #[cfg(not(feature = "voice"))]
    async fn join(
        &self,
        _room: &str,
        _token: &str,
        _auto_subscribe: AutoSubscribe,
    ) -> Result<Box<dyn RoomHandle>, ConnectionError> {
        Err(ConnectionError::NotConfigured(
            "built without the voice feature, room media is unavailable".to_string(),
        ))
    }
}

#[async_trait]
impl RoomConnector for LiveKitConnector {
    async fn connect(
        &self,
        room: &str,
        auto_subscribe: AutoSubscribe,
    ) -> Result<Box<dyn RoomHandle>, ConnectionError> {
        let identity = &self.config.agent_identity;
        let token = mint_participant_token(
            &self.config,
            identity,
            identity,
            join_grants(room, auto_subscribe),
        )?;

        let client = RoomClient::with_api_key(
            &service_url(&self.config.url),
            &self.config.api_key,
            &self.config.api_secret,
        );
        let created = client
            .create_room(room, CreateRoomOptions::default())
            .await
            .map_err(|e| ConnectionError::Unreachable {
                room: room.to_string(),
                message: e.to_string(),
            })?;
        debug!("Room {} ready (sid {})", created.name, created.sid);

        self.join(room, &token, auto_subscribe).await
    }
}

#[cfg(feature = "voice")]
mod media {
    use super::{AutoSubscribe, Participant, RoomConnector, RoomHandle};
    use crate::error::{ConnectionError, SpeechError};
    use crate::voice::audio::{
        frame_from_pcm16, AudioFrame, AudioSource, MicrophoneSource, DEFAULT_SAMPLE_RATE,
    };
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use livekit::participant::RemoteParticipant;
    use livekit::publication::RemoteTrackPublication;
    use livekit::track::{RemoteAudioTrack, RemoteTrack, TrackKind};
    use livekit::webrtc::audio_frame::AudioFrame as RoomFrame;
    use livekit::webrtc::audio_stream::native::NativeAudioStream;
    use livekit::{Room, RoomEvent, RoomOptions};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::{debug, info};

    /// The agent's seat in a LiveKit room
    pub struct LiveKitRoom {
        name: String,
        room: Room,
        events: Option<mpsc::UnboundedReceiver<RoomEvent>>,
        auto_subscribe: AutoSubscribe,
        participant: Option<RemoteParticipant>,
        /// Audio tracks that arrived before the session asked for input
        early_tracks: Vec<(String, RemoteAudioTrack)>,
    }

    impl LiveKitRoom {
        pub async fn join(
            url: &str,
            name: &str,
            token: &str,
            auto_subscribe: AutoSubscribe,
        ) -> Result<Self, ConnectionError> {
            let mut options = RoomOptions::default();
            // Audio-only subscribes per publication
            options.auto_subscribe = auto_subscribe == AutoSubscribe::SubscribeAll;

            let (room, events) = Room::connect(url, token, options).await.map_err(|e| {
                ConnectionError::Unreachable {
                    room: name.to_string(),
                    message: e.to_string(),
                }
            })?;
            info!("Joined room {}", name);

            for participant in room.remote_participants().values() {
                for publication in participant.track_publications().values() {
                    request_audio(auto_subscribe, publication);
                }
            }

            Ok(Self {
                name: name.to_string(),
                room,
                events: Some(events),
                auto_subscribe,
                participant: None,
                early_tracks: Vec::new(),
            })
        }

        fn already_subscribed(&self, identity: &str) -> Option<RemoteAudioTrack> {
            if let Some(pos) = self.early_tracks.iter().rposition(|(who, _)| who == identity) {
                return Some(self.early_tracks[pos].1.clone());
            }
            let participant = self.participant.as_ref()?;
            participant
                .track_publications()
                .values()
                .find_map(|publication| match publication.track() {
                    Some(RemoteTrack::Audio(track)) => Some(track),
                    _ => None,
                })
        }
    }

    #[async_trait]
    impl RoomHandle for LiveKitRoom {
        fn name(&self) -> &str {
            &self.name
        }

        async fn wait_for_participant(&mut self) -> Result<Participant, ConnectionError> {
            if let Some(p) = self
                .room
                .remote_participants()
                .into_values()
                .min_by_key(identity_of)
            {
                let participant = describe(&p);
                self.participant = Some(p);
                return Ok(participant);
            }

            let events = self
                .events
                .as_mut()
                .ok_or_else(|| ConnectionError::Closed(self.name.clone()))?;
            loop {
                match events.recv().await {
                    Some(RoomEvent::ParticipantConnected(p)) => {
                        let participant = describe(&p);
                        self.participant = Some(p);
                        return Ok(participant);
                    }
                    Some(RoomEvent::TrackPublished { publication, .. }) => {
                        request_audio(self.auto_subscribe, &publication);
                    }
                    Some(RoomEvent::TrackSubscribed {
                        track: RemoteTrack::Audio(track),
                        participant,
                        ..
                    }) => self.early_tracks.push((identity_of(&participant), track)),
                    Some(RoomEvent::Disconnected { .. }) | None => {
                        return Err(ConnectionError::Closed(self.name.clone()));
                    }
                    Some(_) => {}
                }
            }
        }

        fn audio_input(&mut self) -> Result<Option<Box<dyn AudioSource>>, SpeechError> {
            if !self.auto_subscribe.subscribes_audio() {
                return Ok(None);
            }
            let events = self.events.take().ok_or_else(|| {
                SpeechError::Capture("room audio is already attached to a session".to_string())
            })?;

            let identity = self.participant.as_ref().map(identity_of);
            let initial = identity.as_deref().and_then(|id| self.already_subscribed(id));
            self.early_tracks.clear();

            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(forward_room_audio(
                events,
                identity,
                initial,
                self.auto_subscribe,
                tx,
            ));
            Ok(Some(Box::new(RoomAudioSource { rx, task })))
        }

        async fn disconnect(&mut self) -> Result<(), ConnectionError> {
            if let Err(e) = self.room.close().await {
                debug!("close {}: {}", self.name, e);
            }
            info!("Left room {}", self.name);
            Ok(())
        }
    }

    /// Frames from the caller's microphone track, resampled for the VAD
    pub struct RoomAudioSource {
        rx: mpsc::UnboundedReceiver<AudioFrame>,
        task: JoinHandle<()>,
    }

    impl Drop for RoomAudioSource {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    #[async_trait]
    impl AudioSource for RoomAudioSource {
        async fn next_frame(&mut self) -> Option<AudioFrame> {
            self.rx.recv().await
        }

        fn try_next_frame(&mut self) -> Option<AudioFrame> {
            self.rx.try_recv().ok()
        }
    }

    /// Pump room events and the caller's audio stream until the caller
    /// leaves or the room closes
    async fn forward_room_audio(
        mut events: mpsc::UnboundedReceiver<RoomEvent>,
        identity: Option<String>,
        initial: Option<RemoteAudioTrack>,
        auto_subscribe: AutoSubscribe,
        tx: mpsc::UnboundedSender<AudioFrame>,
    ) {
        let is_caller = |p: &RemoteParticipant| {
            identity
                .as_deref()
                .map_or(true, |id| p.identity().as_str() == id)
        };
        let mut stream = initial.as_ref().map(open_stream);

        loop {
            tokio::select! {
                frame = next_room_frame(&mut stream) => match frame {
                    Some(frame) => {
                        let frame = frame_from_pcm16(
                            &frame.data,
                            frame.num_channels as u16,
                            frame.sample_rate,
                            DEFAULT_SAMPLE_RATE,
                        );
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    None => {
                        debug!("Caller audio track ended");
                        stream = None;
                    }
                },
                event = events.recv() => match event {
                    Some(RoomEvent::TrackSubscribed {
                        track: RemoteTrack::Audio(track),
                        participant,
                        ..
                    }) if is_caller(&participant) => {
                        info!("Listening to {}", identity_of(&participant));
                        stream = Some(open_stream(&track));
                    }
                    Some(RoomEvent::TrackPublished { publication, participant })
                        if is_caller(&participant) =>
                    {
                        request_audio(auto_subscribe, &publication);
                    }
                    Some(RoomEvent::ParticipantDisconnected(participant))
                        if is_caller(&participant) =>
                    {
                        info!("{} left the room", identity_of(&participant));
                        break;
                    }
                    Some(RoomEvent::Disconnected { .. }) | None => break,
                    Some(_) => {}
                },
            }
        }
    }

    async fn next_room_frame(stream: &mut Option<NativeAudioStream>) -> Option<RoomFrame<'static>> {
        match stream {
            Some(stream) => stream.next().await,
            None => std::future::pending().await,
        }
    }

    fn open_stream(track: &RemoteAudioTrack) -> NativeAudioStream {
        NativeAudioStream::new(track.rtc_track(), DEFAULT_SAMPLE_RATE as i32, 1)
    }

    /// With audio-only subscription, subscribe to audio publications as they appear
    fn request_audio(auto_subscribe: AutoSubscribe, publication: &RemoteTrackPublication) {
        if auto_subscribe == AutoSubscribe::AudioOnly && publication.kind() == TrackKind::Audio {
            publication.set_subscribed(true);
        }
    }

    fn identity_of(participant: &RemoteParticipant) -> String {
        participant.identity().as_str().to_string()
    }

    fn describe(participant: &RemoteParticipant) -> Participant {
        Participant {
            identity: identity_of(participant),
            name: participant.name(),
            sid: participant.sid().to_string(),
        }
    }

    /// Stands in for a room in the `console` command: the local user is the
    /// only participant and the default microphone is the room input
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LocalConnector;

    #[async_trait]
    impl RoomConnector for LocalConnector {
        async fn connect(
            &self,
            room: &str,
            auto_subscribe: AutoSubscribe,
        ) -> Result<Box<dyn RoomHandle>, ConnectionError> {
            Ok(Box::new(LocalRoom {
                name: room.to_string(),
                auto_subscribe,
            }))
        }
    }

    pub struct LocalRoom {
        name: String,
        auto_subscribe: AutoSubscribe,
    }

    #[async_trait]
    impl RoomHandle for LocalRoom {
        fn name(&self) -> &str {
            &self.name
        }

        async fn wait_for_participant(&mut self) -> Result<Participant, ConnectionError> {
            Ok(Participant {
                identity: "console".to_string(),
                name: "Console".to_string(),
                sid: "local".to_string(),
            })
        }

        fn audio_input(&mut self) -> Result<Option<Box<dyn AudioSource>>, SpeechError> {
            if !self.auto_subscribe.subscribes_audio() {
                return Ok(None);
            }
            let source = MicrophoneSource::open(DEFAULT_SAMPLE_RATE)?;
            Ok(Some(Box::new(source)))
        }

        async fn disconnect(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }
}
