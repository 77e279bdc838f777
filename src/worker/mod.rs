//! Worker runtime: job lifecycle, room connection and the voice session

pub mod job;
pub mod room;
pub mod session;

pub use job::{
    Entrypoint, JobContext, JobOutcome, JobState, PrewarmFn, ProcessState, Worker, WorkerOptions,
};
pub use room::{AutoSubscribe, LiveKitConnector, Participant, RoomConnector, RoomHandle};
pub use session::{
    Agent, AgentSession, RoomInputOptions, SessionComponents, SessionSummary, SpeechHandle,
};
