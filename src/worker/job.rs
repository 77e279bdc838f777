//! Worker and job lifecycle
//!
//! A [`Worker`] runs the prewarm callback once per process, then runs the
//! entrypoint once per job. Each job walks a fixed state machine:
//!
//! ```text
//! Connecting → WaitingForParticipant → SessionActive → Ended
//!      ↓                 ↓                   ↓
//!    Failed            Failed              Failed
//! ```
//!
//! A failed job is never recovered in place. The worker logs it, waits for
//! the configured backoff and starts a fresh job.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::room::{AutoSubscribe, Participant, RoomConnector, RoomHandle};
use crate::error::{ConnectionError, JobError};
use crate::voice::vad::VadModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Connecting,
    WaitingForParticipant,
    SessionActive,
    Ended,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Ended | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Connecting => write!(f, "connecting"),
            JobState::WaitingForParticipant => write!(f, "waiting for participant"),
            JobState::SessionActive => write!(f, "session active"),
            JobState::Ended => write!(f, "ended"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Models loaded once per worker process by the prewarm callback.
/// Read-only after construction and shared by every job.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub vad: Arc<VadModel>,
}

/// Per-job handle given to the entrypoint
pub struct JobContext {
    job_id: Uuid,
    room_name: String,
    connector: Arc<dyn RoomConnector>,
    process: Arc<ProcessState>,
    room: Option<Box<dyn RoomHandle>>,
    state: JobState,
    transitions: Vec<JobState>,
}

impl JobContext {
    pub fn new(
        room_name: impl Into<String>,
        connector: Arc<dyn RoomConnector>,
        process: Arc<ProcessState>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            room_name: room_name.into(),
            connector,
            process,
            room: None,
            state: JobState::Connecting,
            transitions: vec![JobState::Connecting],
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn process(&self) -> &ProcessState {
        &self.process
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn transitions(&self) -> &[JobState] {
        &self.transitions
    }

    /// Join the job's room
    pub async fn connect(&mut self, auto_subscribe: AutoSubscribe) -> Result<(), ConnectionError> {
        let room = self.connector.connect(&self.room_name, auto_subscribe).await?;
        self.room = Some(room);
        Ok(())
    }

    /// Block until a participant joins the connected room
    pub async fn wait_for_participant(&mut self) -> Result<Participant, JobError> {
        self.transition(JobState::WaitingForParticipant);
        let room = self.room.as_mut().ok_or(JobError::NotConnected)?;
        let participant = room.wait_for_participant().await?;
        debug!("Participant {} ({}) joined", participant.identity, participant.sid);
        Ok(participant)
    }

    pub fn room_mut(&mut self) -> Result<&mut dyn RoomHandle, JobError> {
        match self.room.as_mut() {
            Some(room) => Ok(room.as_mut()),
            None => Err(JobError::NotConnected),
        }
    }

    pub fn mark_session_active(&mut self) {
        self.transition(JobState::SessionActive);
    }

    fn transition(&mut self, next: JobState) {
        if self.state == next || self.state.is_terminal() {
            return;
        }
        debug!("Job {}: {} -> {}", self.job_id, self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    async fn finish(&mut self, result: &Result<(), JobError>) {
        self.transition(match result {
            Ok(()) => JobState::Ended,
            Err(_) => JobState::Failed,
        });
        if let Some(room) = self.room.as_mut() {
            if let Err(e) = room.disconnect().await {
                warn!("Failed to leave room {}: {}", self.room_name, e);
            }
        }
    }
}

/// Per-job callback
#[async_trait]
pub trait Entrypoint: Send + Sync {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError>;
}

pub type PrewarmFn = Box<dyn Fn() -> ProcessState + Send + Sync>;

/// Callbacks registered with the worker
pub struct WorkerOptions {
    pub prewarm: PrewarmFn,
    pub entrypoint: Arc<dyn Entrypoint>,
}

/// Result of one job
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub final_state: JobState,
    pub transitions: Vec<JobState>,
    pub error: Option<JobError>,
}

pub struct Worker {
    process: Arc<ProcessState>,
    entrypoint: Arc<dyn Entrypoint>,
    connector: Arc<dyn RoomConnector>,
    backoff: Duration,
}

impl Worker {
    /// Run the prewarm callback and get ready to accept jobs
    pub fn new(options: WorkerOptions, connector: Arc<dyn RoomConnector>) -> Self {
        let process = Arc::new((options.prewarm)());
        info!("Worker prewarmed");
        Self {
            process,
            entrypoint: options.entrypoint,
            connector,
            backoff: Duration::from_secs(5),
        }
    }

    /// Delay before starting a new job after a failure
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    /// Run a single job against `room` to completion
    pub async fn run_job(&self, room: &str) -> JobOutcome {
        let mut ctx = JobContext::new(room, self.connector.clone(), self.process.clone());
        info!("Job {} started for room {}", ctx.job_id(), room);

        let result = self.entrypoint.run(&mut ctx).await;
        ctx.finish(&result).await;

        match &result {
            Ok(()) => info!("Job {} ended", ctx.job_id()),
            Err(e) => error!("Job {} failed: {}", ctx.job_id(), e),
        }

        JobOutcome {
            job_id: ctx.job_id(),
            final_state: ctx.state(),
            transitions: ctx.transitions().to_vec(),
            error: result.err(),
        }
    }

    /// Run jobs for `room` back to back until Ctrl+C
    pub async fn run_forever(&self, room: &str) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                outcome = self.run_job(room) => {
                    if outcome.final_state == JobState::Failed {
                        info!("Retrying in {}s", self.backoff.as_secs());
                        tokio::select! {
                            _ = tokio::time::sleep(self.backoff) => {}
                            _ = tokio::signal::ctrl_c() => break,
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        info!("Worker shutting down");
        Ok(())
    }
}
