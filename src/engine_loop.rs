// THEORY:
// The engine loop lets a session be driven from async code while an operator edits
// it from somewhere else. The session moves onto a dedicated blocking worker and
// is only reachable through messages. Each message carries a oneshot reply, and
// the worker handles them strictly one at a time, so an obstacle edit always lands
// between two steps.
//
// Key architectural principles:
// 1.  **Single Owner**: The worker thread owns the `Session`. There are no locks:
//     serialization comes from the queue, not from shared memory.
// 2.  **Cheap Handles**: `EngineHandle` is a cloneable sender plus a `watch` of the
//     latest step record. A UI task can hold one clone for obstacle edits while a
//     driver task holds another for stepping.
// 3.  **Cooperative Play Flag**: `drive` checks a `watch<bool>` play flag between
//     steps and parks while it reads `false`. Pausing never interrupts a step.
// 4.  **Session Comes Back**: Shutting down returns the session through the
//     worker's `JoinHandle`, sink and all.

use crate::core_modules::accessibility::PixelRect;
use crate::core_modules::frame_source::FrameSource;
use crate::core_modules::motion_field::MotionEstimator;
use crate::core_modules::output_sink::RecordSink;
use crate::core_modules::records::StepRecord;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{Session, SessionState};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_QUEUE_DEPTH: usize = 16;

/// Message type for the engine worker.
enum EngineCommand {
    Step(oneshot::Sender<EngineResult<bool>>),
    AddObstacle(PixelRect, oneshot::Sender<EngineResult<usize>>),
    Pause(oneshot::Sender<EngineResult<()>>),
    Resume(oneshot::Sender<EngineResult<()>>),
    Finalize(oneshot::Sender<EngineResult<()>>),
    Abort(oneshot::Sender<EngineResult<()>>),
    State(oneshot::Sender<SessionState>),
    Shutdown,
}

/// A cloneable handle to a session running on the engine worker.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    records: watch::Receiver<Option<StepRecord>>,
}

/// Moves `session` onto a blocking worker and returns a handle to it.
/// Must be called from within a tokio runtime.
pub fn spawn_engine<S, E, K>(mut session: Session<S, E, K>) -> (EngineHandle, JoinHandle<Session<S, E, K>>)
where
    S: FrameSource + Send + 'static,
    E: MotionEstimator + Send + 'static,
    K: RecordSink + Send + 'static,
{
    let (commands, mut inbox) = mpsc::channel::<EngineCommand>(COMMAND_QUEUE_DEPTH);
    let (record_tx, records) = watch::channel(session.last_record().cloned());

    let worker = tokio::task::spawn_blocking(move || {
        info!(state = ?session.state(), "engine loop started");
        while let Some(command) = inbox.blocking_recv() {
            match command {
                EngineCommand::Step(reply) => {
                    let result = session.step_frame();
                    if matches!(result, Ok(true)) {
                        record_tx.send_replace(session.last_record().cloned());
                    }
                    let _ = reply.send(result);
                }
                EngineCommand::AddObstacle(rect, reply) => {
                    let _ = reply.send(session.add_obstacle(rect));
                }
                EngineCommand::Pause(reply) => {
                    let _ = reply.send(session.pause());
                }
                EngineCommand::Resume(reply) => {
                    let _ = reply.send(session.resume());
                }
                EngineCommand::Finalize(reply) => {
                    let _ = reply.send(session.finalize());
                }
                EngineCommand::Abort(reply) => {
                    let _ = reply.send(session.abort());
                }
                EngineCommand::State(reply) => {
                    let _ = reply.send(session.state());
                }
                EngineCommand::Shutdown => break,
            }
        }
        info!(
            state = ?session.state(),
            steps = session.steps_completed(),
            "engine loop stopped"
        );
        session
    });

    (EngineHandle { commands, records }, worker)
}

impl EngineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| EngineError::EngineClosed)?;
        response.await.map_err(|_| EngineError::EngineClosed)
    }

    /// Runs one step. `Ok(false)` at the end of the stream.
    pub async fn step(&self) -> EngineResult<bool> {
        self.request(EngineCommand::Step).await?
    }

    pub async fn add_obstacle(&self, rect: PixelRect) -> EngineResult<usize> {
        self.request(|reply| EngineCommand::AddObstacle(rect, reply)).await?
    }

    pub async fn pause(&self) -> EngineResult<()> {
        self.request(EngineCommand::Pause).await?
    }

    pub async fn resume(&self) -> EngineResult<()> {
        self.request(EngineCommand::Resume).await?
    }

    pub async fn finalize(&self) -> EngineResult<()> {
        self.request(EngineCommand::Finalize).await?
    }

    pub async fn abort(&self) -> EngineResult<()> {
        self.request(EngineCommand::Abort).await?
    }

    pub async fn state(&self) -> EngineResult<SessionState> {
        self.request(EngineCommand::State).await
    }

    /// The most recent step record, if any step has completed.
    pub fn last_record(&self) -> Option<StepRecord> {
        self.records.borrow().clone()
    }

    /// A receiver that is notified after every completed step.
    pub fn subscribe(&self) -> watch::Receiver<Option<StepRecord>> {
        self.records.clone()
    }

    /// Steps until the end of the stream, parking between steps while `play` reads `false`.
    /// Returns the number of steps this call completed.
    pub async fn drive(&self, mut play: watch::Receiver<bool>) -> EngineResult<u64> {
        let mut steps = 0;
        loop {
            if !*play.borrow_and_update() {
                debug!(steps, "drive parked");
                play.wait_for(|playing| *playing)
                    .await
                    .map_err(|_| EngineError::EngineClosed)?;
                debug!(steps, "drive resumed");
            }
            if !self.step().await? {
                return Ok(steps);
            }
            steps += 1;
        }
    }

    /// Asks the worker to stop. The session is handed back through the worker's `JoinHandle`.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.commands
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| EngineError::EngineClosed)
    }
}
