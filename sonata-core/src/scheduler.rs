//! Plan execution. One cooperative task per plan; blocking device work goes
//! through the worker pool. Starting a plan cancels the previous one and waits
//! for it to stop before anything new is written.

use crate::client::EngineClient;
use crate::error::{PlayerError, TaskError};
use crate::player::PlayerPool;
use crate::task::{BreakTask, Plan, SpeechTask, Task};
use crate::workers::WorkerPool;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    IndexReached(i32),
    DoneSpeaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

struct Context {
    client: EngineClient,
    players: Arc<PlayerPool>,
    workers: WorkerPool,
    events: broadcast::Sender<SpeechEvent>,
    state: watch::Sender<PlanState>,
}

struct RunningPlan {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    ctx: Arc<Context>,
    current: tokio::sync::Mutex<Option<RunningPlan>>,
}

impl Scheduler {
    pub fn new(
        client: EngineClient,
        players: Arc<PlayerPool>,
        workers: WorkerPool,
        events: broadcast::Sender<SpeechEvent>,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                client,
                players,
                workers,
                events,
                state: watch::Sender::new(PlanState::Idle),
            }),
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> PlanState {
        *self.ctx.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        self.ctx.events.subscribe()
    }

    /// Cancel whatever is playing, then run `plan`.
    pub async fn start(&self, plan: Plan) {
        let mut current = self.current.lock().await;
        if let Some(old) = current.take() {
            self.stop_plan(old).await;
        }
        let token = CancellationToken::new();
        self.ctx.state.send_replace(PlanState::Running);
        let handle = tokio::spawn(run_plan(Arc::clone(&self.ctx), plan, token.clone()));
        *current = Some(RunningPlan { token, handle });
    }

    /// Stop the running plan and discard its queued audio.
    pub async fn cancel(&self) {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(old) => self.stop_plan(old).await,
            None => self.stop_players().await,
        }
    }

    /// Wait until no plan is running.
    pub async fn wait(&self) -> PlanState {
        let mut rx = self.ctx.state.subscribe();
        let state = match rx.wait_for(|s| *s != PlanState::Running).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    async fn stop_plan(&self, plan: RunningPlan) {
        plan.token.cancel();
        self.stop_players().await;
        if let Err(e) = plan.handle.await {
            tracing::warn!(error = %e, "plan task did not finish cleanly");
        }
        // Anything that slipped in between the stop and the task noticing.
        self.stop_players().await;
    }

    async fn stop_players(&self) {
        let players = Arc::clone(&self.ctx.players);
        if let Err(e) = self.ctx.workers.run(move || players.stop_all()).await {
            tracing::warn!(error = %e, "stopping players failed");
        }
    }
}

async fn run_plan(ctx: Arc<Context>, plan: Plan, token: CancellationToken) {
    for task in plan {
        if token.is_cancelled() {
            break;
        }
        let name = task.name();
        match run_task(&ctx, task, &token).await {
            Ok(()) => {}
            Err(TaskError::Cancelled) => {
                tracing::debug!(task = name, "plan cancelled");
                break;
            }
            Err(e) => tracing::error!(task = name, error = %e, "task failed"),
        }
    }
    let finished = if token.is_cancelled() {
        PlanState::Cancelled
    } else {
        PlanState::Completed
    };
    ctx.state.send_replace(finished);
}

async fn run_task(ctx: &Context, task: Task, token: &CancellationToken) -> Result<(), TaskError> {
    match task {
        Task::Speech(speech) => speak(ctx, speech, token).await,
        Task::Break(pause) => silence(ctx, pause, token).await,
        Task::IndexMarker(markers) => {
            wait_idle(ctx, token).await?;
            for index in markers {
                if token.is_cancelled() {
                    return Err(TaskError::Cancelled);
                }
                let _ = ctx.events.send(SpeechEvent::IndexReached(index));
            }
            Ok(())
        }
        Task::Done => {
            wait_idle(ctx, token).await?;
            let _ = ctx.events.send(SpeechEvent::DoneSpeaking);
            Ok(())
        }
    }
}

async fn speak(ctx: &Context, task: SpeechTask, token: &CancellationToken) -> Result<(), TaskError> {
    if task.is_ignorable() {
        tracing::trace!(text = %task.text, "skipping punctuation-only utterance");
        return Ok(());
    }
    let sample_rate = task.options.sample_rate();
    let mut stream = task
        .options
        .voice
        .synthesize(&ctx.client, &task.text, task.options.speech_args())
        .await?;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TaskError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            return Ok(());
        };
        let pcm = chunk?;
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        feed(ctx, sample_rate, pcm, token).await?;
    }
}

/// Feeds the break one chunk at a time out of a single zeroed buffer.
async fn silence(ctx: &Context, task: BreakTask, token: &CancellationToken) -> Result<(), TaskError> {
    let mut lens = task.chunk_lens().peekable();
    let Some(&first) = lens.peek() else {
        return Ok(());
    };
    let zeros: Arc<[u8]> = vec![0u8; first].into();
    let sample_rate = task.sample_rate;
    for len in lens {
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let zeros = Arc::clone(&zeros);
        queue(ctx, token, move |players, t| players.feed(sample_rate, &zeros[..len], t)).await?;
    }
    Ok(())
}

async fn feed(ctx: &Context, sample_rate: u32, pcm: Vec<u8>, token: &CancellationToken) -> Result<(), TaskError> {
    queue(ctx, token, move |players, t| players.feed(sample_rate, &pcm, t)).await
}

/// Run a blocking write on the worker pool. A write that gave up because of
/// cancellation is reported as [`TaskError::Cancelled`].
async fn queue<F>(ctx: &Context, token: &CancellationToken, write: F) -> Result<(), TaskError>
where
    F: FnOnce(&PlayerPool, &CancellationToken) -> Result<bool, PlayerError> + Send + 'static,
{
    let players = Arc::clone(&ctx.players);
    let t = token.clone();
    let queued = ctx.workers.run(move || write(&*players, &t)).await??;
    if !queued {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}

async fn wait_idle(ctx: &Context, token: &CancellationToken) -> Result<(), TaskError> {
    let players = Arc::clone(&ctx.players);
    let t = token.clone();
    ctx.workers.run(move || players.idle_all(&t)).await?;
    if token.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}
