use std::{
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{Stream, StreamExt, future::join_all};
use tokio::{
    sync::{mpsc, watch},
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    config::PipelineConfig,
    context::{CancelSignal, StageContext, spawn_deadline},
    error::{CancelReason, PipeError},
    fanin::fan_in,
    fanout::fan_out,
    item::{
        Envelope, EnvelopeReceiver, EnvelopeSender, InFlight, ItemResult, channel,
        recv_cancellable, send_cancellable,
    },
    limiter::TokenBucket,
    stage::{ErrorPolicy, FnStage, SharedStage, Stage, StageInput, StageSummary, StageTask},
};

/// Results of one run, one per consumed item.
pub type ResultStream<T> = ReceiverStream<ItemResult<T>>;

static NEXT_PIPELINE: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    /// The source is exhausted; in-flight items are still moving.
    Draining,
    Cancelled,
    Done,
}

impl PipelineState {
    fn can_move_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Cancelled)
                | (Running, Draining)
                | (Running, Cancelled)
                | (Draining, Cancelled)
                | (Draining, Done)
                | (Cancelled, Done)
        )
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineExit {
    /// Every admitted item produced a result.
    Completed,
    Cancelled(CancelReason),
    /// `await_done` ran out of patience and aborted the remaining tasks.
    /// Results already emitted stay valid; the rest are lost.
    ForceStopped(CancelReason),
}

impl PipelineExit {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineExit::Completed)
    }

    pub fn reason(&self) -> Option<&CancelReason> {
        match self {
            PipelineExit::Completed => None,
            PipelineExit::Cancelled(reason) | PipelineExit::ForceStopped(reason) => Some(reason),
        }
    }
}

struct Shared {
    id: Arc<str>,
    config: PipelineConfig,
    signal: CancelSignal,
    in_flight: InFlight,
    admitted: AtomicU64,
    started: AtomicBool,
    state: watch::Sender<PipelineState>,
    exit: OnceLock<PipelineExit>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Shared {
    /// Move to `next` if the state machine allows it. Returns the previous
    /// state when the move happened.
    fn transition(&self, next: PipelineState) -> Option<PipelineState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.can_move_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = previous {
            log::debug!("pipeline {}: {:?} -> {:?}", self.id, from, next);
        }
        previous
    }

    fn finish(&self, exit: PipelineExit) {
        if self.exit.set(exit).is_ok() {
            log::info!("pipeline {}: finished with {:?}", self.id, self.exit.get());
        }
        self.transition(PipelineState::Done);
    }

    /// Exit of a run whose tasks all returned without being cancelled.
    /// Admission is closed by then, so the in-flight count must be zero.
    fn drained_exit(&self) -> PipelineExit {
        let left = self.in_flight.count();
        if left == 0 {
            self.transition(PipelineState::Draining);
            return PipelineExit::Completed;
        }

        log::warn!(
            "pipeline {}: all tasks returned with {} items still in flight",
            self.id,
            left
        );
        let reason = CancelReason::Unaccounted { in_flight: left };
        self.signal.cancel(reason.clone());
        self.transition(PipelineState::Cancelled);
        PipelineExit::Cancelled(self.signal.reason().unwrap_or(reason))
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track<R>(&self, handle: &JoinHandle<R>) {
        self.tasks().push(handle.abort_handle());
    }
}

/// A configured chain of stages with its control surface.
///
/// A pipeline runs once: build it, `start` it with a source, drain the
/// returned [`ResultStream`], then `await_done`.
pub struct Pipeline<T> {
    shared: Arc<Shared>,
    stages: Vec<SharedStage<T>>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn builder() -> PipelineBuilder<T> {
        PipelineBuilder::default()
    }

    /// Spawn every task of the run and start admitting items from `source`.
    ///
    /// Fails if the pipeline was already started or cancelled. Must be
    /// called inside a tokio runtime.
    pub fn start<S>(&self, source: S) -> anyhow::Result<ResultStream<T>>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            anyhow::bail!("pipeline {} already started", shared.id);
        }
        if *shared.state.borrow() != PipelineState::Idle {
            anyhow::bail!("pipeline {} was cancelled before start", shared.id);
        }

        let config = &shared.config;
        let capacity = config.channel_capacity;
        let token = shared.signal.token().clone();
        let policy = if config.fatal_on_stage_error {
            ErrorPolicy::Fatal
        } else {
            ErrorPolicy::Forward
        };
        let deadline = config.deadline.map(|budget| Instant::now() + budget);

        let (admission_tx, mut upstream) = channel(capacity);
        let mut runners = Vec::new();
        let mut forwarders = Vec::new();
        for (index, stage) in self.stages.iter().enumerate() {
            let width = config.fanout_width_per_stage[index];
            let ctx = StageContext::new(&shared.id, stage.name(), index, token.clone())
                .with_deadline(deadline);
            let task = StageTask::new(Arc::clone(stage), ctx, policy, shared.signal.clone());

            upstream = if width == 1 {
                // single runner, order preserved
                let (rx, handle) = task.spawn(StageInput::Owned(upstream), capacity);
                runners.push(handle);
                rx
            } else {
                let fan = fan_out(upstream, width, task, capacity)?;
                runners.extend(fan.handles);
                let (rx, handles) = fan_in(fan.outputs, capacity, token.clone()).into_parts();
                forwarders.extend(handles);
                rx
            };
        }

        if shared.transition(PipelineState::Running).is_none() {
            // dropping admission_tx winds the runners down
            anyhow::bail!("pipeline {} was cancelled before start", shared.id);
        }
        log::info!(
            "pipeline {}: started with {} stages, widths {:?}",
            shared.id,
            self.stages.len(),
            config.fanout_width_per_stage
        );

        let (result_tx, result_rx) = mpsc::channel(capacity);
        let limiter = TokenBucket::new(config.limiter.capacity, config.limiter.refill_interval);

        let admission = {
            let shared = Arc::clone(shared);
            tokio::spawn(async move { admit(shared, source, limiter, admission_tx).await })
        };
        let emitter = {
            let shared = Arc::clone(shared);
            tokio::spawn(async move { emit(shared, upstream, result_tx).await })
        };
        forwarders.push(admission);
        forwarders.push(emitter);

        let deadline_timer = config
            .deadline
            .map(|budget| spawn_deadline(shared.signal.clone(), budget));

        for handle in &runners {
            shared.track(handle);
        }
        for handle in &forwarders {
            shared.track(handle);
        }
        if let Some(handle) = &deadline_timer {
            shared.track(handle);
        }

        let supervisor = {
            let shared = Arc::clone(shared);
            tokio::spawn(async move { supervise(shared, runners, forwarders, deadline_timer).await })
        };
        shared.track(&supervisor);

        Ok(ReceiverStream::new(result_rx))
    }
}

impl<T> Pipeline<T> {
    /// Stop the run. Idempotent; a no-op once the pipeline is done.
    pub fn cancel(&self) {
        let shared = &self.shared;
        if *shared.state.borrow() == PipelineState::Done {
            return;
        }
        if shared.signal.cancel(CancelReason::Requested) {
            log::info!("pipeline {}: cancel requested", shared.id);
        }
        if let Some(PipelineState::Idle) = shared.transition(PipelineState::Cancelled) {
            // nothing was spawned, so nobody else will finish the run
            let reason = shared.signal.reason().unwrap_or(CancelReason::Requested);
            shared.finish(PipelineExit::Cancelled(reason));
        }
    }

    /// Wait for the run to finish.
    ///
    /// With `force_timeout`, gives up after that long: the pipeline is
    /// cancelled, every task is aborted and the exit is
    /// [`PipelineExit::ForceStopped`]. A pipeline that is never started
    /// only finishes through `cancel`.
    pub async fn await_done(&self, force_timeout: Option<Duration>) -> PipelineExit {
        let mut state = self.shared.state.subscribe();
        let done = async move {
            // the sender lives in `shared`, so this only returns on Done
            let _ = state.wait_for(|s| *s == PipelineState::Done).await;
        };

        match force_timeout {
            None => done.await,
            Some(limit) => {
                if tokio::time::timeout(limit, done).await.is_err() {
                    self.force_stop(limit);
                }
            }
        }

        self.shared
            .exit
            .get()
            .cloned()
            .unwrap_or(PipelineExit::Cancelled(CancelReason::Shutdown))
    }

    fn force_stop(&self, waited: Duration) {
        let shared = &self.shared;
        shared.signal.cancel(CancelReason::ForceTimeout);
        let reason = shared.signal.reason().unwrap_or(CancelReason::ForceTimeout);

        let handles: Vec<AbortHandle> = shared.tasks().drain(..).collect();
        log::error!(
            "pipeline {}: not done after {:?}, aborting {} tasks",
            shared.id,
            waited,
            handles.len()
        );
        for handle in handles {
            handle.abort();
        }

        shared.transition(PipelineState::Cancelled);
        shared.finish(PipelineExit::ForceStopped(reason));
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PipelineState {
        *self.shared.state.borrow()
    }

    /// Watch state changes as they happen.
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.shared.state.subscribe()
    }

    /// Items admitted but without a result yet.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.count()
    }

    pub fn admitted(&self) -> u64 {
        self.shared.admitted.load(Ordering::Acquire)
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.shared.signal.reason()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.signal.is_cancelled()
    }
}

async fn admit<T, S>(
    shared: Arc<Shared>,
    source: S,
    limiter: TokenBucket,
    tx: EnvelopeSender<T>,
) where
    S: Stream<Item = T> + Send + 'static,
{
    let token = shared.signal.token().clone();
    let started = Instant::now();
    let mut source = Box::pin(source);

    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = source.next() => match next {
                Some(item) => item,
                None => {
                    shared.transition(PipelineState::Draining);
                    break;
                }
            },
        };

        if limiter.acquire(&token).await.is_err() {
            break;
        }
        let id = shared.admitted.fetch_add(1, Ordering::AcqRel);
        let envelope = Envelope::tracked(id, item, &shared.in_flight);
        log::trace!("pipeline {}: admitted item {}", shared.id, id);
        if send_cancellable(&tx, envelope, &token).await.is_err() {
            break;
        }
    }

    let stats = limiter.stats();
    log::info!(
        "pipeline {}: admission closed after {} items ({:.1}/s, {} refills dropped)",
        shared.id,
        shared.admitted.load(Ordering::Acquire),
        stats.rate(started.elapsed()),
        stats.dropped_refills
    );
    limiter.stop();
}

async fn emit<T>(
    shared: Arc<Shared>,
    mut rx: EnvelopeReceiver<T>,
    tx: mpsc::Sender<ItemResult<T>>,
) {
    let token = shared.signal.token().clone();
    let mut emitted = 0u64;
    while let Ok(Some(envelope)) = recv_cancellable(&mut rx, &token).await {
        match send_cancellable(&tx, envelope.into_result(), &token).await {
            Ok(()) => emitted += 1,
            Err(PipeError::Cancelled) => break,
            Err(PipeError::Closed) => {
                log::warn!("pipeline {}: result stream dropped, shutting down", shared.id);
                shared.signal.cancel(CancelReason::Shutdown);
                break;
            }
        }
    }
    log::debug!("pipeline {}: emitted {} results", shared.id, emitted);
}

async fn supervise(
    shared: Arc<Shared>,
    runners: Vec<JoinHandle<StageSummary>>,
    forwarders: Vec<JoinHandle<()>>,
    deadline_timer: Option<JoinHandle<()>>,
) {
    let joined = futures::future::join(join_all(runners), join_all(forwarders));
    tokio::pin!(joined);

    let (summaries, _) = tokio::select! {
        biased;
        all = &mut joined => all,
        _ = shared.signal.cancelled() => {
            shared.transition(PipelineState::Cancelled);
            joined.await
        }
    };

    if let Some(timer) = deadline_timer {
        timer.abort();
    }

    let mut total = StageSummary::default();
    for summary in summaries {
        match summary {
            Ok(s) => {
                total.processed += s.processed;
                total.failed += s.failed;
                total.forwarded += s.forwarded;
            }
            Err(e) if e.is_panic() => log::error!("pipeline {}: stage runner panicked", shared.id),
            Err(_) => {}
        }
    }
    log::info!(
        "pipeline {}: {} processed, {} failed across all stages",
        shared.id,
        total.processed,
        total.failed
    );

    let exit = if shared.signal.is_cancelled() {
        // a cancelled parent scope records no reason of its own
        let reason = shared.signal.reason().unwrap_or(CancelReason::Shutdown);
        shared.transition(PipelineState::Cancelled);
        PipelineExit::Cancelled(reason)
    } else {
        shared.drained_exit()
    };
    shared.finish(exit);
}

/// Collects stages and configuration for a [`Pipeline`].
pub struct PipelineBuilder<T> {
    id: Option<String>,
    config: Option<PipelineConfig>,
    stages: Vec<SharedStage<T>>,
    parent: Option<CancellationToken>,
}

impl<T> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self {
            id: None,
            config: None,
            stages: Vec::new(),
            parent: None,
        }
    }
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Name used in logs and stage contexts.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Without a config every stage gets width 1 and default limits.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn stage(mut self, stage: impl Stage<T>) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn shared_stage(mut self, stage: SharedStage<T>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StageContext, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.stage(FnStage::new(name, f))
    }

    /// Cancel the pipeline whenever `parent` is cancelled.
    pub fn parent(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn build(self) -> anyhow::Result<Pipeline<T>> {
        let config = self
            .config
            .unwrap_or_else(|| PipelineConfig::with_widths(&vec![1; self.stages.len()]));
        if config.stage_count != self.stages.len() {
            anyhow::bail!(
                "config describes {} stages but {} were added",
                config.stage_count,
                self.stages.len()
            );
        }
        config.validate()?;

        let id = self.id.unwrap_or_else(|| {
            format!("pipeline-{}", NEXT_PIPELINE.fetch_add(1, Ordering::Relaxed))
        });
        let signal = match &self.parent {
            Some(parent) => CancelSignal::child_of(parent),
            None => CancelSignal::new(),
        };
        let (state, _) = watch::channel(PipelineState::Idle);

        Ok(Pipeline {
            shared: Arc::new(Shared {
                id: Arc::from(id),
                config,
                signal,
                in_flight: InFlight::new(),
                admitted: AtomicU64::new(0),
                started: AtomicBool::new(false),
                state,
                exit: OnceLock::new(),
                tasks: Mutex::new(Vec::new()),
            }),
            stages: self.stages,
        })
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
