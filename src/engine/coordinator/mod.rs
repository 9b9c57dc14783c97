//! Update Coordinator
//!
//! Cooperative state machine driving one update session:
//!
//! ```text
//! RequestInfo → CheckNeed ─┬─ Download → Verify → Extract ─┐
//!                          └───────────────────────────────┴→ ReloadManifest → LoadModules → RunEntry → Done
//! ```
//!
//! Exactly one step is active. Each step starts its work in `on_enter`, is
//! polled once per [`Coordinator::tick`] and releases step-local resources
//! in `on_exit`. Any step may end in `Failed(code)`.
//!
//! A controller may force the machine into any step through the
//! [`CommandSender`]. Every transition advances the [`Epoch`]; work started
//! under an older epoch is discarded when it completes.

pub mod context;
pub mod states;

use crate::engine::error::{FailureCode, UpdateError};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

pub use context::{EntryPoint, EventSink, LogEntry, PipelineSettings, UpdateContext, UpdatePlan};
use states::StepState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "step", content = "code", rename_all = "snake_case")]
pub enum Step {
    RequestInfo,
    CheckNeed,
    Download,
    Verify,
    Extract,
    ReloadManifest,
    LoadModules,
    RunEntry,
    Done,
    Failed(FailureCode),
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestInfo => write!(f, "request_info"),
            Self::CheckNeed => write!(f, "check_need"),
            Self::Download => write!(f, "download"),
            Self::Verify => write!(f, "verify"),
            Self::Extract => write!(f, "extract"),
            Self::ReloadManifest => write!(f, "reload_manifest"),
            Self::LoadModules => write!(f, "load_modules"),
            Self::RunEntry => write!(f, "run_entry"),
            Self::Done => write!(f, "done"),
            Self::Failed(code) => write!(f, "failed({})", code),
        }
    }
}

/// Control commands accepted from outside the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    RetryInfo,
    RetryCheck,
    RetryDownload,
    RetryVerify,
    RetryExtract,
    RetryReloadManifest,
    RetryLoadModules,
    RetryRunEntry,
    Abort,
}

impl Command {
    pub fn target(&self) -> Step {
        match self {
            Self::RetryInfo => Step::RequestInfo,
            Self::RetryCheck => Step::CheckNeed,
            Self::RetryDownload => Step::Download,
            Self::RetryVerify => Step::Verify,
            Self::RetryExtract => Step::Extract,
            Self::RetryReloadManifest => Step::ReloadManifest,
            Self::RetryLoadModules => Step::LoadModules,
            Self::RetryRunEntry => Step::RunEntry,
            Self::Abort => Step::Failed(FailureCode::Fatal),
        }
    }
}

/// Notifications for observers (UI, CLI, tests)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    StepChanged { step: Step },
    DownloadProgress { fraction: f32 },
    InfoUnavailable { reason: String },
    Maintenance,
    ManifestReloadFailed { reason: String },
    ModuleMissing { module: String },
    Completed { version: String },
    Failed { code: FailureCode, message: String },
}

/// Transition requested by a step
#[derive(Debug)]
pub enum Transition {
    Stay,
    Goto(Step),
    Fail(UpdateError),
}

/// Transition counter shared with in-flight work
#[derive(Debug, Clone, Default)]
pub struct Epoch(Arc<AtomicU64>);

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn stamp(&self) -> EpochStamp {
        EpochStamp {
            epoch: self.clone(),
            value: self.current(),
        }
    }
}

/// Epoch value captured when a step was entered
#[derive(Debug, Clone)]
pub struct EpochStamp {
    epoch: Epoch,
    value: u64,
}

impl EpochStamp {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_current(&self) -> bool {
        self.epoch.current() == self.value
    }
}

#[derive(Debug, PartialEq)]
pub enum OpStatus<T> {
    Pending,
    Done(T),
    /// Completed after the step that started it was superseded
    Stale,
    /// Worker went away without a result
    Lost,
}

/// Asynchronous operation owned by a step
pub struct PendingOp<T> {
    stamp: EpochStamp,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T: Send + 'static> PendingOp<T> {
    /// Run `fut` on the runtime. Must be called inside a Tokio runtime.
    pub fn spawn<F>(stamp: EpochStamp, fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        Self { stamp, rx: Some(rx) }
    }

    /// Run blocking `f` on the blocking pool.
    pub fn spawn_blocking<F>(stamp: EpochStamp, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(f());
        });
        Self { stamp, rx: Some(rx) }
    }
}

impl<T> PendingOp<T> {
    pub fn from_receiver(stamp: EpochStamp, rx: oneshot::Receiver<T>) -> Self {
        Self { stamp, rx: Some(rx) }
    }

    pub fn stamp(&self) -> &EpochStamp {
        &self.stamp
    }

    /// Check for completion without blocking. Yields a value at most once.
    pub fn poll(&mut self) -> OpStatus<T> {
        let Some(rx) = self.rx.as_mut() else {
            return OpStatus::Lost;
        };
        match rx.try_recv() {
            Ok(value) => {
                self.rx = None;
                if self.stamp.is_current() {
                    OpStatus::Done(value)
                } else {
                    OpStatus::Stale
                }
            }
            Err(oneshot::error::TryRecvError::Empty) => OpStatus::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                OpStatus::Lost
            }
        }
    }
}

/// Handle for pushing commands into a running coordinator
#[derive(Debug, Clone)]
pub struct CommandSender(mpsc::UnboundedSender<Command>);

impl CommandSender {
    /// Returns `false` once the coordinator is gone
    pub fn send(&self, command: Command) -> bool {
        self.0.send(command).is_ok()
    }
}

/// Terminal result of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { version: String },
    Failed { code: FailureCode, message: String },
}

pub struct Coordinator {
    ctx: UpdateContext,
    current: Option<Box<dyn StepState>>,
    step: Option<Step>,
    commands: mpsc::UnboundedReceiver<Command>,
    history: Vec<Step>,
    failure: Option<(FailureCode, String)>,
}

impl Coordinator {
    pub fn new(ctx: UpdateContext) -> (Self, CommandSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            ctx,
            current: None,
            step: None,
            commands: rx,
            history: Vec::new(),
            failure: None,
        };
        (coordinator, CommandSender(tx))
    }

    pub fn context(&self) -> &UpdateContext {
        &self.ctx
    }

    pub fn step(&self) -> Option<Step> {
        self.step
    }

    /// Every step entered so far, in order
    pub fn history(&self) -> &[Step] {
        &self.history
    }

    pub fn is_finished(&self) -> bool {
        self.step.is_some_and(|s| s.is_terminal())
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.step? {
            Step::Done => Some(Outcome::Completed {
                version: self.ctx.state.version().to_string(),
            }),
            Step::Failed(code) => Some(Outcome::Failed {
                code,
                message: self
                    .failure
                    .as_ref()
                    .map(|(_, m)| m.clone())
                    .unwrap_or_default(),
            }),
            _ => None,
        }
    }

    /// Enter the first step. Must be called inside a Tokio runtime.
    pub fn start(&mut self) {
        if self.step.is_none() {
            self.force(Step::RequestInfo);
        }
    }

    /// One scheduler tick: apply pending commands, then poll the active step.
    pub fn tick(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            debug!(?command, "command received");
            if command == Command::Abort {
                self.failure = Some((FailureCode::Fatal, "aborted by controller".to_string()));
            }
            self.force(command.target());
        }

        let transition = match self.current.as_mut() {
            Some(state) => state.poll(&mut self.ctx),
            None => return,
        };
        self.apply(transition);
    }

    /// Drive the session to a terminal step, ticking at the configured interval.
    pub async fn run(&mut self) -> Outcome {
        self.start();
        let mut interval = time::interval(self.ctx.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.tick();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            interval.tick().await;
        }
    }

    /// Jump to `step` regardless of the active one.
    pub fn force(&mut self, step: Step) {
        let transition = self.enter(step);
        self.apply(transition);
    }

    fn apply(&mut self, mut transition: Transition) {
        loop {
            transition = match transition {
                Transition::Stay => return,
                Transition::Goto(step) => self.enter(step),
                Transition::Fail(err) => {
                    let code = err.code();
                    error!(step = ?self.step, code = %code, error = %err, "update step failed");
                    self.failure = Some((code, err.to_string()));
                    self.enter(Step::Failed(code))
                }
            };
        }
    }

    fn enter(&mut self, step: Step) -> Transition {
        if let Some(mut previous) = self.current.take() {
            previous.on_exit(&mut self.ctx);
        }
        let epoch = self.ctx.epoch.advance();

        info!(step = %step, epoch, "entering step");
        self.step = Some(step);
        self.history.push(step);
        self.ctx.events.emit(UpdateEvent::StepChanged { step });

        if let Step::Failed(code) = step {
            let message = match &self.failure {
                Some((_, message)) => message.clone(),
                None => {
                    let message = format!("forced into failed state ({code})");
                    self.failure = Some((code, message.clone()));
                    message
                }
            };
            self.ctx.events.emit(UpdateEvent::Failed { code, message });
        } else {
            self.failure = None;
        }

        let mut state = states::for_step(step);
        let transition = state.on_enter(&mut self.ctx);
        self.current = Some(state);
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_targets() {
        assert_eq!(Command::RetryInfo.target(), Step::RequestInfo);
        assert_eq!(Command::RetryExtract.target(), Step::Extract);
        assert_eq!(Command::Abort.target(), Step::Failed(FailureCode::Fatal));
    }

    #[test]
    fn test_epoch_stamp() {
        let epoch = Epoch::new();
        let stamp = epoch.stamp();
        assert!(stamp.is_current());

        epoch.advance();
        assert!(!stamp.is_current());
        assert!(epoch.stamp().is_current());
    }

    #[tokio::test]
    async fn test_pending_op_stale_after_advance() {
        let epoch = Epoch::new();
        let (tx, rx) = oneshot::channel();
        let mut op = PendingOp::from_receiver(epoch.stamp(), rx);

        assert_eq!(op.poll(), OpStatus::Pending);
        epoch.advance();
        tx.send(42).unwrap();
        assert_eq!(op.poll(), OpStatus::Stale);
        assert_eq!(op.poll(), OpStatus::Lost);
    }

    #[tokio::test]
    async fn test_pending_op_done() {
        let epoch = Epoch::new();
        let mut op = PendingOp::spawn(epoch.stamp(), async { "ready" });

        let value = loop {
            match op.poll() {
                OpStatus::Pending => tokio::task::yield_now().await,
                OpStatus::Done(v) => break v,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(value, "ready");
    }

    #[test]
    fn test_step_display() {
        assert_eq!(Step::Failed(FailureCode::Integrity).to_string(), "failed(integrity)");
        assert!(Step::Done.is_terminal());
        assert!(!Step::Extract.is_terminal());
    }
}
