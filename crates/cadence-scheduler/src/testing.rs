//! Test helpers: a configurable recorder task and a polling wait.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use cadence_core::{TimeSpan, Timestamp};

use crate::task::{
    Cancelled, CompletionParams, InvocationParams, ScheduledTask, TaskContext, TaskState,
};

pub(crate) enum Mode {
    Succeed,
    Fail,
    Panic,
    /// Park until cancelled.
    UntilCancelled,
    /// Park until a permit is available (or cancelled).
    Gate(Arc<Semaphore>),
    RemoveSelf,
    /// Dispose the owning scheduler/collection from inside the invocation.
    DisposeOwner,
    /// Schedule itself once more (single run at the given time) from the invocation.
    RescheduleOnce(Timestamp),
}

/// How a hook misbehaves.
#[derive(Clone, Copy)]
pub(crate) enum Fault {
    Error,
    Panic,
}

impl Fault {
    fn trigger(self, hook: &str) -> anyhow::Result<()> {
        match self {
            Self::Error => anyhow::bail!("{hook} refused"),
            Self::Panic => panic!("{hook} blew up"),
        }
    }
}

pub(crate) struct Recorder {
    me: Weak<Recorder>,
    key: String,
    mode: Mode,
    concurrent: AtomicUsize,
    enqueued: AtomicUsize,
    decline: AtomicBool,
    fail_dispose: AtomicBool,
    enqueue_fault: Mutex<Option<Fault>>,
    completed_fault: Mutex<Option<Fault>>,
    reschedule_on_completion: Mutex<Option<Timestamp>>,
    invocations: Mutex<Vec<InvocationParams>>,
    completions: Mutex<Vec<CompletionParams>>,
    states: Mutex<Vec<TaskState>>,
    positions: Mutex<Vec<usize>>,
    disposals: AtomicUsize,
}

impl Recorder {
    pub(crate) fn new(key: &str) -> Arc<Self> {
        Self::with_mode(key, Mode::Succeed)
    }

    pub(crate) fn with_mode(key: &str, mode: Mode) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            key: key.to_string(),
            mode,
            concurrent: AtomicUsize::new(1),
            enqueued: AtomicUsize::new(0),
            decline: AtomicBool::new(false),
            fail_dispose: AtomicBool::new(false),
            enqueue_fault: Mutex::new(None),
            completed_fault: Mutex::new(None),
            reschedule_on_completion: Mutex::new(None),
            invocations: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            positions: Mutex::new(Vec::new()),
            disposals: AtomicUsize::new(0),
        })
    }

    pub(crate) fn limits(self: Arc<Self>, concurrent: usize, enqueued: usize) -> Arc<Self> {
        self.concurrent.store(concurrent, Ordering::SeqCst);
        self.enqueued.store(enqueued, Ordering::SeqCst);
        self
    }

    pub(crate) fn decline_enqueue(self: Arc<Self>) -> Arc<Self> {
        self.decline.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_dispose(self: Arc<Self>) -> Arc<Self> {
        self.fail_dispose.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_enqueue(self: Arc<Self>, fault: Fault) -> Arc<Self> {
        *self.enqueue_fault.lock().unwrap() = Some(fault);
        self
    }

    /// The completion hook records the completion, then fails.
    pub(crate) fn fail_completed(self: Arc<Self>, fault: Fault) -> Arc<Self> {
        *self.completed_fault.lock().unwrap() = Some(fault);
        self
    }

    /// Schedule itself once more at `at` from the first completion hook.
    pub(crate) fn reschedule_when_completed(self: Arc<Self>, at: Timestamp) -> Arc<Self> {
        *self.reschedule_on_completion.lock().unwrap() = Some(at);
        self
    }

    fn reschedule(&self, ctx: &TaskContext, at: Timestamp) -> anyhow::Result<()> {
        let me: Arc<dyn ScheduledTask> = self
            .me
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("recorder dropped"))?;
        let scheduler = ctx
            .scheduler()
            .ok_or_else(|| anyhow::anyhow!("not owned by a scheduler"))?;
        anyhow::ensure!(
            scheduler.schedule(me, at, TimeSpan::ZERO, 1)?,
            "reschedule refused"
        );
        Ok(())
    }

    pub(crate) fn invocations(&self) -> Vec<InvocationParams> {
        self.invocations.lock().unwrap().clone()
    }

    pub(crate) fn completions(&self) -> Vec<CompletionParams> {
        self.completions.lock().unwrap().clone()
    }

    /// Task state as seen from inside each completion hook.
    pub(crate) fn states_on_completion(&self) -> Vec<TaskState> {
        self.states.lock().unwrap().clone()
    }

    pub(crate) fn enqueue_positions(&self) -> Vec<usize> {
        self.positions.lock().unwrap().clone()
    }

    pub(crate) fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduledTask for Recorder {
    fn key(&self) -> &str {
        &self.key
    }

    fn max_concurrent_invocations(&self) -> usize {
        self.concurrent.load(Ordering::SeqCst)
    }

    fn max_enqueued_invocations(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }

    async fn invoke(
        &self,
        ctx: TaskContext,
        params: InvocationParams,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.invocations.lock().unwrap().push(params);
        match &self.mode {
            Mode::Succeed => Ok(()),
            Mode::Fail => anyhow::bail!("recorder failure #{}", params.invocation_id),
            Mode::Panic => panic!("recorder panic"),
            Mode::UntilCancelled => {
                cancel.cancelled().await;
                Err(Cancelled.into())
            }
            Mode::Gate(gate) => {
                tokio::select! {
                    permit = gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                        Ok(())
                    }
                    _ = cancel.cancelled() => Err(Cancelled.into()),
                }
            }
            Mode::RemoveSelf => {
                ctx.remove(&self.key)?;
                Ok(())
            }
            Mode::DisposeOwner => {
                match &ctx {
                    TaskContext::Scheduler(scheduler) => scheduler.dispose().await?,
                    TaskContext::Collection(collection) => collection.dispose().await?,
                }
                Ok(())
            }
            Mode::RescheduleOnce(at) => {
                if params.invocation_id == 1 {
                    self.reschedule(&ctx, *at)?;
                }
                Ok(())
            }
        }
    }

    fn on_enqueue(
        &self,
        _ctx: &TaskContext,
        _params: &InvocationParams,
        position: usize,
    ) -> anyhow::Result<bool> {
        self.positions.lock().unwrap().push(position);
        let fault = *self.enqueue_fault.lock().unwrap();
        if let Some(fault) = fault {
            fault.trigger("on_enqueue")?;
        }
        Ok(!self.decline.load(Ordering::SeqCst))
    }

    fn on_completed(&self, ctx: &TaskContext, completion: &CompletionParams) -> anyhow::Result<()> {
        self.completions.lock().unwrap().push(completion.clone());
        if let Some(state) = ctx.try_get_task_state(&self.key) {
            self.states.lock().unwrap().push(state);
        }
        let reschedule = self.reschedule_on_completion.lock().unwrap().take();
        if let Some(at) = reschedule {
            self.reschedule(ctx, at)?;
        }
        let fault = *self.completed_fault.lock().unwrap();
        if let Some(fault) = fault {
            fault.trigger("on_completed")?;
        }
        Ok(())
    }

    fn dispose(&self) -> anyhow::Result<()> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        if self.fail_dispose.load(Ordering::SeqCst) {
            anyhow::bail!("recorder '{}' refused to dispose", self.key);
        }
        Ok(())
    }
}

/// Poll `condition` until it holds; panics after five seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
