use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::queue::lock;

/// Stage of a scheduler cycle. Phases always run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Buffer and queue cleanup.
    Pre,
    /// Readiness polling and dispatch.
    Io,
    /// Protocol resolution, broadcast, deferred deletion.
    Logic,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Pre, Phase::Io, Phase::Logic];

    fn index(self) -> usize {
        match self {
            Self::Pre => 0,
            Self::Io => 1,
            Self::Logic => 2,
        }
    }
}

type TaskFn<C> = Box<dyn FnMut(&mut C, &TaskQueue<C>) + Send>;

#[derive(Debug, Clone, Copy)]
enum Cadence {
    Once,
    Persistent,
    Throttled {
        interval: Duration,
        last: Option<Instant>,
    },
}

/// A named unit of work run against a context `C`.
pub struct Task<C> {
    name: Cow<'static, str>,
    cadence: Cadence,
    run: TaskFn<C>,
}

impl<C> Task<C> {
    /// Runs on the next pass of its phase, then is dropped.
    pub fn once<F>(name: impl Into<Cow<'static, str>>, run: F) -> Self
    where
        F: FnMut(&mut C, &TaskQueue<C>) + Send + 'static,
    {
        Self::with_cadence(name, Cadence::Once, run)
    }

    /// Runs on every pass of its phase.
    pub fn persistent<F>(name: impl Into<Cow<'static, str>>, run: F) -> Self
    where
        F: FnMut(&mut C, &TaskQueue<C>) + Send + 'static,
    {
        Self::with_cadence(name, Cadence::Persistent, run)
    }

    /// Persistent, but skipped until `interval` has passed since its last run.
    /// The first pass always runs it.
    pub fn throttled<F>(name: impl Into<Cow<'static, str>>, interval: Duration, run: F) -> Self
    where
        F: FnMut(&mut C, &TaskQueue<C>) + Send + 'static,
    {
        Self::with_cadence(name, Cadence::Throttled { interval, last: None }, run)
    }

    fn with_cadence<F>(name: impl Into<Cow<'static, str>>, cadence: Cadence, run: F) -> Self
    where
        F: FnMut(&mut C, &TaskQueue<C>) + Send + 'static,
    {
        Self {
            name: name.into(),
            cadence,
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.cadence {
            Cadence::Throttled {
                interval,
                last: Some(last),
            } => now.saturating_duration_since(last) >= interval,
            _ => true,
        }
    }

    /// Run the task; returns whether it stays scheduled.
    fn execute(&mut self, ctx: &mut C, queue: &TaskQueue<C>, now: Instant) -> bool {
        if !self.is_due(now) {
            return true;
        }
        (self.run)(ctx, queue);
        match &mut self.cadence {
            Cadence::Once => false,
            Cadence::Persistent => true,
            Cadence::Throttled { last, .. } => {
                *last = Some(now);
                true
            }
        }
    }
}

impl<C> std::fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("cadence", &self.cadence)
            .finish()
    }
}

struct Pending<C> {
    front: [Vec<Task<C>>; 3],
    back: [Vec<Task<C>>; 3],
}

impl<C> Pending<C> {
    fn new() -> Self {
        Self {
            front: [Vec::new(), Vec::new(), Vec::new()],
            back: [Vec::new(), Vec::new(), Vec::new()],
        }
    }
}

/// Handle for enqueueing tasks, including from inside a running task.
///
/// Work queued for a phase that has not run yet in the current cycle runs in
/// this cycle; otherwise it runs in the next one.
pub struct TaskQueue<C> {
    pending: Arc<Mutex<Pending<C>>>,
}

impl<C> TaskQueue<C> {
    fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(Pending::new())),
        }
    }

    pub fn push_front(&self, phase: Phase, task: Task<C>) {
        lock(&self.pending).front[phase.index()].push(task);
    }

    pub fn push_back(&self, phase: Phase, task: Task<C>) {
        lock(&self.pending).back[phase.index()].push(task);
    }

    fn take(&self, phase: Phase) -> (Vec<Task<C>>, Vec<Task<C>>) {
        let mut pending = lock(&self.pending);
        let i = phase.index();
        (
            std::mem::take(&mut pending.front[i]),
            std::mem::take(&mut pending.back[i]),
        )
    }
}

impl<C> Clone for TaskQueue<C> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Cooperative three-phase task runner.
///
/// Each call to [`Scheduler::run`] is one cycle: every due task of `Pre`, then
/// `Io`, then `Logic`, in queue order. Nothing here blocks; a task that polls a
/// multiplexer is the only place a cycle waits.
pub struct Scheduler<C> {
    phases: [VecDeque<Task<C>>; 3],
    queue: TaskQueue<C>,
    cycles: u64,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            phases: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            queue: TaskQueue::new(),
            cycles: 0,
        }
    }

    /// A cloneable handle for enqueueing work from outside a `&mut` borrow.
    pub fn queue(&self) -> TaskQueue<C> {
        self.queue.clone()
    }

    pub fn push_front(&mut self, phase: Phase, task: Task<C>) {
        self.phases[phase.index()].push_front(task);
    }

    pub fn push_back(&mut self, phase: Phase, task: Task<C>) {
        self.phases[phase.index()].push_back(task);
    }

    /// Execute one full pass over all phases.
    pub fn run(&mut self, ctx: &mut C) {
        for phase in Phase::ALL {
            self.merge_pending(phase);

            let i = phase.index();
            let tasks = std::mem::take(&mut self.phases[i]);
            let mut kept = VecDeque::with_capacity(tasks.len());
            let now = Instant::now();
            for mut task in tasks {
                if task.execute(ctx, &self.queue, now) {
                    kept.push_back(task);
                } else {
                    trace!(task = %task.name, ?phase, "once task retired");
                }
            }
            self.phases[i] = kept;
        }
        self.cycles += 1;
    }

    fn merge_pending(&mut self, phase: Phase) {
        let (front, back) = self.queue.take(phase);
        let tasks = &mut self.phases[phase.index()];
        for task in front {
            tasks.push_front(task);
        }
        tasks.extend(back);
    }

    /// Task names scheduled for `phase`, in run order.
    pub fn task_names(&self, phase: Phase) -> Vec<&str> {
        self.phases[phase.index()]
            .iter()
            .map(|task| task.name())
            .collect()
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}
