//! Bounded parallel execution of a [`Plan`].
//!
//! The scheduler runs a single coordinator on the calling thread and a fixed
//! pool of worker threads. Jobs go out to the workers over a shared queue and
//! results come back over a channel. The coordinator is the only place task
//! state is ever written:
//!
//! 1. Tasks without dependencies start out eligible.
//! 2. While a worker is free, the cheapest eligible task is dispatched. Ties
//!    go to the task planned first.
//! 3. The coordinator waits for the next result, the nearest deadline, or the
//!    cancellation poll interval, whichever comes first.
//! 4. A successful task decrements the pending count of its dependents, which
//!    become eligible at zero. A failed or timed out task marks everything
//!    downstream as skipped.
//! 5. The loop ends once every task is in a terminal state.

mod pool;
mod summary;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::Config;
use crate::executor::TaskExecutor;
use crate::plan::{Plan, TaskId};
use crate::scheduler::pool::{Done, Job, WorkerPool};
use crate::utils::{STYLE_RUN, as_elapsed};

pub use crate::scheduler::summary::{RunOutcome, RunSummary, TaskReport, TaskStatus};

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops dispatching new tasks. Tasks already running are left to finish
    /// or time out.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    concurrency: usize,
    timeout: Duration,
    poll_interval: Duration,
    strict: bool,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency(),
            timeout: config.task_timeout(),
            poll_interval: config.poll_interval(),
            strict: config.strict(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes every task of the plan and reports how each one ended.
    ///
    /// Task failures never make this fail; they are part of the summary. The
    /// only error is failing to start a worker thread.
    pub fn run<E>(&self, plan: &Plan, executor: E) -> io::Result<RunSummary>
    where
        E: TaskExecutor + 'static,
    {
        if plan.is_empty() {
            tracing::info!("Nothing to build");
            return Ok(RunSummary::empty());
        }

        let started = Instant::now();
        let workers = self.concurrency.min(plan.len());

        let root_span = tracing::info_span!("scheduler", tasks = plan.len(), workers);
        root_span.pb_set_length(plan.len() as u64);
        root_span.pb_set_style(&STYLE_RUN);
        root_span.pb_set_message("Building tasks...");
        let _enter = root_span.enter();

        let (results, inbox) = mpsc::channel::<Done>();
        let mut pool = WorkerPool::new(workers, Arc::new(executor), results)?;
        let mut state = Coordinator::new(plan, root_span.clone());
        let mut cancelled = false;

        while state.terminal < plan.len() {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                let count = state.abort_pending(TaskStatus::Cancelled, "Run was cancelled");
                tracing::warn!(cancelled = count, "Cancellation requested, waiting for running tasks");
                continue;
            }

            if self.strict && !state.halted && state.has_failures() {
                state.halted = true;
                let count = state.abort_pending(TaskStatus::Skipped, "Stopped after an earlier failure");
                tracing::warn!(skipped = count, "Strict mode, not starting any more tasks");
                continue;
            }

            while state.running.len() < workers
                && let Some(Reverse((_, id))) = state.ready.pop()
            {
                let job = state.start(id, self.timeout);
                pool.dispatch(job);
            }

            if state.running.is_empty() {
                // nothing running and nothing left to start
                break;
            }

            let wait = match state.running.values().filter_map(|f| f.deadline).min() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.poll_interval),
                None => self.poll_interval,
            };

            match inbox.recv_timeout(wait) {
                Ok(done) => state.complete(done),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            for id in state.expired(Instant::now()) {
                state.time_out(id, self.timeout);
                pool.spawn_worker()?;
            }
        }

        let mut summary = RunSummary {
            tasks: state.reports,
            outcome: RunOutcome::Success,
            duration: started.elapsed(),
        };

        summary.outcome = if cancelled {
            RunOutcome::Cancelled
        } else if summary.failures().next().is_some() {
            RunOutcome::Failed
        } else {
            RunOutcome::Success
        };

        tracing::info!(
            outcome = %summary.outcome,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            timed_out = summary.timed_out(),
            skipped = summary.skipped(),
            cancelled = summary.cancelled(),
            "Finished in {}",
            as_elapsed(summary.duration)
        );

        Ok(summary)
    }
}

struct InFlight {
    started: Instant,
    /// `None` when the timeout is too large to be represented.
    deadline: Option<Instant>,
    abandoned: Arc<AtomicBool>,
}

/// Task state owned by the coordinator loop.
struct Coordinator<'p> {
    plan: &'p Plan,
    span: Span,
    reports: Vec<TaskReport>,
    /// Dependencies of each task which have not succeeded yet.
    waiting_on: Vec<usize>,
    /// Eligible tasks, cheapest first, then in plan order.
    ready: BinaryHeap<Reverse<(u64, TaskId)>>,
    running: HashMap<TaskId, InFlight>,
    terminal: usize,
    halted: bool,
}

impl<'p> Coordinator<'p> {
    fn new(plan: &'p Plan, span: Span) -> Self {
        let reports: Vec<TaskReport> = plan
            .tasks()
            .map(|task| TaskReport {
                files: task.files.len(),
                depends_on: plan.dependencies(task.id),
                ..TaskReport::new(task.id, &task.category, TaskStatus::Pending)
            })
            .collect();

        let waiting_on = reports.iter().map(|r| r.depends_on.len()).collect();

        let mut state = Self {
            plan,
            span,
            reports,
            waiting_on,
            ready: BinaryHeap::new(),
            running: HashMap::new(),
            terminal: 0,
            halted: false,
        };

        for id in plan.roots() {
            state.make_eligible(id);
        }

        state
    }

    fn make_eligible(&mut self, id: TaskId) {
        self.reports[id.0].status = TaskStatus::Eligible;
        let cost = self.plan.task(id).map_or(0, |task| task.estimated_cost);
        self.ready.push(Reverse((cost, id)));
    }

    fn start(&mut self, id: TaskId, timeout: Duration) -> Job {
        let abandoned = Arc::new(AtomicBool::new(false));
        let started = Instant::now();
        self.reports[id.0].status = TaskStatus::Running;
        self.running.insert(
            id,
            InFlight {
                started,
                deadline: started.checked_add(timeout),
                abandoned: abandoned.clone(),
            },
        );

        tracing::debug!(task = %id, category = %self.reports[id.0].category, "Dispatching task");

        Job {
            id,
            spec: self.plan.shared(id),
            abandoned,
            parent: self.span.clone(),
        }
    }

    fn complete(&mut self, done: Done) {
        if self.running.remove(&done.id).is_none() {
            tracing::debug!(task = %done.id, "Discarding late result of timed out task");
            return;
        }

        let report = &mut self.reports[done.id.0];
        report.start = Some(done.start);
        report.duration = Some(done.duration);
        report.output = done.outcome.output;

        if done.outcome.success {
            tracing::debug!(task = %done.id, category = %report.category, "Task succeeded in {}", as_elapsed(done.duration));
            self.finish(done.id, TaskStatus::Success);
        } else {
            let error = match done.outcome.error {
                error if error.is_empty() => String::from("Task failed without an error message"),
                error => error,
            };
            tracing::error!(task = %done.id, category = %report.category, "Task failed: {error}");
            report.error = Some(error);
            self.finish(done.id, TaskStatus::Failed);
        }
    }

    fn expired(&self, now: Instant) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, flight)| flight.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn time_out(&mut self, id: TaskId, timeout: Duration) {
        let started = self.running.remove(&id).map(|flight| {
            flight.abandoned.store(true, Ordering::Release);
            flight.started
        });

        let report = &mut self.reports[id.0];
        report.start = started;
        report.duration = Some(timeout);
        report.error = Some(format!("Timed out after {}", as_elapsed(timeout)));
        tracing::error!(task = %id, category = %report.category, "Task timed out after {}", as_elapsed(timeout));

        self.finish(id, TaskStatus::Timeout);
    }

    fn mark(&mut self, id: TaskId, status: TaskStatus) {
        self.reports[id.0].status = status;
        self.terminal += 1;
        self.span.pb_inc(1);
    }

    fn finish(&mut self, id: TaskId, status: TaskStatus) {
        self.mark(id, status);

        if status == TaskStatus::Success {
            for dependent in self.plan.dependents(id) {
                self.waiting_on[dependent.0] -= 1;
                if self.waiting_on[dependent.0] == 0 && self.reports[dependent.0].status == TaskStatus::Pending {
                    self.make_eligible(dependent);
                }
            }
        } else {
            self.skip_dependents(id);
        }
    }

    /// Marks every pending task downstream of `failed` as skipped.
    fn skip_dependents(&mut self, failed: TaskId) {
        let mut stack = vec![failed];

        while let Some(id) = stack.pop() {
            for dependent in self.plan.dependents(id) {
                if self.reports[dependent.0].status != TaskStatus::Pending {
                    continue;
                }

                let reason = format!("Dependency {} ({}) did not succeed", id, self.reports[id.0].category);
                tracing::debug!(task = %dependent, "{reason}");
                self.reports[dependent.0].error = Some(reason);
                self.mark(dependent, TaskStatus::Skipped);
                stack.push(dependent);
            }
        }
    }

    /// Ends every task which has not been dispatched yet.
    fn abort_pending(&mut self, status: TaskStatus, reason: &str) -> usize {
        self.ready.clear();

        let ids: Vec<TaskId> = self
            .reports
            .iter()
            .filter(|r| matches!(r.status, TaskStatus::Pending | TaskStatus::Eligible))
            .map(|r| r.id)
            .collect();

        for &id in &ids {
            self.reports[id.0].error = Some(reason.to_string());
            self.mark(id, status);
        }

        ids.len()
    }

    fn has_failures(&self) -> bool {
        self.reports.iter().any(|r| r.status.is_failure())
    }
}
