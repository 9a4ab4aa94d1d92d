use std::any::Any;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::executor::{ExecOutcome, TaskExecutor};
use crate::plan::{TaskId, TaskSpec};
use crate::utils::STYLE_TASK;

pub(crate) struct Job {
    pub id: TaskId,
    pub spec: Arc<TaskSpec>,
    /// Set by the coordinator once it gave up waiting on this job.
    pub abandoned: Arc<AtomicBool>,
    pub parent: Span,
}

pub(crate) struct Done {
    pub id: TaskId,
    pub outcome: ExecOutcome,
    pub start: Instant,
    pub duration: Duration,
}

/// Fixed set of threads pulling jobs off a shared queue.
///
/// A worker whose job was abandoned retires after the executor returns, so a
/// timed out task never holds on to more than the thread it is stuck in. The
/// coordinator spawns a replacement through [`WorkerPool::spawn_worker`].
pub(crate) struct WorkerPool {
    jobs: Sender<Job>,
    queue: Receiver<Job>,
    results: mpsc::Sender<Done>,
    executor: Arc<dyn TaskExecutor>,
    spawned: usize,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        executor: Arc<dyn TaskExecutor>,
        results: mpsc::Sender<Done>,
    ) -> io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::unbounded();
        let mut pool = Self {
            jobs,
            queue,
            results,
            executor,
            spawned: 0,
        };

        for _ in 0..size {
            pool.spawn_worker()?;
        }

        Ok(pool)
    }

    pub fn dispatch(&self, job: Job) {
        // the pool owns a receiver, so the queue is never disconnected
        let _ = self.jobs.send(job);
    }

    pub fn spawn_worker(&mut self) -> io::Result<()> {
        let queue = self.queue.clone();
        let results = self.results.clone();
        let executor = self.executor.clone();

        thread::Builder::new()
            .name(format!("kamado-worker-{}", self.spawned))
            .spawn(move || work(queue, results, executor))?;

        self.spawned += 1;
        Ok(())
    }
}

fn work(queue: Receiver<Job>, results: mpsc::Sender<Done>, executor: Arc<dyn TaskExecutor>) {
    for job in queue.iter() {
        let span = tracing::info_span!(parent: &job.parent, "task", id = %job.id, category = %job.spec.category);
        span.pb_set_style(&STYLE_TASK);
        span.pb_set_message(&format!("Running {}", job.spec.category));
        let _enter = span.enter();

        let start = Instant::now();

        // A panicking executor only poisons its own task. Everything it sees
        // is either owned by the job or behind `&self`.
        let outcome = match catch_unwind(AssertUnwindSafe(|| executor.execute(&job.spec))) {
            Ok(outcome) => outcome,
            Err(panic) => ExecOutcome::failure(panic_message(&*panic)),
        };

        let done = Done {
            id: job.id,
            outcome,
            start,
            duration: start.elapsed(),
        };

        if results.send(done).is_err() || job.abandoned.load(Ordering::Acquire) {
            break;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}
