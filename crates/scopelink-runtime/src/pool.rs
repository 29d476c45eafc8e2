// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Worker pool
//!
//! N named worker threads pull [`PoolTask`]s from one bounded queue. Each
//! task moves the shared [`PoolFlag`] busy count up and down around its run;
//! the worker that finishes the last task of a cycle flips the flag to
//! FINISHED. Tasks that need the hardware context hold the
//! [`ExclusiveLock`] for their whole run, everything else runs lock-free.
//!
//! A failing or panicking task is recorded as a [`TaskFailure`] and the
//! worker moves on to the next task.

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use scopelink_buffers::{ExclusiveLock, PoolFlag};
use scopelink_ipc::Command;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::panic_message;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// One unit of pool work
pub trait PoolTask: Send {
    fn name(&self) -> &str;

    /// Whether the task must hold the exclusive hardware context
    fn needs_exclusive(&self) -> bool {
        false
    }

    fn run(&mut self) -> Result<()>;
}

/// A task that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub details: String,
}

impl TaskFailure {
    pub fn into_command(self) -> Command {
        Command::TaskFailed {
            task: self.task,
            details: self.details,
        }
    }
}

impl From<TaskFailure> for ManagerError {
    fn from(failure: TaskFailure) -> Self {
        ManagerError::WorkerTaskFailure {
            task: failure.task,
            details: failure.details,
        }
    }
}

struct WorkerShared {
    flag: Arc<PoolFlag>,
    exclusive: Arc<ExclusiveLock>,
    failures: Sender<TaskFailure>,
    shutdown: Arc<AtomicBool>,
}

pub struct WorkerPool {
    tx: Option<Sender<Box<dyn PoolTask>>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    flag: Arc<PoolFlag>,
    failures: Receiver<TaskFailure>,
}

impl WorkerPool {
    /// Spawn `workers` threads sharing a queue of `queue_capacity` tasks
    pub fn start(
        workers: usize,
        queue_capacity: usize,
        flag: Arc<PoolFlag>,
        exclusive: Arc<ExclusiveLock>,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<Box<dyn PoolTask>>(queue_capacity.max(1));
        let (failure_tx, failure_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut pool = Self {
            tx: Some(tx),
            workers: Vec::with_capacity(workers),
            shutdown: Arc::clone(&shutdown),
            flag: Arc::clone(&flag),
            failures: failure_rx,
        };

        for index in 0..workers {
            let rx = rx.clone();
            let shared = WorkerShared {
                flag: Arc::clone(&flag),
                exclusive: Arc::clone(&exclusive),
                failures: failure_tx.clone(),
                shutdown: Arc::clone(&shutdown),
            };
            let handle = thread::Builder::new()
                .name(format!("scopelink-pool-worker-{}", index))
                .spawn(move || worker_loop(index, rx, shared))
                .map_err(|e| ManagerError::Spawn(format!("pool worker {}: {}", index, e)))?;
            pool.workers.push(handle);
        }

        info!("[POOL] Started {} worker(s), queue capacity {}", workers, queue_capacity);
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn flag(&self) -> &PoolFlag {
        &self.flag
    }

    /// Start a cycle of `tasks` tasks; IDLE → RUNNING
    pub fn begin_cycle(&self, tasks: u32) -> Result<u64> {
        Ok(self.flag.begin_cycle(tasks)?)
    }

    /// Queue a task of the current cycle, blocking while the queue is full
    pub fn enqueue(&self, task: Box<dyn PoolTask>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ManagerError::PoolStopped)?;
        tx.send(task).map_err(|_| ManagerError::PoolStopped)
    }

    /// Begin a cycle sized to `tasks` and queue all of them
    pub fn submit_cycle(&self, tasks: Vec<Box<dyn PoolTask>>) -> Result<u64> {
        let cycle = self.begin_cycle(tasks.len() as u32)?;
        for task in tasks {
            self.enqueue(task)?;
        }
        Ok(cycle)
    }

    /// Failures recorded since the last call
    pub fn take_failures(&self) -> Vec<TaskFailure> {
        self.failures.try_iter().collect()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed) && self.workers.iter().any(|w| !w.is_finished())
    }

    /// Signal every worker to stop and join them
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.tx.take();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("pool-worker").to_string();
            if handle.join().is_err() {
                error!("[POOL] Worker {} panicked outside a task", name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(index: usize, rx: Receiver<Box<dyn PoolTask>>, shared: WorkerShared) {
    debug!("[POOL] Worker {} ready", index);
    while !shared.shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(task) => run_one(index, task, &shared),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("[POOL] Worker {} exiting", index);
}

fn report_failure(shared: &WorkerShared, failure: TaskFailure) {
    if let Err(e) = shared.failures.send(failure) {
        warn!("[POOL] Nobody collects failures any more, lost report for '{}'", e.0.task);
    }
}

fn run_one(index: usize, mut task: Box<dyn PoolTask>, shared: &WorkerShared) {
    let name = task.name().to_string();
    let busy = match shared.flag.task_started() {
        Ok(busy) => busy,
        Err(e) => {
            warn!("[POOL] Worker {} refused task '{}': {}", index, name, e);
            report_failure(
                shared,
                TaskFailure {
                    task: name,
                    details: e.to_string(),
                },
            );
            return;
        }
    };
    debug!("[POOL] Worker {} running '{}' (busy {})", index, name, busy);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if task.needs_exclusive() {
            let _guard = shared.exclusive.lock();
            task.run()
        } else {
            task.run()
        }
    }));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
    };
    if let Some(details) = failure {
        warn!("[POOL] Task '{}' failed on worker {}: {}", name, index, details);
        report_failure(shared, TaskFailure { task: name, details });
    }

    match shared.flag.task_finished() {
        Ok(0) => {
            if let Err(e) = shared.flag.finish_cycle() {
                error!("[POOL] Could not finish cycle: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => error!("[POOL] Worker {} could not release busy slot: {}", index, e),
    }
}
