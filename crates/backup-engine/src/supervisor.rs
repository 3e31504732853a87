//! Restartable background tasks.
//!
//! Each task runs on its own named thread and reports a heartbeat through its [`TaskHandle`].
//! The supervisor restarts a task whose thread has ended without a shutdown, and replaces a
//! task whose heartbeat has gone stale. A replaced task sees `should_continue() == false` and
//! exits at its next check.

use core::time::Duration;
use std::{
    io,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use thiserror::Error;
use tracing::{error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Signals every background task to stop.
#[derive(Default)]
pub struct ShutdownSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl ShutdownSignal {
    /// A signal that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every task to stop.
    pub fn trigger(&self) {
        *lock(&self.stopped) = true;
        self.changed.notify_all();
    }

    /// If shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *lock(&self.stopped)
    }

    /// Sleep for `duration` or until shutdown. Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let stopped = lock(&self.stopped);
        let (stopped, _) = self
            .changed
            .wait_timeout_while(stopped, duration, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// State shared between a task's runs and the supervisor.
struct TaskState {
    generation: AtomicU64,
    restarts: AtomicU32,
    last_beat: Mutex<Instant>,
}

/// Given to each run of a task.
pub struct TaskHandle {
    name: &'static str,
    generation: u64,
    state: Arc<TaskState>,
    shutdown: Arc<ShutdownSignal>,
}

impl TaskHandle {
    /// The task name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Report that the task is alive.
    pub fn beat(&self) {
        *lock(&self.state.last_beat) = Instant::now();
    }

    /// If this run should keep going: no shutdown was requested and it was not replaced.
    pub fn should_continue(&self) -> bool {
        !self.shutdown.is_triggered() && self.state.generation.load(Ordering::SeqCst) == self.generation
    }

    /// Sleep for `duration`, waking early on shutdown. Returns [`TaskHandle::should_continue`].
    pub fn sleep(&self, duration: Duration) -> bool {
        self.shutdown.wait_timeout(duration);
        self.should_continue()
    }
}

/// A task body. Called again for every restart.
pub type TaskBody = Arc<dyn Fn(&TaskHandle) + Send + Sync>;

/// Describes a supervised task.
pub struct TaskConfig {
    /// Thread and log name.
    pub name: &'static str,
    /// Replace the task when it has not beaten for this long. `None` only restarts it when
    /// its thread ends.
    pub heartbeat_timeout: Option<Duration>,
    /// The task body.
    pub body: TaskBody,
}

struct Supervised {
    config: TaskConfig,
    state: Arc<TaskState>,
    thread: Option<JoinHandle<()>>,
    /// Replaced runs that have not exited yet.
    replaced: Vec<JoinHandle<()>>,
}

/// Keeps background tasks running.
pub struct Supervisor {
    tasks: Mutex<Vec<Supervised>>,
    shutdown: Arc<ShutdownSignal>,
    interval: Duration,
}

impl Supervisor {
    /// Create a supervisor that checks its tasks every `interval`.
    pub fn new(interval: Duration, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown,
            interval,
        }
    }

    /// Start a task.
    pub fn spawn(&self, config: TaskConfig) -> Result<(), SpawnError> {
        let state = Arc::new(TaskState {
            generation: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
            last_beat: Mutex::new(Instant::now()),
        });

        let thread = self.start(&config, &state)?;
        info!("[Supervisor] Started {}", config.name);

        lock(&self.tasks).push(Supervised {
            config,
            state,
            thread: Some(thread),
            replaced: Vec::new(),
        });

        Ok(())
    }

    fn start(&self, config: &TaskConfig, state: &Arc<TaskState>) -> Result<JoinHandle<()>, SpawnError> {
        *lock(&state.last_beat) = Instant::now();

        let handle = TaskHandle {
            name: config.name,
            generation: state.generation.load(Ordering::SeqCst),
            state: Arc::clone(state),
            shutdown: Arc::clone(&self.shutdown),
        };
        let body = Arc::clone(&config.body);

        thread::Builder::new()
            .name(config.name.to_string())
            .spawn(move || body(&handle))
            .map_err(SpawnError)
    }

    /// Check every task once, restarting any that died or stalled.
    pub fn check(&self) {
        if self.shutdown.is_triggered() {
            return;
        }

        let mut tasks = lock(&self.tasks);
        for task in tasks.iter_mut() {
            task.replaced.retain(|thread| !thread.is_finished());

            let finished = task.thread.as_ref().is_none_or(JoinHandle::is_finished);
            let stale = task.config.heartbeat_timeout.is_some_and(|timeout| {
                lock(&task.state.last_beat).elapsed() > timeout
            });

            if finished {
                if let Some(thread) = task.thread.take() {
                    match thread.join() {
                        Ok(()) => error!("[Supervisor] {} stopped unexpectedly, restarting it", task.config.name),
                        Err(_) => error!("[Supervisor] {} panicked, restarting it", task.config.name),
                    }
                }
            } else if stale {
                error!("[Supervisor] {} stopped responding, replacing it", task.config.name);
                if let Some(thread) = task.thread.take() {
                    task.replaced.push(thread);
                }
            } else {
                continue;
            }

            task.state.generation.fetch_add(1, Ordering::SeqCst);
            task.state.restarts.fetch_add(1, Ordering::SeqCst);

            match self.start(&task.config, &task.state) {
                Ok(thread) => task.thread = Some(thread),
                Err(error) => error!("[Supervisor] Could not restart {}: {error}", task.config.name),
            }
        }
    }

    /// How many times the named task has been restarted.
    pub fn restarts(&self, name: &str) -> Option<u32> {
        lock(&self.tasks)
            .iter()
            .find(|task| task.config.name == name)
            .map(|task| task.state.restarts.load(Ordering::SeqCst))
    }

    /// Check the tasks every interval until shutdown, then wait for them to exit.
    pub fn run(&self) {
        while !self.shutdown.wait_timeout(self.interval) {
            self.check();
        }

        self.join();
    }

    /// Wait for every task thread to exit. Only returns once shutdown was triggered and the
    /// tasks have noticed it.
    pub fn join(&self) {
        let threads: Vec<(&'static str, JoinHandle<()>)> = {
            let mut tasks = lock(&self.tasks);
            let threads: Vec<_> = tasks
                .iter_mut()
                .flat_map(|task| {
                    let name = task.config.name;
                    task.thread
                        .take()
                        .into_iter()
                        .chain(task.replaced.drain(..))
                        .map(move |thread| (name, thread))
                })
                .collect();
            threads
        };

        for (name, thread) in threads {
            if thread.join().is_err() {
                warn!("[Supervisor] {name} panicked while shutting down");
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
#[error("Failed to spawn a task thread:\n{0}")]
pub struct SpawnError(#[source] io::Error);
