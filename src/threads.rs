//! Named worker-thread registry.
//!
//! Thread-affine modules must run their lifecycle hooks off the caller's
//! thread because the hooks wrap blocking hardware calls. Each worker runs an
//! independent single-threaded cooperative event loop over a single-consumer
//! task queue; there is no shared-memory parallel execution of hook code.
//! Cross-thread interaction is always "post a task to thread X and block the
//! caller until it completes" ([`ThreadRegistry::run_blocking`]).
//!
//! No timeout is enforced on posted tasks: a stuck hardware call hangs the
//! caller indefinitely. Recovery from that is external process supervision,
//! not this layer.

use crate::error::{CoreError, CoreResult};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

enum WorkerTask {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

/// Exit latch a worker signals when its loop terminates.
struct WorkerExit {
    done: Mutex<bool>,
    cond: Condvar,
}

impl WorkerExit {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn signal(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if *done {
            return true;
        }
        self.cond.wait_while_for(&mut done, |d| !*d, timeout);
        *done
    }
}

struct WorkerRecord {
    sender: mpsc::Sender<WorkerTask>,
    exit: Arc<WorkerExit>,
}

type WorkerTable = Mutex<HashMap<String, WorkerRecord>>;

/// Registry of uniquely named worker threads.
///
/// Workers self-unregister when their loop exits naturally, so the table only
/// ever holds live threads.
pub struct ThreadRegistry {
    table: Arc<WorkerTable>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    /// Create an empty thread registry.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a new worker thread under a unique name.
    ///
    /// Returns `false` without creating anything if a worker with this name
    /// already exists.
    pub fn get_new_thread(&self, name: &str) -> bool {
        let mut table = self.table.lock();
        if table.contains_key(name) {
            warn!("Thread \"{name}\" already registered, unable to create duplicate");
            return false;
        }

        let (sender, receiver) = mpsc::channel::<WorkerTask>();
        let exit = WorkerExit::new();
        let worker_exit = exit.clone();
        let worker_table: Weak<WorkerTable> = Arc::downgrade(&self.table);
        let worker_name = name.to_string();

        let spawned = thread::Builder::new()
            .name(worker_name.clone())
            .spawn(move || {
                debug!("Worker thread \"{worker_name}\" started");
                // Cooperative event loop: ends on Quit or when the queue is
                // dropped with the registry.
                while let Ok(task) = receiver.recv() {
                    match task {
                        WorkerTask::Run(task) => task(),
                        WorkerTask::Quit => break,
                    }
                }
                if let Some(table) = worker_table.upgrade() {
                    table.lock().remove(&worker_name);
                }
                debug!("Worker thread \"{worker_name}\" finished");
                worker_exit.signal();
            });

        match spawned {
            Ok(_handle) => {
                table.insert(name.to_string(), WorkerRecord { sender, exit });
                info!("Created worker thread \"{name}\"");
                true
            }
            Err(err) => {
                error!("Failed to spawn worker thread \"{name}\": {err}");
                false
            }
        }
    }

    /// Post a task to the named worker and block until it has completed
    /// there, returning the task's result.
    ///
    /// Calling this from the worker itself runs the task inline instead of
    /// deadlocking on the queue.
    pub fn run_blocking<R, F>(&self, name: &str, task: F) -> CoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if thread::current().name() == Some(name) {
            return Ok(task());
        }

        let sender = {
            let table = self.table.lock();
            match table.get(name) {
                Some(record) => record.sender.clone(),
                None => {
                    return Err(CoreError::Thread(format!(
                        "no worker thread named \"{name}\""
                    )))
                }
            }
        };

        let (done_tx, done_rx) = mpsc::channel::<R>();
        sender
            .send(WorkerTask::Run(Box::new(move || {
                let _ = done_tx.send(task());
            })))
            .map_err(|_| CoreError::Thread(format!("worker thread \"{name}\" queue closed")))?;
        done_rx
            .recv()
            .map_err(|_| CoreError::Thread(format!("worker thread \"{name}\" died mid-task")))
    }

    /// Request cooperative termination of the named worker's event loop.
    ///
    /// Returns `false` if no such worker exists. Does not wait for the loop
    /// to exit; pair with [`ThreadRegistry::join_thread`] for that.
    pub fn quit_thread(&self, name: &str) -> bool {
        let table = self.table.lock();
        match table.get(name) {
            Some(record) => {
                let _ = record.sender.send(WorkerTask::Quit);
                true
            }
            None => {
                debug!("No worker thread \"{name}\" to quit");
                false
            }
        }
    }

    /// Block until the named worker's loop has exited or the timeout elapsed.
    ///
    /// A name with no live worker counts as already joined.
    pub fn join_thread(&self, name: &str, timeout: Duration) -> bool {
        let exit = {
            let table = self.table.lock();
            match table.get(name) {
                Some(record) => record.exit.clone(),
                None => return true,
            }
        };
        exit.wait(timeout)
    }

    /// Process-teardown helper: request termination of every worker and wait
    /// for each up to `timeout`. Laggards are logged, never raised.
    pub fn quit_all_threads(&self, timeout: Duration) {
        let names: Vec<String> = self.table.lock().keys().cloned().collect();
        for name in &names {
            self.quit_thread(name);
        }
        for name in &names {
            if !self.join_thread(name, timeout) {
                error!("Worker thread \"{name}\" did not terminate within {timeout:?}");
            }
        }
    }

    /// Names of all live workers.
    pub fn thread_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a worker with this name is alive.
    pub fn has_thread(&self, name: &str) -> bool {
        self.table.lock().contains_key(name)
    }
}
