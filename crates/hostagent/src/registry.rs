//! Name-keyed table of managed processes.

use std::sync::Arc;

use dashmap::DashMap;
use log::warn;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{Mutex, watch};

use crate::error::{SupervisorError, SupervisorResult};

/// How a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal or unreadable.
    pub code: Option<i32>,
}

/// A host process spawned by the supervisor.
///
/// The child itself is owned by a reaper task; this handle only keeps the
/// output pipes (taken once by `wait`) and a watch on the exit status.
#[derive(Debug)]
pub struct ManagedProcess {
    pid: u32,
    name: String,
    stdout: Mutex<Option<ChildStdout>>,
    stderr: Mutex<Option<ChildStderr>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ManagedProcess {
    /// Take ownership of a freshly spawned child and start reaping it.
    ///
    /// Returns `None` if the child has already been polled to completion.
    pub fn from_child(name: impl Into<String>, mut child: Child) -> Option<Arc<Self>> {
        let pid = child.id()?;
        let name = name.into();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (exit_tx, exit_rx) = watch::channel(None);

        let reaper_name = name.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("[Process] Could not wait on {reaper_name}({pid}): {e}");
                    None
                }
            };
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        Some(Arc::new(Self {
            pid,
            name,
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            exit: exit_rx,
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the stdout pipe. Only the first caller gets it.
    pub async fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().await.take()
    }

    /// Take the stderr pipe. Only the first caller gets it.
    pub async fn take_stderr(&self) -> Option<ChildStderr> {
        self.stderr.lock().await.take()
    }

    /// Exit status if the process has ended.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    /// Wait until the reaper observes the exit.
    pub async fn wait_exit(&self) -> SupervisorResult<ProcessExit> {
        let mut rx = self.exit.clone();
        let exit = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SupervisorError::internal(format!("lost exit status of {self}")))?;
        exit.ok_or_else(|| SupervisorError::internal(format!("lost exit status of {self}")))
    }
}

impl std::fmt::Display for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.pid)
    }
}

/// Registry key for `name`. Lookups ignore case the way host image names do.
fn key(name: &str) -> String {
    name.to_lowercase()
}

/// Concurrent registry of managed processes keyed by process name.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: DashMap<String, Arc<ManagedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.processes
            .get(&key(name))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Insert or overwrite the entry for `name`.
    pub fn put(&self, name: &str, process: Arc<ManagedProcess>) {
        self.processes.insert(key(name), process);
    }

    pub fn delete(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.remove(&key(name)).map(|(_, process)| process)
    }

    /// Remove `name` only if it still maps to `process`.
    pub fn delete_if_same(&self, name: &str, process: &Arc<ManagedProcess>) -> bool {
        self.processes
            .remove_if(&key(name), |_, current| Arc::ptr_eq(current, process))
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processes.contains_key(&key(name))
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
