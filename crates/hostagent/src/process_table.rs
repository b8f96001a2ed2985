//! Queries against the live OS process table.
//!
//! The supervisor only trusts its registry for processes it spawned during
//! this incarnation. Processes left behind by a previous agent are found here
//! by image name and torn down as stale.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsStr;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use log::{debug, warn};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Live OS process lookup and forced termination.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Pid of a running process whose image name (file name without
    /// extension) equals `name`. When a process tree matches, the root wins.
    async fn find_by_name(&self, name: &str) -> io::Result<Option<u32>>;

    /// Force-kill `pid` and all of its descendants. A pid that no longer
    /// exists is not an error.
    async fn kill_tree(&self, pid: u32) -> io::Result<()>;
}

/// Image name of an executable path: the file name with a trailing `.exe`
/// removed.
pub fn image_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_string_lossy();
    Some(strip_exe(&file_name).to_string())
}

/// Name a managed process is tracked under: its image name, lower-cased.
/// Image names compare case-insensitively on the host, so `svc` and `SVC`
/// are one process.
pub fn process_name(path: &Path) -> Option<String> {
    image_name(path).map(|name| name.to_lowercase())
}

fn strip_exe(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
        &name[..len - 4]
    } else {
        name
    }
}

fn process_matches(name: &str, exe: Option<&Path>, process_name: &OsStr) -> bool {
    // The short process name is truncated on Linux, so prefer the executable.
    if let Some(image) = exe.and_then(image_name) {
        return image.eq_ignore_ascii_case(name);
    }
    strip_exe(&process_name.to_string_lossy()).eq_ignore_ascii_case(name)
}

fn refreshed_system() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
    );
    system
}

fn find_root(system: &System, name: &str) -> Option<u32> {
    let matches: HashSet<Pid> = system
        .processes()
        .iter()
        .filter(|(_, p)| process_matches(name, p.exe(), p.name()))
        .map(|(pid, _)| *pid)
        .collect();

    let mut roots: Vec<Pid> = matches
        .iter()
        .copied()
        .filter(|pid| {
            system
                .process(*pid)
                .and_then(|p| p.parent())
                .is_none_or(|parent| !matches.contains(&parent))
        })
        .collect();
    roots.sort();
    roots.first().map(|pid| pid.as_u32())
}

/// `pid` followed by all of its descendants, breadth first.
fn process_tree(system: &System, pid: Pid) -> Vec<Pid> {
    let mut tree = vec![pid];
    let mut queue = VecDeque::from([pid]);
    while let Some(current) = queue.pop_front() {
        for (child, process) in system.processes() {
            if process.parent() == Some(current) && !tree.contains(child) {
                tree.push(*child);
                queue.push_back(*child);
            }
        }
    }
    tree
}

/// Production process table backed by `sysinfo`; kills go through
/// `taskkill /T /F` on Windows.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn find_by_name(&self, name: &str) -> io::Result<Option<u32>> {
        let name = name.to_string();
        let found = tokio::task::spawn_blocking(move || {
            let system = refreshed_system();
            find_root(&system, &name)
        })
        .await
        .map_err(io::Error::other)?;

        if let Some(pid) = found {
            debug!("[Process] Found host process {pid}");
        }
        Ok(found)
    }

    #[cfg(windows)]
    async fn kill_tree(&self, pid: u32) -> io::Result<()> {
        let output = tokio::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output()
            .await?;
        if !output.status.success() {
            // taskkill also fails when the process is already gone.
            debug!(
                "[Process] taskkill {pid}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    #[cfg(not(windows))]
    async fn kill_tree(&self, pid: u32) -> io::Result<()> {
        tokio::task::spawn_blocking(move || {
            let system = refreshed_system();
            let root = Pid::from_u32(pid);
            if system.process(root).is_none() {
                return;
            }
            // Children first so nothing gets reparented mid-kill.
            for member in process_tree(&system, root).into_iter().rev() {
                if let Some(process) = system.process(member)
                    && !process.kill()
                {
                    warn!("[Process] Could not signal {member}");
                }
            }
        })
        .await
        .map_err(io::Error::other)
    }
}
