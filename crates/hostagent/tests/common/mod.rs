//! Test utilities: host fakes and scratch binaries.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hostagent::allowlist::ProcessPathAllowList;
use hostagent::checksum::compute_checksum;
use hostagent::containers::{Container, ContainerError, ContainerLookup, ContainerResult, MountPoint};
use hostagent::firewall::FirewallManager;
use hostagent::process_table::ProcessTable;
use hostagent::service::AgentService;
use hostagent::shell::{ShellError, ShellOutput, ShellRunner};
use hostagent::volumes::VolumeMounter;
use hostagent::{ProcessRegistry, StartOptions, Supervisor, SupervisorConfig};
use tokio_util::sync::CancellationToken;

/// Shell that records commands instead of running PowerShell.
#[derive(Default)]
pub struct RecordingShell {
    commands: Mutex<Vec<String>>,
    fail_with: Mutex<Option<String>>,
    stall: Mutex<bool>,
}

impl RecordingShell {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn fail_with(&self, stderr: &str) {
        *self.fail_with.lock().unwrap() = Some(stderr.to_string());
    }

    /// Make every later command hang after it is recorded.
    pub fn stall(&self) {
        *self.stall.lock().unwrap() = true;
    }
}

#[async_trait]
impl ShellRunner for RecordingShell {
    async fn execute(
        &self,
        command: &str,
        _cancel: &CancellationToken,
    ) -> Result<ShellOutput, ShellError> {
        self.commands.lock().unwrap().push(command.to_string());
        let stall = *self.stall.lock().unwrap();
        if stall {
            futures::future::pending::<()>().await;
        }
        match self.fail_with.lock().unwrap().clone() {
            Some(stderr) => Err(ShellError::Failed {
                status: "exit status: 1".to_string(),
                stderr,
            }),
            None => Ok(ShellOutput::default()),
        }
    }
}

/// Process table backed by a name -> pid map the test controls. Kills are
/// real `kill -9` signals.
#[derive(Default)]
pub struct FakeHost {
    processes: Mutex<HashMap<String, u32>>,
    killed: Mutex<Vec<u32>>,
    refuse_kill: Mutex<bool>,
    stall_kill: Mutex<bool>,
}

impl FakeHost {
    pub fn insert(&self, name: &str, pid: u32) {
        self.processes.lock().unwrap().insert(name.to_string(), pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }

    pub fn refuse_kills(&self) {
        *self.refuse_kill.lock().unwrap() = true;
    }

    /// Make kills hang until `stall_kills(false)`.
    pub fn stall_kills(&self, stall: bool) {
        *self.stall_kill.lock().unwrap() = stall;
    }
}

#[async_trait]
impl ProcessTable for FakeHost {
    async fn find_by_name(&self, name: &str) -> io::Result<Option<u32>> {
        Ok(self.processes.lock().unwrap().get(name).copied())
    }

    async fn kill_tree(&self, pid: u32) -> io::Result<()> {
        let stall = *self.stall_kill.lock().unwrap();
        if stall {
            futures::future::pending::<()>().await;
        }
        if *self.refuse_kill.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "access denied"));
        }
        self.killed.lock().unwrap().push(pid);
        self.processes.lock().unwrap().retain(|_, p| *p != pid);
        let _ = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status();
        Ok(())
    }
}

/// Container lookup answering from a fixed label -> mounts table.
#[derive(Default)]
pub struct FakeContainers {
    containers: Mutex<Vec<(BTreeMap<String, String>, Container)>>,
}

impl FakeContainers {
    /// Register a container labelled `selector` (`KEY=VALUE`) mounting
    /// `host_path` at `container_path`.
    pub fn insert(&self, selector: &str, container_path: &str, host_path: &Path) {
        let labels = hostagent::containers::parse_selectors(&[selector]).unwrap();
        let mount = MountPoint {
            read_only: true,
            host_path: host_path.to_string_lossy().into_owned(),
            container_path: container_path.to_string(),
        };
        let mut containers = self.containers.lock().unwrap();
        match containers.iter_mut().find(|(l, _)| *l == labels) {
            Some((_, container)) => container.mounts.push(mount),
            None => containers.push((
                labels,
                Container {
                    id: selector.to_string(),
                    mounts: vec![mount],
                },
            )),
        }
    }
}

#[async_trait]
impl ContainerLookup for FakeContainers {
    async fn find(&self, labels: &BTreeMap<String, String>) -> ContainerResult<Container> {
        let containers = self.containers.lock().unwrap();
        containers
            .iter()
            .find(|(l, _)| labels.iter().all(|(k, v)| l.get(k) == Some(v)))
            .map(|(_, c)| c.clone())
            .ok_or_else(|| ContainerError::NotFound(format!("{labels:?}")))
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub shell: Arc<RecordingShell>,
    pub host: Arc<FakeHost>,
    pub containers: Arc<FakeContainers>,
    pub registry: Arc<ProcessRegistry>,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SupervisorConfig::default())
    }

    pub fn with_config(config: SupervisorConfig) -> Self {
        let shell = Arc::new(RecordingShell::default());
        let host = Arc::new(FakeHost::default());
        let containers = Arc::new(FakeContainers::default());
        let registry = Arc::new(ProcessRegistry::new());
        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            FirewallManager::new(shell.clone()),
            host.clone(),
            config,
        ));
        Self {
            dir: tempfile::tempdir().unwrap(),
            shell,
            host,
            containers,
            registry,
            supervisor,
        }
    }

    pub fn service(&self, allow_list: ProcessPathAllowList) -> Arc<AgentService> {
        Arc::new(AgentService::new(
            self.supervisor.clone(),
            VolumeMounter::new(self.containers.clone()),
            allow_list,
        ))
    }

    /// Write an executable shell script into the scratch directory.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        write_script(self.dir.path(), name, body)
    }

    /// Start options for `path` with its real checksum.
    pub async fn options(&self, path: &Path) -> StartOptions {
        StartOptions {
            path: path.to_path_buf(),
            checksum: compute_checksum(path).await.unwrap(),
            ..Default::default()
        }
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Whether `pid` can still be signalled.
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
