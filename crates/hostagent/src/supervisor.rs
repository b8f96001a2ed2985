//! Host process supervisor.
//!
//! Per process name the lifecycle is Absent -> Starting -> Running -> Exiting
//! -> Absent. Start reconciles against the live OS process table before
//! spawning, so processes left behind by a previous agent are torn down and
//! replaced instead of duplicated.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use hostagent_protocol::Expose;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::checksum::verify_checksum;
use crate::error::{SupervisorError, SupervisorResult};
use crate::firewall::FirewallManager;
use crate::process_table::{ProcessTable, process_name};
use crate::registry::{ManagedProcess, ProcessExit, ProcessRegistry};

/// Console of its own for every spawned process, as the host service has none.
#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

const READ_CHUNK: usize = 1024;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Prefix given to binaries before they are spawned so their image name
    /// identifies them as agent-managed.
    pub binary_prefix: String,
    /// Upper bound on a kill, including firewall cleanup.
    pub kill_timeout: Duration,
    /// A keep-alive stream with no ping for this long is treated as closed.
    pub keepalive_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary_prefix: "hostagent-".to_string(),
            kill_timeout: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// What to start.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub path: PathBuf,
    pub checksum: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries merged over the agent's environment.
    pub envs: Vec<String>,
    /// Working directory, the binary's directory when `None`.
    pub dir: Option<PathBuf>,
    pub exposes: Vec<Expose>,
}

/// One item of a wait stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Always the last event of a successful stream.
    Exited(Option<i32>),
}

pub type WaitStream = ReceiverStream<SupervisorResult<WaitEvent>>;

/// Split a `KEY=VALUE` entry.
pub fn parse_env(entry: &str) -> SupervisorResult<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(SupervisorError::invalid_argument(format!(
            "environment entry {entry:?} is not KEY=VALUE"
        ))),
    }
}

pub struct Supervisor {
    registry: Arc<ProcessRegistry>,
    firewall: FirewallManager,
    host: Arc<dyn ProcessTable>,
    config: SupervisorConfig,
    /// Serializes Start so the uniqueness check and the registry insert
    /// cannot interleave.
    start_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        firewall: FirewallManager,
        host: Arc<dyn ProcessTable>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            firewall,
            host,
            config,
            start_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Path the binary is moved to before it is spawned.
    pub fn renamed_path(&self, path: &Path) -> SupervisorResult<PathBuf> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SupervisorError::invalid_argument(format!("{} has no file name", path.display()))
            })?;
        if file_name.starts_with(&self.config.binary_prefix) {
            return Ok(path.to_path_buf());
        }
        Ok(path.with_file_name(format!("{}{file_name}", self.config.binary_prefix)))
    }

    /// Start a binary under supervision and return its process name.
    pub async fn start(
        &self,
        options: StartOptions,
        cancel: &CancellationToken,
    ) -> SupervisorResult<String> {
        verify_checksum(&options.path, &options.checksum).await?;

        let envs = options
            .envs
            .iter()
            .map(|e| parse_env(e))
            .collect::<SupervisorResult<Vec<_>>>()?;

        let target = self.renamed_path(&options.path)?;
        let name = process_name(&target).ok_or_else(|| {
            SupervisorError::invalid_argument(format!("{} has no file name", target.display()))
        })?;

        let _guard = self.start_lock.lock().await;

        // Reconcile before the rename: a running image cannot be replaced
        // on Windows.
        self.reconcile(&name).await?;

        move_file(&options.path, &target).await.map_err(|e| {
            SupervisorError::internal(format!(
                "could not rename {} to {}: {e}",
                options.path.display(),
                target.display()
            ))
        })?;

        self.firewall
            .create_rules(&name, &options.exposes, cancel)
            .await
            .map_err(|e| {
                SupervisorError::internal(format!("could not create firewall rules: {e}"))
            })?;

        let dir = match options.dir {
            Some(dir) => dir,
            None => target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        let mut cmd = Command::new(&target);
        cmd.args(&options.args)
            .envs(envs)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_CONSOLE);
        #[cfg(unix)]
        cmd.process_group(0);

        let process = match cmd.spawn() {
            Ok(child) => ManagedProcess::from_child(name.clone(), child),
            Err(e) => {
                self.rollback_rules(&name, &options.exposes).await;
                return Err(SupervisorError::internal(format!(
                    "could not spawn {}: {e}",
                    target.display()
                )));
            }
        };
        let Some(process) = process else {
            self.rollback_rules(&name, &options.exposes).await;
            return Err(SupervisorError::internal(format!(
                "{} exited before it could be tracked",
                target.display()
            )));
        };

        info!("[Process] Created process {process}");
        self.registry.put(&name, process);
        Ok(name)
    }

    async fn reconcile(&self, name: &str) -> SupervisorResult<()> {
        if let Some(existing) = self.registry.get(name) {
            if existing.is_running() {
                return Err(SupervisorError::AlreadyRunning(name.to_string()));
            }
            // Exited but never killed.
            self.registry.delete_if_same(name, &existing);
        }

        let found = self.host.find_by_name(name).await.map_err(|e| {
            SupervisorError::internal(format!("could not query host processes: {e}"))
        })?;
        let Some(pid) = found else {
            return Ok(());
        };

        warn!("[Process] Found stale process {name}({pid}), recreating it");
        self.kill_stale(name, pid).await
    }

    async fn kill_stale(&self, name: &str, pid: u32) -> SupervisorResult<()> {
        // The tree goes first so a hung firewall call cannot keep it alive.
        let work = async {
            self.host.kill_tree(pid).await.map_err(|e| {
                SupervisorError::internal(format!("could not kill stale process {pid}: {e}"))
            })?;
            let cancel = CancellationToken::new();
            self.firewall
                .remove_rules(name, &cancel)
                .await
                .map_err(|e| SupervisorError::internal(format!("could not remove firewall rules: {e}")))
        };
        tokio::time::timeout(self.config.kill_timeout, work)
            .await
            .map_err(|_| {
                SupervisorError::internal(format!("deadline exceeded killing stale {name}({pid})"))
            })?
    }

    async fn rollback_rules(&self, name: &str, exposes: &[Expose]) {
        if exposes.is_empty() {
            return;
        }
        let cancel = CancellationToken::new();
        if let Err(e) = self.firewall.remove_rules(name, &cancel).await {
            warn!("[Firewall] Could not roll back rules for {name}: {e}");
        }
    }

    /// Stream stdout and stderr of `name` until it exits.
    ///
    /// Only one caller per process gets the output; the pipes are consumed
    /// by the first wait.
    pub async fn wait(&self, name: &str) -> SupervisorResult<WaitStream> {
        let process = self
            .registry
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(format!("could not find process {name}")))?;

        let stdout = process.take_stdout().await;
        let stderr = process.take_stderr().await;
        if stdout.is_none() && stderr.is_none() {
            debug!("[Process] Output of {process} already consumed");
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let joined = tokio::try_join!(
                pump(stdout, &tx, WaitEvent::Stdout),
                pump(stderr, &tx, WaitEvent::Stderr),
                process.wait_exit(),
            );
            let last = match joined {
                Ok((_, _, ProcessExit { code })) => {
                    debug!("[Process] {process} exited with {code:?}");
                    Ok(WaitEvent::Exited(code))
                }
                Err(e) => {
                    warn!("[Process] Wait on {process} failed: {e}");
                    Err(e)
                }
            };
            let _ = tx.send(last).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Hold `name` alive while `pings` keeps producing names.
    ///
    /// Only the most recent non-blank name counts. When the stream ends, or
    /// stays quiet longer than the keep-alive timeout, that process is killed.
    pub async fn keep_alive<S>(&self, mut pings: S) -> SupervisorResult<()>
    where
        S: Stream<Item = String> + Unpin,
    {
        let mut last: Option<String> = None;
        loop {
            match tokio::time::timeout(self.config.keepalive_timeout, pings.next()).await {
                Ok(Some(name)) => {
                    let name = name.trim();
                    if !name.is_empty() {
                        last = Some(name.to_string());
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "[Process] No keep-alive for {} within {:?}",
                        last.as_deref().unwrap_or("<unnamed>"),
                        self.config.keepalive_timeout
                    );
                    break;
                }
            }
        }

        let name = last.ok_or_else(|| {
            SupervisorError::invalid_argument("keep-alive stream carried no process name")
        })?;
        debug!("[Process] Keep-alive for {name} ended");
        self.kill(&name, self.config.kill_timeout).await
    }

    /// Kill the process tree, forget `name` and remove its firewall rules.
    ///
    /// Killing an unknown name succeeds. Rule removal shares the deadline but
    /// only runs once the process is gone; its failure is logged, not
    /// returned.
    pub async fn kill(&self, name: &str, deadline: Duration) -> SupervisorResult<()> {
        let Some(process) = self.registry.get(name) else {
            debug!("[Process] Kill of unknown process {name} ignored");
            return Ok(());
        };

        let deadline = Instant::now() + deadline;
        match tokio::time::timeout_at(deadline, self.terminate(&process)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SupervisorError::internal(format!(
                    "deadline exceeded killing {process}"
                )));
            }
        }

        let cancel = CancellationToken::new();
        match tokio::time::timeout_at(deadline, self.firewall.remove_rules(name, &cancel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[Firewall] Could not remove rules for {name}: {e}"),
            Err(_) => warn!("[Firewall] Removing rules for {name} timed out"),
        }
        Ok(())
    }

    async fn terminate(&self, process: &Arc<ManagedProcess>) -> SupervisorResult<()> {
        if process.is_running() {
            self.host
                .kill_tree(process.pid())
                .await
                .map_err(|e| SupervisorError::internal(format!("could not kill {process}: {e}")))?;
        }
        process.wait_exit().await?;

        self.registry.delete_if_same(process.name(), process);
        info!("[Process] Killed process {process}");
        Ok(())
    }
}

async fn pump<R>(
    reader: Option<R>,
    tx: &mpsc::Sender<SupervisorResult<WaitEvent>>,
    wrap: fn(Vec<u8>) -> WaitEvent,
) -> SupervisorResult<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => {
                if tx.send(Ok(wrap(buf[..n].to_vec()))).await.is_err() {
                    return Err(SupervisorError::internal("wait stream receiver dropped"));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => {
                return Err(SupervisorError::internal(format!("could not read output: {e}")));
            }
        }
    }
}

/// Move `from` to `to`, replacing any existing `to`.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if from == to {
        return Ok(());
    }
    match tokio::fs::remove_file(to).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::rename(from, to).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{ShellError, ShellOutput, ShellRunner};
    use async_trait::async_trait;

    struct NoShell;

    #[async_trait]
    impl ShellRunner for NoShell {
        async fn execute(
            &self,
            _command: &str,
            _cancel: &CancellationToken,
        ) -> Result<ShellOutput, ShellError> {
            Ok(ShellOutput::default())
        }
    }

    struct EmptyHost;

    #[async_trait]
    impl ProcessTable for EmptyHost {
        async fn find_by_name(&self, _name: &str) -> io::Result<Option<u32>> {
            Ok(None)
        }

        async fn kill_tree(&self, _pid: u32) -> io::Result<()> {
            Ok(())
        }
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(
            Arc::new(ProcessRegistry::new()),
            FirewallManager::new(Arc::new(NoShell)),
            Arc::new(EmptyHost),
            SupervisorConfig::default(),
        )
    }

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("FOO=bar=baz").unwrap(),
            ("FOO".to_string(), "bar=baz".to_string())
        );
        assert_eq!(parse_env("EMPTY=").unwrap().1, "");
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=value").is_err());
    }

    #[test]
    fn test_renamed_path() {
        let sup = supervisor();
        assert_eq!(
            sup.renamed_path(Path::new("/opt/bin/echoserver.exe")).unwrap(),
            PathBuf::from("/opt/bin/hostagent-echoserver.exe")
        );
        assert_eq!(
            sup.renamed_path(Path::new("/opt/bin/hostagent-echoserver.exe"))
                .unwrap(),
            PathBuf::from("/opt/bin/hostagent-echoserver.exe")
        );
        assert!(sup.renamed_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_move_file_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        tokio::fs::write(&from, b"new").await.unwrap();
        tokio::fs::write(&to, b"old").await.unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_wait_unknown_is_not_found() {
        let err = supervisor().wait("nope").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_kill_unknown_is_noop() {
        supervisor()
            .kill("nope", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_without_name() {
        let err = supervisor()
            .keep_alive(futures::stream::iter(vec![" ".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_keep_alive_uses_last_name() {
        // Both names are unknown, so the kill is a no-op; the call must still
        // resolve with the last one rather than erroring.
        supervisor()
            .keep_alive(futures::stream::iter(vec![
                "first".to_string(),
                "second".to_string(),
            ]))
            .await
            .unwrap();
    }
}
