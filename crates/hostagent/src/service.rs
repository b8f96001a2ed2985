//! Request service in front of the supervisor.
//!
//! Validates request shape, enforces the process-path allow-list and turns a
//! panic in any handler into an `Unknown` error instead of taking the agent
//! down.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{FutureExt, Stream};
use hostagent_protocol::{
    KeepAliveRequest, KillRequest, MountRequest, StartRequest, VersionResponse, WaitRequest,
};
use log::{error, warn};
use tokio_util::sync::CancellationToken;

use crate::allowlist::ProcessPathAllowList;
use crate::error::{SupervisorError, SupervisorResult};
use crate::supervisor::{StartOptions, Supervisor, WaitStream};
use crate::volumes::VolumeMounter;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a handler, mapping a panic to [`SupervisorError::Unknown`].
pub async fn guarded<F, T>(method: &str, handler: F) -> SupervisorResult<T>
where
    F: Future<Output = SupervisorResult<T>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("[Service] {method} panicked: {message}");
            Err(SupervisorError::Unknown(message))
        }
    }
}

fn require(value: &str, field: &str) -> SupervisorResult<()> {
    if value.trim().is_empty() {
        return Err(SupervisorError::invalid_argument(format!("{field} is required")));
    }
    Ok(())
}

pub struct AgentService {
    supervisor: Arc<Supervisor>,
    volumes: VolumeMounter,
    allow_list: ProcessPathAllowList,
}

impl AgentService {
    pub fn new(
        supervisor: Arc<Supervisor>,
        volumes: VolumeMounter,
        allow_list: ProcessPathAllowList,
    ) -> Self {
        Self {
            supervisor,
            volumes,
            allow_list,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn start(
        &self,
        request: StartRequest,
        cancel: &CancellationToken,
    ) -> SupervisorResult<String> {
        guarded("start", async {
            if !self.allow_list.allows(&request.path) {
                warn!("[Service] Rejected start of {}: not allow-listed", request.path);
                return Err(SupervisorError::invalid_argument("invalid path"));
            }
            require(&request.path, "path")?;
            require(&request.checksum, "checksum")?;

            let dir = request.dir.trim();
            let options = StartOptions {
                path: PathBuf::from(request.path.trim()),
                checksum: request.checksum,
                args: request.args,
                envs: request.envs,
                dir: (!dir.is_empty()).then(|| PathBuf::from(dir)),
                exposes: request.exposes,
            };
            self.supervisor.start(options, cancel).await
        })
        .await
    }

    pub async fn wait(&self, request: WaitRequest) -> SupervisorResult<WaitStream> {
        guarded("wait", async {
            require(&request.process_name, "process_name")?;
            self.supervisor.wait(request.process_name.trim()).await
        })
        .await
    }

    /// Run a keep-alive session over a stream of pings.
    pub async fn keep_alive<S>(&self, pings: S) -> SupervisorResult<()>
    where
        S: Stream<Item = KeepAliveRequest> + Unpin,
    {
        use futures::StreamExt;
        guarded(
            "keep_alive",
            self.supervisor
                .keep_alive(pings.map(|ping| ping.process_name)),
        )
        .await
    }

    pub async fn kill(&self, request: KillRequest) -> SupervisorResult<String> {
        guarded("kill", async {
            require(&request.process_name, "process_name")?;
            let name = request.process_name.trim();
            self.supervisor
                .kill(name, self.supervisor.config().kill_timeout)
                .await?;
            Ok(name.to_string())
        })
        .await
    }

    /// Link container paths onto the host; returns the destinations linked.
    pub async fn mount(&self, request: MountRequest) -> SupervisorResult<Vec<String>> {
        guarded(
            "mount",
            self.volumes.mount(&request.selectors, &request.paths),
        )
        .await
    }

    pub fn version(&self) -> VersionResponse {
        VersionResponse {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            os_name: sysinfo::System::name(),
            os_version: sysinfo::System::long_os_version(),
            kernel_version: sysinfo::System::kernel_version(),
        }
    }
}
