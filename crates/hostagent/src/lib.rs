//! Host agent library.
//!
//! Runs host binaries on behalf of containers, tracks them by name, streams
//! their output back, and tears them down together with the firewall rules
//! opened for them. Also links container volume paths onto the host.

pub mod allowlist;
pub mod checksum;
pub mod client;
pub mod config;
pub mod containers;
pub mod error;
pub mod firewall;
pub mod logging;
pub mod process_table;
pub mod registry;
pub mod server;
pub mod service;
pub mod shell;
pub mod supervisor;
pub mod transport;
pub mod volumes;

pub use error::{SupervisorError, SupervisorResult};
pub use registry::{ManagedProcess, ProcessRegistry};
pub use supervisor::{StartOptions, Supervisor, SupervisorConfig, WaitEvent};

use std::sync::Arc;

use crate::containers::ContainerLookup;
use crate::firewall::FirewallManager;
use crate::process_table::ProcessTable;
use crate::service::AgentService;
use crate::shell::ShellRunner;
use crate::volumes::VolumeMounter;

/// Wire up a service from its host facilities.
pub fn build_service(
    shell: Arc<dyn ShellRunner>,
    host: Arc<dyn ProcessTable>,
    containers: Arc<dyn ContainerLookup>,
    supervisor_config: SupervisorConfig,
    allow_list: allowlist::ProcessPathAllowList,
) -> Arc<AgentService> {
    let supervisor = Supervisor::new(
        Arc::new(ProcessRegistry::new()),
        FirewallManager::new(shell),
        host,
        supervisor_config,
    );
    Arc::new(AgentService::new(
        Arc::new(supervisor),
        VolumeMounter::new(containers),
        allow_list,
    ))
}
