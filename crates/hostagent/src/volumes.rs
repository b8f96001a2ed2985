//! Host-side volume mounts.
//!
//! A container sees `c:\var\run\secrets`; the runtime backs it with some
//! kubelet directory on the host. Mounting links that backing directory to a
//! host path the client chooses, so host processes see the same files.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use hostagent_protocol::VolumePath;
use log::{debug, info};

use crate::allowlist::normalize_path;
use crate::containers::{ContainerLookup, parse_selectors};
use crate::error::{SupervisorError, SupervisorResult};

#[derive(Clone)]
pub struct VolumeMounter {
    containers: Arc<dyn ContainerLookup>,
}

impl VolumeMounter {
    pub fn new(containers: Arc<dyn ContainerLookup>) -> Self {
        Self { containers }
    }

    /// Link every requested container path onto its host destination and
    /// return the destinations linked.
    ///
    /// Paths the container does not mount, or whose backing path is missing
    /// on the host, are skipped.
    pub async fn mount(
        &self,
        selectors: &[String],
        paths: &[VolumePath],
    ) -> SupervisorResult<Vec<String>> {
        if selectors.iter().all(|s| s.trim().is_empty()) {
            return Err(SupervisorError::invalid_argument(
                "selectors are required to identify the container",
            ));
        }
        let labels = parse_selectors(selectors)
            .map_err(|e| SupervisorError::invalid_argument(e.to_string()))?;
        let container = self.containers.find(&labels).await.map_err(|e| {
            SupervisorError::invalid_argument(format!(
                "could not find container with {}: {e}",
                selectors.join(",")
            ))
        })?;

        let host_paths: HashMap<String, String> = container
            .mounts
            .into_iter()
            .map(|m| (normalize_path(&m.container_path), m.host_path))
            .collect();

        let mut mounted = Vec::new();
        for path in paths {
            let Some(source) = host_paths.get(&normalize_path(&path.source)) else {
                debug!("[Volume] {} is not mounted into the container", path.source);
                continue;
            };
            if tokio::fs::symlink_metadata(source).await.is_err() {
                debug!("[Volume] Backing path {source} of {} is missing", path.source);
                continue;
            }

            let destination = Path::new(path.destination.trim());
            link(Path::new(source), destination).await.map_err(|e| {
                SupervisorError::internal(format!(
                    "could not mount {} to {}: {e}",
                    path.source,
                    destination.display()
                ))
            })?;
            info!("[Volume] Mounted {} to {}", path.source, destination.display());
            mounted.push(destination.display().to_string());
        }
        Ok(mounted)
    }
}

/// Replace whatever is at `destination` with a symlink to `source`.
async fn link(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    remove_all(destination).await?;
    symlink(source, destination).await
}

/// Remove a file, link or directory tree. A missing path is not an error.
async fn remove_all(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        match tokio::fs::remove_file(path).await {
            // Directory symlinks on Windows are removed as directories.
            Err(_) if cfg!(windows) => tokio::fs::remove_dir(path).await,
            other => other,
        }
    }
}

#[cfg(unix)]
async fn symlink(source: &Path, destination: &Path) -> io::Result<()> {
    tokio::fs::symlink(source, destination).await
}

#[cfg(windows)]
async fn symlink(source: &Path, destination: &Path) -> io::Result<()> {
    if tokio::fs::metadata(source).await?.is_dir() {
        tokio::fs::symlink_dir(source, destination).await
    } else {
        tokio::fs::symlink_file(source, destination).await
    }
}

