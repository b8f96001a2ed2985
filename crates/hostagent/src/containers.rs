//! Container lookup for volume mounts.
//!
//! A container is identified by its labels. Only its mount table is needed:
//! which host directory backs each path the container sees.

use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

/// Result type for container lookups.
pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("no container matches {0}")]
    NotFound(String),

    #[error("more than one container matches {0}")]
    MultipleFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    #[error("selector {0:?} is not KEY=VALUE")]
    InvalidSelector(String),

    /// None of the configured CLIs is installed.
    #[error("no container runtime available ({0})")]
    NoRuntimeAvailable(String),
}

/// One mount of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub read_only: bool,
    pub host_path: String,
    pub container_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub mounts: Vec<MountPoint>,
}

/// Parse `KEY=VALUE` selectors into a label filter.
pub fn parse_selectors<S: AsRef<str>>(selectors: &[S]) -> ContainerResult<BTreeMap<String, String>> {
    selectors
        .iter()
        .map(|s| {
            let s = s.as_ref();
            match s.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.trim().to_string()))
                }
                _ => Err(ContainerError::InvalidSelector(s.to_string())),
            }
        })
        .collect()
}

fn describe(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Finds the single running container carrying a set of labels.
#[async_trait]
pub trait ContainerLookup: Send + Sync {
    async fn find(&self, labels: &BTreeMap<String, String>) -> ContainerResult<Container>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

/// Parse the output of `inspect --format '{{json .Mounts}}'`.
pub fn parse_mounts(json: &str) -> ContainerResult<Vec<MountPoint>> {
    let json = json.trim();
    if json.is_empty() || json == "null" {
        return Ok(Vec::new());
    }
    let mounts: Vec<InspectMount> =
        serde_json::from_str(json).map_err(|e| ContainerError::ParseError(e.to_string()))?;
    Ok(mounts
        .into_iter()
        .map(|m| MountPoint {
            read_only: !m.rw,
            host_path: m.source,
            container_path: m.destination,
        })
        .collect())
}

/// Container lookup through a docker-compatible CLI.
///
/// Candidates are tried in order; a CLI that is not installed is skipped.
#[derive(Debug, Clone)]
pub struct CliContainerLookup {
    candidates: Vec<String>,
}

impl Default for CliContainerLookup {
    fn default() -> Self {
        Self::new(vec!["docker".to_string(), "nerdctl".to_string()])
    }
}

impl CliContainerLookup {
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }

    async fn run(&self, binary: &str, command: &str, args: &[String]) -> io::Result<ContainerResult<String>> {
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }));
        }
        Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    async fn find_with(
        &self,
        binary: &str,
        labels: &BTreeMap<String, String>,
    ) -> io::Result<ContainerResult<Container>> {
        let mut args = vec!["ps".to_string(), "-q".to_string(), "--no-trunc".to_string()];
        for (key, value) in labels {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }
        let ids = match self.run(binary, "ps", &args).await? {
            Ok(stdout) => stdout,
            Err(e) => return Ok(Err(e)),
        };
        let ids: Vec<&str> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let id = match ids.as_slice() {
            [] => return Ok(Err(ContainerError::NotFound(describe(labels)))),
            [id] => id.to_string(),
            _ => return Ok(Err(ContainerError::MultipleFound(describe(labels)))),
        };

        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .Mounts}}".to_string(),
            id.clone(),
        ];
        let mounts = match self.run(binary, "inspect", &args).await? {
            Ok(stdout) => parse_mounts(&stdout),
            Err(e) => Err(e),
        };
        Ok(mounts.map(|mounts| Container { id, mounts }))
    }
}

#[async_trait]
impl ContainerLookup for CliContainerLookup {
    async fn find(&self, labels: &BTreeMap<String, String>) -> ContainerResult<Container> {
        for binary in &self.candidates {
            match self.find_with(binary, labels).await {
                Ok(result) => return result,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{binary} not found, trying next container runtime");
                }
                Err(e) => {
                    return Err(ContainerError::CommandFailed {
                        command: binary.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Err(ContainerError::NoRuntimeAvailable(self.candidates.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selectors() {
        let labels = parse_selectors(&["app=flannel", "tier = node"]).unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("flannel"));
        assert_eq!(labels.get("tier").map(String::as_str), Some("node"));
        assert!(parse_selectors(&["novalue"]).is_err());
        assert!(parse_selectors(&["=x"]).is_err());
    }

    #[test]
    fn test_parse_mounts() {
        let json = r#"[{"Type":"bind","Source":"/var/lib/kubelet/pods/1/volumes/token","Destination":"/var/run/secrets","Mode":"","RW":false,"Propagation":"rprivate"},
                      {"Type":"bind","Source":"/data","Destination":"/srv","RW":true}]"#;
        let mounts = parse_mounts(json).unwrap();
        assert_eq!(mounts.len(), 2);
        assert!(mounts[0].read_only);
        assert_eq!(mounts[0].container_path, "/var/run/secrets");
        assert_eq!(mounts[1].host_path, "/data");
        assert!(!mounts[1].read_only);

        assert!(parse_mounts("null\n").unwrap().is_empty());
        assert!(parse_mounts("{oops").is_err());
    }

    #[cfg(unix)]
    fn fake_cli(dir: &std::path::Path, name: &str, ps_output: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  ps) printf '{ps_output}' ;;\n  inspect) printf \
             '[{{\"Source\":\"/host/%s\",\"Destination\":\"/in\",\"RW\":true}}]' \"$4\" ;;\nesac\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_lookup_single_container() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "onectl", "abc123\\n");
        let lookup = CliContainerLookup::new(vec!["hostagent-missing-cli".to_string(), cli]);

        let labels = parse_selectors(&["app=flannel"]).unwrap();
        let container = lookup.find(&labels).await.unwrap();
        assert_eq!(container.id, "abc123");
        assert_eq!(
            container.mounts,
            vec![MountPoint {
                read_only: false,
                host_path: "/host/abc123".to_string(),
                container_path: "/in".to_string(),
            }]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_lookup_requires_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let labels = parse_selectors(&["app=flannel"]).unwrap();

        let none = CliContainerLookup::new(vec![fake_cli(dir.path(), "nonectl", "")]);
        assert!(matches!(
            none.find(&labels).await,
            Err(ContainerError::NotFound(_))
        ));

        let many = CliContainerLookup::new(vec![fake_cli(dir.path(), "manyctl", "a\\nb\\n")]);
        assert!(matches!(
            many.find(&labels).await,
            Err(ContainerError::MultipleFound(_))
        ));
    }

    #[tokio::test]
    async fn test_no_runtime_installed() {
        let lookup = CliContainerLookup::new(vec!["hostagent-missing-cli".to_string()]);
        let err = lookup.find(&BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ContainerError::NoRuntimeAvailable(_)));
    }
}
