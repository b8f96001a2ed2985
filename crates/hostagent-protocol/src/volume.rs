//! Volume path pairs for `mount`.
//!
//! A client names a path as the container sees it and where on the host it
//! should appear: `CONTAINER_PATH:HOST_PATH`, or a single path used for both.
//! Windows drive letters make `:` ambiguous, so a one-character segment is
//! read as a drive letter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePath {
    /// Path inside the container.
    pub source: String,
    /// Host path the container's backing directory is linked to.
    pub destination: String,
}

impl VolumePath {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse path {0:?}")]
pub struct VolumePathError(pub String);

/// Parse `CONTAINER_PATH[:HOST_PATH]`, e.g.
/// `c:\var\run\secrets:c:\etc\kube-flannel\secrets`.
pub fn parse_volume_path(spec: &str) -> Result<VolumePath, VolumePathError> {
    let spec = spec.trim();
    if spec.is_empty() || spec.starts_with(':') || spec.ends_with(':') {
        return Err(VolumePathError(spec.to_string()));
    }

    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination) = match parts.as_slice() {
        // /path, c:/path
        [_] | [_, _] => (spec.to_string(), spec.to_string()),
        // c:/container:/host
        [drive, path, host] if drive.len() == 1 => (format!("{drive}:{path}"), host.to_string()),
        // /container:c:/host
        [container, drive, path] => (container.to_string(), format!("{drive}:{path}")),
        // c:/container:c:/host
        [c_drive, c_path, h_drive, h_path] => {
            (format!("{c_drive}:{c_path}"), format!("{h_drive}:{h_path}"))
        }
        _ => return Err(VolumePathError(spec.to_string())),
    };
    Ok(VolumePath::new(source, destination))
}

/// Parse a list of path specs, skipping blank entries.
pub fn parse_volume_paths<S: AsRef<str>>(specs: &[S]) -> Result<Vec<VolumePath>, VolumePathError> {
    specs
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.trim().is_empty())
        .map(parse_volume_path)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_path_maps_to_itself() {
        assert_eq!(
            parse_volume_path("/var/run/secrets").unwrap(),
            VolumePath::new("/var/run/secrets", "/var/run/secrets")
        );
        assert_eq!(
            parse_volume_path(r"c:\var\run\secrets").unwrap(),
            VolumePath::new(r"c:\var\run\secrets", r"c:\var\run\secrets")
        );
    }

    #[test]
    fn test_drive_letters_on_either_side() {
        assert_eq!(
            parse_volume_path(r"c:\var\run\secrets:c:\etc\flannel").unwrap(),
            VolumePath::new(r"c:\var\run\secrets", r"c:\etc\flannel")
        );
        assert_eq!(
            parse_volume_path(r"c:\var\run:\etc\flannel").unwrap(),
            VolumePath::new(r"c:\var\run", r"\etc\flannel")
        );
        assert_eq!(
            parse_volume_path(r"/var/run:c:\etc\flannel").unwrap(),
            VolumePath::new("/var/run", r"c:\etc\flannel")
        );
    }

    #[test]
    fn test_malformed_specs() {
        assert!(parse_volume_path(":/host").is_err());
        assert!(parse_volume_path("/container:").is_err());
        assert!(parse_volume_path("a:b:c:d:e").is_err());
        assert!(parse_volume_path("  ").is_err());
    }

    #[test]
    fn test_parse_list_skips_blank() {
        let paths = parse_volume_paths(&["/a", " ", "/b:c:/d"]).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1], VolumePath::new("/b", "c:/d"));
    }
}
