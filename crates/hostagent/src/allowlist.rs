//! Process-path allow-list applied ahead of Start.

use std::collections::HashSet;

/// Lexically clean a path for comparison: both separator styles unified to
/// `/`, `.` and empty segments dropped, `..` resolved, lower-cased.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let rooted = unified.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." && !(parts.len() == 1 && last.ends_with(':')) => {
                    parts.pop();
                }
                Some(last) if last.ends_with(':') => {}
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    let cleaned = if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    };
    cleaned.to_lowercase()
}

/// Binaries a client may start. An empty list allows everything.
#[derive(Debug, Clone, Default)]
pub struct ProcessPathAllowList {
    paths: HashSet<String>,
}

impl ProcessPathAllowList {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|p| normalize_path(p.as_ref()))
                .collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.paths.is_empty()
    }

    pub fn allows(&self, path: &str) -> bool {
        !self.is_enabled() || self.paths.contains(&normalize_path(path))
    }
}
