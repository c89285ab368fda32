//! Registry layout resolver.
//!
//! The registry root is configurable per deployment. The layout is a pure,
//! stateless translator from the root to the concrete paths the registrar
//! writes and the watcher observes. No hard-coded paths appear in runtime code.

use crate::backend::is_direct_child;
use crate::error::{CoordinationError, CoordinationResult};

/// Directory under the registry root that holds one key per instance.
pub const NODES_DIR: &str = "nodes";

/// Default registry root used by tests and examples.
pub const DEFAULT_REGISTRY_ROOT: &str = "/macondo";

/// Maps a registry root to concrete key paths.
///
/// ```text
/// /macondo                  registry root
/// /macondo/nodes            nodes_dir()
/// /macondo/nodes/0000000001 one ephemeral-sequential key per instance
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLayout {
    root: String,
    nodes_dir: String,
}

impl RegistryLayout {
    /// Create a layout, validating the root.
    ///
    /// The root must be absolute, must not end in `/`, and must not contain
    /// empty segments.
    pub fn new(root: impl Into<String>) -> CoordinationResult<Self> {
        let root = root.into();
        let trimmed = root.trim();
        if trimmed.is_empty() {
            return Err(CoordinationError::Config("registry_root is empty".into()));
        }
        if !trimmed.starts_with('/') {
            return Err(CoordinationError::Config(format!(
                "registry_root must be an absolute path: {trimmed}"
            )));
        }
        if trimmed.len() > 1 && trimmed.ends_with('/') {
            return Err(CoordinationError::Config(format!(
                "registry_root must not end with '/': {trimmed}"
            )));
        }
        if trimmed.len() > 1 && trimmed[1..].split('/').any(str::is_empty) {
            return Err(CoordinationError::Config(format!(
                "registry_root contains an empty segment: {trimmed}"
            )));
        }
        let root = if trimmed == "/" {
            String::new()
        } else {
            trimmed.to_owned()
        };
        let nodes_dir = format!("{root}/{NODES_DIR}");
        Ok(Self { root, nodes_dir })
    }

    /// The registry root. Empty when the root is `/`.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The directory holding the instance keys.
    pub fn nodes_dir(&self) -> &str {
        &self.nodes_dir
    }

    /// Prefix passed to sequential creates; the service appends the sequence.
    pub fn node_prefix(&self) -> String {
        format!("{}/", self.nodes_dir)
    }

    /// Returns true if `path` is a direct child of the nodes directory.
    pub fn is_node(&self, path: &str) -> bool {
        is_direct_child(&self.nodes_dir, path)
    }
}

impl Default for RegistryLayout {
    fn default() -> Self {
        Self {
            root: DEFAULT_REGISTRY_ROOT.to_owned(),
            nodes_dir: format!("{DEFAULT_REGISTRY_ROOT}/{NODES_DIR}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = RegistryLayout::default();
        assert_eq!(layout.root(), "/macondo");
        assert_eq!(layout.nodes_dir(), "/macondo/nodes");
        assert_eq!(layout.node_prefix(), "/macondo/nodes/");
        assert_eq!(layout, RegistryLayout::new("/macondo").unwrap());
    }

    #[test]
    fn test_nested_root() {
        let layout = RegistryLayout::new("/apps/macondo/prod").unwrap();
        assert_eq!(layout.nodes_dir(), "/apps/macondo/prod/nodes");
    }

    #[test]
    fn test_slash_root() {
        let layout = RegistryLayout::new("/").unwrap();
        assert_eq!(layout.root(), "");
        assert_eq!(layout.nodes_dir(), "/nodes");
    }

    #[test]
    fn test_invalid_roots_rejected() {
        for root in ["", "   ", "macondo", "/macondo/", "/a//b"] {
            let err = RegistryLayout::new(root).unwrap_err();
            assert!(
                matches!(err, CoordinationError::Config(_)),
                "root '{root}' should be rejected"
            );
        }
    }

    #[test]
    fn test_is_node() {
        let layout = RegistryLayout::default();
        assert!(layout.is_node("/macondo/nodes/0000000001"));
        assert!(!layout.is_node("/macondo/nodes"));
        assert!(!layout.is_node("/macondo/nodes/"));
        assert!(!layout.is_node("/macondo/nodes/a/b"));
        assert!(!layout.is_node("/macondo/nodesx/1"));
        assert!(!layout.is_node("/other/nodes/1"));
    }
}
