//! Scope paths identifying a task invocation's position in the call tree

use serde::{Deserialize, Serialize};

/// Dotted path of a task invocation inside a workflow, e.g. `main.fetch`
/// or `main.fan_out[2].upper`.
///
/// The root scope is the workflow name. Composition primitives derive
/// indexed child scopes so sibling events never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopePath(String);

impl ScopePath {
    pub fn root(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Child scope for a named task under this scope.
    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}.{}", self.0, name))
    }

    /// Indexed child scope for fan-out siblings (`parallel`, `map`).
    pub fn indexed(&self, name: &str, index: usize) -> Self {
        Self(format!("{}.{}[{}]", self.0, name, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `other` equals this scope or lives underneath it.
    pub fn contains(&self, other: &ScopePath) -> bool {
        other.0 == self.0 || other.0.starts_with(&format!("{}.", self.0))
    }
}

impl std::fmt::Display for ScopePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScopePath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ScopePath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_and_indexed() {
        let root = ScopePath::root("main");
        assert_eq!(root.child("fetch").as_str(), "main.fetch");
        assert_eq!(root.indexed("map", 2).as_str(), "main.map[2]");
    }

    #[test]
    fn test_contains() {
        let root = ScopePath::root("main");
        let child = root.child("fetch");
        let grandchild = child.child("retry");

        assert!(root.contains(&child));
        assert!(root.contains(&grandchild));
        assert!(child.contains(&grandchild));
        assert!(!child.contains(&root));
        // Prefix of a sibling name is not containment
        let sibling = ScopePath::from("main.fetcher");
        assert!(!child.contains(&sibling));
    }
}
