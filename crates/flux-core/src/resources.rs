//! Resource requests and worker capabilities

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// What a workflow asks of the worker that runs it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub packages: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// What a worker advertises at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub cpu: f64,
    pub memory_bytes: u64,

    #[serde(default)]
    pub packages: BTreeSet<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    pub max_concurrent: u32,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_bytes: 1024 * 1024 * 1024,
            packages: BTreeSet::new(),
            tags: BTreeSet::new(),
            max_concurrent: 10,
        }
    }
}

impl WorkerCapabilities {
    /// The matching rule: available cpu/memory cover the request, installed
    /// packages and tags are supersets of the requested sets.
    pub fn satisfies(&self, request: &ResourceRequest) -> bool {
        if let Some(cpu) = request.cpu {
            if self.cpu < cpu {
                return false;
            }
        }
        if let Some(memory) = request.memory_bytes {
            if self.memory_bytes < memory {
                return false;
            }
        }
        request.packages.is_subset(&self.packages) && request.tags.is_subset(&self.tags)
    }

    /// Remaining capacity after subtracting an in-flight request.
    pub fn minus(&self, request: &ResourceRequest) -> WorkerCapabilities {
        WorkerCapabilities {
            cpu: (self.cpu - request.cpu.unwrap_or(0.0)).max(0.0),
            memory_bytes: self
                .memory_bytes
                .saturating_sub(request.memory_bytes.unwrap_or(0)),
            packages: self.packages.clone(),
            tags: self.tags.clone(),
            max_concurrent: self.max_concurrent,
        }
    }

    /// Scalar used to rank eligible workers (best fit = most free).
    pub fn free_score(&self) -> f64 {
        self.cpu + self.memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(cpu: f64, packages: &[&str]) -> WorkerCapabilities {
        WorkerCapabilities {
            cpu,
            packages: packages.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_matching_rule() {
        let w1 = caps(4.0, &["a"]);
        let w2 = caps(2.0, &["a", "b"]);

        let e1 = ResourceRequest::new().with_cpu(3.0).with_packages(["a"]);
        let e2 = ResourceRequest::new().with_cpu(1.0).with_packages(["b"]);

        assert!(w1.satisfies(&e1));
        assert!(!w2.satisfies(&e1));
        assert!(!w1.satisfies(&e2));
        assert!(w2.satisfies(&e2));
    }

    #[test]
    fn test_tag_subset() {
        let mut w = caps(8.0, &[]);
        w.tags = ["gpu".to_string(), "eu".to_string()].into();

        assert!(w.satisfies(&ResourceRequest::new().with_tags(["gpu"])));
        assert!(!w.satisfies(&ResourceRequest::new().with_tags(["gpu", "us"])));
    }

    #[test]
    fn test_minus_saturates() {
        let w = caps(2.0, &[]);
        let after = w.minus(&ResourceRequest::new().with_cpu(3.0));
        assert_eq!(after.cpu, 0.0);
    }
}
