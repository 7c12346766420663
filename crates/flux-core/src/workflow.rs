//! Workflow definition identity and the declared resource/secret needs
//! used by the dispatcher's resource-fit matching.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

/// `{cpu_cores?, memory?, gpu?, packages?}` declared by a workflow
/// definition; the dispatcher matches this against a worker's reported
/// resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ResourceRequirements {
    pub cpu_cores: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub gpu: Option<String>,
    pub packages: BTreeSet<String>,
}

impl ResourceRequirements {
    /// `true` if `offered` is a superset of these requirements: enough
    /// cpu/memory, a matching gpu if one is required, and every
    /// declared package present.
    pub fn satisfied_by(&self, offered: &WorkerResources) -> bool {
        if let Some(needed) = self.cpu_cores {
            if offered.cpu_count < needed {
                return false;
            }
        }
        if let Some(needed) = self.memory_bytes {
            if offered.memory_bytes < needed {
                return false;
            }
        }
        if let Some(needed) = &self.gpu {
            match &offered.gpu_descriptors {
                Some(descs) if descs.iter().any(|d| d == needed) => {}
                _ => return false,
            }
        }
        self.packages.is_subset(&offered.package_set)
    }
}

/// Resources a worker reports on registration (spec.md §4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct WorkerResources {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub gpu_descriptors: Option<Vec<String>>,
    pub package_set: BTreeSet<String>,
}

/// Where a task/workflow's output is materialized.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputStorageKind {
    #[default]
    Inline,
    ExternalByRef,
}

/// Identity `(name, version)` plus the declared metadata a workflow
/// definition carries; immutable after registration, versions are
/// append-only (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: u32,
    pub secret_requests: BTreeSet<String>,
    pub resource_requirements: ResourceRequirements,
    pub output_storage_kind: OutputStorageKind,
}

/// `{kind, message, details}` — the wire shape for a workflow-level
/// failure, distinct from [`crate::event::WireError`] only in that it is
/// the type workflow bodies construct and return, not the event payload
/// shape (the runtime converts between the two at the journal
/// boundary).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    pub kind: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl WorkflowError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_requirements_superset_match() {
        let req = ResourceRequirements {
            cpu_cores: Some(2),
            memory_bytes: Some(1024),
            gpu: None,
            packages: ["numpy".to_string()].into_iter().collect(),
        };
        let offered = WorkerResources {
            cpu_count: 4,
            memory_bytes: 4096,
            gpu_descriptors: None,
            package_set: ["numpy".to_string(), "pandas".to_string()].into_iter().collect(),
        };
        assert!(req.satisfied_by(&offered));
    }

    #[test]
    fn resource_requirements_rejects_missing_package() {
        let req = ResourceRequirements {
            packages: ["torch".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let offered = WorkerResources::default();
        assert!(!req.satisfied_by(&offered));
    }
}
