//! Identifier newtypes for workflows, versions, runs and steps.

use serde::{Deserialize, Serialize};

macro_rules! generated_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Abbreviated form for log lines.
            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

generated_id!(
    /// Unique identifier for a workflow (the tenant-owned graph container)
    WorkflowId
);

generated_id!(
    /// Unique identifier for an immutable workflow graph version
    WorkflowVersionId
);

generated_id!(
    /// Unique identifier for a run (one execution of a version)
    RunId
);

/// Identifier of a graph node / run step. Authored in the graph
/// definition, so there is no `generate()` - step ids are human-chosen.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }

    #[test]
    fn short_form_truncates() {
        let id = RunId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");

        let tiny = RunId::new("ab");
        assert_eq!(tiny.short(), "ab");
    }

    #[test]
    fn display_round_trip() {
        let id = StepId::new("fetch_orders");
        assert_eq!(id.to_string(), "fetch_orders");
        assert_eq!(id.as_str(), "fetch_orders");
    }
}
