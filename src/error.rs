//! Error taxonomy for plan building, dispatch, and storage.
//!
//! Per-file failures are isolated and reported; plan-building and
//! store-availability failures are fatal. [`IndexerError::exit_code`] maps
//! the fatal classes onto the process exit status used by `fidx`.

use std::fmt;

use thiserror::Error;

/// One plugin whose declared requirements could not be placed in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiedPlugin {
    /// Fully-qualified identity of the plugin.
    pub plugin: String,
    /// Requirement names that matched no earlier plugin.
    pub missing: Vec<String>,
}

/// The execution plan could not be built (missing or circular requirements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyError {
    pub unsatisfied: Vec<UnsatisfiedPlugin>,
}

impl DependencyError {
    /// Returns `true` if `plugin` is named in this error.
    pub fn names(&self, plugin: &str) -> bool {
        self.unsatisfied.iter().any(|u| u.plugin == plugin)
    }
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "some handlers have missing dependencies:")?;
        for u in &self.unsatisfied {
            write!(f, "\n  - [{}] is missing [{}]", u.plugin, u.missing.join(", "))?;
        }
        write!(f, "\nplease edit your configuration")
    }
}

impl std::error::Error for DependencyError {}

/// Errors surfaced by the indexing core.
#[derive(Debug, Clone, Error)]
pub enum IndexerError {
    /// Plan could not be built.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Configuration is invalid (unknown handler, bad glob, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No filesystem backend is registered for a data source's scheme.
    #[error("no filesystem backend registered for scheme '{0}'")]
    UnknownScheme(String),

    /// Driver introspection failed. Never fatal: the run degrades to serial.
    #[error("capability probe failed: {0}")]
    CapabilityProbe(String),

    /// A data source could not be connected or listed.
    #[error("data source {source_path}: {message}")]
    Backend { source_path: String, message: String },

    /// A single (plugin, file) invocation failed.
    #[error("{plugin} failed on {path}: {message}")]
    WorkItem {
        plugin: String,
        path: String,
        message: String,
    },

    /// A uniqueness violation from an unlocked insert.
    #[error("uniqueness conflict on {table}: {message}")]
    UpsertConflict { table: String, message: String },

    /// The storage handle became unusable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Any other statement-level database failure.
    #[error("database error: {0}")]
    Database(String),
}

impl IndexerError {
    /// Fatal errors stop the run after in-flight work has drained.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexerError::StoreUnavailable(_))
    }

    /// Process exit status: 2 for configuration/plan failures, 3 for
    /// mid-run storage failures, 1 for anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            IndexerError::Dependency(_)
            | IndexerError::Config(_)
            | IndexerError::UnknownScheme(_) => 2,
            IndexerError::StoreUnavailable(_) => 3,
            _ => 1,
        }
    }
}

/// Finds the most specific [`IndexerError`] inside an `anyhow` chain, if any.
pub fn find_indexer_error(err: &anyhow::Error) -> Option<&IndexerError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<IndexerError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_error_lists_every_plugin() {
        let err = DependencyError {
            unsatisfied: vec![
                UnsatisfiedPlugin {
                    plugin: "a::A".to_string(),
                    missing: vec!["B".to_string()],
                },
                UnsatisfiedPlugin {
                    plugin: "c::C".to_string(),
                    missing: vec!["D".to_string(), "E".to_string()],
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("[a::A] is missing [B]"));
        assert!(text.contains("[c::C] is missing [D, E]"));
        assert!(err.names("c::C"));
        assert!(!err.names("B"));
    }

    #[test]
    fn exit_codes_distinguish_plan_and_store_failures() {
        let plan = IndexerError::Dependency(DependencyError {
            unsatisfied: vec![],
        });
        assert_eq!(plan.exit_code(), 2);
        assert_eq!(IndexerError::Config("x".into()).exit_code(), 2);
        assert_eq!(IndexerError::StoreUnavailable("x".into()).exit_code(), 3);
        assert_eq!(IndexerError::Database("x".into()).exit_code(), 1);
        assert!(IndexerError::StoreUnavailable("x".into()).is_fatal());
        assert!(!IndexerError::UpsertConflict {
            table: "t".into(),
            message: "m".into()
        }
        .is_fatal());
    }

    #[test]
    fn finds_error_through_context() {
        let err = anyhow::Error::new(IndexerError::StoreUnavailable("gone".into()))
            .context("while inserting file");
        assert!(matches!(
            find_indexer_error(&err),
            Some(IndexerError::StoreUnavailable(_))
        ));
    }
}
