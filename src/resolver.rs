//! Dependency resolution: order plugins into steps.
//!
//! Plugins are layered iteratively. Each pass places every unplaced plugin
//! whose requirements are all satisfied by plugins placed in *any* earlier
//! step; the placed plugins form the next step. A pass that places nothing
//! while plugins remain fails with a [`DependencyError`] naming every
//! remaining plugin and its unmet requirements. Within a step, plugins keep
//! their input order.

use std::fmt;
use std::sync::Arc;

use crate::error::{DependencyError, UnsatisfiedPlugin};
use crate::traits::{name_matches, HandlerPlugin};

/// Plugins that may run in any order relative to each other.
pub type Step = Vec<Arc<dyn HandlerPlugin>>;

/// Steps in execution order.
#[derive(Clone, Default)]
pub struct ExecutionPlan {
    steps: Vec<Step>,
}

impl ExecutionPlan {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Every plugin, flattened in execution order.
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn HandlerPlugin>> {
        self.steps.iter().flatten()
    }

    /// Distinct database schemas, in first-use order.
    pub fn schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> = Vec::new();
        for plugin in self.plugins() {
            let schema = plugin.database_schema();
            if !schemas.iter().any(|s| s == schema) {
                schemas.push(schema.to_string());
            }
        }
        schemas
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Plugin names per step, for logging and assertions.
    pub fn names(&self) -> Vec<Vec<String>> {
        self.steps
            .iter()
            .map(|step| step.iter().map(|p| p.name().to_string()).collect())
            .collect()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            let names: Vec<&str> = step.iter().map(|p| p.name()).collect();
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "step {}: {}", i + 1, names.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("steps", &self.names())
            .finish()
    }
}

/// Order `plugins` into steps so that every plugin runs after all of its
/// requirements.
pub fn build_plan(plugins: Vec<Arc<dyn HandlerPlugin>>) -> Result<ExecutionPlan, DependencyError> {
    let mut unplaced = plugins;
    let mut placed_names: Vec<String> = Vec::new();
    let mut steps: Vec<Step> = Vec::new();

    while !unplaced.is_empty() {
        let (ready, waiting): (Vec<_>, Vec<_>) = unplaced
            .into_iter()
            .partition(|p| missing_requirements(p.as_ref(), &placed_names).is_empty());

        if ready.is_empty() {
            let unsatisfied = waiting
                .iter()
                .map(|p| UnsatisfiedPlugin {
                    plugin: p.name().to_string(),
                    missing: missing_requirements(p.as_ref(), &placed_names),
                })
                .collect();
            return Err(DependencyError { unsatisfied });
        }

        placed_names.extend(ready.iter().map(|p| p.name().to_string()));
        steps.push(ready);
        unplaced = waiting;
    }

    let plan = ExecutionPlan { steps };
    tracing::info!("execution plan:\n{}", plan);
    Ok(plan)
}

fn missing_requirements(plugin: &dyn HandlerPlugin, placed: &[String]) -> Vec<String> {
    plugin
        .required_plugins()
        .into_iter()
        .filter(|wanted| !placed.iter().any(|name| name_matches(name, wanted)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::FileDescriptor;
    use crate::schema::SchemaBuilder;
    use crate::store::Store;
    use async_trait::async_trait;

    struct Stub {
        name: &'static str,
        requires: Vec<&'static str>,
    }

    fn stub(name: &'static str, requires: &[&'static str]) -> Arc<dyn HandlerPlugin> {
        Arc::new(Stub {
            name,
            requires: requires.to_vec(),
        })
    }

    #[async_trait]
    impl HandlerPlugin for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn handled_mime_patterns(&self) -> Vec<String> {
            vec!["*".to_string()]
        }
        fn required_plugins(&self) -> Vec<String> {
            self.requires.iter().map(|s| s.to_string()).collect()
        }
        fn database_schema(&self) -> &str {
            "stub"
        }
        fn define_tables(&self, _schema: &mut SchemaBuilder) {}
        async fn handle(&self, _: &FileDescriptor, _: &Store, _: &Config) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn core_audio_document_layers_into_two_steps() {
        let plan = build_plan(vec![
            stub("x::handlers::CoreHandler", &[]),
            stub("x::handlers::AudioHandler", &["CoreHandler"]),
            stub("x::handlers::DocumentHandler", &["x::handlers::CoreHandler"]),
        ])
        .unwrap();
        assert_eq!(
            plan.names(),
            vec![
                vec!["x::handlers::CoreHandler"],
                vec!["x::handlers::AudioHandler", "x::handlers::DocumentHandler"],
            ]
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.plugins().count(), 3);
    }

    #[test]
    fn missing_requirement_names_the_plugin() {
        let err = build_plan(vec![stub("A", &["B"])]).err().unwrap();
        assert_eq!(
            err.unsatisfied,
            vec![UnsatisfiedPlugin {
                plugin: "A".to_string(),
                missing: vec!["B".to_string()],
            }]
        );
    }

    #[test]
    fn every_blocked_plugin_is_reported() {
        let err = build_plan(vec![
            stub("Core", &[]),
            stub("A", &["Core", "Gone"]),
            stub("B", &["A"]),
            stub("C", &["D"]),
            stub("D", &["C"]),
        ])
        .err()
        .unwrap();
        assert!(err.names("A") && err.names("B") && err.names("C") && err.names("D"));
        assert!(!err.names("Core"));
        let a = err.unsatisfied.iter().find(|u| u.plugin == "A").unwrap();
        assert_eq!(a.missing, vec!["Gone".to_string()]);
    }

    #[test]
    fn requirements_see_all_earlier_steps() {
        // C needs A (step 1) and B (step 2).
        let plan = build_plan(vec![
            stub("C", &["A", "B"]),
            stub("B", &["A"]),
            stub("A", &[]),
        ])
        .unwrap();
        assert_eq!(
            plan.names(),
            vec![vec!["A"], vec!["B"], vec!["C"]]
        );
    }

    #[test]
    fn step_order_follows_input_order() {
        let plan = build_plan(vec![
            stub("z::Z", &[]),
            stub("a::A", &[]),
            stub("m::M", &["Z"]),
        ])
        .unwrap();
        assert_eq!(plan.names(), vec![vec!["z::Z", "a::A"], vec!["m::M"]]);
    }

    #[test]
    fn suffix_must_cover_whole_segments() {
        let err = build_plan(vec![stub("x::CoreHandler", &[]), stub("A", &["reHandler"])])
            .err()
            .unwrap();
        assert!(err.names("A"));
    }

    #[test]
    fn empty_input_is_an_empty_plan() {
        let plan = build_plan(Vec::new()).unwrap();
        assert!(plan.is_empty());
        assert!(plan.schemas().is_empty());
    }

    #[test]
    fn display_lists_steps() {
        let plan = build_plan(vec![stub("A", &[]), stub("B", &["A"])]).unwrap();
        assert_eq!(plan.to_string(), "step 1: A\nstep 2: B");
        assert_eq!(plan.schemas(), vec!["stub".to_string()]);
    }
}
