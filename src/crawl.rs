//! Application wiring: configuration → plan → store → dispatch.
//!
//! ```text
//! Config ──▶ PluginRegistry::load ──▶ build_plan ──▶ Store::open(schemas)
//!                                                        │
//!                                   schema::initialize ◀─┘
//!                                          │
//!                                          ▼
//!                              Dispatcher::dispatch ──▶ RunReport
//! ```
//!
//! Each function prints a short summary on stdout; errors are returned as
//! [`IndexerError`] so the binary can map them to exit codes.

use std::sync::Arc;

use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::dispatch::{Dispatcher, RunReport, StopHandle};
use crate::error::{find_indexer_error, IndexerError};
use crate::progress::CrawlProgressReporter;
use crate::resolver::{build_plan, ExecutionPlan};
use crate::schema;
use crate::store::Store;
use crate::traits::PluginRegistry;

/// Load the configured handlers and order them.
pub fn plan(config: &Config, registry: &PluginRegistry) -> Result<ExecutionPlan, IndexerError> {
    let plugins = registry.load(config)?;
    Ok(build_plan(plugins)?)
}

async fn open_store(config: &Config, plan: &ExecutionPlan) -> Result<Store, IndexerError> {
    let store = Store::open(config, &plan.schemas())
        .await
        .map_err(|e| startup_error(&e))?;
    schema::initialize(&store, plan)
        .await
        .map_err(|e| startup_error(&e))?;
    Ok(store)
}

/// A store that cannot be opened or initialized before dispatch is a setup
/// failure, never a mid-run storage failure.
fn startup_error(err: &anyhow::Error) -> IndexerError {
    match find_indexer_error(err) {
        Some(known @ (IndexerError::Dependency(_) | IndexerError::Config(_))) => known.clone(),
        _ => IndexerError::Config(format!("cannot open the index store: {:#}", err)),
    }
}

/// Create the database files and every handler's tables.
pub async fn run_init(config: &Config, registry: &PluginRegistry) -> Result<(), IndexerError> {
    let plan = plan(config, registry)?;
    let store = open_store(config, &plan).await?;
    store.close().await;

    println!("initialized {}", config.db.dir.display());
    for name in plan.schemas() {
        println!("  schema: {}", name);
    }
    Ok(())
}

/// Print the execution plan without touching the store.
pub fn show_plan(config: &Config, registry: &PluginRegistry) -> Result<(), IndexerError> {
    let plan = plan(config, registry)?;
    println!("{}", plan);
    Ok(())
}

/// Crawl every configured data source once.
///
/// `stop` may be triggered at any time, including before the run starts.
/// Per-item failures are part of the returned report; only configuration,
/// plan and fatal storage failures are `Err`.
pub async fn run_crawl(
    config: Arc<Config>,
    registry: &PluginRegistry,
    stop: StopHandle,
    progress: Arc<dyn CrawlProgressReporter>,
) -> Result<RunReport, IndexerError> {
    let plan = plan(&config, registry)?;
    let store = open_store(&config, &plan).await?;

    let dispatcher = Dispatcher::new(Arc::clone(&config), store.clone(), BackendRegistry::with_builtins())
        .with_progress(progress)
        .with_stop_handle(stop);

    let result = dispatcher.dispatch(&plan).await;
    store.close().await;
    let report = result?;

    print_summary(&report);
    Ok(report)
}

fn print_summary(report: &RunReport) {
    println!("crawl");
    println!("  data sources: {}", report.sources);
    println!("  work items: {}", report.submitted);
    println!("  succeeded: {}", report.succeeded);
    if report.stopped {
        println!("  stopped early");
    }
    if report.failures.is_empty() {
        println!("complete");
    } else {
        for failure in &report.failures {
            println!("  failed: {}", failure.error);
        }
        println!("partial success: {} failures", report.failed());
    }
}
