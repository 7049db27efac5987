//! The dispatch engine.
//!
//! A single control loop walks data sources, plan steps, plugins and files,
//! in that order, and submits one work item per matching `(plugin, file)`
//! pair. When the store supports parallel connections, work items run on a
//! bounded [`JoinSet`]; otherwise they run inline on the control loop. After
//! every `(source, step, plugin)` combination the loop waits for all of its
//! work items to finish before moving on, because later plugins read what
//! earlier ones wrote.
//!
//! ```text
//! for source in data_sources            ← stop check
//!   connect, wrap in FileEnumerationCache
//!   for step in plan                    ← stop check
//!     for plugin in step                ← stop check
//!       for file in cache               ← stop check
//!         mime glob + can_handle → submit
//!       barrier: drain the join set
//! ```
//!
//! Per-item failures (handler errors, upsert conflicts, timeouts, panics) are
//! logged and recorded in the [`RunReport`]. A [`IndexerError::StoreUnavailable`]
//! stops submission; in-flight work drains and the first such error is
//! returned.

use futures::FutureExt;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::backend::BackendRegistry;
use crate::capability::supports_parallel_connections;
use crate::config::{Config, DataSourceConfig};
use crate::enumeration::FileEnumerationCache;
use crate::error::{find_indexer_error, IndexerError};
use crate::models::{FileDescriptor, ListOptions};
use crate::progress::{CrawlProgressEvent, CrawlProgressReporter, NoProgress};
use crate::resolver::ExecutionPlan;
use crate::store::{is_store_unavailable, Store};
use crate::traits::HandlerPlugin;

/// Lifecycle of a [`Dispatcher`].
///
/// `Idle → Running → Completed`, or `Running → Stopping → Stopped`, or
/// `Running → Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Stopping,
    Stopped,
    Failed,
}

/// Requests a cooperative stop of a running (or not yet started) dispatch.
///
/// Cheap to clone and safe to use from any task or thread, including a
/// signal handler.
#[derive(Clone)]
pub struct StopHandle {
    token: CancellationToken,
    state: Arc<Mutex<EngineState>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(EngineState::Idle)),
        }
    }

    /// Idempotent. No new work items are submitted once this returns;
    /// in-flight ones run to completion.
    pub fn request_stop(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("stop requested");
        }
        self.token.cancel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == EngineState::Running {
            *state = EngineState::Stopping;
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One failed work item, or a data source that could not be crawled.
#[derive(Debug, Clone)]
pub struct WorkItemFailure {
    pub source: String,
    /// Empty for data-source failures.
    pub plugin: String,
    /// `None` for data-source failures.
    pub path: Option<String>,
    pub error: IndexerError,
}

/// Outcome of a dispatch that did not fail fatally.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Data sources started.
    pub sources: usize,
    /// Work items submitted.
    pub submitted: u64,
    /// Work items that returned `Ok`.
    pub succeeded: u64,
    pub failures: Vec<WorkItemFailure>,
    /// Whether the run ended early on a stop request.
    pub stopped: bool,
}

impl RunReport {
    /// No failures and no early stop.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.stopped
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Drives handler plugins over every configured data source.
pub struct Dispatcher {
    config: Arc<Config>,
    store: Store,
    backends: BackendRegistry,
    progress: Arc<dyn CrawlProgressReporter>,
    stop: StopHandle,
}

struct CompiledPlugin {
    plugin: Arc<dyn HandlerPlugin>,
    mimes: GlobSet,
}

/// Result of one work item, tagged for reporting.
struct WorkOutcome {
    plugin: String,
    path: String,
    result: Result<(), IndexerError>,
}

#[derive(Default)]
struct RunState {
    report: RunReport,
    fatal: Option<IndexerError>,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, store: Store, backends: BackendRegistry) -> Self {
        Self {
            config,
            store,
            backends,
            progress: Arc::new(NoProgress),
            stop: StopHandle::new(),
        }
    }

    /// Use a stop handle created before the dispatcher, e.g. one already
    /// wired to a signal handler.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn CrawlProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> EngineState {
        *self.stop.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: EngineState) {
        *self.stop.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn stop_requested(&self) -> bool {
        self.stop.token.is_cancelled()
    }

    /// Configured worker count; a hand-built config with 0 still gets one.
    fn worker_limit(&self) -> usize {
        self.config.crawler.workers.max(1)
    }

    /// Run `plan` over every configured data source.
    ///
    /// Returns `Ok` when the run completes or stops early (see
    /// [`RunReport::stopped`]), with per-item failures in the report. Returns
    /// `Err` only for fatal failures, after in-flight work has drained.
    pub async fn dispatch(&self, plan: &ExecutionPlan) -> Result<RunReport, IndexerError> {
        let steps = compile_plan(plan)?;

        self.set_state(EngineState::Running);
        if self.stop_requested() {
            self.set_state(EngineState::Stopping);
        }

        let parallel = supports_parallel_connections(&self.store).await;
        if parallel {
            tracing::info!(workers = self.worker_limit(), "dispatching in parallel");
        } else {
            tracing::warn!("store does not support parallel connections, dispatching serially");
        }

        let mut run = RunState::default();
        let mut workers = JoinSet::new();

        for source in &self.config.data_sources {
            if self.stop_requested() {
                break;
            }
            run.report.sources += 1;
            self.crawl_source(source, &steps, parallel, &mut workers, &mut run)
                .await;
            if run.fatal.is_some() {
                break;
            }
        }

        if let Some(err) = run.fatal {
            self.set_state(EngineState::Failed);
            tracing::error!(error = %err, "dispatch failed");
            return Err(err);
        }

        run.report.stopped = self.stop_requested();
        self.set_state(if run.report.stopped {
            EngineState::Stopped
        } else {
            EngineState::Completed
        });
        Ok(run.report)
    }

    async fn crawl_source(
        &self,
        source: &DataSourceConfig,
        steps: &[Vec<CompiledPlugin>],
        parallel: bool,
        workers: &mut JoinSet<WorkOutcome>,
        run: &mut RunState,
    ) {
        let label = source.path.as_str();
        let submitted_before = run.report.submitted;
        let failed_before = run.report.failures.len();

        self.progress.report(CrawlProgressEvent::Connecting {
            source: label.to_string(),
        });

        let connection = match self
            .backends
            .resolve(source)
            .and_then(|(backend, uri)| {
                tracing::debug!(source = label, backend = backend.name(), "connecting");
                backend
                    .connect(&uri, source)
                    .map_err(|e| IndexerError::Backend {
                        source_path: label.to_string(),
                        message: format!("{:#}", e),
                    })
            }) {
            Ok(connection) => connection,
            Err(err) => {
                record_source_failure(run, label, err);
                return;
            }
        };

        let cache = Arc::new(FileEnumerationCache::new(
            connection,
            ListOptions {
                ignore_patterns: source.ignore_patterns.clone(),
                follow_symlinks: source.follow_symlinks,
            },
        ));

        'steps: for (index, step) in steps.iter().enumerate() {
            if self.stop_requested() {
                break;
            }
            for compiled in step {
                if self.stop_requested() {
                    break 'steps;
                }
                let plugin_name = compiled.plugin.name();
                self.progress.report(CrawlProgressEvent::Dispatching {
                    source: label.to_string(),
                    step: index + 1,
                    plugin: plugin_name.to_string(),
                });

                if let Err(message) = start_listing(&cache).await {
                    let err = IndexerError::Backend {
                        source_path: label.to_string(),
                        message,
                    };
                    record_source_failure(run, label, err);
                    break 'steps;
                }

                let mut index = 0;
                loop {
                    if self.stop_requested() || run.fatal.is_some() {
                        break;
                    }
                    let Some(file) = next_file(&cache, index).await else {
                        break;
                    };
                    index += 1;
                    if !compiled.mimes.is_match(file.mime()) || !compiled.plugin.can_handle(&file)
                    {
                        continue;
                    }
                    if parallel {
                        while workers.len() >= self.worker_limit() {
                            if let Some(joined) = workers.join_next().await {
                                self.record(joined, label, run);
                            }
                        }
                        // A slot may have freed up because of a stop or a fatal failure.
                        if self.stop_requested() || run.fatal.is_some() {
                            break;
                        }
                        run.report.submitted += 1;
                        workers.spawn(run_work_item(
                            Arc::clone(&compiled.plugin),
                            file,
                            self.store.clone(),
                            Arc::clone(&self.config),
                        ));
                    } else {
                        run.report.submitted += 1;
                        let outcome = run_work_item(
                            Arc::clone(&compiled.plugin),
                            file,
                            self.store.clone(),
                            Arc::clone(&self.config),
                        )
                        .await;
                        self.record(Ok(outcome), label, run);
                    }
                }

                self.drain(workers, label, run).await;
                tracing::debug!(source = label, step = index + 1, plugin = plugin_name, "barrier reached");

                if run.fatal.is_some() {
                    break 'steps;
                }
            }
        }

        let submitted = run.report.submitted - submitted_before;
        let failed = (run.report.failures.len() - failed_before) as u64;
        tracing::info!(source = label, submitted, failed, "data source done");
        self.progress.report(CrawlProgressEvent::Finished {
            source: label.to_string(),
            submitted,
            failed,
        });
    }

    /// Wait for every in-flight work item.
    async fn drain(&self, workers: &mut JoinSet<WorkOutcome>, source: &str, run: &mut RunState) {
        while let Some(joined) = workers.join_next().await {
            self.record(joined, source, run);
        }
    }

    fn record(&self, joined: Result<WorkOutcome, JoinError>, source: &str, run: &mut RunState) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => WorkOutcome {
                plugin: String::new(),
                path: String::new(),
                result: Err(IndexerError::WorkItem {
                    plugin: String::new(),
                    path: String::new(),
                    message: format!("worker task failed: {}", e),
                }),
            },
        };

        match outcome.result {
            Ok(()) => run.report.succeeded += 1,
            Err(err) => {
                tracing::error!(
                    source,
                    plugin = %outcome.plugin,
                    path = %outcome.path,
                    error = %err,
                    "work item failed"
                );
                if err.is_fatal() && run.fatal.is_none() {
                    run.fatal = Some(err.clone());
                }
                run.report.failures.push(WorkItemFailure {
                    source: source.to_string(),
                    plugin: outcome.plugin,
                    path: Some(outcome.path),
                    error: err,
                });
            }
        }
    }
}

/// Start the source listing on the blocking pool.
async fn start_listing(cache: &Arc<FileEnumerationCache>) -> Result<(), String> {
    let cache = Arc::clone(cache);
    match tokio::task::spawn_blocking(move || cache.start()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(e) => Err(format!("listing task failed: {}", e)),
    }
}

/// The file at `index`, pulled from the listing and sniffed on the blocking
/// pool. `None` ends the traversal.
async fn next_file(cache: &Arc<FileEnumerationCache>, index: usize) -> Option<FileDescriptor> {
    let cache = Arc::clone(cache);
    let pulled = tokio::task::spawn_blocking(move || {
        let file = cache.get(index)?;
        file.mime();
        Some(file)
    })
    .await;
    match pulled {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(error = %e, "listing task failed, ending traversal");
            None
        }
    }
}

fn record_source_failure(run: &mut RunState, source: &str, err: IndexerError) {
    tracing::error!(source, error = %err, "data source skipped");
    run.report.failures.push(WorkItemFailure {
        source: source.to_string(),
        plugin: String::new(),
        path: None,
        error: err,
    });
}

/// Invoke one plugin on one file, with the configured timeout and with
/// panics converted into failures.
async fn run_work_item(
    plugin: Arc<dyn HandlerPlugin>,
    file: FileDescriptor,
    store: Store,
    config: Arc<Config>,
) -> WorkOutcome {
    let plugin_name = plugin.name().to_string();
    let path = file.full_path().display().to_string();
    let failure = |message: String| IndexerError::WorkItem {
        plugin: plugin_name.clone(),
        path: path.clone(),
        message,
    };

    let work = AssertUnwindSafe(plugin.handle(&file, &store, &config)).catch_unwind();
    let joined = match config.work_item_timeout() {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(joined) => joined,
            Err(_) => Ok(Err(anyhow::Error::new(failure(format!(
                "timed out after {}",
                format_duration(limit)
            ))))),
        },
        None => work.await,
    };

    let result = match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(classify_handler_error(e, &failure)),
        Err(panic) => Err(failure(format!("panicked: {}", panic_message(&panic)))),
    };

    WorkOutcome {
        plugin: plugin_name.clone(),
        path: path.clone(),
        result,
    }
}

fn classify_handler_error(
    err: anyhow::Error,
    failure: &dyn Fn(String) -> IndexerError,
) -> IndexerError {
    if let Some(known) = find_indexer_error(&err) {
        return match known {
            IndexerError::StoreUnavailable(_)
            | IndexerError::UpsertConflict { .. }
            | IndexerError::WorkItem { .. } => known.clone(),
            _ => failure(format!("{:#}", err)),
        };
    }
    let store_gone = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<sqlx::Error>())
        .any(is_store_unavailable);
    if store_gone {
        return IndexerError::StoreUnavailable(format!("{:#}", err));
    }
    failure(format!("{:#}", err))
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn compile_plan(plan: &ExecutionPlan) -> Result<Vec<Vec<CompiledPlugin>>, IndexerError> {
    plan.steps()
        .iter()
        .map(|step| {
            step.iter()
                .map(|plugin| {
                    Ok(CompiledPlugin {
                        mimes: mime_globset(plugin.as_ref())?,
                        plugin: Arc::clone(plugin),
                    })
                })
                .collect()
        })
        .collect()
}

/// `*` crosses `/`, so `*` matches every mime and `audio/*` every audio type.
fn mime_globset(plugin: &dyn HandlerPlugin) -> Result<GlobSet, IndexerError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in plugin.handled_mime_patterns() {
        let glob = GlobBuilder::new(&pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .map_err(|e| {
                IndexerError::Config(format!(
                    "{}: invalid mime pattern '{}': {}",
                    plugin.name(),
                    pattern,
                    e
                ))
            })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexerError::Config(format!("{}: {}", plugin.name(), e)))
}
