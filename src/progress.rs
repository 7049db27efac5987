//! Crawl progress reporting.
//!
//! Reports which data source is being connected, which (step, plugin)
//! combination is being dispatched, and per-source totals. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a crawl.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrawlProgressEvent {
    /// Resolving the backend and starting the listing for a data source.
    Connecting { source: String },
    /// Submitting work items for one plugin of one step (1-based).
    Dispatching {
        source: String,
        step: usize,
        plugin: String,
    },
    /// Every step has run for this data source.
    Finished {
        source: String,
        submitted: u64,
        failed: u64,
    },
}

/// Reports crawl progress. Implementations write to stderr (human or JSON).
pub trait CrawlProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the dispatch control loop.
    fn report(&self, event: CrawlProgressEvent);
}

/// Human-friendly progress on stderr: "crawl /srv/music  step 2  AudioHandler".
pub struct StderrProgress;

impl CrawlProgressReporter for StderrProgress {
    fn report(&self, event: CrawlProgressEvent) {
        let line = human_line(&event);
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

fn human_line(event: &CrawlProgressEvent) -> String {
    match event {
        CrawlProgressEvent::Connecting { source } => {
            format!("crawl {}  connecting...\n", source)
        }
        CrawlProgressEvent::Dispatching {
            source,
            step,
            plugin,
        } => format!("crawl {}  step {}  {}\n", source, step, short_name(plugin)),
        CrawlProgressEvent::Finished {
            source,
            submitted,
            failed,
        } => format!(
            "crawl {}  done  {} work items, {} failed\n",
            source,
            format_number(*submitted),
            format_number(*failed)
        ),
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl CrawlProgressReporter for JsonProgress {
    fn report(&self, event: CrawlProgressEvent) {
        let obj = json_event(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

fn json_event(event: &CrawlProgressEvent) -> serde_json::Value {
    match event {
        CrawlProgressEvent::Connecting { source } => serde_json::json!({
            "event": "progress",
            "source": source,
            "phase": "connecting"
        }),
        CrawlProgressEvent::Dispatching {
            source,
            step,
            plugin,
        } => serde_json::json!({
            "event": "progress",
            "source": source,
            "phase": "dispatching",
            "step": step,
            "plugin": plugin
        }),
        CrawlProgressEvent::Finished {
            source,
            submitted,
            failed,
        } => serde_json::json!({
            "event": "progress",
            "source": source,
            "phase": "finished",
            "submitted": submitted,
            "failed": failed
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl CrawlProgressReporter for NoProgress {
    fn report(&self, _event: CrawlProgressEvent) {}
}

fn short_name(plugin: &str) -> &str {
    plugin.rsplit("::").next().unwrap_or(plugin)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn CrawlProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
