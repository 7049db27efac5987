use anyhow::Result;

use crate::backend::BackendRegistry;
use crate::config::Config;

/// Health of one configured data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub path: String,
    pub scheme: String,
    /// Backend name, or `-` when none serves the scheme.
    pub backend: String,
    pub status: &'static str,
}

impl SourceStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "OK"
    }
}

/// Resolve and connect every data source without listing it.
pub fn check_sources(config: &Config, backends: &BackendRegistry) -> Vec<SourceStatus> {
    config
        .data_sources
        .iter()
        .map(|source| match backends.resolve(source) {
            Ok((backend, uri)) => {
                let status = match backend.connect(&uri, source) {
                    Ok(_) => "OK",
                    Err(e) => {
                        tracing::debug!(source = %source.path, error = %e, "connect failed");
                        "NOT FOUND"
                    }
                };
                SourceStatus {
                    path: source.path.clone(),
                    scheme: uri.scheme,
                    backend: backend.name().to_string(),
                    status,
                }
            }
            Err(e) => SourceStatus {
                path: source.path.clone(),
                scheme: crate::backend::DataSourceUri::parse(&source.path)
                    .map(|uri| uri.scheme)
                    .unwrap_or_else(|_| e.to_string()),
                backend: "-".to_string(),
                status: "UNKNOWN SCHEME",
            },
        })
        .collect()
}

pub fn list_sources(config: &Config, backends: &BackendRegistry) -> Result<()> {
    let statuses = check_sources(config, backends);

    println!("{:<40} {:<8} {:<8} STATUS", "DATA SOURCE", "SCHEME", "BACKEND");
    for s in &statuses {
        println!("{:<40} {:<8} {:<8} {}", s.path, s.scheme, s.backend, s.status);
    }

    Ok(())
}
