use std::path::PathBuf;

use anyhow::anyhow;
use reqwest::StatusCode;

/// Errors surfaced by configuration loading and range planning.
///
/// Per-period download failures never show up here: they are logged and
/// recorded as `false` in the result map.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("unsupported configuration format: {0:?} (expected .yaml, .yml or .json)")]
    UnsupportedConfigFormat(String),

    #[error("failed to read configuration file {}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {}: {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    #[error("failed to write configuration file {}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize configuration for {}: {message}", path.display())]
    ConfigSerialize { path: PathBuf, message: String },

    #[error("invalid configuration section `{section}`: {message}")]
    ConfigSection { section: String, message: String },

    #[error("environment override {var}={value:?} is not a valid {expected}")]
    EnvOverride {
        var: String,
        value: String,
        expected: &'static str,
    },

    #[error("invalid date {input:?}: expected {expected}")]
    InvalidDate {
        input: String,
        expected: &'static str,
    },

    #[error("invalid month {0}: expected 1-12")]
    InvalidMonth(u32),

    #[error("invalid hour {0:?}: expected HH:MM")]
    InvalidHour(String),

    #[error("invalid range: end {end} is before start {start}")]
    InvalidRange { start: String, end: String },

    #[error("hourly download of `{0}` needs an hour list (pass hours or set `time` in the dataset registry)")]
    MissingHours(String),

    #[error("dataset `{name}` is not configured under `{service}.datasets`")]
    DatasetNotFound { service: &'static str, name: String },

    #[error("output template {template:?} references unknown placeholder `{placeholder}`")]
    TemplatePlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("failed to create output directory {}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, serde::Deserialize)]
pub(crate) struct CdsErrorResponse {
    #[serde(default)]
    pub(crate) title: Option<String>,
    #[serde(default)]
    pub(crate) status: Option<u16>,
    #[serde(default)]
    pub(crate) detail: Option<String>,
    #[serde(default)]
    pub(crate) trace_id: Option<String>,
    // Some endpoints respond with {"message":...,"detail":...}
    #[serde(default)]
    pub(crate) message: Option<String>,
}

pub(crate) fn format_cds_error(status: StatusCode, url: &str, e: &CdsErrorResponse) -> anyhow::Error {
    let title = e.title.as_deref().or(e.message.as_deref()).unwrap_or("");
    let detail = e.detail.as_deref().unwrap_or("");
    let trace = e.trace_id.as_deref().unwrap_or("(none)");
    let code = e.status.unwrap_or(status.as_u16());

    let lower = format!("{} {}", title, detail).to_lowercase();
    if status == StatusCode::FORBIDDEN && lower.contains("licence") {
        let link = detail
            .find("https://")
            .and_then(|idx| detail[idx..].split_whitespace().next())
            .unwrap_or("https://cds.climate.copernicus.eu/how-to-api");
        return anyhow!(
            "CDS returned 403: the dataset licence has not been accepted.\nAccept it at {} and re-run.\n\nServer message: {}\ntrace_id: {}",
            link,
            title,
            trace
        );
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow!(
            "CDS authentication failed (HTTP {}).\n- check `c3s.api_key`, CDSAPI_KEY or .cdsapirc holds a valid personal access token\n\nServer message: {}\n{}\ntrace_id: {}\nrequest: {}",
            code,
            title,
            detail,
            trace,
            url
        );
    }

    anyhow!("API request failed: HTTP {} for url ({})\n{}\n{}", code, url, title, detail)
}
