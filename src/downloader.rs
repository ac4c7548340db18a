//! The contract shared by the dataset downloaders, and the range loop that
//! drives them.
//!
//! A range run connects once, plans its periods, then walks them in order:
//! periods whose output file already exists are recorded as successful
//! without touching the network, the rest go through
//! [`Downloader::download_with_retry`]. Failures of a single period never
//! abort the run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{Span, error, info, warn};

use crate::error::{Error, Result};
use crate::period::{Granularity, Period};
use crate::settings::{GeneralSettings, Registry};
use crate::util::backoff;

/// Files at or below this size are treated as missing.
pub const MIN_VALID_SIZE: u64 = 1024;

pub const MONTHLY_TEMPLATE: &str = "{dataset}_{year}_{month}.{ext}";
pub const DAILY_TEMPLATE: &str = "{dataset}_{year}{month}{day}.{ext}";

/// Period label to success flag.
pub type RangeResults = BTreeMap<String, bool>;

/// What to download for every period of a range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub dataset: String,
    /// Overrides the registry's variable list.
    pub variables: Option<Vec<String>>,
    /// Hours of day (`HH:MM`); overrides the registry's `time`.
    pub hours: Option<Vec<String>>,
}

impl Selection {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Self::default()
        }
    }

    pub fn with_variables(mut self, variables: Option<Vec<String>>) -> Self {
        self.variables = variables.filter(|v| !v.is_empty());
        self
    }

    pub fn with_hours(mut self, hours: Option<Vec<String>>) -> Self {
        self.hours = hours.filter(|h| !h.is_empty());
        self
    }
}

/// Bounded retry with multiplicative backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&GeneralSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(general: &GeneralSettings) -> Self {
        Self {
            max_attempts: general.max_retries.max(1),
            initial_delay: Duration::try_from_secs_f64(general.retry_delay).unwrap_or_default(),
            max_delay: Duration::try_from_secs_f64(general.retry_max_delay).unwrap_or_default(),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Calls `attempt` with 1-based attempt numbers until it returns true or
    /// attempts run out.
    pub fn run(&self, mut attempt: impl FnMut(u32) -> bool) -> bool {
        let mut delay = self.initial_delay.min(self.max_delay);
        for n in 1..=self.max_attempts.max(1) {
            if attempt(n) {
                return true;
            }
            if n < self.max_attempts {
                warn!(attempt = n, of = self.max_attempts, ?delay, "attempt failed, retrying");
                thread::sleep(delay);
                delay = backoff(delay, self.max_delay);
            }
        }
        false
    }
}

/// State every downloader carries: where files go, how to retry, and the
/// logging span its output is attached to.
#[derive(Debug, Clone)]
pub struct DownloaderBase {
    output_dir: PathBuf,
    retry: RetryPolicy,
    timeout: Duration,
    span: Span,
}

impl DownloaderBase {
    /// Creates the output directory if needed.
    pub fn new(general: &GeneralSettings, span: Span) -> Result<Self> {
        let output_dir = general.output_base_dir.clone();
        std::fs::create_dir_all(&output_dir).map_err(|source| Error::OutputDir {
            path: output_dir.clone(),
            source,
        })?;
        Ok(Self {
            output_dir,
            retry: RetryPolicy::from_settings(general),
            timeout: Duration::from_secs(general.timeout),
            span,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn generate_output_path(&self, template: &str, params: &[(&str, String)]) -> Result<PathBuf> {
        Ok(self.output_dir.join(render_template(template, params)?))
    }

    pub fn log_progress(&self, current: usize, total: usize, message: &str) {
        if total > 0 {
            let percent = current as f64 / total as f64 * 100.0;
            info!(parent: &self.span, "{} [{}/{}] {:.1}%", message, current, total, percent);
        }
    }
}

/// Substitutes `{name}` placeholders in `template`.
pub fn render_template(template: &str, params: &[(&str, String)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = &after[..close];
        let value = params
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::TemplatePlaceholder {
                template: template.to_string(),
                placeholder: name.to_string(),
            })?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// True iff `path` exists and is larger than [`MIN_VALID_SIZE`].
pub fn check_existing(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > MIN_VALID_SIZE)
}

/// Dataset name to a human readable description.
pub fn list_available_datasets(registry: &Registry) -> BTreeMap<String, String> {
    registry
        .iter()
        .map(|(name, entry)| (name.clone(), entry.description()))
        .collect()
}

pub trait Downloader {
    /// Parameters of one unit, built right before it is downloaded.
    type Task;

    fn base(&self) -> &DownloaderBase;

    fn registry(&self) -> &Registry;

    /// Sets up the remote client. A false return aborts the range run.
    fn connect(&mut self) -> bool;

    /// Fetches one unit into `output_path`. Errors are logged and reported
    /// as false, never propagated.
    fn download_single(&mut self, task: &Self::Task, output_path: &Path) -> bool;

    fn build_task(&self, granularity: Granularity, period: &Period, selection: &Selection) -> Result<Self::Task>;

    /// Checks what no retry can fix (registry entry, required fields) before
    /// any attempt is made. An error fails the period without retrying.
    fn validate_task(&self, _task: &Self::Task) -> anyhow::Result<()> {
        Ok(())
    }

    fn file_extension(&self, _selection: &Selection) -> &'static str {
        "nc"
    }

    fn download_with_retry(&mut self, task: &Self::Task, output_path: &Path) -> bool {
        let policy = self.base().retry().clone();
        policy.run(|_| self.download_single(task, output_path))
    }

    fn generate_output_path(&self, template: &str, params: &[(&str, String)]) -> Result<PathBuf> {
        self.base().generate_output_path(template, params)
    }

    fn check_existing(&self, path: &Path) -> bool {
        check_existing(path)
    }

    fn log_progress(&self, current: usize, total: usize, message: &str) {
        self.base().log_progress(current, total, message);
    }

    fn list_available_datasets(&self) -> BTreeMap<String, String> {
        list_available_datasets(self.registry())
    }

    fn output_path_for(&self, period: &Period, selection: &Selection) -> Result<PathBuf> {
        let mut params = vec![
            ("dataset", selection.dataset.clone()),
            ("year", period.year().to_string()),
            ("month", format!("{:02}", period.month())),
            ("ext", self.file_extension(selection).to_string()),
        ];
        let template = match period.day() {
            Some(day) => {
                params.push(("day", format!("{:02}", day)));
                DAILY_TEMPLATE
            }
            None => MONTHLY_TEMPLATE,
        };
        self.generate_output_path(template, &params)
    }

    /// Walks `periods` in order, skipping the ones already on disk.
    fn download_periods(
        &mut self,
        granularity: Granularity,
        periods: &[Period],
        selection: &Selection,
    ) -> Result<RangeResults> {
        let mut results = RangeResults::new();
        let total = periods.len();

        for (i, period) in periods.iter().enumerate() {
            let label = period.label();
            let output_path = self.output_path_for(period, selection)?;

            if self.check_existing(&output_path) {
                info!(period = %label, path = %output_path.display(), "file already present, skipping");
                results.insert(label, true);
            } else {
                let task = self.build_task(granularity, period, selection)?;
                let ok = match self.validate_task(&task) {
                    Ok(()) => {
                        info!(period = %label, dataset = %selection.dataset, "downloading");
                        self.download_with_retry(&task, &output_path)
                    }
                    Err(e) => {
                        error!(period = %label, dataset = %selection.dataset, "skipping period: {:#}", e);
                        false
                    }
                };
                results.insert(label, ok);
            }

            self.log_progress(i + 1, total, "progress");
        }

        Ok(results)
    }

    /// Connects, plans the periods, then downloads them.
    ///
    /// A failed connection yields an empty map; planning errors propagate.
    fn run_range<F>(&mut self, granularity: Granularity, selection: &Selection, plan: F) -> Result<RangeResults>
    where
        F: FnOnce() -> Result<Vec<Period>>,
    {
        let span = self.base().span().clone();
        let _entered = span.enter();

        if !self.connect() {
            error!(dataset = %selection.dataset, "could not connect to the data service");
            return Ok(RangeResults::new());
        }

        let periods = plan()?;
        info!(
            dataset = %selection.dataset,
            ?granularity,
            periods = periods.len(),
            "starting range download"
        );
        self.download_periods(granularity, &periods, selection)
    }
}

/// Success/failure tally of a range run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
}

impl DownloadSummary {
    pub fn from_results(results: &RangeResults) -> Self {
        let failed: Vec<String> = results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(label, _)| label.clone())
            .collect();
        Self {
            total: results.len(),
            succeeded: results.len() - failed.len(),
            failed,
        }
    }
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Download finished!")?;
        writeln!(f, "Succeeded: {}/{}", self.succeeded, self.total)?;
        writeln!(f, "Failed: {}/{}", self.failed.len(), self.total)?;
        if !self.failed.is_empty() {
            writeln!(f)?;
            writeln!(f, "Failed periods:")?;
            for label in &self.failed {
                writeln!(f, "  {}", label)?;
            }
        }
        Ok(())
    }
}
