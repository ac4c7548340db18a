//! ERA5 and other gridded atmosphere datasets from the Climate Data Store.

use anyhow::anyhow;
use serde_json::{Map, Value, json};
use std::path::Path;
use tracing::{Span, error, info};

use crate::client::Client;
use crate::downloader::{Downloader, DownloaderBase, RangeResults, RetryPolicy, Selection, check_existing};
use crate::error::{Error, Result};
use crate::period::{
    Granularity, Period, YearMonth, day_range, month_range, normalize_hours, parse_day, parse_hours, year_bounds,
};
use crate::settings::{C3sSection, DatasetSpec, Registry, Settings, lookup};

const SERVICE: &str = "c3s";

/// Registry fields copied into the request verbatim when declared.
const PASS_THROUGH: [&str; 4] = ["daily_statistic", "frequency", "statistic", "time_zone"];

/// Something that can run a CDS retrieval into a file.
pub trait Retriever {
    fn retrieve_to(&self, dataset: &str, request: &Value, target: &Path) -> anyhow::Result<()>;
}

impl Retriever for Client {
    fn retrieve_to(&self, dataset: &str, request: &Value, target: &Path) -> anyhow::Result<()> {
        self.retrieve(dataset, request, target).map(|_| ())
    }
}

/// Builds the client when a range run connects.
pub type Connector<C> = Box<dyn Fn(&C3sSection, &DownloaderBase) -> anyhow::Result<C>>;

#[derive(Debug, Clone, PartialEq)]
pub struct C3sTask {
    pub dataset: String,
    pub year: i32,
    pub month: u32,
    pub days: Option<Vec<u32>>,
    pub variables: Option<Vec<String>>,
    pub time: Option<Vec<String>>,
}

pub struct C3sDownloader<C = Client> {
    base: DownloaderBase,
    service: C3sSection,
    connector: Connector<C>,
    client: Option<C>,
}

impl C3sDownloader<Client> {
    /// Downloader backed by the CDS Retrieve API.
    pub fn new(settings: &Settings, span: Span, progress: bool) -> Result<Self> {
        Self::with_connector(
            settings,
            span,
            Box::new(move |service: &C3sSection, base: &DownloaderBase| -> anyhow::Result<Client> {
                Ok(Client::new(service.api_url.clone(), service.api_key.clone(), service.verify)?
                    .with_timeout(base.timeout())
                    .with_sleep_max(base.retry().max_delay)
                    .with_progress(progress))
            }),
        )
    }
}

impl<C: Retriever> C3sDownloader<C> {
    pub fn with_connector(settings: &Settings, span: Span, connector: Connector<C>) -> Result<Self> {
        Ok(Self {
            base: DownloaderBase::new(&settings.general()?, span)?,
            service: settings.c3s()?,
            connector,
            client: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.base = self.base.with_retry(retry);
        self
    }

    pub fn service(&self) -> &C3sSection {
        &self.service
    }

    /// Monthly files from `start` to `end` (`YYYY-MM`, inclusive).
    pub fn download_monthly_range(&mut self, start: &str, end: &str, selection: &Selection) -> Result<RangeResults> {
        self.run_range(Granularity::Monthly, selection, || {
            month_range(YearMonth::parse(start)?, YearMonth::parse(end)?)
        })
    }

    /// Monthly files for whole years, optionally trimmed by a first and last
    /// month.
    pub fn download_range(
        &mut self,
        start_year: i32,
        end_year: i32,
        start_month: Option<u32>,
        end_month: Option<u32>,
        selection: &Selection,
    ) -> Result<RangeResults> {
        self.run_range(Granularity::Monthly, selection, || {
            let (start, end) = year_bounds(start_year, end_year, start_month, end_month)?;
            month_range(start, end)
        })
    }

    /// Daily files from `start` to `end` (`YYYY-MM-DD`, inclusive).
    pub fn download_daily_range(&mut self, start: &str, end: &str, selection: &Selection) -> Result<RangeResults> {
        self.run_range(Granularity::Daily, selection, || day_range(parse_day(start)?, parse_day(end)?))
    }

    /// One file per day holding the selected hours. The hours come from the
    /// selection or from the registry's `time`; having neither is an error.
    pub fn download_hourly_range(&mut self, start: &str, end: &str, selection: &Selection) -> Result<RangeResults> {
        let hours = self.hours_for(selection);
        let dataset = selection.dataset.clone();
        self.run_range(Granularity::Hourly, selection, move || {
            let hours = hours.ok_or(Error::MissingHours(dataset))?;
            parse_hours(&hours)?;
            day_range(parse_day(start)?, parse_day(end)?)
        })
    }

    fn hours_for(&self, selection: &Selection) -> Option<Vec<String>> {
        selection.hours.clone().or_else(|| {
            lookup(&self.service.datasets, SERVICE, &selection.dataset)
                .ok()
                .and_then(|spec| spec.time.clone())
        })
    }

    /// Registry entry and CDS dataset name for `dataset`.
    fn resolve_dataset(&self, dataset: &str) -> anyhow::Result<(&DatasetSpec, &str)> {
        let spec = lookup(&self.service.datasets, SERVICE, dataset)?;
        let name = spec
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("dataset `{}` has no CDS `name` in the registry", dataset))?;
        Ok((spec, name))
    }

    fn try_download(&self, task: &C3sTask, output_path: &Path) -> anyhow::Result<bool> {
        let (spec, name) = self.resolve_dataset(&task.dataset)?;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("C3S client is not connected"))?;

        let request = build_request(spec, task);
        info!(dataset = name, request = %request, "submitting CDS request");
        client.retrieve_to(name, &request, output_path)?;
        Ok(check_existing(output_path))
    }
}

/// Request body for one task.
pub fn build_request(spec: &DatasetSpec, task: &C3sTask) -> Value {
    let mut req = Map::new();
    req.insert(
        "product_type".into(),
        json!(spec.product_type.as_deref().unwrap_or("monthly_averaged_reanalysis")),
    );
    req.insert(
        "variable".into(),
        json!(task.variables.as_ref().unwrap_or(&spec.variables)),
    );
    req.insert("year".into(), json!(task.year.to_string()));
    req.insert("month".into(), json!(format!("{:02}", task.month)));
    req.insert(
        "data_format".into(),
        json!(spec.data_format.as_deref().unwrap_or("netcdf")),
    );

    if let Some(time) = task.time.as_ref().or(spec.time.as_ref()) {
        req.insert("time".into(), json!(time));
    }

    let declared = [&spec.daily_statistic, &spec.frequency, &spec.statistic, &spec.time_zone];
    for (key, value) in PASS_THROUGH.iter().zip(declared) {
        if let Some(value) = value {
            req.insert((*key).into(), json!(value));
        }
    }

    if let Some(format) = &spec.download_format {
        req.insert("download_format".into(), json!(format));
    }
    if let Some(days) = &task.days {
        let days: Vec<String> = days.iter().map(|d| format!("{:02}", d)).collect();
        req.insert("day".into(), json!(days));
    }

    Value::Object(req)
}

impl<C: Retriever> Downloader for C3sDownloader<C> {
    type Task = C3sTask;

    fn base(&self) -> &DownloaderBase {
        &self.base
    }

    fn registry(&self) -> &Registry {
        &self.service.datasets
    }

    fn connect(&mut self) -> bool {
        match (self.connector)(&self.service, &self.base) {
            Ok(client) => {
                self.client = Some(client);
                info!("connected to the C3S API");
                true
            }
            Err(e) => {
                error!("C3S API connection failed: {:#}", e);
                false
            }
        }
    }

    fn download_single(&mut self, task: &C3sTask, output_path: &Path) -> bool {
        match self.try_download(task, output_path) {
            Ok(true) => {
                info!(path = %output_path.display(), "download complete");
                true
            }
            Ok(false) => {
                error!(path = %output_path.display(), "downloaded file failed validation");
                false
            }
            Err(e) => {
                error!(dataset = %task.dataset, year = task.year, month = task.month, "download failed: {:#}", e);
                false
            }
        }
    }

    fn build_task(&self, _granularity: Granularity, period: &Period, selection: &Selection) -> Result<C3sTask> {
        let time = self.hours_for(selection).map(|h| normalize_hours(&h)).transpose()?;
        Ok(C3sTask {
            dataset: selection.dataset.clone(),
            year: period.year(),
            month: period.month(),
            days: period.day().map(|d| vec![d]),
            variables: selection.variables.clone(),
            time,
        })
    }

    fn validate_task(&self, task: &C3sTask) -> anyhow::Result<()> {
        self.resolve_dataset(&task.dataset).map(|_| ())
    }

    fn file_extension(&self, selection: &Selection) -> &'static str {
        let Ok(spec) = lookup(&self.service.datasets, SERVICE, &selection.dataset) else {
            return "nc";
        };
        match (spec.download_format.as_deref(), spec.data_format.as_deref()) {
            (Some("zip"), _) => "zip",
            (_, Some("grib")) => "grib",
            _ => "nc",
        }
    }
}
