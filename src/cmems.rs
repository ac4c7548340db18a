//! Gridded ocean products from Copernicus Marine.

use anyhow::{anyhow, bail};
use std::path::Path;
use tracing::{Span, error, info, warn};

use crate::downloader::{Downloader, DownloaderBase, RangeResults, RetryPolicy, Selection, check_existing};
use crate::error::Result;
use crate::marine::{BoundingBox, DepthRange, MarineClient, SubsetRequest};
use crate::period::{
    Granularity, Period, TimeWindow, YearMonth, day_range, month_range, parse_day, parse_hours, year_bounds,
};
use crate::settings::{CmemsSection, DatasetSpec, Registry, Settings, lookup};

const SERVICE: &str = "cmems";

/// Dataset described by [`CmemsDownloader::get_dataset_info`] when none is named.
pub const DEFAULT_INFO_DATASET: &str = "glo12_monthly";

/// Something that can extract a marine subset into a file.
pub trait Subsetter {
    fn subset_to(&self, request: &SubsetRequest, target: &Path) -> anyhow::Result<()>;

    /// Product metadata for `dataset_id`.
    fn describe(&self, dataset_id: &str) -> anyhow::Result<String>;
}

impl Subsetter for MarineClient {
    fn subset_to(&self, request: &SubsetRequest, target: &Path) -> anyhow::Result<()> {
        self.subset(request, target).map(|_| ())
    }

    fn describe(&self, dataset_id: &str) -> anyhow::Result<String> {
        self.describe_product(dataset_id)
    }
}

pub type Connector<S> = Box<dyn Fn(&CmemsSection, &DownloaderBase) -> anyhow::Result<S>>;

#[derive(Debug, Clone, PartialEq)]
pub struct CmemsTask {
    pub dataset: String,
    pub variables: Option<Vec<String>>,
    pub window: TimeWindow,
}

pub struct CmemsDownloader<S = MarineClient> {
    base: DownloaderBase,
    service: CmemsSection,
    connector: Connector<S>,
    client: Option<S>,
}

impl CmemsDownloader<MarineClient> {
    pub fn new(settings: &Settings, span: Span, progress: bool) -> Result<Self> {
        Self::with_connector(
            settings,
            span,
            Box::new(move |service: &CmemsSection, base: &DownloaderBase| -> anyhow::Result<MarineClient> {
                Ok(MarineClient::new(
                    service.api_url.clone(),
                    service.service_id.clone(),
                    service.username.clone(),
                    service.password.clone(),
                )?
                .with_timeout(base.timeout())
                .with_sleep_max(base.retry().max_delay)
                .with_progress(progress))
            }),
        )
    }
}

impl<S: Subsetter> CmemsDownloader<S> {
    pub fn with_connector(settings: &Settings, span: Span, connector: Connector<S>) -> Result<Self> {
        Ok(Self {
            base: DownloaderBase::new(&settings.general()?, span)?,
            service: settings.cmems()?,
            connector,
            client: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.base = self.base.with_retry(retry);
        self
    }

    pub fn service(&self) -> &CmemsSection {
        &self.service
    }

    /// Monthly files from `start` to `end` (`YYYY-MM`, inclusive), each
    /// covering `[first day, first day of next month)`.
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

    /// Daily files narrowed to the selected hours, or whole days when no
    /// hours are given.
    pub fn download_hourly_range(&mut self, start: &str, end: &str, selection: &Selection) -> Result<RangeResults> {
        let hours = self.hours_for(selection);
        self.run_range(Granularity::Hourly, selection, move || {
            parse_hours(&hours)?;
            day_range(parse_day(start)?, parse_day(end)?)
        })
    }

    fn hours_for(&self, selection: &Selection) -> Vec<String> {
        selection
            .hours
            .clone()
            .or_else(|| {
                lookup(&self.service.datasets, SERVICE, &selection.dataset)
                    .ok()
                    .and_then(|spec| spec.time.clone())
            })
            .unwrap_or_default()
    }

    /// Metadata of a marine product, by product id, falling back to the
    /// `glo12_monthly` registry entry. Failures are logged and give `None`.
    pub fn get_dataset_info(&mut self, dataset_id: Option<&str>) -> Option<String> {
        let dataset_id = match dataset_id {
            Some(id) => id.to_string(),
            None => match lookup(&self.service.datasets, SERVICE, DEFAULT_INFO_DATASET)
                .ok()
                .and_then(|spec| spec.dataset_id.clone())
            {
                Some(id) => id,
                None => {
                    error!("no dataset id given and `{}` has no `dataset_id`", DEFAULT_INFO_DATASET);
                    return None;
                }
            },
        };

        if self.client.is_none() && !self.connect() {
            return None;
        }
        let client = self.client.as_ref()?;
        match client.describe(&dataset_id) {
            Ok(info) => Some(info),
            Err(e) => {
                error!(product = %dataset_id, "failed to fetch dataset info: {:#}", e);
                None
            }
        }
    }

    fn try_download(&self, task: &CmemsTask, output_path: &Path) -> anyhow::Result<bool> {
        let spec = lookup(&self.service.datasets, SERVICE, &task.dataset)?;
        let request = subset_request(spec, task)?;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("CMEMS client is not connected"))?;

        info!(
            product = %request.dataset_id,
            start = %request.start,
            end = %request.end,
            "requesting CMEMS subset"
        );
        client.subset_to(&request, output_path)?;
        Ok(check_existing(output_path))
    }
}

/// Subset parameters for one task.
pub fn subset_request(spec: &DatasetSpec, task: &CmemsTask) -> anyhow::Result<SubsetRequest> {
    let Some(dataset_id) = spec.dataset_id.clone() else {
        bail!("dataset `{}` has no `dataset_id` in the registry", task.dataset);
    };
    let variables = task.variables.clone().unwrap_or_else(|| spec.variables.clone());
    if variables.is_empty() {
        bail!("no variables selected for dataset `{}`", task.dataset);
    }

    Ok(SubsetRequest {
        dataset_id,
        variables,
        start: task.window.start,
        end: task.window.end,
        bbox: spec.spatial_range.map(|[min_lon, max_lon, min_lat, max_lat]| BoundingBox {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }),
        depth: spec.depth_range.map(|[min, max]| DepthRange { min, max }),
    })
}

impl<S: Subsetter> Downloader for CmemsDownloader<S> {
    type Task = CmemsTask;

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
                true
            }
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        }
    }

    fn download_single(&mut self, task: &CmemsTask, output_path: &Path) -> bool {
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
                error!(dataset = %task.dataset, start = %task.window.start, "download failed: {:#}", e);
                false
            }
        }
    }

    fn build_task(&self, granularity: Granularity, period: &Period, selection: &Selection) -> Result<CmemsTask> {
        let window = match (period, granularity) {
            (Period::Month(month), _) => TimeWindow::month(*month)?,
            (Period::Day(date), Granularity::Hourly) => {
                TimeWindow::hours(*date, &parse_hours(&self.hours_for(selection))?)?
            }
            (Period::Day(date), _) => TimeWindow::day(*date)?,
        };
        Ok(CmemsTask {
            dataset: selection.dataset.clone(),
            variables: selection.variables.clone(),
            window,
        })
    }

    fn validate_task(&self, task: &CmemsTask) -> anyhow::Result<()> {
        let spec = lookup(&self.service.datasets, SERVICE, &task.dataset)?;
        subset_request(spec, task).map(|_| ())
    }
}
