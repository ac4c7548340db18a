//! Batch downloads of Copernicus climate (C3S/ERA5) and ocean (CMEMS) data.
//!
//! A range of months or days is split into one file per period. Periods whose
//! file is already on disk (and larger than 1 KiB) are skipped, so re-running
//! the same range only fetches what is missing. Every period reports its own
//! success flag; one failing period never stops the rest.
//!
//! ## Quick start
//! ```no_run
//! use copernicus_batch::{C3sDownloader, Selection, Settings};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(Path::new("config/config.yaml"))?;
//!     let span = tracing::info_span!("c3s");
//!     let mut downloader = C3sDownloader::new(&settings, span, true)?;
//!
//!     let selection = Selection::new("era5_monthly");
//!     let results = downloader.download_monthly_range("2020-01", "2020-12", &selection)?;
//!     for (period, ok) in &results {
//!         println!("{}: {}", period, ok);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! CDS credentials come from the `c3s` config section, `CDSAPI_URL` /
//! `CDSAPI_KEY`, or a `.cdsapirc`. Marine credentials come from the `cmems`
//! section or `CMEMS_USERNAME` / `CMEMS_PASSWORD`.

#![forbid(unsafe_code)]

mod c3s;
mod client;
mod cmems;
mod config;
mod downloader;
mod error;
mod marine;
mod period;
mod processing;
mod settings;
mod util;

pub use c3s::{C3sDownloader, C3sTask, Retriever, build_request};
pub use client::{Client, RemoteFile};
pub use cmems::{CmemsDownloader, CmemsTask, DEFAULT_INFO_DATASET, Subsetter, subset_request};
pub use downloader::{
    DAILY_TEMPLATE, DownloadSummary, Downloader, DownloaderBase, MIN_VALID_SIZE, MONTHLY_TEMPLATE,
    RangeResults, RetryPolicy, Selection, check_existing, list_available_datasets, render_template,
};
pub use error::{Error, Result};
pub use marine::{BoundingBox, DEFAULT_MARINE_URL, DepthRange, MarineClient, SubsetRequest};
pub use period::{
    Granularity, Period, TimeWindow, YearMonth, day_range, month_range, normalize_hours, parse_day, parse_hours,
    year_bounds,
};
pub use settings::{
    C3sSection, CmemsSection, DatasetSpec, ENV_PREFIX, GeneralSettings, Registry, RegistryEntry, RunDefaults,
    Settings, apply_env_overrides, deep_merge, lookup,
};

/// Connector types, one per service.
pub mod connect {
    pub use crate::c3s::Connector as C3sConnector;
    pub use crate::cmems::Connector as CmemsConnector;
}
