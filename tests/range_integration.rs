//! Range runs against in-process fake services.
//!
//! The fakes record every remote call and write a file of configurable size,
//! so skip/idempotence behavior can be observed without a network.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use copernicus_batch::{
    C3sDownloader, C3sSection, CmemsDownloader, CmemsSection, Downloader, DownloaderBase, Error, RetryPolicy,
    Retriever, Selection, Settings, SubsetRequest, Subsetter,
};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::Span;

#[derive(Clone)]
struct FakeCds {
    calls: Rc<RefCell<Vec<(String, Value)>>>,
    failures_left: Rc<Cell<usize>>,
    file_size: usize,
}

impl FakeCds {
    fn new() -> Self {
        Self {
            calls: Rc::default(),
            failures_left: Rc::default(),
            file_size: 4096,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl Retriever for FakeCds {
    fn retrieve_to(&self, dataset: &str, request: &Value, target: &Path) -> anyhow::Result<()> {
        self.calls.borrow_mut().push((dataset.to_string(), request.clone()));
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            anyhow::bail!("simulated CDS outage");
        }
        std::fs::write(target, vec![0u8; self.file_size])?;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeMarine {
    requests: Rc<RefCell<Vec<SubsetRequest>>>,
    described: Rc<RefCell<Vec<String>>>,
}

impl Subsetter for FakeMarine {
    fn subset_to(&self, request: &SubsetRequest, target: &Path) -> anyhow::Result<()> {
        self.requests.borrow_mut().push(request.clone());
        std::fs::write(target, vec![1u8; 2048])?;
        Ok(())
    }

    fn describe(&self, dataset_id: &str) -> anyhow::Result<String> {
        self.described.borrow_mut().push(dataset_id.to_string());
        Ok(format!("<product id=\"{}\"/>", dataset_id))
    }
}

fn settings(out: &Path) -> Settings {
    Settings::from_value(json!({
        "general": {"output_base_dir": out, "max_retries": 1, "retry_delay": 0.0},
        "c3s": {
            "datasets": {
                "era5_monthly": {
                    "name": "reanalysis-era5-single-levels-monthly-means",
                    "variables": ["2m_temperature"]
                },
                "era5_hourly": {
                    "name": "reanalysis-era5-single-levels",
                    "product_type": "reanalysis",
                    "variables": ["2m_temperature"]
                },
                "era5_grib": {
                    "name": "reanalysis-era5-single-levels",
                    "data_format": "grib",
                    "time": ["06:00"]
                }
            }
        },
        "cmems": {
            "datasets": {
                "glo12_monthly": {
                    "dataset_id": "cmems_mod_glo_phy_my_0.083deg_P1M-m",
                    "variables": ["thetao"],
                    "spatial_range": [100, 130, 0, 40],
                    "depth_range": [0.5, 100]
                }
            }
        }
    }))
}

fn c3s(out: &Path, fake: &FakeCds) -> C3sDownloader<FakeCds> {
    let fake = fake.clone();
    C3sDownloader::with_connector(
        &settings(out),
        Span::none(),
        Box::new(move |_: &C3sSection, _: &DownloaderBase| -> anyhow::Result<FakeCds> { Ok(fake.clone()) }),
    )
    .unwrap()
}

fn cmems(out: &Path, fake: &FakeMarine) -> CmemsDownloader<FakeMarine> {
    let fake = fake.clone();
    CmemsDownloader::with_connector(
        &settings(out),
        Span::none(),
        Box::new(move |_: &CmemsSection, _: &DownloaderBase| -> anyhow::Result<FakeMarine> { Ok(fake.clone()) }),
    )
    .unwrap()
}

fn out_dir() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let out = dir.path().join("data");
    (dir, out)
}

#[test]
fn test_monthly_range_has_one_key_per_month() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let mut downloader = c3s(&out, &fake);

    let results = downloader
        .download_monthly_range("2019-11", "2020-02", &Selection::new("era5_monthly"))
        .unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.values().all(|ok| *ok));
    assert_eq!(fake.call_count(), 4);
    assert!(out.join("era5_monthly_2019_11.nc").is_file());
    assert!(out.join("era5_monthly_2020_02.nc").is_file());

    let (dataset, request) = &fake.calls.borrow()[0];
    assert_eq!(dataset, "reanalysis-era5-single-levels-monthly-means");
    assert_eq!(request["year"], "2019");
    assert_eq!(request["month"], "11");
}

#[test]
fn test_second_run_makes_no_remote_calls() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let selection = Selection::new("era5_monthly");

    let first = c3s(&out, &fake)
        .download_monthly_range("2020-01", "2020-06", &selection)
        .unwrap();
    assert_eq!(fake.call_count(), 6);

    let second = c3s(&out, &fake)
        .download_monthly_range("2020-01", "2020-06", &selection)
        .unwrap();
    assert_eq!(fake.call_count(), 6, "existing files must not be fetched again");
    assert_eq!(first, second);
    assert!(second.values().all(|ok| *ok));
}

#[test]
fn test_year_range_covers_full_interior_years() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let results = c3s(&out, &fake)
        .download_range(2018, 2020, Some(11), Some(2), &Selection::new("era5_monthly"))
        .unwrap();
    // Nov-Dec 2018, all of 2019, Jan-Feb 2020
    assert_eq!(results.len(), 16);
    assert!(results.contains_key("2019-06"));
}

#[test]
fn test_end_before_start_is_an_error() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let err = c3s(&out, &fake)
        .download_monthly_range("2020-06", "2020-03", &Selection::new("era5_monthly"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRange { .. }));
    assert_eq!(fake.call_count(), 0);
}

#[test]
fn test_unknown_dataset_fails_each_period_without_erroring() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let results = c3s(&out, &fake)
        .download_monthly_range("2020-01", "2020-03", &Selection::new("not_configured"))
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.values().all(|ok| !*ok));
    assert_eq!(fake.call_count(), 0);
}

#[test]
fn test_unknown_dataset_is_not_retried() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let mut downloader = c3s(&out, &fake).with_retry(RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(5),
    });

    let started = Instant::now();
    let results = downloader
        .download_monthly_range("2020-01", "2020-02", &Selection::new("nope"))
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.values().all(|ok| !*ok));
    assert!(started.elapsed() < Duration::from_secs(5), "no backoff sleep expected");
}

#[test]
fn test_registry_entry_without_name_is_not_retried() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let settings = Settings::from_value(json!({
        "general": {"output_base_dir": &out},
        "c3s": {"datasets": {"era5_unnamed": {"variables": ["2m_temperature"]}, "era5_note": "notes only"}}
    }));
    let handle = fake.clone();
    let mut downloader = C3sDownloader::with_connector(
        &settings,
        Span::none(),
        Box::new(move |_: &C3sSection, _: &DownloaderBase| -> anyhow::Result<FakeCds> { Ok(handle.clone()) }),
    )
    .unwrap()
    .with_retry(RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(5),
    });

    let started = Instant::now();
    for dataset in ["era5_unnamed", "era5_note"] {
        let results = downloader
            .download_monthly_range("2020-01", "2020-01", &Selection::new(dataset))
            .unwrap();
        assert_eq!(results.get("2020-01"), Some(&false));
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(fake.call_count(), 0);
}

#[test]
fn test_failed_connection_returns_empty_results() {
    let (_dir, out) = out_dir();
    let mut downloader = C3sDownloader::<FakeCds>::with_connector(
        &settings(&out),
        Span::none(),
        Box::new(|_: &C3sSection, _: &DownloaderBase| -> anyhow::Result<FakeCds> {
            anyhow::bail!("no credentials")
        }),
    )
    .unwrap();

    let results = downloader
        .download_monthly_range("2020-01", "2020-03", &Selection::new("era5_monthly"))
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_small_download_counts_as_failure() {
    let (_dir, out) = out_dir();
    let mut fake = FakeCds::new();
    fake.file_size = 100;
    let results = c3s(&out, &fake)
        .download_monthly_range("2020-01", "2020-01", &Selection::new("era5_monthly"))
        .unwrap();
    assert_eq!(results.get("2020-01"), Some(&false));
}

#[test]
fn test_retry_policy_recovers_from_transient_failure() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    fake.failures_left.set(1);
    let mut downloader = c3s(&out, &fake).with_retry(RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    });

    let results = downloader
        .download_monthly_range("2020-01", "2020-01", &Selection::new("era5_monthly"))
        .unwrap();
    assert_eq!(results.get("2020-01"), Some(&true));
    assert_eq!(fake.call_count(), 2);
}

#[test]
fn test_single_attempt_policy_does_not_retry() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    fake.failures_left.set(1);
    let results = c3s(&out, &fake)
        .with_retry(RetryPolicy::single_attempt())
        .download_monthly_range("2020-01", "2020-02", &Selection::new("era5_monthly"))
        .unwrap();
    assert_eq!(results.get("2020-01"), Some(&false));
    assert_eq!(results.get("2020-02"), Some(&true));
    assert_eq!(fake.call_count(), 2);
}

#[test]
fn test_daily_range_has_one_key_per_day() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let results = c3s(&out, &fake)
        .download_daily_range("2020-02-27", "2020-03-02", &Selection::new("era5_hourly"))
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.contains_key("2020-02-29"));
    assert!(out.join("era5_hourly_20200229.nc").is_file());

    let (_, request) = &fake.calls.borrow()[2];
    assert_eq!(request["day"], json!(["29"]));
}

#[test]
fn test_hourly_range_requires_hours() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let err = c3s(&out, &fake)
        .download_hourly_range("2020-03-01", "2020-03-02", &Selection::new("era5_hourly"))
        .unwrap_err();
    assert!(matches!(err, Error::MissingHours(name) if name == "era5_hourly"));
}

#[test]
fn test_hourly_range_sends_hours_and_uses_registry_format() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();

    let selection = Selection::new("era5_hourly").with_hours(Some(vec!["00:00".into(), "12:00".into()]));
    let results = c3s(&out, &fake)
        .download_hourly_range("2020-03-01", "2020-03-02", &selection)
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(fake.calls.borrow()[0].1["time"], json!(["00:00", "12:00"]));

    // registry `time` is enough, and grib datasets get a .grib file
    let results = c3s(&out, &fake)
        .download_hourly_range("2020-03-01", "2020-03-01", &Selection::new("era5_grib"))
        .unwrap();
    assert_eq!(results.get("2020-03-01"), Some(&true));
    assert!(out.join("era5_grib_20200301.grib").is_file());
    assert_eq!(fake.calls.borrow()[2].1["time"], json!(["06:00"]));
}

#[test]
fn test_hourly_hours_are_sent_normalized() {
    let (_dir, out) = out_dir();
    let fake = FakeCds::new();
    let selection = Selection::new("era5_hourly").with_hours(Some(vec![" 6:00".into(), "18:00 ".into()]));
    c3s(&out, &fake)
        .download_hourly_range("2020-03-01", "2020-03-01", &selection)
        .unwrap();
    assert_eq!(fake.calls.borrow()[0].1["time"], json!(["06:00", "18:00"]));
}

#[test]
fn test_list_available_datasets_from_downloader() {
    let (_dir, out) = out_dir();
    let listed = c3s(&out, &FakeCds::new()).list_available_datasets();
    assert_eq!(listed["era5_monthly"], "reanalysis-era5-single-levels-monthly-means");
    assert_eq!(listed.len(), 3);
}

#[test]
fn test_cmems_monthly_windows_and_box() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let results = cmems(&out, &fake)
        .download_monthly_range("2020-11", "2021-01", &Selection::new("glo12_monthly"))
        .unwrap();
    assert_eq!(results.len(), 3);

    let requests = fake.requests.borrow();
    assert_eq!(requests[1].start.to_string(), "2020-12-01 00:00:00");
    assert_eq!(requests[1].end.to_string(), "2021-01-01 00:00:00");
    assert_eq!(requests[1].bbox.unwrap().max_lon, 130.0);
    assert_eq!(requests[1].depth.unwrap().max, 100.0);
    assert!(out.join("glo12_monthly_2020_12.nc").is_file());
}

#[test]
fn test_cmems_daily_range_has_full_day_windows() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let results = cmems(&out, &fake)
        .download_daily_range("2020-02-28", "2020-03-01", &Selection::new("glo12_monthly"))
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.values().all(|ok| *ok));
    assert!(out.join("glo12_monthly_20200229.nc").is_file());

    let requests = fake.requests.borrow();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].start.to_string(), "2020-02-29 00:00:00");
    assert_eq!(requests[1].end.to_string(), "2020-03-01 00:00:00");
}

#[test]
fn test_cmems_second_run_makes_no_remote_calls() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let selection = Selection::new("glo12_monthly");

    let first = cmems(&out, &fake)
        .download_monthly_range("2020-01", "2020-04", &selection)
        .unwrap();
    assert_eq!(fake.requests.borrow().len(), 4);

    let second = cmems(&out, &fake)
        .download_monthly_range("2020-01", "2020-04", &selection)
        .unwrap();
    assert_eq!(fake.requests.borrow().len(), 4);
    assert_eq!(first, second);
}

#[test]
fn test_cmems_year_range_matches_monthly_range() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let results = cmems(&out, &fake)
        .download_range(2019, 2020, Some(12), Some(1), &Selection::new("glo12_monthly"))
        .unwrap();
    let labels: Vec<_> = results.keys().cloned().collect();
    assert_eq!(labels, ["2019-12", "2020-01"]);
}

#[test]
fn test_cmems_dataset_missing_variables_is_not_attempted() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let settings = Settings::from_value(json!({
        "general": {"output_base_dir": &out},
        "cmems": {"datasets": {"bare": {"dataset_id": "cmems_x"}}}
    }));
    let handle = fake.clone();
    let mut downloader = CmemsDownloader::with_connector(
        &settings,
        Span::none(),
        Box::new(move |_: &CmemsSection, _: &DownloaderBase| -> anyhow::Result<FakeMarine> { Ok(handle.clone()) }),
    )
    .unwrap();

    let results = downloader
        .download_monthly_range("2020-01", "2020-01", &Selection::new("bare"))
        .unwrap();
    assert_eq!(results.get("2020-01"), Some(&false));
    assert!(fake.requests.borrow().is_empty());
}

#[test]
fn test_cmems_dataset_info_defaults_to_glo12() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let mut downloader = cmems(&out, &fake);

    let info = downloader.get_dataset_info(None).unwrap();
    assert!(info.contains("cmems_mod_glo_phy_my_0.083deg_P1M-m"));
    assert!(downloader.get_dataset_info(Some("cmems_other")).is_some());
    assert_eq!(
        *fake.described.borrow(),
        ["cmems_mod_glo_phy_my_0.083deg_P1M-m", "cmems_other"]
    );
}

#[test]
fn test_cmems_hourly_window_spans_listed_hours() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let selection = Selection::new("glo12_monthly").with_hours(Some(vec!["00:00".into(), "12:00".into()]));
    let results = cmems(&out, &fake)
        .download_hourly_range("2020-03-15", "2020-03-15", &selection)
        .unwrap();
    assert_eq!(results.get("2020-03-15"), Some(&true));

    let requests = fake.requests.borrow();
    assert_eq!(requests[0].start.to_string(), "2020-03-15 00:00:00");
    assert_eq!(requests[0].end.to_string(), "2020-03-15 13:00:00");
}

#[test]
fn test_cmems_hourly_without_hours_covers_whole_day() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    cmems(&out, &fake)
        .download_hourly_range("2020-03-15", "2020-03-16", &Selection::new("glo12_monthly"))
        .unwrap();

    let requests = fake.requests.borrow();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].start.to_string(), "2020-03-16 00:00:00");
    assert_eq!(requests[1].end.to_string(), "2020-03-17 00:00:00");
}

#[test]
fn test_cmems_invalid_hour_is_an_error() {
    let (_dir, out) = out_dir();
    let fake = FakeMarine::default();
    let selection = Selection::new("glo12_monthly").with_hours(Some(vec!["noon".into()]));
    let err = cmems(&out, &fake)
        .download_hourly_range("2020-03-15", "2020-03-15", &selection)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidHour(_)));
    assert!(fake.requests.borrow().is_empty());
}
