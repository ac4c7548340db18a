//! Copernicus Marine subset client.
//!
//! A subset is one authenticated GET against the product-download endpoint;
//! the extraction (variables, bounding box, depth range, time window) is
//! expressed entirely in the query string and the body is the file itself.

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::client::{send_with_retries, write_body};
use crate::util::{ensure_parent, partial_path};

pub const DEFAULT_MARINE_URL: &str = "https://nrt.cmems-du.eu/motu-web/Motu";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthRange {
    pub min: f64,
    pub max: f64,
}

/// One extraction from a marine product.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetRequest {
    pub dataset_id: String,
    pub variables: Vec<String>,
    /// Inclusive window start.
    pub start: NaiveDateTime,
    /// Exclusive window end.
    pub end: NaiveDateTime,
    pub bbox: Option<BoundingBox>,
    pub depth: Option<DepthRange>,
}

impl SubsetRequest {
    pub(crate) fn query(&self, service_id: Option<&str>) -> Vec<(&'static str, String)> {
        let mut q = vec![("action", "productdownload".to_string())];
        if let Some(service) = service_id {
            q.push(("service", service.to_string()));
        }
        q.push(("product", self.dataset_id.clone()));
        if let Some(b) = self.bbox {
            q.push(("x_lo", b.min_lon.to_string()));
            q.push(("x_hi", b.max_lon.to_string()));
            q.push(("y_lo", b.min_lat.to_string()));
            q.push(("y_hi", b.max_lat.to_string()));
        }
        if let Some(d) = self.depth {
            q.push(("z_lo", d.min.to_string()));
            q.push(("z_hi", d.max.to_string()));
        }
        q.push(("t_lo", self.start.format(TIME_FORMAT).to_string()));
        q.push(("t_hi", self.end.format(TIME_FORMAT).to_string()));
        q.extend(self.variables.iter().map(|v| ("variable", v.clone())));
        q.push(("mode", "console".to_string()));
        q
    }
}

#[derive(Debug, Clone)]
pub struct MarineClient {
    url: String,
    service_id: Option<String>,
    username: String,
    password: String,

    timeout: Duration,
    retry_max: usize,
    sleep_max: Duration,
    progress: bool,

    http: HttpClient,
}

impl MarineClient {
    /// Creates a client; credentials fall back to `CMEMS_USERNAME` and
    /// `CMEMS_PASSWORD`.
    pub fn new(
        url: Option<String>,
        service_id: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let username = username.or_else(|| std::env::var("CMEMS_USERNAME").ok());
        let password = password.or_else(|| std::env::var("CMEMS_PASSWORD").ok());
        let (Some(username), Some(password)) = (username, password) else {
            bail!(
                "Missing CMEMS credentials: export CMEMS_USERNAME='your_username' and CMEMS_PASSWORD='your_password'"
            );
        };

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(crate::util::USER_AGENT));

        let http = HttpClient::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            url: url.unwrap_or_else(|| DEFAULT_MARINE_URL.to_string()),
            service_id,
            username,
            password,
            timeout: Duration::from_secs(300),
            retry_max: 5,
            sleep_max: Duration::from_secs(120),
            progress: true,
            http,
        })
    }

    /// Time allowed for one request, including the server-side extraction
    /// and the transfer of its body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sleep_max(mut self, sleep_max: Duration) -> Self {
        self.sleep_max = sleep_max;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Extracts `request` and writes it to `target`.
    pub fn subset(&self, request: &SubsetRequest, target: &Path) -> Result<PathBuf> {
        ensure_parent(target)
            .with_context(|| format!("failed to create directory for {}", target.display()))?;

        let query = request.query(self.service_id.as_deref());
        debug!(product = %request.dataset_id, start = %request.start, end = %request.end, "requesting subset");

        let resp = send_with_retries(
            || {
                self.http
                    .get(&self.url)
                    .basic_auth(&self.username, Some(&self.password))
                    .query(&query)
                    .timeout(self.timeout)
                    .send()
            },
            self.retry_max,
            self.sleep_max,
        )?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            bail!("subset request failed: HTTP {} for product {}\n{}", status, request.dataset_id, text);
        }

        // The endpoint reports extraction errors as a 200 with an XML/HTML status page.
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if content_type.contains("xml") || content_type.contains("html") {
            let text = resp.text().unwrap_or_default();
            bail!("subset of {} was rejected by the server:\n{}", request.dataset_id, text.trim());
        }

        let expected = resp.content_length().unwrap_or(0);
        let part = partial_path(target);
        let written = write_body(resp, &part, expected, self.progress)?;
        if written == 0 || written < expected {
            let _ = std::fs::remove_file(&part);
            bail!("subset download incomplete: received {} of {} byte(s)", written, expected);
        }

        std::fs::rename(&part, target)
            .with_context(|| format!("failed to move download into {}", target.display()))?;
        Ok(target.to_path_buf())
    }

    /// Fetches the product description document for `dataset_id`: its
    /// variables, time coverage and grid.
    pub fn describe_product(&self, dataset_id: &str) -> Result<String> {
        let mut query = vec![("action", "describeProduct".to_string())];
        if let Some(service) = &self.service_id {
            query.push(("service", service.clone()));
        }
        query.push(("product", dataset_id.to_string()));

        let resp = send_with_retries(
            || {
                self.http
                    .get(&self.url)
                    .basic_auth(&self.username, Some(&self.password))
                    .query(&query)
                    .timeout(self.timeout)
                    .send()
            },
            self.retry_max,
            self.sleep_max,
        )?;

        let status = resp.status();
        let text = resp.text().context("failed to read product description")?;
        if !status.is_success() {
            bail!("describe request failed: HTTP {} for product {}\n{}", status, dataset_id, text);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn request() -> SubsetRequest {
        let day = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        SubsetRequest {
            dataset_id: "cmems_mod_glo_phy_my_0.083deg_P1M-m".to_string(),
            variables: vec!["thetao".to_string(), "so".to_string()],
            start: day.and_hms_opt(0, 0, 0).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 4, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            bbox: Some(BoundingBox {
                min_lon: 100.0,
                max_lon: 130.5,
                min_lat: 0.0,
                max_lat: 40.0,
            }),
            depth: None,
        }
    }

    #[test]
    fn test_query_carries_window_bbox_and_variables() {
        let q = request().query(Some("GLOBAL-TDS"));
        let get = |k: &str| q.iter().filter(|(n, _)| *n == k).map(|(_, v)| v.as_str()).collect::<Vec<_>>();

        assert_eq!(get("service"), ["GLOBAL-TDS"]);
        assert_eq!(get("x_hi"), ["130.5"]);
        assert_eq!(get("t_lo"), ["2020-03-01 00:00:00"]);
        assert_eq!(get("t_hi"), ["2020-04-01 00:00:00"]);
        assert_eq!(get("variable"), ["thetao", "so"]);
        assert!(get("z_lo").is_empty());
    }

    #[test]
    fn test_query_without_service_omits_it() {
        let q = request().query(None);
        assert!(q.iter().all(|(k, _)| *k != "service"));
    }

    #[test]
    fn test_new_with_explicit_credentials() {
        let client = MarineClient::new(None, None, Some("u".into()), Some("p".into())).unwrap();
        assert_eq!(client.url, DEFAULT_MARINE_URL);
    }
}
