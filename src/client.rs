use anyhow::{Context, Result, anyhow, bail};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::resolve_credentials;
use crate::error::{CdsErrorResponse, format_cds_error};
use crate::processing::{Job, JobResults, JobState, JobStatus};
use crate::util::{append_query, backoff, ensure_parent, partial_path, retriable_status};

/// Client for the CDS Retrieve API.
///
/// A retrieval submits a job for a dataset, polls the job monitor until it
/// settles, then downloads the single result asset.
#[derive(Debug, Clone)]
pub struct Client {
    url: String,
    key: String,

    timeout: Duration,
    retry_max: usize,
    sleep_max: Duration,
    progress: bool,

    http: HttpClient,
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
    /// Download URL.
    pub location: String,
    /// Expected content length (bytes).
    pub content_length: u64,
    /// Optional content type.
    pub content_type: Option<String>,
}

impl Client {
    /// Creates a client using (in order of precedence):
    /// - explicit `url`/`key` arguments
    /// - environment variables `CDSAPI_URL` / `CDSAPI_KEY`
    /// - config file from `CDSAPI_RC` or `.cdsapirc`
    pub fn new(url: Option<String>, key: Option<String>, verify: Option<bool>) -> Result<Self> {
        let creds = resolve_credentials(url, key, verify)?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(crate::util::USER_AGENT));

        // Result files can take far longer than any sane request timeout, so
        // only API calls get one (see `api_json`).
        let http = HttpClient::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .danger_accept_invalid_certs(!creds.verify)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            url: creds.url,
            key: creds.key,
            timeout: Duration::from_secs(60),
            retry_max: 5,
            sleep_max: Duration::from_secs(120),
            progress: true,
            http,
        })
    }

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

    /// Submits a request for `dataset`, waits for it and downloads the result
    /// to `target`.
    pub fn retrieve<T: Serialize>(&self, dataset: &str, request: &T, target: &Path) -> Result<RemoteFile> {
        let retrieve_base = format!("{}/retrieve/v1", self.url.trim_end_matches('/'));
        let exec_url = format!("{}/processes/{}/execution", retrieve_base, dataset);

        let job: Job = self.api_json("POST", &exec_url, &serde_json::json!({ "inputs": request }))?;
        let monitor_url = job
            .monitor_url()
            .or_else(|| {
                job.job_id
                    .as_deref()
                    .map(|id| format!("{}/jobs/{}", retrieve_base, id))
            })
            .ok_or_else(|| anyhow!("missing monitor link in job submission response"))?;
        debug!(dataset, monitor = %monitor_url, "job submitted");

        let results_url = self.wait_for_job(&monitor_url)?;
        let results: JobResults = self.api_json("GET", &results_url, &Value::Null)?;
        let file = results.to_remote_file(&results_url)?;
        self.download(&file, target)?;
        Ok(file)
    }

    fn wait_for_job(&self, monitor_url: &str) -> Result<String> {
        let status_url = append_query(monitor_url, &[("log", "true"), ("request", "true")]);
        let mut sleep = Duration::from_secs(1);
        let mut last_status: Option<String> = None;

        loop {
            let status: JobStatus = self.api_json("GET", &status_url, &Value::Null)?;
            if last_status.as_deref() != Some(status.status.as_str()) {
                info!(status = %status.status, "job status");
                last_status = Some(status.status.clone());
            }

            match JobState::parse(&status.status)? {
                JobState::Successful => {
                    return Ok(status
                        .results_url()
                        .unwrap_or_else(|| format!("{}/results", monitor_url.trim_end_matches('/'))));
                }
                JobState::Failed => bail!("processing failed with status {}", status.status),
                JobState::Pending => {
                    thread::sleep(sleep);
                    sleep = backoff(sleep, self.sleep_max).max(Duration::from_secs(1));
                }
            }
        }
    }

    /// Downloads `file` to `target`, replacing whatever is there.
    ///
    /// Bytes land in a `.part` sibling first; the target only appears once
    /// the advertised length has been received.
    pub fn download(&self, file: &RemoteFile, target: &Path) -> Result<PathBuf> {
        ensure_parent(target)
            .with_context(|| format!("failed to create directory for {}", target.display()))?;

        let resp = self.robust_request(|| self.authorize(self.http.get(&file.location)).send())?;
        let resp = resp.error_for_status().context("download request failed")?;

        let part = partial_path(target);
        let written = write_body(resp, &part, file.content_length, self.progress)?;
        if written < file.content_length {
            let _ = std::fs::remove_file(&part);
            bail!(
                "download failed: received {} byte(s) out of {}",
                written,
                file.content_length
            );
        }

        std::fs::rename(&part, target)
            .with_context(|| format!("failed to move download into {}", target.display()))?;
        Ok(target.to_path_buf())
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("PRIVATE-TOKEN", self.key.trim())
    }

    fn api_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        method: &str,
        url: &str,
        request: &TReq,
    ) -> Result<TResp> {
        let resp = self.robust_request(|| {
            let req = match method {
                "GET" => self.http.get(url),
                _ => self.http.post(url).json(request),
            };
            self.authorize(req).timeout(self.timeout).send()
        })?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            if let Ok(err_json) = serde_json::from_str::<CdsErrorResponse>(&text) {
                return Err(format_cds_error(status, url, &err_json));
            }
            bail!("API request failed: HTTP {} for url ({})\n{}", status, url, text);
        }

        serde_json::from_str::<TResp>(&text)
            .with_context(|| format!("failed to parse API JSON (url={}, status={})", url, status))
    }

    fn robust_request<F>(&self, f: F) -> Result<Response>
    where
        F: FnMut() -> std::result::Result<Response, reqwest::Error>,
    {
        send_with_retries(f, self.retry_max, self.sleep_max)
    }
}

/// Sends a request, retrying connection errors and transient statuses.
///
/// After `retry_max` attempts the last response (or error) is returned as is.
pub(crate) fn send_with_retries<F>(mut f: F, retry_max: usize, sleep_max: Duration) -> Result<Response>
where
    F: FnMut() -> std::result::Result<Response, reqwest::Error>,
{
    let mut tries = 0usize;
    let mut sleep = Duration::from_secs(1).min(sleep_max);
    loop {
        tries += 1;
        match f() {
            Ok(resp) if retriable_status(resp.status().as_u16()) && tries < retry_max => {
                debug!(status = %resp.status(), tries, "transient status, retrying");
            }
            Ok(resp) => return Ok(resp),
            Err(err) if tries < retry_max => {
                debug!(error = %err, tries, "request failed, retrying");
            }
            Err(err) => return Err(err).context("could not connect"),
        }
        thread::sleep(sleep);
        sleep = backoff(sleep, sleep_max);
    }
}

/// Streams a response body into `part`, returning the number of bytes written.
pub(crate) fn write_body(mut resp: Response, part: &Path, expected: u64, progress: bool) -> Result<u64> {
    let mut out = File::create(part).with_context(|| format!("failed to open {}", part.display()))?;

    let pb = progress.then(|| {
        let pb = ProgressBar::new(expected);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
        ) {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb
    });

    let mut written: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = resp.read(&mut buf).context("download interrupted")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
        if let Some(pb) = &pb {
            pb.inc(n as u64);
        }
    }
    out.flush()?;

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    Ok(written)
}
