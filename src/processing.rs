use anyhow::{Result, bail};

use crate::client::RemoteFile;
use crate::util::urljoin;

#[derive(Debug, serde::Deserialize)]
pub(crate) struct Link {
    #[serde(default)]
    rel: Option<String>,
    href: String,
}

fn find_link(links: &[Link], rel: &str) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() == Some(rel))
        .map(|l| l.href.clone())
}

/// Reply to `POST /retrieve/v1/processes/{dataset}/execution`.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct Job {
    #[serde(default, alias = "jobID")]
    pub(crate) job_id: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
}

impl Job {
    pub(crate) fn monitor_url(&self) -> Option<String> {
        find_link(&self.links, "monitor")
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct JobStatus {
    pub(crate) status: String,
    #[serde(default)]
    links: Vec<Link>,
}

impl JobStatus {
    pub(crate) fn results_url(&self) -> Option<String> {
        find_link(&self.links, "results")
    }
}

/// State of a submitted job as reported by the monitor endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Pending,
    Successful,
    Failed,
}

impl JobState {
    pub(crate) fn parse(status: &str) -> Result<Self> {
        match status {
            "accepted" | "running" => Ok(Self::Pending),
            "successful" => Ok(Self::Successful),
            "failed" | "rejected" | "dismissed" | "deleted" => Ok(Self::Failed),
            other => bail!("unknown processing status [{}]", other),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct JobResults {
    asset: Asset,
}

#[derive(Debug, serde::Deserialize)]
struct Asset {
    value: AssetValue,
}

#[derive(Debug, serde::Deserialize)]
struct AssetValue {
    href: String,
    #[serde(rename = "file:size")]
    file_size: u64,
    #[serde(default, rename = "type")]
    content_type: Option<String>,
}

impl JobResults {
    pub(crate) fn to_remote_file(&self, results_url: &str) -> Result<RemoteFile> {
        let href = self.asset.value.href.trim();
        if href.is_empty() {
            bail!("missing results asset href");
        }

        Ok(RemoteFile {
            location: urljoin(results_url, href),
            content_length: self.asset.value.file_size,
            content_type: self.asset.value.content_type.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_monitor_link_is_found() {
        let job: Job = serde_json::from_str(
            r#"{"jobID":"j1","links":[{"rel":"self","href":"a"},{"rel":"monitor","href":"http://h/jobs/j1"}]}"#,
        )
        .unwrap();
        assert_eq!(job.job_id.as_deref(), Some("j1"));
        assert_eq!(job.monitor_url().as_deref(), Some("http://h/jobs/j1"));
    }

    #[test]
    fn test_job_state_parse() {
        assert_eq!(JobState::parse("running").unwrap(), JobState::Pending);
        assert_eq!(JobState::parse("successful").unwrap(), JobState::Successful);
        assert_eq!(JobState::parse("dismissed").unwrap(), JobState::Failed);
        assert!(JobState::parse("sleeping").is_err());
    }

    #[test]
    fn test_results_relative_href_is_joined() {
        let results: JobResults = serde_json::from_str(
            r#"{"asset":{"value":{"href":"/download/x.nc","file:size":2048,"type":"application/netcdf"}}}"#,
        )
        .unwrap();
        let file = results.to_remote_file("http://h/jobs/j1/results").unwrap();
        assert_eq!(file.location, "http://h/jobs/j1/results/download/x.nc");
        assert_eq!(file.content_length, 2048);
    }
}
