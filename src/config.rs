//! CDS credential resolution.
//!
//! Precedence: explicit values (the `c3s` config section), then the
//! `CDSAPI_URL` / `CDSAPI_KEY` environment variables, then the first
//! `.cdsapirc` found (`CDSAPI_RC`, current directory, home directory).

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, PartialEq)]
pub(crate) struct RcFile {
    pub(crate) url: Option<String>,
    pub(crate) key: Option<String>,
    pub(crate) verify: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Credentials {
    pub(crate) url: String,
    pub(crate) key: String,
    pub(crate) verify: bool,
}

pub(crate) fn resolve_credentials(
    url: Option<String>,
    key: Option<String>,
    verify: Option<bool>,
) -> Result<Credentials> {
    let url = url.or_else(|| std::env::var("CDSAPI_URL").ok());
    let key = key.or_else(|| std::env::var("CDSAPI_KEY").ok());
    merge_rc(url, key, verify, &rc_candidates())
}

fn merge_rc(
    mut url: Option<String>,
    mut key: Option<String>,
    verify: Option<bool>,
    candidates: &[PathBuf],
) -> Result<Credentials> {
    let mut file_verify = None;

    if url.is_none() || key.is_none() || verify.is_none() {
        if let Some(path) = candidates.iter().find(|p| p.exists()) {
            let rc = read_rc(path)
                .with_context(|| format!("failed to read configuration file {}", path.display()))?;
            url = url.or(rc.url);
            key = key.or(rc.key);
            file_verify = rc.verify;
        }
    }

    let searched = || {
        if candidates.is_empty() {
            "create .cdsapirc".to_string()
        } else {
            let list = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("or put it in one of: {}", list)
        }
    };

    let Some(url) = url else {
        bail!("Missing CDS url (set c3s.api_url, CDSAPI_URL {})", searched());
    };
    let Some(key) = key else {
        bail!("Missing CDS key (set c3s.api_key, CDSAPI_KEY {})", searched());
    };

    Ok(Credentials {
        url,
        key,
        verify: verify.or(file_verify).unwrap_or(true),
    })
}

fn read_rc(path: &Path) -> Result<RcFile> {
    Ok(parse_rc(&std::fs::read_to_string(path)?))
}

/// Parses the `key: value` lines of a `.cdsapirc`.
///
/// A key with an empty value takes its value from the next line, which some
/// copy-pasted token files rely on.
pub(crate) fn parse_rc(text: &str) -> RcFile {
    let mut rc = RcFile::default();
    let mut pending: Option<String> = None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, value) = match (pending.take(), line.split_once(':')) {
            (Some(name), _) if !looks_like_entry(line) => (name, line),
            (_, Some((k, v))) => (k.trim().to_string(), v.trim()),
            (_, None) => continue,
        };

        let value = strip_quotes(value);
        if value.is_empty() {
            pending = Some(name);
            continue;
        }

        match name.as_str() {
            "url" => rc.url = Some(value.to_string()),
            "key" => rc.key = Some(value.to_string()),
            "verify" => rc.verify = Some(value != "0"),
            _ => {}
        }
    }

    rc
}

fn looks_like_entry(line: &str) -> bool {
    line.split_once(':')
        .is_some_and(|(k, _)| matches!(k.trim(), "url" | "key" | "verify"))
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return inner;
        }
    }
    s
}

fn rc_candidates() -> Vec<PathBuf> {
    if let Ok(p) = std::env::var("CDSAPI_RC") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".cdsapirc"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".cdsapirc"));
    }
    v
}
