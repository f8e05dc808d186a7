//! Remote file sources: an HTTP(S) server with directory listings, or a
//! locally mounted mirror. Both expose the same small surface so the fetch
//! step never cares which one it talks to.

use anyhow::{Context, Result};
use regex::Regex;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub trait RemoteClient: Send + Sync + fmt::Debug {
    /// Identifier used for the per-host lock.
    fn host(&self) -> &str;
    fn ping(&self) -> Result<()>;
    /// File names available in `directory`.
    fn list(&self, directory: &str) -> Result<Vec<String>>;
    /// Downloads `location` into `dest_dir`, returning the written path.
    fn fetch(&self, location: &str, dest_dir: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Runs `op` up to `retries + 1` times, sleeping `delay * attempt` between
/// failures. The last error is returned with the attempt count attached.
pub fn with_retries<T, F>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Result<T>,
{
    let mut last_err = None;
    for attempt in 0..=policy.retries {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(target: "remote", label, attempt, error = %format!("{err:#}"), "attempt failed");
                last_err = Some(err);
            }
        }
        if attempt < policy.retries {
            thread::sleep(policy.delay * (attempt as u32 + 1));
        }
    }
    let Some(err) = last_err else {
        anyhow::bail!("{label}: no attempt was made");
    };
    Err(err.context(format!("{label} failed after {} attempts", policy.retries + 1)))
}

/// Last path segment of a URL or path.
pub fn basename(location: &str) -> &str {
    let trimmed = location.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Everything up to and including the last `/`.
pub fn parent_location(location: &str) -> &str {
    match location.rfind('/') {
        Some(idx) => &location[..=idx],
        None => "",
    }
}

/// Writes `bytes` next to its destination first and renames into place.
fn write_atomically(dest_dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;
    let target = dest_dir.join(name);
    let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)
        .with_context(|| format!("failed to create temp file in {}", dest_dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write {}", target.display()))?;
    tmp.persist(&target)
        .with_context(|| format!("failed to persist {}", target.display()))?;
    Ok(target)
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)href\s*=\s*["']([^"'?#]+)["']"#).expect("href regex is valid")
    })
}

/// File names linked from an HTML index page. Directories and parent links
/// are dropped.
pub fn parse_listing(html: &str) -> Vec<String> {
    let mut names = Vec::new();
    for caps in href_re().captures_iter(html) {
        let href = &caps[1];
        if href.ends_with('/') || href.starts_with("..") {
            continue;
        }
        let name = basename(href);
        if name.is_empty() || names.iter().any(|n| n == name) {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

#[derive(Debug)]
pub struct HttpClient {
    host: String,
    base: String,
    client: reqwest::blocking::Client,
}

impl HttpClient {
    pub fn new(location: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(location)
            .with_context(|| format!("invalid remote url `{location}`"))?;
        let host = url
            .host_str()
            .map(str::to_string)
            .with_context(|| format!("remote url `{location}` has no host"))?;
        let mut base = url.clone();
        base.set_path("/");
        base.set_query(None);
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gnss-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            host,
            base: base.to_string(),
            client,
        })
    }
}

impl RemoteClient for HttpClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn ping(&self) -> Result<()> {
        let resp = self
            .client
            .head(&self.base)
            .send()
            .with_context(|| format!("{} is unreachable", self.host))?;
        debug!(host = %self.host, status = %resp.status(), "ping");
        Ok(())
    }

    fn list(&self, directory: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(directory)
            .send()
            .with_context(|| format!("failed to list {directory}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("listing {directory} returned http status {}", resp.status());
        }
        let body = resp
            .text()
            .with_context(|| format!("failed to read listing {directory}"))?;
        Ok(parse_listing(&body))
    }

    fn fetch(&self, location: &str, dest_dir: &Path) -> Result<PathBuf> {
        let resp = self
            .client
            .get(location)
            .send()
            .with_context(|| format!("failed to request {location}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("{location} returned http status {}", resp.status());
        }
        let bytes = resp
            .bytes()
            .with_context(|| format!("failed to read body of {location}"))?;
        write_atomically(dest_dir, basename(location), &bytes)
    }
}

/// A directory tree standing in for a remote server.
#[derive(Debug)]
pub struct LocalMirror {
    host: String,
}

impl LocalMirror {
    pub fn new(root: &Path) -> Self {
        Self {
            host: format!("local-{}", root.display()),
        }
    }

    fn resolve(location: &str) -> PathBuf {
        PathBuf::from(location.strip_prefix("file://").unwrap_or(location))
    }
}

impl RemoteClient for LocalMirror {
    fn host(&self) -> &str {
        &self.host
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn list(&self, directory: &str) -> Result<Vec<String>> {
        let dir = Self::resolve(directory);
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))? {
            let entry = entry?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn fetch(&self, location: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = Self::resolve(location);
        let bytes =
            fs::read(&source).with_context(|| format!("failed to read {}", source.display()))?;
        write_atomically(dest_dir, basename(location), &bytes)
    }
}

/// Picks a client from the shape of a remote template: `http(s)://` goes to
/// [`HttpClient`], anything else is a local mirror.
pub fn client_for(template: &str, timeout: Duration) -> Result<Box<dyn RemoteClient>> {
    let lower = template.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(Box::new(HttpClient::new(template, timeout)?));
    }
    let path = LocalMirror::resolve(template);
    let root = path
        .components()
        .take_while(|c| !c.as_os_str().to_string_lossy().contains(['%', '<']))
        .collect::<PathBuf>();
    Ok(Box::new(LocalMirror::new(&root)))
}
