use crate::ingest::site::SiteId;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Source of RINEX header values for a station at a given instant.
pub trait MetadataProvider: Send + Sync + fmt::Debug {
    fn header_fields(&self, site: &SiteId, at: DateTime<Utc>) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Default, Deserialize)]
struct SiteFile {
    #[serde(default)]
    fields: BTreeMap<String, String>,
    #[serde(default)]
    period: Vec<SitePeriod>,
}

#[derive(Debug, Deserialize)]
struct SitePeriod {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

impl SitePeriod {
    fn covers(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| from <= at) && self.to.is_none_or(|to| at < to)
    }
}

/// One TOML file per station (`<dir>/<site4>.toml`, falling back to the
/// 9-char id). Top-level `[fields]` always apply; each `[[period]]` block
/// whose `from`/`to` window contains the instant overrides them, later
/// blocks winning.
#[derive(Debug, Clone)]
pub struct SiteMetadataDir {
    dir: PathBuf,
}

impl SiteMetadataDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn site_file(&self, site: &SiteId) -> Option<PathBuf> {
        [site.four(), site.nine()]
            .into_iter()
            .flat_map(|id| [id.to_ascii_lowercase(), id.to_string()])
            .map(|id| self.dir.join(format!("{id}.toml")))
            .find(|p| p.is_file())
    }
}

fn load_site_file(path: &Path) -> Result<SiteFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

impl MetadataProvider for SiteMetadataDir {
    fn header_fields(&self, site: &SiteId, at: DateTime<Utc>) -> Result<BTreeMap<String, String>> {
        let Some(path) = self.site_file(site) else {
            anyhow::bail!("no metadata for site {} in {}", site, self.dir.display());
        };
        let parsed = load_site_file(&path)?;
        let mut fields = parsed.fields;
        let mut matched = false;
        for period in parsed.period.iter().filter(|p| p.covers(at)) {
            matched = true;
            fields.extend(period.fields.clone());
        }
        if !matched && !parsed.period.is_empty() {
            anyhow::bail!(
                "no metadata period of site {} covers {}",
                site,
                at.format("%Y-%m-%dT%H:%M:%SZ")
            );
        }
        Ok(fields)
    }
}
