pub mod convert;
pub mod epochs;
pub mod fetch;
pub mod merge;
pub mod split;
pub mod status;
pub mod tag;

use crate::config::IngestConfig;
use crate::error::{IngestError, StepExitCode};
use crate::ingest::epoch::{EpochRange, Period, parse_instant, parse_timezone};
use crate::ingest::site::SiteId;
use crate::ingest::step::{Step, StepDirs};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub exit_code: i32,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            exit_code: 0,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Schedule flags shared by every step command.
#[derive(Debug, Clone)]
pub struct RangeOptions {
    pub start: Option<String>,
    pub end: Option<String>,
    pub epochs: Vec<String>,
    pub period: String,
    pub round: String,
    pub tz: String,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            epochs: Vec::new(),
            period: "1d".to_string(),
            round: "floor".to_string(),
            tz: "UTC".to_string(),
        }
    }
}

impl RangeOptions {
    /// Explicit `epochs` win over `start`/`end`. With neither the range is
    /// the invalid sentinel, which file-driven steps accept.
    pub fn build(&self) -> Result<EpochRange, IngestError> {
        let tz = parse_timezone(&self.tz)?;
        let period = Period::parse(&self.period)?;
        let now = Utc::now();
        if !self.epochs.is_empty() {
            let epochs = self
                .epochs
                .iter()
                .map(|raw| parse_instant(raw, tz, now))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(EpochRange::manual(epochs, period, tz));
        }
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => {
                EpochRange::from_strings(start, end, &self.period, &self.round, &self.tz, now)
            }
            (Some(start), None) => {
                EpochRange::from_strings(start, "now", &self.period, &self.round, &self.tz, now)
            }
            (None, Some(_)) => Err(IngestError::InvalidConfig(
                "--end needs --start".to_string(),
            )),
            (None, None) => Ok(EpochRange::invalid(period, tz)),
        }
    }

    /// Like [`RangeOptions::build`] but a missing schedule is an error.
    pub fn require(&self) -> Result<EpochRange, IngestError> {
        let range = self.build()?;
        if !range.is_valid() {
            return Err(IngestError::InvalidConfig(
                "this command needs --start/--end or --epoch".to_string(),
            ));
        }
        Ok(range)
    }
}

/// Flags that configure the step itself rather than its schedule.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub out_dir: String,
    pub inp_dir: Option<String>,
    pub site: Option<String>,
    pub session: Vec<String>,
    pub fields: Vec<String>,
    pub options: Vec<String>,
    pub filter: Option<String>,
}

/// Parses repeated `KEY=VALUE` flags.
pub fn parse_pairs(raw: &[String]) -> Result<BTreeMap<String, String>, IngestError> {
    let mut out = BTreeMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            return Err(IngestError::InvalidConfig(format!(
                "expected KEY=VALUE, got `{item}`"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(IngestError::InvalidConfig(format!(
                "empty key in `{item}`"
            )));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

pub fn build_step(
    name: &str,
    opts: &StepOptions,
    range: EpochRange,
    cfg: &IngestConfig,
) -> Result<Step, IngestError> {
    let site = opts.site.as_deref().map(SiteId::parse).transpose()?;
    let dirs = StepDirs {
        out: opts.out_dir.clone(),
        tmp: cfg.paths.tmp_dir.clone(),
        log: cfg.paths.log_dir.clone(),
        inp: opts.inp_dir.clone(),
    };
    Step::new(name, dirs, range, cfg.step_settings())
        .with_site(site)
        .with_session(parse_pairs(&opts.session)?)
        .with_site_fields(parse_pairs(&opts.fields)?)
        .with_options(parse_pairs(&opts.options)?)
        .with_name_filter(opts.filter.as_deref())
}

/// Explicit files win; otherwise every regular file of the step's input
/// directory is taken, sorted by name.
pub fn input_files(step: &Step, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !files.is_empty() {
        return Ok(files.to_vec());
    }
    let Some(dir) = step.inp_dir(None)? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Copies the ledger summary, one line per row, and the failed rows into
/// the report. The exit code becomes the report's.
pub fn report_step(report: &mut CommandReport, step: &Step, code: StepExitCode) {
    report.exit_code = code.code();
    report.detail(format!("status={}", code.as_str()));
    report.detail(step.summary());
    for line in step.table().row_lines() {
        report.detail(line);
    }
    for row in step.table().iter().filter(|r| r.ok_input && !r.ok_output) {
        report.issue(format!("{}: {}", row.file_name, row.note));
    }
    if code != StepExitCode::Done {
        report.ok = false;
    }
}
