use anyhow::Result;
use std::path::PathBuf;

use crate::commands::{CommandReport, RangeOptions, StepOptions, build_step, input_files, report_step};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::ingest::epoch::{RollingRef, parse_instant, parse_timezone};
use crate::ingest::merge::MergeStep;

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub step: StepOptions,
    pub range: RangeOptions,
    pub files: Vec<PathBuf>,
    pub converter: Option<String>,
    pub output_name: String,
    pub rolling: Option<String>,
}

/// An integer selects an epoch by index (negative from the end); anything
/// else is read as an instant.
fn parse_rolling(raw: &str, tz: &str) -> Result<RollingRef, IngestError> {
    if let Ok(idx) = raw.trim().parse::<isize>() {
        return Ok(RollingRef::Index(idx));
    }
    let tz = parse_timezone(tz)?;
    Ok(RollingRef::Instant(parse_instant(raw, tz, chrono::Utc::now())?))
}

pub fn run(opts: &MergeOptions, cfg: &IngestConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("merge");
    let rolling = opts
        .rolling
        .as_deref()
        .map(|raw| parse_rolling(raw, &opts.range.tz))
        .transpose()?;
    let step = build_step("merge", &opts.step, opts.range.build()?, cfg)?;
    let files = input_files(&step, &opts.files)?;
    let registry = cfg.registry()?;
    report.detail(format!("inputs={}", files.len()));

    let mut merge = MergeStep::new(
        step,
        &registry,
        opts.converter.as_deref(),
        &opts.output_name,
        cfg.dispatch_settings(),
    )?
    .with_rolling(rolling);
    let code = merge.run_on_files(&files);
    report_step(&mut report, &merge.step, code);
    Ok(report)
}
