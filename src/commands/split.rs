use anyhow::Result;
use std::path::PathBuf;

use crate::commands::{CommandReport, RangeOptions, StepOptions, build_step, report_step};
use crate::config::IngestConfig;
use crate::ingest::split::SplitStep;

#[derive(Debug, Clone, Default)]
pub struct SplitOptions {
    pub step: StepOptions,
    pub range: RangeOptions,
    pub input: PathBuf,
    pub converter: Option<String>,
    pub output_name: String,
}

pub fn run(opts: &SplitOptions, cfg: &IngestConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("split");
    let range = opts.range.require()?;
    let step = build_step("split", &opts.step, range, cfg)?;
    let registry = cfg.registry()?;
    report.detail(format!("input={}", opts.input.display()));

    let mut split = SplitStep::new(
        step,
        &registry,
        opts.converter.as_deref(),
        &opts.input,
        &opts.output_name,
        cfg.dispatch_settings(),
    )?;
    let code = split.run();
    report_step(&mut report, &split.step, code);
    Ok(report)
}
