use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::commands::{CommandReport, RangeOptions, StepOptions, build_step, input_files, report_step};
use crate::config::IngestConfig;
use crate::ingest::convert::ConvertStep;

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub step: StepOptions,
    pub range: RangeOptions,
    pub files: Vec<PathBuf>,
    pub converter: Option<String>,
    pub output_name: Option<String>,
    pub workers: Option<usize>,
}

pub fn run(opts: &ConvertOptions, cfg: &IngestConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("convert");
    let step = build_step("convert", &opts.step, opts.range.build()?, cfg)?;
    let files = input_files(&step, &opts.files)?;
    let registry = Arc::new(cfg.registry()?);
    let workers = opts.workers.unwrap_or(cfg.convert.workers as usize);
    report.detail(format!("inputs={}", files.len()));
    report.detail(format!("workers={workers}"));

    let mut convert = ConvertStep::new(step, registry, opts.converter.clone(), cfg.dispatch_settings())?
        .with_output_name(opts.output_name.clone());
    let code = convert.run_batch(&files, workers);
    report_step(&mut report, &convert.step, code);
    Ok(report)
}
