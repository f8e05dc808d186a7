use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::commands::{CommandReport, RangeOptions, StepOptions, build_step, input_files, report_step};
use crate::config::IngestConfig;
use crate::external::metadata::{MetadataProvider, SiteMetadataDir};
use crate::ingest::tag::TagStep;

#[derive(Debug, Clone, Default)]
pub struct TagOptions {
    pub step: StepOptions,
    pub range: RangeOptions,
    pub files: Vec<PathBuf>,
    pub converter: Option<String>,
    pub output_name: Option<String>,
    pub metadata_dir: Option<PathBuf>,
}

pub fn run(opts: &TagOptions, cfg: &IngestConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("tag");
    let metadata_dir = opts
        .metadata_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.metadata_dir));
    report.detail(format!("metadata_dir={}", metadata_dir.display()));
    let provider: Arc<dyn MetadataProvider> = Arc::new(SiteMetadataDir::new(metadata_dir));

    let step = build_step("tag", &opts.step, opts.range.build()?, cfg)?.with_metadata(Some(provider));
    let files = input_files(&step, &opts.files)?;
    let registry = cfg.registry()?;
    report.detail(format!("inputs={}", files.len()));

    let mut tag = TagStep::new(
        step,
        &registry,
        opts.converter.as_deref(),
        opts.output_name.as_deref(),
        cfg.dispatch_settings(),
    )?;
    let code = tag.run_on_files(&files);
    report_step(&mut report, &tag.step, code);
    Ok(report)
}
