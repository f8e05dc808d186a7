use anyhow::Result;
use std::sync::Arc;

use crate::commands::{CommandReport, RangeOptions, StepOptions, build_step, report_step};
use crate::config::IngestConfig;
use crate::external::remote::{RemoteClient, client_for};
use crate::ingest::fetch::FetchStep;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub step: StepOptions,
    pub range: RangeOptions,
    pub remote: String,
    pub local_name: Option<String>,
    pub check_listing: bool,
}

pub fn run(opts: &FetchOptions, cfg: &IngestConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("fetch");
    let range = opts.range.require()?;
    let step = build_step("fetch", &opts.step, range, cfg)?;
    let client: Arc<dyn RemoteClient> = Arc::from(client_for(&opts.remote, cfg.fetch_timeout())?);
    report.detail(format!("remote={}", opts.remote));

    let mut fetch = FetchStep::new(step, client, &opts.remote, cfg.retry_policy())
        .with_local_name(opts.local_name.clone())
        .with_listing(opts.check_listing || cfg.fetch.check_listing);
    let code = fetch.run();
    report_step(&mut report, &fetch.step, code);
    Ok(report)
}
