use anyhow::Result;

use crate::commands::{CommandReport, RangeOptions};

/// Lists the epochs a step would work on, with the end of each interval.
pub fn run(range: &RangeOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("epochs");
    let range = range.require()?;
    report.detail(format!("period={}", range.period()));
    report.detail(format!("round={}", range.round_method()));
    report.detail(format!("timezone={}", range.timezone()));
    let starts = range.generate(false);
    let ends = range.generate(true);
    report.detail(format!("count={}", starts.len()));
    for (start, end) in starts.iter().zip(&ends) {
        report.detail(format!(
            "{} {}",
            start.format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ")
        ));
    }
    Ok(report)
}
