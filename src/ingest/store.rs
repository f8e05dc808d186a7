//! Persisted ledgers: one CSV file per step invocation, one row appended and
//! flushed as soon as the row is processed. Later runs read every ledger of
//! the same step to skip work already done, including outputs that were
//! renamed on success and cannot be guessed up front.

use crate::ingest::ledger::{Row, Table};
use crate::ingest::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

pub const LEDGER_SUFFIX: &str = ".ledger.csv";

/// How a success recorded by an earlier run is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyPolicy {
    /// A recorded success is enough.
    #[default]
    Union,
    /// A recorded success counts only while its output still exists.
    Verified,
}

impl FromStr for IdempotencyPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "union" => Ok(Self::Union),
            "verified" => Ok(Self::Verified),
            other => Err(format!("unknown idempotency policy `{other}`")),
        }
    }
}

pub fn ledger_file_name(step: &str, tag: Option<&str>, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%dT%H%M%S");
    let pid = std::process::id();
    match tag {
        Some(tag) => format!("{stamp}_{pid}_{tag}_{step}{LEDGER_SUFFIX}"),
        None => format!("{stamp}_{pid}_{step}{LEDGER_SUFFIX}"),
    }
}

/// Appends one row to `path`, writing the header first when the file is new.
pub fn append_row(path: &Path, row: &Row) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    writer
        .serialize(row)
        .with_context(|| format!("failed to write ledger row to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

/// Every ledger file written by `step` under `log_dir`, oldest first.
pub fn ledger_files(log_dir: &Path, step: &str) -> Result<Vec<PathBuf>> {
    if !log_dir.is_dir() {
        return Ok(Vec::new());
    }
    let suffix = format!("_{step}{LEDGER_SUFFIX}");
    let mut files = Vec::new();
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("failed to read {}", log_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(&suffix) && entry.path().is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Loads and concatenates every ledger of `step`. Malformed lines are
/// reported and skipped.
pub fn load_previous(log_dir: &Path, step: &str) -> Result<Table> {
    let mut table = Table::new();
    for path in ledger_files(log_dir, step)? {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        for (line, record) in reader.deserialize::<Row>().enumerate() {
            match record {
                Ok(row) => table.push(row),
                Err(err) => {
                    let file = path.display().to_string();
                    let line = (line + 2).to_string();
                    let err = err.to_string();
                    warn::emit(WarnEvent {
                        code: "LEDGER_PARSE",
                        step,
                        action: "skip-line",
                        file: &file,
                        retry: &line,
                        reason: "malformed ledger line",
                        err: &err,
                        ..WarnEvent::default()
                    });
                }
            }
        }
    }
    debug!(step, rows = table.len(), "loaded previous ledgers");
    Ok(table)
}

/// Disables rows that an earlier run already completed. Under
/// [`IdempotencyPolicy::Verified`] a recorded success is only honored when
/// its output path still exists. Returns the number of rows skipped.
pub fn filter_previous_run_table(
    table: &mut Table,
    previous: &Table,
    policy: IdempotencyPolicy,
) -> usize {
    let mut done: HashMap<String, &Row> = HashMap::new();
    for row in previous.iter() {
        let key = row.ledger_key();
        if row.ok_output {
            done.insert(key, row);
        } else {
            done.remove(&key);
        }
    }

    let mut skipped = 0usize;
    for row in table.iter_mut() {
        if !row.ok_input {
            continue;
        }
        let Some(prior) = done.get(&row.ledger_key()) else {
            continue;
        };
        let output = prior.output_path.as_ref();
        if policy == IdempotencyPolicy::Verified && !output.is_some_and(|p| p.exists()) {
            continue;
        }
        row.ok_input = false;
        row.ok_output = true;
        if row.output_path.is_none() {
            row.output_path = prior.output_path.clone();
        }
        if row.output_size.is_none() {
            row.output_size = prior.output_size;
        }
        row.append_note("done in previous run");
        skipped += 1;
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn row(name: &str, ok_output: bool, output: Option<&Path>) -> Row {
        Row {
            file_name: name.to_string(),
            site: "MLVL".to_string(),
            ok_input: true,
            ok_output,
            output_path: output.map(Path::to_path_buf),
            output_size: output.map(|_| 42),
            ..Row::default()
        }
    }

    #[test]
    fn appended_rows_read_back_across_files() {
        let dir = tempdir().expect("tempdir");
        let first = dir.path().join("20240101T000000_1_fetch.ledger.csv");
        let second = dir.path().join("20240102T000000_2_fetch.ledger.csv");
        let other = dir.path().join("20240102T000000_2_convert.ledger.csv");
        append_row(&first, &row("a.Z", true, Some(Path::new("/data/a.Z")))).expect("append");
        append_row(&first, &row("b.Z", false, None)).expect("append");
        append_row(&second, &row("b.Z", true, Some(Path::new("/data/b.Z")))).expect("append");
        append_row(&other, &row("c.Z", true, None)).expect("append");

        let table = load_previous(dir.path(), "fetch").expect("load");
        let names = table.iter().map(|r| r.file_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a.Z", "b.Z", "b.Z"]);
        assert_eq!(
            table.get(0).and_then(|r| r.output_path.clone()),
            Some(PathBuf::from("/data/a.Z"))
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("20240101T000000_1_fetch.ledger.csv");
        append_row(&path, &row("a.Z", true, None)).expect("append");
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        writeln!(file, "garbage-without-enough-columns").expect("write");
        append_row(&path, &row("b.Z", true, None)).expect("append");

        let table = load_previous(dir.path(), "fetch").expect("load");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn missing_log_dir_is_an_empty_history() {
        let dir = tempdir().expect("tempdir");
        let table = load_previous(&dir.path().join("nope"), "fetch").expect("load");
        assert!(table.is_empty());
    }

    #[test]
    fn union_policy_trusts_recorded_success() {
        let previous = Table::from_rows(vec![row("a.Z", true, Some(Path::new("/gone/a.Z")))]);
        let mut table = Table::from_rows(vec![row("a.Z", false, None), row("b.Z", false, None)]);
        let skipped = filter_previous_run_table(&mut table, &previous, IdempotencyPolicy::Union);
        assert_eq!(skipped, 1);
        let first = table.get(0).expect("row");
        assert!(!first.ok_input);
        assert!(first.ok_output);
        assert_eq!(first.output_path, Some(PathBuf::from("/gone/a.Z")));
        assert!(table.get(1).expect("row").ok_input);
    }

    #[test]
    fn verified_policy_requires_output_on_disk() {
        let dir = tempdir().expect("tempdir");
        let kept = dir.path().join("a.rnx");
        fs::write(&kept, b"rinex").expect("write");
        let previous = Table::from_rows(vec![
            row("a.Z", true, Some(&kept)),
            row("b.Z", true, Some(&dir.path().join("b.rnx"))),
        ]);
        let mut table = Table::from_rows(vec![row("a.Z", false, None), row("b.Z", false, None)]);
        let skipped = filter_previous_run_table(&mut table, &previous, IdempotencyPolicy::Verified);
        assert_eq!(skipped, 1);
        assert!(!table.get(0).expect("row").ok_input);
        assert!(table.get(1).expect("row").ok_input);
    }

    #[test]
    fn later_failure_supersedes_earlier_success() {
        let previous = Table::from_rows(vec![row("a.Z", true, None), row("a.Z", false, None)]);
        let mut table = Table::from_rows(vec![row("a.Z", false, None)]);
        assert_eq!(
            filter_previous_run_table(&mut table, &previous, IdempotencyPolicy::Union),
            0
        );
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("Verified".parse::<IdempotencyPolicy>(), Ok(IdempotencyPolicy::Verified));
        assert!("strict".parse::<IdempotencyPolicy>().is_err());
    }
}
