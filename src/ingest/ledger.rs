use crate::error::StepExitCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which side of a row an operation looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Io {
    Input,
    Output,
}

/// One unit of work, typically one file at one epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub file_name: String,
    pub site: String,
    pub epoch_start: Option<DateTime<Utc>>,
    pub epoch_end: Option<DateTime<Utc>>,
    pub ok_input: bool,
    pub ok_output: bool,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub original_path: Option<PathBuf>,
    pub input_size: Option<u64>,
    pub output_size: Option<u64>,
    pub note: String,
}

impl Row {
    pub fn for_epoch(site: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            site: site.to_string(),
            epoch_start: Some(start),
            epoch_end: Some(end),
            ok_input: true,
            ..Self::default()
        }
    }

    pub fn path(&self, io: Io) -> Option<&Path> {
        match io {
            Io::Input => self.input_path.as_deref(),
            Io::Output => self.output_path.as_deref(),
        }
    }

    pub fn set_ok(&mut self, io: Io, ok: bool, size: Option<u64>) {
        match io {
            Io::Input => {
                self.ok_input = ok;
                self.input_size = size;
            }
            Io::Output => {
                self.ok_output = ok;
                self.output_size = size;
            }
        }
    }

    /// Marks the row's output as failed and records why.
    pub fn fail(&mut self, note: impl Into<String>) {
        self.ok_output = false;
        self.output_size = None;
        self.note = note.into();
    }

    pub fn append_note(&mut self, note: &str) {
        if self.note.is_empty() {
            self.note = note.to_string();
        } else {
            self.note = format!("{}; {note}", self.note);
        }
    }

    /// Key used to match a row against ledgers from earlier runs.
    pub fn ledger_key(&self) -> String {
        if !self.file_name.is_empty() {
            return self.file_name.clone();
        }
        let epoch = self
            .epoch_start
            .map(|e| e.to_rfc3339())
            .unwrap_or_default();
        format!("{}@{epoch}", self.site)
    }
}

/// Ordered collection of rows. Order mirrors epoch order and is preserved by
/// every operation; rows only disappear through [`Table::purge`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub total: usize,
    pub ok_input: usize,
    pub ok_output: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Row> {
        self.rows.iter_mut()
    }

    pub fn get(&self, idx: usize) -> Option<&Row> {
        self.rows.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Row> {
        self.rows.get_mut(idx)
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Appends another table's rows after this one's.
    pub fn concat(&mut self, other: Table) {
        self.rows.extend(other.rows);
    }

    /// Indices of rows still eligible for the step's action, in order.
    pub fn pending(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.ok_input)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn counts(&self) -> TableCounts {
        TableCounts {
            total: self.rows.len(),
            ok_input: self.rows.iter().filter(|r| r.ok_input).count(),
            ok_output: self.rows.iter().filter(|r| r.ok_output).count(),
        }
    }

    /// Never redo work whose output already validates.
    pub fn filter_ok_out(&mut self) -> usize {
        let mut skipped = 0usize;
        for row in &mut self.rows {
            if row.ok_input && row.ok_output {
                skipped += 1;
            }
            row.ok_input = row.ok_input && !row.ok_output;
        }
        skipped
    }

    /// Removes every row matching `pred` in one pass. Returns how many went.
    pub fn purge<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&Row) -> bool,
    {
        let before = self.rows.len();
        self.rows.retain(|r| !pred(r));
        before - self.rows.len()
    }

    /// Flags valid outputs smaller than `fraction` of the median valid size
    /// or than `min_bytes`. Returns the number of rows invalidated.
    pub fn invalidate_small_outputs(&mut self, fraction: f64, min_bytes: u64) -> usize {
        let mut sizes = self
            .rows
            .iter()
            .filter(|r| r.ok_output)
            .filter_map(|r| r.output_size)
            .collect::<Vec<_>>();
        if sizes.is_empty() {
            return 0;
        }
        sizes.sort_unstable();
        let median = median_of_sorted(&sizes);
        let threshold = fraction * median;

        let mut invalidated = 0usize;
        for row in &mut self.rows {
            if !row.ok_output {
                continue;
            }
            let Some(size) = row.output_size else {
                continue;
            };
            if (size as f64) < threshold || size < min_bytes {
                row.ok_output = false;
                row.append_note(&format!(
                    "output too small ({size} B, median {median:.0} B)"
                ));
                invalidated += 1;
            }
        }
        invalidated
    }

    /// Status derived from the aggregate input/output flags.
    pub fn exit_code(&self) -> StepExitCode {
        derive_exit_code(self.counts())
    }

    pub fn summary(&self) -> String {
        let counts = self.counts();
        format!(
            "rows={} ok_input={} ok_output={}",
            counts.total, counts.ok_input, counts.ok_output
        )
    }

    pub fn row_lines(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| {
                format!(
                    "{} site={} epoch={} in={} out={} output={} note={}",
                    if r.file_name.is_empty() { "-" } else { &r.file_name },
                    if r.site.is_empty() { "-" } else { &r.site },
                    r.epoch_start
                        .map(|e| e.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    r.ok_input,
                    r.ok_output,
                    r.output_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    if r.note.is_empty() { "-" } else { &r.note },
                )
            })
            .collect()
    }
}

fn median_of_sorted(sizes: &[u64]) -> f64 {
    let mid = sizes.len() / 2;
    if sizes.len() % 2 == 0 {
        (sizes[mid - 1] as f64 + sizes[mid] as f64) / 2.0
    } else {
        sizes[mid] as f64
    }
}

pub fn derive_exit_code(counts: TableCounts) -> StepExitCode {
    let TableCounts {
        total,
        ok_input,
        ok_output,
    } = counts;
    if total == 0 || ok_output == total || ok_input == 0 {
        return StepExitCode::Done;
    }
    match (ok_output == 0, ok_input == total) {
        (true, true) => StepExitCode::FailedAllInput,
        (true, false) => StepExitCode::FailedSomeInput,
        (false, true) => StepExitCode::PartialAllInput,
        (false, false) => StepExitCode::PartialSomeInput,
    }
}
