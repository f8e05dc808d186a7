use crate::error::{IngestError, StepExitCode};
use crate::ingest::compress;
use crate::ingest::converter::{
    ConvertRequest, Converter, ConverterRegistry, DispatchOutcome, DispatchSettings, dispatch,
};
use crate::ingest::epoch::RollingRef;
use crate::ingest::files::TransferMode;
use crate::ingest::ledger::{Io, Row, Table};
use crate::ingest::step::Step;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_MERGE_CONVERTER: &str = "gfzrnx-merge";

/// Joins short files into one file per site and window. Windows are one
/// period long and anchored on the calendar, or on a rolling reference.
#[derive(Debug, Clone)]
pub struct MergeStep {
    pub step: Step,
    converter: Arc<dyn Converter>,
    output_name: String,
    rolling: Option<RollingRef>,
    dispatch: DispatchSettings,
    groups: Vec<Vec<PathBuf>>,
}

impl MergeStep {
    pub fn new(
        step: Step,
        registry: &ConverterRegistry,
        converter: Option<&str>,
        output_name: &str,
        dispatch: DispatchSettings,
    ) -> Result<Self, IngestError> {
        let converter = registry.get(converter.unwrap_or(DEFAULT_MERGE_CONVERTER))?;
        Ok(Self {
            step,
            converter,
            output_name: output_name.to_string(),
            rolling: None,
            dispatch,
            groups: Vec::new(),
        })
    }

    pub fn with_rolling(mut self, rolling: Option<RollingRef>) -> Self {
        self.rolling = rolling;
        self
    }

    /// Member files of each row, aligned with the step table.
    pub fn groups(&self) -> &[Vec<PathBuf>] {
        &self.groups
    }

    /// Replaces the table with one row per (site, window) group. Missing
    /// files and files without an epoch become rows of their own with
    /// `ok_input=false`.
    pub fn group_files(&mut self, files: &[PathBuf]) {
        self.step.load_from_file_list(files);
        self.step.apply_name_filter();
        let rows = self.step.table().rows().to_vec();

        let dated = rows
            .iter()
            .filter(|r| r.ok_input)
            .filter_map(|r| r.epoch_start)
            .collect::<Vec<_>>();
        let windows = self.step.epoch_range().round_epochs(&dated, self.rolling);
        let mut window_of = windows.into_iter();

        let mut grouped: BTreeMap<(String, DateTime<Utc>), Vec<Row>> = BTreeMap::new();
        let mut rejected = Vec::new();
        for row in rows {
            if !row.ok_input {
                rejected.push(row);
                continue;
            }
            if row.epoch_start.is_none() {
                let mut row = row;
                row.ok_input = false;
                row.note = "no epoch for input".to_string();
                rejected.push(row);
                continue;
            }
            let Some(window) = window_of.next() else {
                continue;
            };
            grouped.entry((row.site.clone(), window)).or_default().push(row);
        }

        let period = self.step.epoch_range().period().duration();
        let tick = self.step.epoch_range().tick();
        let mut table = Table::new();
        let mut groups = Vec::new();
        for ((site, window), members) in grouped {
            let paths = members
                .iter()
                .filter_map(|r| r.input_path.clone())
                .collect::<Vec<_>>();
            table.push(Row {
                site,
                epoch_start: Some(window),
                epoch_end: window
                    .checked_add_signed(period)
                    .and_then(|e| e.checked_sub_signed(tick)),
                ok_input: true,
                input_path: paths.first().cloned(),
                input_size: Some(members.iter().filter_map(|r| r.input_size).sum()),
                ..Row::default()
            });
            groups.push(paths);
        }
        for row in rejected {
            warn!(step = %self.step.name(), file = %row.file_name, note = %row.note, "input left out of merge");
            table.push(row);
            groups.push(Vec::new());
        }
        debug!(step = %self.step.name(), groups = table.len(), "merge groups built");
        self.step.replace_table(table);
        self.groups = groups;
    }

    pub fn run_on_files(&mut self, files: &[PathBuf]) -> StepExitCode {
        self.group_files(files);
        self.run()
    }

    pub fn run(&mut self) -> StepExitCode {
        for idx in self.step.table().pending() {
            if let Some(dest) = self.step.guess_output_path(idx, &self.output_name) {
                if let Some(row) = self.step.table_mut().get_mut(idx) {
                    row.file_name = dest
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                }
                self.step.check_local_exists(idx, Io::Output);
            }
        }
        self.step.filter_ok_out();
        self.step.filter_previous_run();

        let pending = self.step.table().pending();
        if pending.is_empty() {
            self.step.log_table();
            return self.step.exit_code();
        }
        let scratch = match self.step.scratch_dir("merge") {
            Ok(dir) => dir,
            Err(err) => {
                for idx in pending {
                    self.step.fail_row(idx, "STAGING", &format!("{err:#}"));
                }
                return self.step.exit_code();
            }
        };
        for idx in pending {
            self.merge_row(idx, &scratch);
            self.step.record(idx);
        }
        if let Err(err) = fs::remove_dir_all(&scratch) {
            warn!(step = %self.step.name(), dir = %scratch.display(), error = %err, "could not remove scratch dir");
        }
        self.step.invalidate_small_outputs();
        self.step.log_table();
        self.step.exit_code()
    }

    fn merge_row(&mut self, idx: usize, scratch: &Path) {
        let Some(dest) = self.step.table().get(idx).and_then(|r| r.output_path.clone()) else {
            return;
        };
        let members = self.groups.get(idx).cloned().unwrap_or_default();
        let timeout = self.step.settings().decompress_timeout;
        let mut inputs = Vec::with_capacity(members.len());
        for member in &members {
            match compress::decompress_file(member, scratch, timeout) {
                Ok(done) => inputs.push(done.path),
                Err(err) => {
                    self.step.fail_row(idx, "DECOMPRESS", &format!("{err:#}"));
                    return;
                }
            }
        }
        let name = self
            .step
            .table()
            .get(idx)
            .map(|r| r.file_name.clone())
            .unwrap_or_default();
        let work_dir = scratch.join(format!("group{idx}"));
        let options = self.step.options().clone();
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: &work_dir,
            output: Some(&name),
            options: &options,
        };
        match dispatch(self.converter.as_ref(), &req, &self.dispatch) {
            DispatchOutcome::Produced(path) => {
                if let Some(row) = self.step.table_mut().get_mut(idx) {
                    row.output_path = Some(path);
                }
            }
            DispatchOutcome::Failed(reason) => {
                self.step.fail_row(idx, "MERGE_FAILED", &reason);
                return;
            }
        }
        if self
            .step
            .move_or_copy(idx, &dest, TransferMode::Move, true)
            .is_some()
        {
            if self.step.check_local_exists(idx, Io::Output) {
                info!(
                    step = %self.step.name(),
                    output = %dest.display(),
                    members = members.len(),
                    "merged"
                );
            } else {
                self.step.fail_row(idx, "EMPTY_OUTPUT", "merge produced an empty file");
            }
        }
    }
}
