use crate::error::{IngestError, StepExitCode};
use crate::ingest::compress;
use crate::ingest::converter::{
    ConvertRequest, Converter, ConverterRegistry, DispatchOutcome, DispatchSettings, dispatch,
};
use crate::ingest::files::TransferMode;
use crate::ingest::ledger::Io;
use crate::ingest::site::infer_from_filename;
use crate::ingest::step::Step;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_SPLIT_CONVERTER: &str = "gfzrnx-split";

/// Cuts one long file into one file per epoch of the step's range.
#[derive(Debug, Clone)]
pub struct SplitStep {
    pub step: Step,
    converter: Arc<dyn Converter>,
    input: PathBuf,
    output_name: String,
    dispatch: DispatchSettings,
}

impl SplitStep {
    /// Without an explicit step site the site is read from the input name.
    pub fn new(
        step: Step,
        registry: &ConverterRegistry,
        converter: Option<&str>,
        input: &Path,
        output_name: &str,
        dispatch: DispatchSettings,
    ) -> Result<Self, IngestError> {
        let converter = registry.get(converter.unwrap_or(DEFAULT_SPLIT_CONVERTER))?;
        let step = if step.site().is_none() {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let site = infer_from_filename(&name).site;
            step.with_site(site)
        } else {
            step
        };
        Ok(Self {
            step,
            converter,
            input: input.to_path_buf(),
            output_name: output_name.to_string(),
            dispatch,
        })
    }

    pub fn run(&mut self) -> StepExitCode {
        self.step.init_table();
        let input_size = fs::metadata(&self.input)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len());
        for idx in 0..self.step.table().len() {
            if let Some(row) = self.step.table_mut().get_mut(idx) {
                row.input_path = Some(self.input.clone());
                row.set_ok(Io::Input, input_size.is_some(), input_size);
                if input_size.is_none() {
                    row.note = "input missing".to_string();
                }
            }
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
        if input_size.is_none() {
            warn!(step = %self.step.name(), file = %self.input.display(), "input file missing");
        }
        self.step.filter_ok_out();
        self.step.filter_previous_run();

        let pending = self.step.table().pending();
        if pending.is_empty() {
            self.step.log_table();
            return self.step.exit_code();
        }
        let staged = self
            .step
            .scratch_dir("split")
            .and_then(|dir| {
                let timeout = self.step.settings().decompress_timeout;
                compress::decompress_file(&self.input, &dir, timeout).map(|d| (dir, d.path))
            });
        let (scratch, source) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                for idx in pending {
                    self.step.fail_row(idx, "DECOMPRESS", &format!("{err:#}"));
                    self.step.record(idx);
                }
                self.step.log_table();
                return self.step.exit_code();
            }
        };
        for idx in pending {
            self.split_row(idx, &scratch, &source);
            self.step.record(idx);
        }
        if let Err(err) = fs::remove_dir_all(&scratch) {
            warn!(step = %self.step.name(), dir = %scratch.display(), error = %err, "could not remove scratch dir");
        }
        self.step.invalidate_small_outputs();
        self.step.log_table();
        self.step.exit_code()
    }

    fn split_row(&mut self, idx: usize, scratch: &Path, source: &Path) {
        let Some(row) = self.step.table().get(idx).cloned() else {
            return;
        };
        let (Some(dest), Some(start)) = (row.output_path.clone(), row.epoch_start) else {
            return;
        };
        let mut options = self.step.options().clone();
        options.insert(
            "epoch_beg".to_string(),
            start.format("%Y%m%d_%H%M%S").to_string(),
        );
        options.insert(
            "duration".to_string(),
            self.step.epoch_range().period().as_secs().to_string(),
        );
        let inputs = [source.to_path_buf()];
        let work_dir = scratch.join(format!("part{idx}"));
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: &work_dir,
            output: Some(&row.file_name),
            options: &options,
        };
        match dispatch(self.converter.as_ref(), &req, &self.dispatch) {
            DispatchOutcome::Produced(path) => {
                if let Some(row) = self.step.table_mut().get_mut(idx) {
                    row.output_path = Some(path);
                }
            }
            DispatchOutcome::Failed(reason) => {
                self.step.fail_row(idx, "SPLIT_FAILED", &reason);
                return;
            }
        }
        if self
            .step
            .move_or_copy(idx, &dest, TransferMode::Move, true)
            .is_some()
        {
            if self.step.check_local_exists(idx, Io::Output) {
                info!(step = %self.step.name(), output = %dest.display(), "split");
            } else {
                self.step.fail_row(idx, "EMPTY_OUTPUT", "split produced an empty file");
            }
        }
    }
}
