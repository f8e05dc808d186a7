use crate::error::{IngestError, StepExitCode};
use crate::ingest::converter::{ConvertRequest, ConverterRegistry, DispatchOutcome, DispatchSettings, dispatch};
use crate::ingest::files::{self, TransferMode};
use crate::ingest::ledger::{Io, Row, Table};
use crate::ingest::step::Step;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Converts raw receiver files into RINEX through registered converters.
#[derive(Debug, Clone)]
pub struct ConvertStep {
    pub step: Step,
    registry: Arc<ConverterRegistry>,
    converter: Option<String>,
    output_name: Option<String>,
    dispatch: DispatchSettings,
}

impl ConvertStep {
    /// An explicit converter name is resolved here so a typo fails before
    /// any file is touched.
    pub fn new(
        step: Step,
        registry: Arc<ConverterRegistry>,
        converter: Option<String>,
        dispatch: DispatchSettings,
    ) -> Result<Self, IngestError> {
        if let Some(name) = &converter {
            registry.get(name)?;
        }
        Ok(Self {
            step,
            registry,
            converter,
            output_name: None,
            dispatch,
        })
    }

    /// Final name template for converted files. Without one the converter's
    /// own product name is kept.
    pub fn with_output_name(mut self, template: Option<String>) -> Self {
        self.output_name = template;
        self
    }

    pub fn run_on_files(&mut self, files: &[PathBuf]) -> StepExitCode {
        self.step.load_from_file_list(files);
        self.run()
    }

    /// Converts every pending row of the current table.
    pub fn run(&mut self) -> StepExitCode {
        self.step.apply_name_filter();
        if let Some(template) = self.output_name.clone() {
            for idx in self.step.table().pending() {
                if self.step.guess_output_path(idx, &template).is_some() {
                    self.step.check_local_exists(idx, Io::Output);
                }
            }
        }
        self.step.filter_ok_out();
        self.step.filter_previous_run();

        let pending = self.step.table().pending();
        if pending.is_empty() {
            self.step.log_table();
            return self.step.exit_code();
        }
        let scratch = match self.step.scratch_dir("convert") {
            Ok(dir) => dir,
            Err(err) => {
                for idx in pending {
                    self.step.fail_row(idx, "STAGING", &format!("{err:#}"));
                }
                return self.step.exit_code();
            }
        };
        for idx in pending {
            self.convert_row(idx, &scratch);
            self.step.record(idx);
        }
        if let Err(err) = fs::remove_dir_all(&scratch) {
            warn!(step = %self.step.name(), dir = %scratch.display(), error = %err, "could not remove scratch dir");
        }
        self.step.invalidate_small_outputs();
        self.step.log_table();
        self.step.exit_code()
    }

    fn convert_row(&mut self, idx: usize, scratch: &Path) {
        let Some(input) = self.step.decompress(idx, scratch) else {
            return;
        };
        let converter = match self.registry.select(self.converter.as_deref(), &input) {
            Ok(c) => c,
            Err(err) => {
                self.step.fail_row(idx, "NO_CONVERTER", &err.to_string());
                return;
            }
        };
        // Tools that write beside their input must not litter the archive.
        let input = if converter.writes_beside_input() && !input.starts_with(scratch) {
            let staged = scratch.join(input.file_name().unwrap_or_default());
            if let Err(err) = files::transfer_file(&input, &staged, TransferMode::Copy) {
                self.step.fail_row(idx, "STAGING", &format!("{err:#}"));
                return;
            }
            staged
        } else {
            input
        };
        let guessed = self.step.table().get(idx).and_then(|r| r.output_path.clone());
        let out_dir = match self.step.out_dir(self.step.table().get(idx)) {
            Ok(dir) => dir,
            Err(err) => {
                self.step.fail_row(idx, "OUTPUT_PATH", &format!("{err:#}"));
                return;
            }
        };
        let work_dir = scratch.join(format!("row{idx}"));
        let inputs = [input];
        let options = self.step.options().clone();
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: &work_dir,
            output: None,
            options: &options,
        };
        let produced = match dispatch(converter.as_ref(), &req, &self.dispatch) {
            DispatchOutcome::Produced(path) => path,
            DispatchOutcome::Failed(reason) => {
                self.step.fail_row(idx, "CONVERT_FAILED", &reason);
                return;
            }
        };
        let dest = guessed.unwrap_or_else(|| out_dir.join(produced.file_name().unwrap_or_default()));
        if let Some(row) = self.step.table_mut().get_mut(idx) {
            row.output_path = Some(produced);
        }
        if self
            .step
            .move_or_copy(idx, &dest, TransferMode::Move, true)
            .is_some()
        {
            if self.step.check_local_exists(idx, Io::Output) {
                info!(
                    step = %self.step.name(),
                    converter = converter.name(),
                    output = %dest.display(),
                    "converted"
                );
            } else {
                self.step.fail_row(idx, "EMPTY_OUTPUT", "converter produced an empty file");
            }
        }
    }

    /// Splits `files` into `workers` disjoint chunks converted on scoped
    /// threads. Each worker owns a cloned step with its own ledger file; the
    /// sub-ledgers are concatenated in chunk order.
    pub fn run_batch(&mut self, files: &[PathBuf], workers: usize) -> StepExitCode {
        let workers = workers.max(1);
        if workers == 1 || files.len() <= 1 {
            return self.run_on_files(files);
        }
        let chunk_len = files.len().div_ceil(workers);
        let chunks = files.chunks(chunk_len).collect::<Vec<_>>();
        info!(
            step = %self.step.name(),
            files = files.len(),
            workers = chunks.len(),
            "batch conversion"
        );
        let tables = thread::scope(|scope| {
            let handles = chunks
                .iter()
                .enumerate()
                .map(|(n, chunk)| {
                    let mut worker = self.clone();
                    worker.step = worker.step.with_ledger_tag(&format!("w{n}"));
                    scope.spawn(move || {
                        worker.run_on_files(chunk);
                        worker.step.table().clone()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .zip(chunks.iter())
                .map(|(handle, chunk)| handle.join().unwrap_or_else(|_| panicked_chunk(chunk)))
                .collect::<Vec<_>>()
        });
        let mut merged = Table::new();
        for table in tables {
            merged.concat(table);
        }
        self.step.replace_table(merged);
        self.step.log_table();
        self.step.exit_code()
    }
}

fn panicked_chunk(chunk: &[PathBuf]) -> Table {
    Table::from_rows(
        chunk
            .iter()
            .map(|path| Row {
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                ok_input: true,
                input_path: Some(path.clone()),
                note: "conversion worker panicked".to_string(),
                ..Row::default()
            })
            .collect(),
    )
}
