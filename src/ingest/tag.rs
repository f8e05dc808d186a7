use crate::error::{IngestError, StepExitCode};
use crate::external::metadata::MetadataProvider;
use crate::ingest::converter::{
    ConvertRequest, Converter, ConverterRegistry, DispatchOutcome, DispatchSettings, dispatch,
};
use crate::ingest::files::TransferMode;
use crate::ingest::ledger::Io;
use crate::ingest::site::SiteId;
use crate::ingest::step::Step;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_TAG_CONVERTER: &str = "gfzrnx-tag";
pub const DEFAULT_TAG_NAME: &str = "<file_name>";

/// Stamps header fields from the metadata provider onto each input file,
/// writing the result under the output tree.
#[derive(Debug, Clone)]
pub struct TagStep {
    pub step: Step,
    provider: Arc<dyn MetadataProvider>,
    converter: Arc<dyn Converter>,
    output_name: String,
    dispatch: DispatchSettings,
}

/// Header edit instructions in the `update_insert` form the tagging tool
/// reads. Values holding several header columns are split on `|`.
pub fn crux_text(fields: &BTreeMap<String, String>) -> String {
    let mut out = String::from("update_insert:\nO - ALL:\n");
    for (label, value) in fields {
        let columns = value
            .split('|')
            .enumerate()
            .map(|(i, v)| format!("{i}: \"{}\"", v.trim().replace('"', "'")))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "\"{label}\": {{ {columns} }}");
    }
    out
}

fn write_crux(dir: &Path, idx: usize, fields: &BTreeMap<String, String>) -> Result<PathBuf> {
    let path = dir.join(format!("row{idx}.crux"));
    fs::write(&path, crux_text(fields))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

impl TagStep {
    /// Tagging needs a metadata provider on the step.
    pub fn new(
        step: Step,
        registry: &ConverterRegistry,
        converter: Option<&str>,
        output_name: Option<&str>,
        dispatch: DispatchSettings,
    ) -> Result<Self, IngestError> {
        let Some(provider) = step.metadata().cloned() else {
            return Err(IngestError::InvalidConfig(
                "tagging needs a metadata directory".to_string(),
            ));
        };
        let converter = registry.get(converter.unwrap_or(DEFAULT_TAG_CONVERTER))?;
        Ok(Self {
            step,
            provider,
            converter,
            output_name: output_name.unwrap_or(DEFAULT_TAG_NAME).to_string(),
            dispatch,
        })
    }

    pub fn run_on_files(&mut self, files: &[PathBuf]) -> StepExitCode {
        self.step.load_from_file_list(files);
        self.run()
    }

    pub fn run(&mut self) -> StepExitCode {
        self.step.apply_name_filter();
        for idx in self.step.table().pending() {
            if self.step.guess_output_path(idx, &self.output_name).is_some() {
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
        let scratch = match self.step.scratch_dir("tag") {
            Ok(dir) => dir,
            Err(err) => {
                for idx in pending {
                    self.step.fail_row(idx, "STAGING", &format!("{err:#}"));
                }
                return self.step.exit_code();
            }
        };
        for idx in pending {
            self.tag_row(idx, &scratch);
            self.step.record(idx);
        }
        if let Err(err) = fs::remove_dir_all(&scratch) {
            warn!(step = %self.step.name(), dir = %scratch.display(), error = %err, "could not remove scratch dir");
        }
        self.step.invalidate_small_outputs();
        self.step.log_table();
        self.step.exit_code()
    }

    fn tag_row(&mut self, idx: usize, scratch: &Path) {
        let Some(row) = self.step.table().get(idx).cloned() else {
            return;
        };
        let Some(dest) = row.output_path.clone() else {
            return;
        };
        if row.input_path.as_deref() == Some(dest.as_path()) {
            self.step
                .fail_row(idx, "IN_PLACE", "output would overwrite its input");
            return;
        }
        let site = match self.step.site().cloned() {
            Some(site) => Ok(site),
            None => SiteId::parse(&row.site),
        };
        let (site, epoch) = match (site, row.epoch_start) {
            (Ok(site), Some(epoch)) => (site, epoch),
            (Err(err), _) => {
                self.step.fail_row(idx, "METADATA", &err.to_string());
                return;
            }
            (_, None) => {
                self.step.fail_row(idx, "METADATA", "row has no epoch");
                return;
            }
        };
        let fields = match self.provider.header_fields(&site, epoch) {
            Ok(fields) => fields,
            Err(err) => {
                self.step.fail_row(idx, "METADATA", &format!("{err:#}"));
                return;
            }
        };
        let Some(input) = self.step.decompress(idx, scratch) else {
            return;
        };
        let crux = match write_crux(scratch, idx, &fields) {
            Ok(path) => path,
            Err(err) => {
                self.step.fail_row(idx, "STAGING", &format!("{err:#}"));
                return;
            }
        };
        let mut options = self.step.options().clone();
        options.insert("crux".to_string(), crux.display().to_string());
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let inputs = [input];
        let work_dir = scratch.join(format!("row{idx}"));
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
                self.step.fail_row(idx, "TAG_FAILED", &reason);
                return;
            }
        }
        if self
            .step
            .move_or_copy(idx, &dest, TransferMode::Move, true)
            .is_some()
        {
            if self.step.check_local_exists(idx, Io::Output) {
                info!(step = %self.step.name(), site = %site, output = %dest.display(), "tagged");
            } else {
                self.step.fail_row(idx, "EMPTY_OUTPUT", "tagging produced an empty file");
            }
        }
    }
}
