//! Shared machinery of every pipeline step: directory roles, the job ledger
//! and the row-level primitives concrete steps compose into their action.

use crate::error::{IngestError, StepExitCode};
use crate::external::metadata::MetadataProvider;
use crate::ingest::compress::{self, Compression};
use crate::ingest::epoch::EpochRange;
use crate::ingest::files::{self, TransferMode};
use crate::ingest::ledger::{Io, Row, Table};
use crate::ingest::lock::{self, FileLock};
use crate::ingest::site::{SiteId, infer_from_filename};
use crate::ingest::store::{self, IdempotencyPolicy};
use crate::ingest::translate::{MakeDir, TranslationContext, translate_path};
use crate::ingest::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Unresolved directory templates for each role a step uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDirs {
    pub out: String,
    pub tmp: String,
    pub log: String,
    pub inp: Option<String>,
}

/// Tunables a step takes from the loaded configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSettings {
    pub small_fraction: f64,
    pub min_bytes: u64,
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub policy: IdempotencyPolicy,
    pub use_ledger: bool,
    pub decompress_timeout: Duration,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            small_fraction: 0.1,
            min_bytes: 0,
            lock_timeout: Duration::from_secs(300),
            lock_poll: Duration::from_millis(500),
            policy: IdempotencyPolicy::Union,
            use_ledger: true,
            decompress_timeout: Duration::from_secs(120),
        }
    }
}

/// Which side of a previous step's rows becomes this step's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Input,
    Output,
}

#[derive(Debug, Clone)]
pub struct Step {
    name: String,
    dirs: StepDirs,
    epoch_range: EpochRange,
    site: Option<SiteId>,
    session: BTreeMap<String, String>,
    site_fields: BTreeMap<String, String>,
    options: BTreeMap<String, String>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    settings: StepSettings,
    table: Table,
    exit_override: Option<StepExitCode>,
    ledger_tag: Option<String>,
    ledger_path: Option<PathBuf>,
    name_filter: Option<Regex>,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn compile_filter(pattern: &str) -> Result<Regex, IngestError> {
    Regex::new(pattern).map_err(|e| IngestError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn fmt_epoch(epoch: DateTime<Utc>) -> String {
    epoch.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

impl Step {
    pub fn new(name: &str, dirs: StepDirs, epoch_range: EpochRange, settings: StepSettings) -> Self {
        Self {
            name: name.to_string(),
            dirs,
            epoch_range,
            site: None,
            session: BTreeMap::new(),
            site_fields: BTreeMap::new(),
            options: BTreeMap::new(),
            metadata: None,
            settings,
            table: Table::new(),
            exit_override: None,
            ledger_tag: None,
            ledger_path: None,
            name_filter: None,
        }
    }

    pub fn with_site(mut self, site: Option<SiteId>) -> Self {
        self.site = site;
        self
    }

    pub fn with_session(mut self, session: BTreeMap<String, String>) -> Self {
        self.session = session;
        self
    }

    pub fn with_site_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.site_fields = fields;
        self
    }

    pub fn with_options(mut self, options: BTreeMap<String, String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_metadata(mut self, provider: Option<Arc<dyn MetadataProvider>>) -> Self {
        self.metadata = provider;
        self
    }

    /// Worker copies write to their own ledger file.
    pub fn with_ledger_tag(mut self, tag: &str) -> Self {
        self.ledger_tag = Some(tag.to_string());
        self.ledger_path = None;
        self
    }

    /// Only rows whose file name matches `pattern` are worked on.
    pub fn with_name_filter(mut self, pattern: Option<&str>) -> Result<Self, IngestError> {
        self.name_filter = pattern.map(compile_filter).transpose()?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn epoch_range(&self) -> &EpochRange {
        &self.epoch_range
    }

    pub fn site(&self) -> Option<&SiteId> {
        self.site.as_ref()
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn metadata(&self) -> Option<&Arc<dyn MetadataProvider>> {
        self.metadata.as_ref()
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut Table {
        &mut self.table
    }

    pub fn replace_table(&mut self, table: Table) {
        self.table = table;
    }

    pub fn ledger_path(&self) -> Option<&Path> {
        self.ledger_path.as_deref()
    }

    pub fn tz(&self) -> Tz {
        self.epoch_range.timezone()
    }

    fn row_site(&self, row: Option<&Row>) -> Option<SiteId> {
        if let Some(site) = &self.site {
            return Some(site.clone());
        }
        row.and_then(|r| SiteId::parse(&r.site).ok())
    }

    /// Flattened key/value view of everything a template may reference for
    /// `row`: site variants, session and site fields, epoch and file fields.
    pub fn translation_context(&self, row: Option<&Row>) -> TranslationContext {
        let mut ctx = TranslationContext::new();
        if let Some(site) = self.row_site(row) {
            ctx.insert_site(&site);
        }
        ctx.insert_fields(&self.site_fields);
        ctx.insert_fields(&self.session);

        let mut fields = BTreeMap::new();
        fields.insert("period".to_string(), self.epoch_range.period().to_string());
        if let Some(row) = row {
            if let Some(start) = row.epoch_start {
                fields.insert("epoch_start".to_string(), fmt_epoch(start));
            }
            if let Some(end) = row.epoch_end {
                fields.insert("epoch_end".to_string(), fmt_epoch(end));
            }
            if !row.file_name.is_empty() {
                fields.insert("file_name".to_string(), row.file_name.clone());
                let stem_source = row
                    .input_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(&row.file_name));
                fields.insert(
                    "file_stem".to_string(),
                    crate::ingest::converter::file_stem(&stem_source),
                );
            }
        }
        ctx.insert_fields(&fields);
        ctx
    }

    pub fn resolve(&self, template: &str, row: Option<&Row>, make_dir: MakeDir) -> Result<PathBuf> {
        let ctx = self.translation_context(row);
        let epoch = row.and_then(|r| r.epoch_start);
        translate_path(template, &ctx, epoch, self.tz(), make_dir)
    }

    pub fn out_dir(&self, row: Option<&Row>) -> Result<PathBuf> {
        self.resolve(&self.dirs.out, row, MakeDir::Dir)
    }

    pub fn tmp_dir(&self) -> Result<PathBuf> {
        self.resolve(&self.dirs.tmp, None, MakeDir::Dir)
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        self.resolve(&self.dirs.log, None, MakeDir::Dir)
    }

    pub fn inp_dir(&self, row: Option<&Row>) -> Result<Option<PathBuf>> {
        match &self.dirs.inp {
            Some(template) => Ok(Some(self.resolve(template, row, MakeDir::No)?)),
            None => Ok(None),
        }
    }

    /// Seeds one row per generated epoch. An invalid range seeds nothing.
    pub fn init_table(&mut self) {
        let site = self
            .site
            .as_ref()
            .map(|s| s.four().to_string())
            .unwrap_or_default();
        let starts = self.epoch_range.generate(false);
        let ends = self.epoch_range.generate(true);
        self.table = Table::from_rows(
            starts
                .into_iter()
                .zip(ends)
                .map(|(start, end)| Row::for_epoch(&site, start, end))
                .collect(),
        );
        debug!(step = %self.name, rows = self.table.len(), "table seeded from epoch range");
    }

    /// Replaces the table with one row per file. Site and epoch come from the
    /// file name, falling back to the step site and the file mtime.
    pub fn load_from_file_list(&mut self, files: &[PathBuf]) {
        let period = self.epoch_range.period().duration();
        let tick = self.epoch_range.tick();
        let mut rows = Vec::with_capacity(files.len());
        for path in files {
            let name = file_name_of(path);
            let info = infer_from_filename(&name);
            let meta = fs::metadata(path).ok().filter(|m| m.is_file());
            let epoch = info.epoch.or_else(|| {
                meta.as_ref()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from)
            });
            let site = self
                .site
                .clone()
                .or(info.site)
                .map(|s| s.four().to_string())
                .unwrap_or_default();
            let mut row = Row {
                file_name: name.clone(),
                site,
                epoch_start: epoch,
                epoch_end: epoch
                    .and_then(|e| e.checked_add_signed(period))
                    .and_then(|e| e.checked_sub_signed(tick)),
                input_path: Some(path.clone()),
                ..Row::default()
            };
            match meta {
                Some(meta) => row.set_ok(Io::Input, true, Some(meta.len())),
                None => {
                    row.set_ok(Io::Input, false, None);
                    row.note = "input missing".to_string();
                    warn!(step = %self.name, file = %path.display(), "input file missing");
                }
            }
            rows.push(row);
        }
        self.table = Table::from_rows(rows);
    }

    /// Standard hand-off between steps: site and epochs are kept and either
    /// the previous outputs or inputs become this step's inputs.
    pub fn load_from_previous_table(&mut self, previous: &Table, link: Link) {
        let rows = previous
            .iter()
            .map(|prev| {
                let (path, ok, size) = match link {
                    Link::Output => (prev.output_path.clone(), prev.ok_output, prev.output_size),
                    Link::Input => (prev.input_path.clone(), prev.ok_input, prev.input_size),
                };
                Row {
                    file_name: path.as_deref().map(file_name_of).unwrap_or_default(),
                    site: prev.site.clone(),
                    epoch_start: prev.epoch_start,
                    epoch_end: prev.epoch_end,
                    ok_input: ok && path.is_some(),
                    input_size: size,
                    input_path: path,
                    ..Row::default()
                }
            })
            .collect();
        self.table = Table::from_rows(rows);
    }

    pub fn filter_ok_out(&mut self) -> usize {
        let skipped = self.table.filter_ok_out();
        if skipped > 0 {
            info!(step = %self.name, skipped, "outputs already valid");
        }
        skipped
    }

    /// Every persisted ledger of this step. Unreadable history is logged and
    /// treated as empty.
    pub fn load_previous_ledgers(&self) -> Table {
        let loaded = self
            .log_dir()
            .and_then(|dir| store::load_previous(&dir, &self.name));
        match loaded {
            Ok(table) => table,
            Err(err) => {
                warn!(step = %self.name, error = %format!("{err:#}"), "could not read previous ledgers");
                Table::new()
            }
        }
    }

    pub fn filter_previous_run_table(&mut self, previous: &Table) -> usize {
        let skipped = store::filter_previous_run_table(&mut self.table, previous, self.settings.policy);
        if skipped > 0 {
            info!(step = %self.name, skipped, policy = ?self.settings.policy, "done in previous runs");
        }
        skipped
    }

    /// Applies the persisted-ledger filter when enabled.
    pub fn filter_previous_run(&mut self) -> usize {
        if !self.settings.use_ledger {
            return 0;
        }
        let previous = self.load_previous_ledgers();
        if previous.is_empty() {
            return 0;
        }
        self.filter_previous_run_table(&previous)
    }

    /// Drops rows whose file name does not match `pattern`.
    pub fn filter_filenames(&mut self, pattern: &str) -> Result<usize, IngestError> {
        let re = compile_filter(pattern)?;
        Ok(self.table.purge(|r| !re.is_match(&r.file_name)))
    }

    /// Applies the filter given to [`Step::with_name_filter`], if any.
    pub fn apply_name_filter(&mut self) -> usize {
        let Some(re) = &self.name_filter else {
            return 0;
        };
        let dropped = self.table.purge(|r| !re.is_match(&r.file_name));
        if dropped > 0 {
            debug!(step = %self.name, dropped, filter = re.as_str(), "rows filtered by name");
        }
        dropped
    }

    pub fn purge<F>(&mut self, pred: F) -> usize
    where
        F: FnMut(&Row) -> bool,
    {
        self.table.purge(pred)
    }

    /// Size validation over all valid outputs. Rows it invalidates are
    /// persisted again so later runs do not trust their earlier success.
    pub fn invalidate_small_outputs(&mut self) -> usize {
        let before = self.table.iter().map(|r| r.ok_output).collect::<Vec<_>>();
        let invalidated = self
            .table
            .invalidate_small_outputs(self.settings.small_fraction, self.settings.min_bytes);
        if invalidated == 0 {
            return 0;
        }
        let changed = self
            .table
            .iter()
            .enumerate()
            .filter(|(i, r)| before[*i] && !r.ok_output)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        for idx in changed {
            if let Some(row) = self.table.get(idx) {
                warn::emit(WarnEvent {
                    code: "SMALL_OUTPUT",
                    step: &self.name,
                    action: "invalidate",
                    site: &row.site,
                    file: &row.file_name,
                    reason: &row.note,
                    ..WarnEvent::default()
                });
            }
            self.record(idx);
        }
        invalidated
    }

    /// Fresh private work directory under the step's tmp dir.
    pub fn scratch_dir(&self, label: &str) -> Result<PathBuf> {
        let dir = self
            .tmp_dir()?
            .join(format!("{label}-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn set_exit_code(&mut self, code: StepExitCode) {
        self.exit_override = Some(code);
    }

    pub fn exit_code(&self) -> StepExitCode {
        self.exit_override.unwrap_or_else(|| self.table.exit_code())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} exit={}",
            self.name,
            self.table.summary(),
            self.exit_code().as_str()
        )
    }

    pub fn log_table(&self) {
        for line in self.table.row_lines() {
            debug!(step = %self.name, "{line}");
        }
        info!(step = %self.name, "{}", self.summary());
    }

    /// Existence and size of one side of a row; updates the matching flags.
    pub fn check_local_exists(&mut self, idx: usize, io: Io) -> bool {
        let Some(row) = self.table.get_mut(idx) else {
            return false;
        };
        let size = row.path(io).and_then(files::valid_size);
        row.set_ok(io, size.is_some(), size);
        size.is_some()
    }

    /// Resolves `<out_dir>/<name_template>` for a row without looking at its
    /// input, so existing outputs are known before any work is done.
    pub fn guess_output_path(&mut self, idx: usize, name_template: &str) -> Option<PathBuf> {
        let row = self.table.get(idx)?.clone();
        let resolved = self.out_dir(Some(&row)).and_then(|dir| {
            let ctx = self.translation_context(Some(&row));
            let name = translate_path(name_template, &ctx, row.epoch_start, self.tz(), MakeDir::No)?;
            Ok(dir.join(name))
        });
        match resolved {
            Ok(path) => {
                if let Some(row) = self.table.get_mut(idx) {
                    row.output_path = Some(path.clone());
                }
                Some(path)
            }
            Err(err) => {
                self.fail_row(idx, "OUTPUT_PATH", &format!("{err:#}"));
                None
            }
        }
    }

    /// Makes the row's input usable by tools. A valid uncompressed sibling of
    /// the input, or an earlier result in `dest_dir`, is reused.
    ///
    /// The row is only rewritten when the result sits beside the input:
    /// `input_path` moves to it and `original_path` keeps the compressed
    /// file. A copy in a scratch dir is returned without touching the row.
    pub fn decompress(&mut self, idx: usize, dest_dir: &Path) -> Option<PathBuf> {
        let input = self.table.get(idx)?.input_path.clone()?;
        if Compression::detect(&input).is_none() {
            return Some(input);
        }
        let sibling = input.with_file_name(compress::strip_compression(&file_name_of(&input)));
        let result = match files::valid_size(&sibling) {
            Some(_) => Ok(compress::Decompressed {
                path: sibling,
                created: false,
            }),
            None => compress::decompress_file(&input, dest_dir, self.settings.decompress_timeout),
        };
        match result {
            Ok(done) => {
                debug!(
                    step = %self.name,
                    file = %input.display(),
                    created = done.created,
                    "decompressed input"
                );
                if done.path.parent() == input.parent() {
                    let row = self.table.get_mut(idx)?;
                    row.input_size = files::valid_size(&done.path);
                    row.input_path = Some(done.path.clone());
                    row.original_path = Some(input);
                }
                Some(done.path)
            }
            Err(err) => {
                self.fail_row(idx, "DECOMPRESS", &format!("{err:#}"));
                None
            }
        }
    }

    /// Places the row's current output at `dest`. An existing destination is
    /// kept unless `force`; identical content counts as already placed.
    pub fn move_or_copy(
        &mut self,
        idx: usize,
        dest: &Path,
        mode: TransferMode,
        force: bool,
    ) -> Option<PathBuf> {
        let src = self.table.get(idx)?.output_path.clone();
        let Some(src) = src else {
            self.fail_row(idx, "TRANSFER", "no output to transfer");
            return None;
        };
        if src == dest {
            return Some(src);
        }
        if dest.exists() && !force {
            match files::same_content(&src, dest) {
                Ok(true) => {
                    if mode == TransferMode::Move
                        && let Err(err) = fs::remove_file(&src)
                    {
                        warn!(
                            step = %self.name,
                            file = %src.display(),
                            error = %err,
                            "could not remove source of an already placed output"
                        );
                    }
                }
                _ => {
                    if let Some(row) = self.table.get_mut(idx) {
                        row.append_note("kept existing destination");
                    }
                }
            }
            if let Some(row) = self.table.get_mut(idx) {
                row.output_path = Some(dest.to_path_buf());
            }
            return Some(dest.to_path_buf());
        }
        match files::transfer_file(&src, dest, mode) {
            Ok(()) => {
                if let Some(row) = self.table.get_mut(idx) {
                    row.output_path = Some(dest.to_path_buf());
                }
                Some(dest.to_path_buf())
            }
            Err(err) => {
                self.fail_row(idx, "TRANSFER", &format!("{err:#}"));
                None
            }
        }
    }

    /// Records a row-level failure on the row and as a warning line.
    pub fn fail_row(&mut self, idx: usize, code: &str, reason: &str) {
        let Some(row) = self.table.get_mut(idx) else {
            return;
        };
        row.fail(reason);
        let row = row.clone();
        warn::emit(WarnEvent {
            code,
            step: &self.name,
            action: "skip-row",
            site: &row.site,
            file: &row.file_name,
            reason,
            ..WarnEvent::default()
        });
    }

    /// Appends the row to this run's persisted ledger. Failures to persist
    /// are logged; the in-memory ledger stays authoritative for this run.
    pub fn record(&mut self, idx: usize) {
        if !self.settings.use_ledger {
            return;
        }
        let Some(row) = self.table.get(idx).cloned() else {
            return;
        };
        if self.ledger_path.is_none() {
            match self.log_dir() {
                Ok(dir) => {
                    let name =
                        store::ledger_file_name(&self.name, self.ledger_tag.as_deref(), Utc::now());
                    self.ledger_path = Some(dir.join(name));
                }
                Err(err) => {
                    warn!(step = %self.name, error = %format!("{err:#}"), "no ledger directory");
                    return;
                }
            }
        }
        if let Some(path) = &self.ledger_path
            && let Err(err) = store::append_row(path, &row)
        {
            warn!(step = %self.name, error = %format!("{err:#}"), "could not persist ledger row");
        }
    }

    /// Exclusive lock on a shared resource, `None` when it could not be had.
    pub fn lock(&self, resource: Option<&str>) -> Option<FileLock> {
        let dir = match self.tmp_dir() {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!(step = %self.name, error = %format!("{err:#}"), "no lock directory");
                return None;
            }
        };
        let path = lock::lock_path(&dir, resource);
        FileLock::acquire(&path, self.settings.lock_timeout, self.settings.lock_poll)
    }
}
