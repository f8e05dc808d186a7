use crate::error::StepExitCode;
use crate::external::remote::{self, RemoteClient, RetryPolicy, with_retries};
use crate::ingest::files::TransferMode;
use crate::ingest::ledger::Io;
use crate::ingest::step::Step;
use crate::ingest::translate::{has_unresolved, translate};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Downloads one remote file per epoch into the output tree.
#[derive(Debug, Clone)]
pub struct FetchStep {
    pub step: Step,
    client: Arc<dyn RemoteClient>,
    remote: String,
    local_name: Option<String>,
    retry: RetryPolicy,
    check_listing: bool,
}

impl FetchStep {
    /// `remote` is a location template (URL or mirror path) resolved per row.
    pub fn new(step: Step, client: Arc<dyn RemoteClient>, remote: &str, retry: RetryPolicy) -> Self {
        Self {
            step,
            client,
            remote: remote.to_string(),
            local_name: None,
            retry,
            check_listing: false,
        }
    }

    /// Local file name template; defaults to the remote file name.
    pub fn with_local_name(mut self, template: Option<String>) -> Self {
        self.local_name = template;
        self
    }

    /// Ask the remote for directory listings before downloading, so absent
    /// files are recorded as missing input instead of failed transfers.
    pub fn with_listing(mut self, check_listing: bool) -> Self {
        self.check_listing = check_listing;
        self
    }

    fn prepare_rows(&mut self) {
        let tz = self.step.tz();
        for idx in 0..self.step.table().len() {
            let Some(row) = self.step.table().get(idx).cloned() else {
                continue;
            };
            let ctx = self.step.translation_context(Some(&row));
            let location = translate(&self.remote, &ctx, row.epoch_start, tz);
            if has_unresolved(&location) {
                warn!(step = "fetch", location = %location, "remote template has unresolved keywords");
            }
            let name = remote::basename(&location).to_string();
            if let Some(row) = self.step.table_mut().get_mut(idx) {
                row.file_name = name.clone();
                row.input_path = Some(PathBuf::from(&location));
            }
            let template = self.local_name.clone().unwrap_or(name);
            if self.step.guess_output_path(idx, &template).is_some() {
                self.step.check_local_exists(idx, Io::Output);
            }
        }
    }

    fn mark_pending(&mut self, pending: &[usize], code: &str, reason: &str) {
        for &idx in pending {
            self.step.fail_row(idx, code, reason);
        }
    }

    fn apply_listing(&mut self, pending: &[usize]) {
        let mut by_dir: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &idx in pending {
            let Some(location) = self
                .step
                .table()
                .get(idx)
                .and_then(|r| r.input_path.as_ref())
                .map(|p| p.display().to_string())
            else {
                continue;
            };
            by_dir
                .entry(remote::parent_location(&location).to_string())
                .or_default()
                .push(idx);
        }
        for (dir, rows) in by_dir {
            let listed = with_retries(self.retry, &format!("list {dir}"), |_| self.client.list(&dir));
            let names = match listed {
                Ok(names) => names.into_iter().collect::<BTreeSet<_>>(),
                Err(err) => {
                    warn!(step = "fetch", dir = %dir, error = %format!("{err:#}"), "listing failed, fetching blind");
                    continue;
                }
            };
            for idx in rows {
                let absent = self
                    .step
                    .table()
                    .get(idx)
                    .is_some_and(|r| !names.contains(&r.file_name));
                if absent {
                    if let Some(row) = self.step.table_mut().get_mut(idx) {
                        row.ok_input = false;
                        row.append_note("not on remote");
                    }
                    self.step.record(idx);
                }
            }
        }
    }

    /// Total action: seed, filter what is already local, probe, lock, fetch
    /// what is left and validate sizes.
    pub fn run(&mut self) -> StepExitCode {
        self.step.init_table();
        if self.step.table().is_empty() {
            info!(step = "fetch", "epoch range yields no work");
            return self.step.exit_code();
        }
        self.prepare_rows();
        self.step.apply_name_filter();
        self.step.filter_ok_out();
        self.step.filter_previous_run();

        let pending = self.step.table().pending();
        if pending.is_empty() {
            info!(step = "fetch", "nothing to fetch");
            self.step.log_table();
            return self.step.exit_code();
        }

        if let Err(err) = with_retries(self.retry, "reachability probe", |_| self.client.ping()) {
            let reason = format!("{} unreachable: {err:#}", self.client.host());
            self.mark_pending(&pending, "REMOTE_UNREACHABLE", &reason);
            self.step.set_exit_code(StepExitCode::RemoteUnreachable);
            self.step.log_table();
            return self.step.exit_code();
        }

        let host = self.client.host().to_string();
        let Some(_guard) = self.step.lock(Some(&host)) else {
            self.mark_pending(&pending, "LOCK_TIMEOUT", &format!("lock on {host} not acquired"));
            self.step.set_exit_code(StepExitCode::RemoteUnreachable);
            self.step.log_table();
            return self.step.exit_code();
        };

        if self.check_listing {
            self.apply_listing(&pending);
        }

        let staging = match self.step.scratch_dir("fetch") {
            Ok(dir) => dir,
            Err(err) => {
                self.mark_pending(&pending, "STAGING", &format!("{err:#}"));
                return self.step.exit_code();
            }
        };

        for idx in self.step.table().pending() {
            let Some(row) = self.step.table().get(idx).cloned() else {
                continue;
            };
            let Some(location) = row.input_path.as_ref().map(|p| p.display().to_string()) else {
                continue;
            };
            let Some(dest) = row.output_path.clone() else {
                continue;
            };
            let label = format!("fetch {}", row.file_name);
            match with_retries(self.retry, &label, |_| self.client.fetch(&location, &staging)) {
                Ok(downloaded) => {
                    if let Some(row) = self.step.table_mut().get_mut(idx) {
                        row.output_path = Some(downloaded);
                    }
                    if self
                        .step
                        .move_or_copy(idx, &dest, TransferMode::Move, true)
                        .is_some()
                        && !self.step.check_local_exists(idx, Io::Output)
                    {
                        self.step.fail_row(idx, "EMPTY_DOWNLOAD", "downloaded file is empty");
                    }
                }
                Err(err) => {
                    self.step.fail_row(idx, "FETCH_FAILED", &format!("{err:#}"));
                    if let Some(row) = self.step.table_mut().get_mut(idx) {
                        row.output_path = Some(dest);
                    }
                }
            }
            if let Some(row) = self.step.table().get(idx)
                && row.ok_output
            {
                info!(step = "fetch", site = %row.site, file = %row.file_name, "fetched");
            }
            self.step.record(idx);
        }
        let _ = std::fs::remove_dir_all(&staging);

        self.step.invalidate_small_outputs();
        self.step.log_table();
        self.step.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::epoch::{EpochRange, Period, RoundMethod};
    use crate::ingest::site::SiteId;
    use crate::ingest::step::{StepDirs, StepSettings};
    use anyhow::Result;
    use chrono::{DateTime, Utc};
    use chrono_tz::Tz;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Local mirror that counts every remote interaction.
    #[derive(Debug, Default)]
    struct CountingMirror {
        calls: AtomicUsize,
        fetches: AtomicUsize,
        reachable: bool,
    }

    impl CountingMirror {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteClient for CountingMirror {
        fn host(&self) -> &str {
            "mirror.test"
        }

        fn ping(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reachable {
                Ok(())
            } else {
                anyhow::bail!("connection refused")
            }
        }

        fn list(&self, directory: &str) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            remote::LocalMirror::new(Path::new(directory)).list(directory)
        }

        fn fetch(&self, location: &str, dest_dir: &Path) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            remote::LocalMirror::new(Path::new(location)).fetch(location, dest_dir)
        }
    }

    fn day(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("{raw}T00:00:00Z"))
            .expect("rfc")
            .with_timezone(&Utc)
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            retries: 1,
            delay: Duration::from_millis(1),
        }
    }

    fn fetch_step(root: &TempDir, client: Arc<CountingMirror>) -> FetchStep {
        let base = root.path().display().to_string();
        let range = EpochRange::new(
            day("2024-01-01"),
            day("2024-01-03"),
            Period::parse("1d").expect("period"),
            RoundMethod::Floor,
            Tz::UTC,
        )
        .expect("range");
        let settings = StepSettings {
            lock_timeout: Duration::from_secs(2),
            lock_poll: Duration::from_millis(10),
            ..StepSettings::default()
        };
        let step = Step::new(
            "fetch",
            StepDirs {
                out: format!("{base}/archive/<SITE_ID4>/%Y"),
                tmp: format!("{base}/tmp"),
                log: format!("{base}/log"),
                inp: None,
            },
            range,
            settings,
        )
        .with_site(Some(SiteId::parse("mlvl").expect("site")));
        FetchStep::new(
            step,
            client,
            &format!("{base}/mirror/%Y/%j/<site_id4>%j0.%yd"),
            quick_retry(),
        )
    }

    fn seed_mirror(root: &TempDir) {
        for doy in ["001", "002", "003"] {
            let dir = root.path().join(format!("mirror/2024/{doy}"));
            fs::create_dir_all(&dir).expect("mkdir");
            fs::write(dir.join(format!("mlvl{doy}0.24d")), vec![b'x'; 2048]).expect("seed");
        }
    }

    #[test]
    fn fetches_only_missing_files_and_reruns_without_network() {
        let root = tempdir().expect("tempdir");
        seed_mirror(&root);
        let archive = root.path().join("archive/MLVL/2024");
        fs::create_dir_all(&archive).expect("mkdir");
        fs::write(archive.join("mlvl0020.24d"), vec![b'x'; 2048]).expect("existing");

        let client = Arc::new(CountingMirror {
            reachable: true,
            ..CountingMirror::default()
        });
        let mut first = fetch_step(&root, client.clone());
        let code = first.run();
        assert_eq!(client.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(first.step.table().counts().ok_output, 3);
        assert_eq!(code, StepExitCode::Done);
        for doy in ["001", "002", "003"] {
            assert!(archive.join(format!("mlvl{doy}0.24d")).is_file());
        }

        let rerun_client = Arc::new(CountingMirror {
            reachable: true,
            ..CountingMirror::default()
        });
        let mut second = fetch_step(&root, rerun_client.clone());
        assert_eq!(second.run().code(), 0);
        assert_eq!(rerun_client.calls(), 0);
        assert_eq!(second.step.table().counts().ok_output, 3);
    }

    #[test]
    fn unreachable_remote_sets_distinct_code() {
        let root = tempdir().expect("tempdir");
        seed_mirror(&root);
        let client = Arc::new(CountingMirror::default());
        let mut step = fetch_step(&root, client.clone());
        assert_eq!(step.run(), StepExitCode::RemoteUnreachable);
        assert_eq!(client.fetches.load(Ordering::SeqCst), 0);
        assert!(step.step.table().iter().all(|r| r.note.contains("unreachable")));
    }

    #[test]
    fn missing_remote_files_fail_only_their_rows() {
        let root = tempdir().expect("tempdir");
        seed_mirror(&root);
        fs::remove_file(root.path().join("mirror/2024/003/mlvl0030.24d")).expect("rm");
        let client = Arc::new(CountingMirror {
            reachable: true,
            ..CountingMirror::default()
        });
        let mut step = fetch_step(&root, client.clone());
        assert_eq!(step.run(), StepExitCode::PartialAllInput);
        let last = step.step.table().get(2).expect("row");
        assert!(!last.ok_output);
        assert!(last.note.contains("failed"));
    }

    #[test]
    fn listing_marks_absent_files_as_missing_input() {
        let root = tempdir().expect("tempdir");
        seed_mirror(&root);
        fs::remove_file(root.path().join("mirror/2024/003/mlvl0030.24d")).expect("rm");
        let client = Arc::new(CountingMirror {
            reachable: true,
            ..CountingMirror::default()
        });
        let mut step = fetch_step(&root, client.clone()).with_listing(true);
        assert_eq!(step.run(), StepExitCode::PartialSomeInput);
        let last = step.step.table().get(2).expect("row");
        assert!(!last.ok_input);
        assert!(last.note.contains("not on remote"));
        assert_eq!(client.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ledger_success_skips_renamed_outputs() {
        let root = tempdir().expect("tempdir");
        seed_mirror(&root);
        let client = Arc::new(CountingMirror {
            reachable: true,
            ..CountingMirror::default()
        });
        let mut first = fetch_step(&root, client.clone());
        first.run();
        fs::remove_dir_all(root.path().join("archive")).expect("rm archive");

        let again = Arc::new(CountingMirror {
            reachable: true,
            ..CountingMirror::default()
        });
        let mut second = fetch_step(&root, again.clone());
        assert_eq!(second.run(), StepExitCode::Done);
        assert_eq!(again.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn truncated_downloads_are_invalidated() {
        let root = tempdir().expect("tempdir");
        seed_mirror(&root);
        fs::write(root.path().join("mirror/2024/002/mlvl0020.24d"), b"xx").expect("truncate");
        let client = Arc::new(CountingMirror {
            reachable: true,
            ..CountingMirror::default()
        });
        let mut step = fetch_step(&root, client);
        assert_eq!(step.run(), StepExitCode::PartialAllInput);
        let middle = step.step.table().get(1).expect("row");
        assert!(!middle.ok_output);
        assert!(middle.note.contains("too small"));
    }
}
