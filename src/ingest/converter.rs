//! External format converters.
//!
//! A converter is described by a program, an argv template and two result
//! patterns. Output file names are never trusted from the tool: after the
//! program exits, its output directory is polled for files matching the
//! primary pattern that appeared after the run started.

use crate::error::IngestError;
use crate::external::process::{self, CommandOutcome};
use crate::ingest::compress::strip_compression;
use anyhow::Result;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

const HEAD_BYTES: usize = 16;

/// Everything a converter invocation needs to know.
#[derive(Debug, Clone, Copy)]
pub struct ConvertRequest<'a> {
    pub inputs: &'a [PathBuf],
    pub out_dir: &'a Path,
    /// Desired output file name, for tools that take one.
    pub output: Option<&'a str>,
    pub options: &'a BTreeMap<String, String>,
}

impl ConvertRequest<'_> {
    fn first_input(&self) -> Option<&Path> {
        self.inputs.first().map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone)]
pub struct ResultPatterns {
    pub primary: Regex,
    pub secondary: Option<Regex>,
}

pub trait Converter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    /// Signature check on the (decompressed) input name and its first bytes.
    fn matches(&self, path: &Path, head: &[u8]) -> bool;
    /// Full argv, program first.
    fn build_command(&self, req: &ConvertRequest<'_>) -> Result<Vec<String>>;
    fn result_patterns(&self, req: &ConvertRequest<'_>) -> Result<ResultPatterns, IngestError>;
    /// Whether the tool writes next to its input instead of into `out_dir`.
    fn writes_beside_input(&self) -> bool {
        false
    }
}

/// Declarative converter, as written in `[[converters]]` config blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Regexes matched against the last extension, case-insensitively.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub magic: Option<String>,
    pub primary: String,
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(default)]
    pub beside_input: bool,
}

#[derive(Debug, Clone)]
pub struct TemplateConverter {
    spec: ConverterSpec,
    extensions: Vec<Regex>,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{(input|inputs|outdir|output|stem|opt:[A-Za-z0-9_]+)\}")
            .expect("placeholder regex is valid")
    })
}

/// Input file name without compression suffix and last extension.
pub fn file_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let bare = strip_compression(&name);
    match bare.rfind('.') {
        Some(idx) if idx > 0 => bare[..idx].to_string(),
        _ => bare.to_string(),
    }
}

fn last_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let bare = strip_compression(&name);
    bare.rfind('.').map(|idx| bare[idx + 1..].to_string())
}

fn invalid_pattern(pattern: &str, err: impl fmt::Display) -> IngestError {
    IngestError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    }
}

impl TemplateConverter {
    pub fn compile(spec: ConverterSpec) -> Result<Self, IngestError> {
        if spec.name.trim().is_empty() || spec.program.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "converter needs a name and a program".to_string(),
            ));
        }
        let extensions = spec
            .extensions
            .iter()
            .map(|ext| {
                RegexBuilder::new(&format!("^(?:{ext})$"))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| invalid_pattern(ext, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        // Both result patterns must compile once placeholders are filled.
        for pattern in std::iter::once(&spec.primary).chain(spec.secondary.as_ref()) {
            let sample = pattern.replace("{stem}", "x").replace("{output}", "x");
            Regex::new(&sample).map_err(|e| invalid_pattern(pattern, e))?;
        }
        Ok(Self { spec, extensions })
    }

    pub fn spec(&self) -> &ConverterSpec {
        &self.spec
    }

    /// Expands one template argument into zero or more argv entries. A
    /// template word may hold several whitespace-separated pieces; the whole
    /// group is dropped when any placeholder in it has no value.
    fn expand_group(&self, group: &str, req: &ConvertRequest<'_>) -> Vec<String> {
        let stem = req.first_input().map(file_stem).unwrap_or_default();
        let mut out = Vec::new();
        for piece in group.split_whitespace() {
            if piece == "{inputs}" {
                if req.inputs.is_empty() {
                    return Vec::new();
                }
                out.extend(req.inputs.iter().map(|p| p.display().to_string()));
                continue;
            }
            let mut missing = false;
            let expanded = placeholder_re().replace_all(piece, |caps: &regex::Captures| {
                let key = &caps[1];
                let value = match key {
                    "input" => req.first_input().map(|p| p.display().to_string()),
                    "inputs" => Some(
                        req.inputs
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(" "),
                    ),
                    "outdir" => Some(req.out_dir.display().to_string()),
                    "output" => req.output.map(str::to_string),
                    "stem" => Some(stem.clone()),
                    other => other
                        .strip_prefix("opt:")
                        .and_then(|opt| req.options.get(opt).cloned()),
                };
                value.unwrap_or_else(|| {
                    missing = true;
                    String::new()
                })
            });
            if missing {
                return Vec::new();
            }
            out.push(expanded.into_owned());
        }
        out
    }

    fn fill_pattern(&self, pattern: &str, req: &ConvertRequest<'_>) -> String {
        let stem = req.first_input().map(file_stem).unwrap_or_default();
        let output = req.output.unwrap_or_default();
        pattern
            .replace("{stem}", &regex::escape(&stem))
            .replace("{output}", &regex::escape(output))
    }
}

impl Converter for TemplateConverter {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn matches(&self, path: &Path, head: &[u8]) -> bool {
        if let Some(ext) = last_extension(path)
            && self.extensions.iter().any(|re| re.is_match(&ext))
        {
            return true;
        }
        match &self.spec.magic {
            Some(magic) if !magic.is_empty() => head.starts_with(magic.as_bytes()),
            _ => false,
        }
    }

    fn build_command(&self, req: &ConvertRequest<'_>) -> Result<Vec<String>> {
        if req.inputs.is_empty() {
            anyhow::bail!("converter {} called without input", self.spec.name);
        }
        let mut argv = vec![self.spec.program.clone()];
        for group in &self.spec.args {
            argv.extend(self.expand_group(group, req));
        }
        Ok(argv)
    }

    fn result_patterns(&self, req: &ConvertRequest<'_>) -> Result<ResultPatterns, IngestError> {
        let primary_src = self.fill_pattern(&self.spec.primary, req);
        let primary = Regex::new(&primary_src).map_err(|e| invalid_pattern(&primary_src, e))?;
        let secondary = match &self.spec.secondary {
            Some(pattern) => {
                let src = self.fill_pattern(pattern, req);
                Some(Regex::new(&src).map_err(|e| invalid_pattern(&src, e))?)
            }
            None => None,
        };
        Ok(ResultPatterns { primary, secondary })
    }

    fn writes_beside_input(&self) -> bool {
        self.spec.beside_input
    }
}

fn builtin(
    name: &str,
    program: &str,
    args: &[&str],
    extensions: &[&str],
    magic: Option<&str>,
    primary: &str,
    secondary: Option<&str>,
) -> ConverterSpec {
    ConverterSpec {
        name: name.to_string(),
        program: program.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        extensions: extensions.iter().map(|s| s.to_string()).collect(),
        magic: magic.map(str::to_string),
        primary: primary.to_string(),
        secondary: secondary.map(str::to_string),
        beside_input: false,
    }
}

/// Converters known without any configuration.
pub fn builtin_specs() -> Vec<ConverterSpec> {
    let mut crx = builtin(
        "crx2rnx",
        "crx2rnx",
        &["-f {input}"],
        &["crx", r"\d\d[dD]"],
        None,
        r"^{stem}\.(\d\d[oO]|rnx)$",
        None,
    );
    crx.beside_input = true;
    vec![
        builtin(
            "sbf2rin",
            "sbf2rin",
            &["-f {input}", "-o {outdir}/{stem}.obs", "-R{opt:rinex_major}"],
            &["sbf", r"\d\d_"],
            Some("$@"),
            r"^{stem}\.obs$",
            Some(r"^{stem}\.(nav|gnav|sbs)$"),
        ),
        builtin(
            "convbin",
            "convbin",
            &["{input}", "-d {outdir}", "-v {opt:rinex_version}"],
            &["ubx", "rtcm", "rtcm3", "bnx", "binex", "jps", "nov", "oem"],
            None,
            r"^{stem}\.obs$",
            Some(r"^{stem}\.(nav|gnav|hnav|qnav|lnav|cnav|inav|sbs)$"),
        ),
        builtin(
            "mdb2rinex",
            "mdb2rinex",
            &["--out {outdir}", "{input}"],
            &[r"m\d\d", "mdb"],
            None,
            r"(?i)^.+\.(\d\do|rnx)$",
            Some(r"(?i)^.+\.\d\d[nglpqf]$"),
        ),
        crx,
        builtin(
            "gfzrnx-merge",
            "gfzrnx",
            &["-finp {inputs}", "-fout {outdir}/{output}", "-kv", "-f"],
            &[],
            None,
            r"^{output}$",
            None,
        ),
        builtin(
            "gfzrnx-split",
            "gfzrnx",
            &[
                "-finp {input}",
                "-fout {outdir}/{output}",
                "-epo_beg {opt:epoch_beg}",
                "-d {opt:duration}",
                "-kv",
                "-f",
            ],
            &[],
            None,
            r"^{output}$",
            None,
        ),
        builtin(
            "gfzrnx-tag",
            "gfzrnx",
            &[
                "-finp {input}",
                "-fout {outdir}/{output}",
                "-crux {opt:crux}",
                "-kv",
                "-f",
            ],
            &[],
            None,
            r"^{output}$",
            None,
        ),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn Converter>>,
}

impl ConverterRegistry {
    /// User converters first, then every built-in whose name they do not
    /// shadow.
    pub fn from_specs(user: &[ConverterSpec]) -> Result<Self, IngestError> {
        let mut registry = Self::default();
        for spec in user {
            registry.register(Arc::new(TemplateConverter::compile(spec.clone())?));
        }
        for spec in builtin_specs() {
            if user.iter().any(|u| u.name == spec.name) {
                continue;
            }
            registry.register(Arc::new(TemplateConverter::compile(spec)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, converter: Arc<dyn Converter>) {
        self.converters.push(converter);
    }

    pub fn names(&self) -> Vec<&str> {
        self.converters.iter().map(|c| c.name()).collect()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Converter>, IngestError> {
        self.converters
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| IngestError::UnknownConverter(name.to_string()))
    }

    /// Explicit name wins; otherwise the first converter whose signature
    /// matches `input`.
    pub fn select(
        &self,
        explicit: Option<&str>,
        input: &Path,
    ) -> Result<Arc<dyn Converter>, IngestError> {
        if let Some(name) = explicit {
            return self.get(name);
        }
        let head = read_head(input);
        self.converters
            .iter()
            .find(|c| c.matches(input, &head))
            .cloned()
            .ok_or_else(|| IngestError::UnknownConverter(input.display().to_string()))
    }
}

fn read_head(path: &Path) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEAD_BYTES);
    if let Ok(file) = fs::File::open(path) {
        let _ = file.take(HEAD_BYTES as u64).read_to_end(&mut buf);
    }
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub discovery_window: Duration,
    pub keep_secondary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Produced(PathBuf),
    Failed(String),
}

fn resolve_program(program: &str) -> Result<PathBuf, String> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        if path.is_file() {
            return Ok(path);
        }
        return Err(format!("converter program {program} does not exist"));
    }
    which::which(program).map_err(|_| format!("converter program `{program}` not found on PATH"))
}

/// Files in `dir` matching `pattern` modified at or after `since`, newest
/// first.
fn scan(dir: &Path, pattern: &Regex, since: SystemTime) -> Vec<(PathBuf, SystemTime)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found = entries
        .flatten()
        .filter(|e| pattern.is_match(&e.file_name().to_string_lossy()))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().ok()?;
            (modified >= since).then(|| (e.path(), modified))
        })
        .collect::<Vec<_>>();
    found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    found
}

/// Runs one converter invocation and locates its product. Every failure is
/// returned as a reason string; nothing escapes to the caller.
pub fn dispatch(
    converter: &dyn Converter,
    req: &ConvertRequest<'_>,
    settings: &DispatchSettings,
) -> DispatchOutcome {
    let argv = match converter.build_command(req) {
        Ok(argv) => argv,
        Err(err) => return DispatchOutcome::Failed(format!("{err:#}")),
    };
    let patterns = match converter.result_patterns(req) {
        Ok(p) => p,
        Err(err) => return DispatchOutcome::Failed(err.to_string()),
    };
    let Some((program, args)) = argv.split_first() else {
        return DispatchOutcome::Failed(format!("{} built an empty command", converter.name()));
    };
    let program = match resolve_program(program) {
        Ok(p) => p,
        Err(reason) => return DispatchOutcome::Failed(reason),
    };
    let watch_dir = if converter.writes_beside_input() {
        req.first_input()
            .and_then(Path::parent)
            .unwrap_or(req.out_dir)
            .to_path_buf()
    } else {
        req.out_dir.to_path_buf()
    };
    if let Err(err) = fs::create_dir_all(&watch_dir) {
        return DispatchOutcome::Failed(format!("failed to create {}: {err}", watch_dir.display()));
    }

    // mtime granularity on some filesystems is a full second
    let started = SystemTime::now()
        .checked_sub(Duration::from_secs(1))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut cmd = Command::new(&program);
    cmd.args(args).current_dir(&watch_dir);
    debug!(converter = converter.name(), argv = ?argv, "running converter");

    match process::run_with_timeout(&mut cmd, Some(settings.timeout)) {
        Err(err) => return DispatchOutcome::Failed(format!("{err:#}")),
        Ok(CommandOutcome::TimedOut { after }) => {
            return DispatchOutcome::Failed(format!(
                "{} timed out after {}s",
                converter.name(),
                after.as_secs()
            ));
        }
        Ok(CommandOutcome::Finished {
            status,
            stdout,
            stderr,
        }) => {
            if !stdout.trim().is_empty() {
                debug!(converter = converter.name(), stdout = %stdout.trim(), "converter stdout");
            }
            if !stderr.trim().is_empty() {
                debug!(converter = converter.name(), stderr = %stderr.trim(), "converter stderr");
            }
            if !status.success() {
                return DispatchOutcome::Failed(format!(
                    "{} exited with {status}: {}",
                    converter.name(),
                    process::tail(&stderr, 200)
                ));
            }
        }
    }

    let deadline = Instant::now() + settings.discovery_window;
    let mut found = scan(&watch_dir, &patterns.primary, started);
    while found.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
        found = scan(&watch_dir, &patterns.primary, started);
    }
    let inputs = req.inputs;
    found.retain(|(p, _)| !inputs.contains(p));
    let Some((product, _)) = found.first().cloned() else {
        return DispatchOutcome::Failed(format!(
            "no output matching `{}` in {}",
            patterns.primary.as_str(),
            watch_dir.display()
        ));
    };
    for (stale, _) in found.iter().skip(1) {
        let _ = fs::remove_file(stale);
    }
    if !settings.keep_secondary
        && let Some(secondary) = &patterns.secondary
    {
        for (extra, _) in scan(&watch_dir, secondary, started) {
            if extra != product && !inputs.contains(&extra) {
                let _ = fs::remove_file(&extra);
            }
        }
    }
    info!(
        converter = converter.name(),
        output = %product.display(),
        "converter produced output"
    );
    DispatchOutcome::Produced(product)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn spec(program: &Path, args: &[&str]) -> ConverterSpec {
        ConverterSpec {
            name: "fake".to_string(),
            program: program.display().to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            extensions: vec!["raw".to_string()],
            magic: None,
            primary: r"^{stem}\.obs$".to_string(),
            secondary: Some(r"^{stem}\.nav$".to_string()),
            beside_input: false,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            timeout: Duration::from_secs(10),
            discovery_window: Duration::from_millis(300),
            keep_secondary: false,
        }
    }

    #[test]
    fn argv_groups_expand_and_drop() {
        let conv = TemplateConverter::compile(spec(
            Path::new("/bin/fake"),
            &["{input}", "-d {outdir}", "-v {opt:rinex_version}", "-finp {inputs}"],
        ))
        .expect("compile");
        let inputs = vec![PathBuf::from("/in/a.raw.gz"), PathBuf::from("/in/b.raw")];
        let options = BTreeMap::new();
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: Path::new("/out"),
            output: None,
            options: &options,
        };
        let argv = conv.build_command(&req).expect("argv");
        assert_eq!(
            argv,
            vec!["/bin/fake", "/in/a.raw.gz", "-d", "/out", "-finp", "/in/a.raw.gz", "/in/b.raw"]
        );
        let patterns = conv.result_patterns(&req).expect("patterns");
        assert!(patterns.primary.is_match("a.obs"));
        assert!(!patterns.primary.is_match("b.obs"));
    }

    #[test]
    fn registry_selects_by_signature_and_name() {
        let dir = tempdir().expect("tempdir");
        let sbf = dir.path().join("receiver_dump.bin");
        fs::write(&sbf, b"$@\x12\x34payload").expect("write");

        let registry = ConverterRegistry::from_specs(&[]).expect("registry");
        assert_eq!(registry.select(None, &sbf).expect("sbf").name(), "sbf2rin");
        assert_eq!(
            registry
                .select(None, Path::new("MLVL00FRA_R_20240150000_01D_30S_MO.crx.gz"))
                .expect("crx")
                .name(),
            "crx2rnx"
        );
        assert_eq!(
            registry.select(None, Path::new("mlvl0320.24d.Z")).expect("d").name(),
            "crx2rnx"
        );
        assert_eq!(
            registry.select(Some("gfzrnx-merge"), &sbf).expect("named").name(),
            "gfzrnx-merge"
        );
        assert!(matches!(
            registry.select(None, Path::new("notes.txt")),
            Err(IngestError::UnknownConverter(_))
        ));
        assert!(registry.get("nope").is_err());
    }

    #[test]
    fn user_converters_take_precedence() {
        let mut user = spec(Path::new("/opt/bin/my-sbf"), &["{input}"]);
        user.name = "sbf2rin".to_string();
        user.extensions = vec!["sbf".to_string()];
        let registry = ConverterRegistry::from_specs(&[user]).expect("registry");
        let chosen = registry.select(None, Path::new("x.sbf")).expect("chosen");
        assert_eq!(chosen.name(), "sbf2rin");
        let names = registry.names();
        assert_eq!(names.iter().filter(|n| **n == "sbf2rin").count(), 1);
        assert_eq!(names[0], "sbf2rin");
    }

    #[test]
    fn bad_patterns_are_rejected_at_compile_time() {
        let mut bad = spec(Path::new("/bin/fake"), &[]);
        bad.primary = "([unclosed".to_string();
        assert!(matches!(
            TemplateConverter::compile(bad),
            Err(IngestError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn dispatch_finds_primary_and_drops_secondary() {
        let dir = tempdir().expect("tempdir");
        let bin = write_script(
            dir.path(),
            "fake-conv",
            r#"stem=$(basename "$1" .raw)
echo obs > "$2/$stem.obs"
echo nav > "$2/$stem.nav"
echo converted"#,
        );
        let input = dir.path().join("site0320.raw");
        fs::write(&input, b"raw").expect("input");
        let out_dir = dir.path().join("out");
        let conv = TemplateConverter::compile(spec(&bin, &["{input}", "{outdir}"])).expect("compile");
        let inputs = vec![input];
        let options = BTreeMap::new();
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: &out_dir,
            output: None,
            options: &options,
        };
        let outcome = dispatch(&conv, &req, &settings());
        assert_eq!(outcome, DispatchOutcome::Produced(out_dir.join("site0320.obs")));
        assert!(!out_dir.join("site0320.nav").exists());
    }

    #[test]
    fn dispatch_waits_for_background_writes() {
        let dir = tempdir().expect("tempdir");
        let bin = write_script(
            dir.path(),
            "slow-conv",
            r#"stem=$(basename "$1" .raw)
(sleep 0.3; echo obs > "$2/$stem.obs") >/dev/null 2>&1 &
exit 0"#,
        );
        let input = dir.path().join("site0320.raw");
        fs::write(&input, b"raw").expect("input");
        let conv = TemplateConverter::compile(spec(&bin, &["{input}", "{outdir}"])).expect("compile");
        let inputs = vec![input];
        let options = BTreeMap::new();
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: dir.path(),
            output: None,
            options: &options,
        };
        let mut slow = settings();
        slow.discovery_window = Duration::from_secs(5);
        assert_eq!(
            dispatch(&conv, &req, &slow),
            DispatchOutcome::Produced(dir.path().join("site0320.obs"))
        );
    }

    #[test]
    fn dispatch_reports_failures() {
        let dir = tempdir().expect("tempdir");
        let failing = write_script(dir.path(), "fail-conv", "echo broken >&2\nexit 2");
        let silent = write_script(dir.path(), "noop-conv", "exit 0");
        let sleepy = write_script(dir.path(), "sleepy-conv", "exec sleep 5");
        let input = dir.path().join("site0320.raw");
        fs::write(&input, b"raw").expect("input");
        let inputs = vec![input];
        let options = BTreeMap::new();
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: dir.path(),
            output: None,
            options: &options,
        };

        let conv = TemplateConverter::compile(spec(&failing, &["{input}"])).expect("compile");
        match dispatch(&conv, &req, &settings()) {
            DispatchOutcome::Failed(reason) => assert!(reason.contains("broken"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }

        let conv = TemplateConverter::compile(spec(&silent, &["{input}"])).expect("compile");
        match dispatch(&conv, &req, &settings()) {
            DispatchOutcome::Failed(reason) => assert!(reason.contains("no output"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }

        let conv = TemplateConverter::compile(spec(&sleepy, &["{input}"])).expect("compile");
        let mut quick = settings();
        quick.timeout = Duration::from_millis(200);
        match dispatch(&conv, &req, &quick) {
            DispatchOutcome::Failed(reason) => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }

        let missing = TemplateConverter::compile(spec(
            Path::new("surely-not-a-real-converter-binary"),
            &["{input}"],
        ))
        .expect("compile");
        match dispatch(&missing, &req, &settings()) {
            DispatchOutcome::Failed(reason) => assert!(reason.contains("not found"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stale_outputs_from_earlier_runs_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let stale = dir.path().join("site0320.obs");
        fs::write(&stale, b"old").expect("stale");
        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&stale)
            .expect("open")
            .set_modified(old)
            .expect("mtime");
        let silent = write_script(dir.path(), "noop-conv", "exit 0");
        let input = dir.path().join("site0320.raw");
        fs::write(&input, b"raw").expect("input");
        let inputs = vec![input];
        let options = BTreeMap::new();
        let req = ConvertRequest {
            inputs: &inputs,
            out_dir: dir.path(),
            output: None,
            options: &options,
        };
        let conv = TemplateConverter::compile(spec(&silent, &["{input}"])).expect("compile");
        assert!(matches!(
            dispatch(&conv, &req, &settings()),
            DispatchOutcome::Failed(_)
        ));
    }
}
