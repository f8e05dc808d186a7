use crate::error::IngestError;
use crate::external::remote::RetryPolicy;
use crate::ingest::converter::{ConverterRegistry, ConverterSpec, DispatchSettings};
use crate::ingest::step::StepSettings;
use crate::ingest::store::IdempotencyPolicy;
use crate::paths::IngestPaths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub tmp_dir: String,
    pub log_dir: String,
    pub metadata_dir: String,
}

impl PathsConfig {
    fn under(paths: &IngestPaths) -> Self {
        Self {
            tmp_dir: paths.tmp_dir.display().to_string(),
            log_dir: paths.log_dir.display().to_string(),
            metadata_dir: paths.metadata_dir.display().to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tmp_dir: "tmp".to_string(),
            log_dir: "log".to_string(),
            metadata_dir: "sites".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub retries: u64,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
    pub check_listing: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay_secs: 2,
            timeout_secs: 60,
            check_listing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    pub timeout_secs: u64,
    pub workers: u64,
    pub discovery_window_secs: u64,
    pub keep_secondary: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            workers: 1,
            discovery_window_secs: 2,
            keep_secondary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub small_fraction: f64,
    pub min_bytes: u64,
    pub decompress_timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            small_fraction: 0.1,
            min_bytes: 0,
            decompress_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub policy: IdempotencyPolicy,
    pub use_ledger: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            policy: IdempotencyPolicy::Union,
            use_ledger: true,
        }
    }
}

/// Everything a run needs, built once and passed down by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    pub paths: PathsConfig,
    pub fetch: FetchConfig,
    pub convert: ConvertConfig,
    pub lock: LockConfig,
    pub validation: ValidationConfig,
    pub idempotency: IdempotencyConfig,
    pub converters: Vec<ConverterSpec>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialIngestConfig {
    paths: Option<PathsConfig>,
    fetch: Option<FetchConfig>,
    convert: Option<ConvertConfig>,
    lock: Option<LockConfig>,
    validation: Option<ValidationConfig>,
    idempotency: Option<IdempotencyConfig>,
    #[serde(default)]
    converters: Vec<ConverterSpec>,
}

impl IngestConfig {
    pub fn step_settings(&self) -> StepSettings {
        StepSettings {
            small_fraction: self.validation.small_fraction,
            min_bytes: self.validation.min_bytes,
            lock_timeout: Duration::from_secs(self.lock.timeout_secs),
            lock_poll: Duration::from_millis(self.lock.poll_interval_ms),
            policy: self.idempotency.policy,
            use_ledger: self.idempotency.use_ledger,
            decompress_timeout: Duration::from_secs(self.validation.decompress_timeout_secs),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            timeout: Duration::from_secs(self.convert.timeout_secs),
            discovery_window: Duration::from_secs(self.convert.discovery_window_secs),
            keep_secondary: self.convert.keep_secondary,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.fetch.retries as usize,
            delay: Duration::from_secs(self.fetch.retry_delay_secs),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    pub fn registry(&self) -> Result<ConverterRegistry, IngestError> {
        ConverterRegistry::from_specs(&self.converters)
    }
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

pub fn validate(cfg: &IngestConfig) -> Result<(), IngestError> {
    let invalid = |msg: &str| -> Result<(), IngestError> {
        Err(IngestError::InvalidConfig(msg.to_string()))
    };
    let f = cfg.validation.small_fraction;
    if !(0.0..1.0).contains(&f) {
        return invalid("validation.small_fraction must be in [0, 1)");
    }
    if cfg.convert.workers == 0 {
        return invalid("convert.workers must be >= 1");
    }
    if cfg.convert.timeout_secs == 0 {
        return invalid("convert.timeout_secs must be >= 1");
    }
    if cfg.fetch.timeout_secs == 0 {
        return invalid("fetch.timeout_secs must be >= 1");
    }
    if cfg.lock.timeout_secs == 0 {
        return invalid("lock.timeout_secs must be >= 1");
    }
    if cfg.lock.poll_interval_ms == 0 {
        return invalid("lock.poll_interval_ms must be >= 1");
    }
    if cfg.paths.tmp_dir.trim().is_empty() || cfg.paths.log_dir.trim().is_empty() {
        return invalid("paths.tmp_dir and paths.log_dir cannot be empty");
    }
    let mut names = std::collections::BTreeSet::new();
    for conv in &cfg.converters {
        if !names.insert(conv.name.as_str()) {
            return Err(IngestError::InvalidConfig(format!(
                "converter `{}` is defined twice",
                conv.name
            )));
        }
    }
    Ok(())
}

fn merge_file_config(base: &mut IngestConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let parsed: PartialIngestConfig = toml::from_str(&raw).map_err(|err| {
        IngestError::InvalidConfig(format!("failed to parse {}: {err}", path.display()))
    })?;
    if let Some(paths) = parsed.paths {
        base.paths = paths;
    }
    if let Some(fetch) = parsed.fetch {
        base.fetch = fetch;
    }
    if let Some(convert) = parsed.convert {
        base.convert = convert;
    }
    if let Some(lock) = parsed.lock {
        base.lock = lock;
    }
    if let Some(validation) = parsed.validation {
        base.validation = validation;
    }
    if let Some(idempotency) = parsed.idempotency {
        base.idempotency = idempotency;
    }
    base.converters = parsed.converters;
    Ok(())
}

fn apply_env_overrides(cfg: &mut IngestConfig) -> Result<(), IngestError> {
    cfg.paths.tmp_dir = env_or_string("GNSS_INGEST_TMP_DIR", &cfg.paths.tmp_dir);
    cfg.paths.log_dir = env_or_string("GNSS_INGEST_LOG_DIR", &cfg.paths.log_dir);
    cfg.paths.metadata_dir = env_or_string("GNSS_INGEST_METADATA_DIR", &cfg.paths.metadata_dir);

    cfg.fetch.retries = env_or_u64("GNSS_INGEST_FETCH_RETRIES", cfg.fetch.retries);
    cfg.fetch.retry_delay_secs =
        env_or_u64("GNSS_INGEST_FETCH_RETRY_DELAY_SECS", cfg.fetch.retry_delay_secs);
    cfg.fetch.timeout_secs = env_or_u64("GNSS_INGEST_FETCH_TIMEOUT_SECS", cfg.fetch.timeout_secs);
    cfg.fetch.check_listing = env_or_bool("GNSS_INGEST_FETCH_CHECK_LISTING", cfg.fetch.check_listing);

    cfg.convert.timeout_secs =
        env_or_u64("GNSS_INGEST_CONVERT_TIMEOUT_SECS", cfg.convert.timeout_secs);
    cfg.convert.workers = env_or_u64("GNSS_INGEST_CONVERT_WORKERS", cfg.convert.workers);
    cfg.convert.discovery_window_secs = env_or_u64(
        "GNSS_INGEST_DISCOVERY_WINDOW_SECS",
        cfg.convert.discovery_window_secs,
    );
    cfg.convert.keep_secondary =
        env_or_bool("GNSS_INGEST_KEEP_SECONDARY", cfg.convert.keep_secondary);

    cfg.lock.timeout_secs = env_or_u64("GNSS_INGEST_LOCK_TIMEOUT_SECS", cfg.lock.timeout_secs);
    cfg.lock.poll_interval_ms =
        env_or_u64("GNSS_INGEST_LOCK_POLL_MS", cfg.lock.poll_interval_ms);

    cfg.validation.small_fraction =
        env_or_f64("GNSS_INGEST_SMALL_FRACTION", cfg.validation.small_fraction);
    cfg.validation.min_bytes = env_or_u64("GNSS_INGEST_MIN_BYTES", cfg.validation.min_bytes);

    if let Ok(raw) = env::var("GNSS_INGEST_IDEMPOTENCY")
        && !raw.trim().is_empty()
    {
        cfg.idempotency.policy = raw
            .parse::<IdempotencyPolicy>()
            .map_err(IngestError::InvalidConfig)?;
    }
    cfg.idempotency.use_ledger =
        env_or_bool("GNSS_INGEST_USE_LEDGER", cfg.idempotency.use_ledger);
    Ok(())
}

/// Defaults, then the TOML file, then `GNSS_INGEST_*` variables.
pub fn load_config(paths: &IngestPaths) -> Result<IngestConfig> {
    let mut cfg = IngestConfig {
        paths: PathsConfig::under(paths),
        ..IngestConfig::default()
    };
    merge_file_config(&mut cfg, &paths.config_file)?;
    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[convert]
workers = 4

[idempotency]
policy = "verified"

[[converters]]
name = "teqc-lite"
program = "teqc"
args = ["+obs {outdir}/{stem}.obs", "{input}"]
extensions = ["tgd"]
primary = '^{stem}\.obs$'
"#,
        )
        .expect("write");
        let mut cfg = IngestConfig::default();
        merge_file_config(&mut cfg, &path).expect("merge");
        assert_eq!(cfg.convert.workers, 4);
        assert_eq!(cfg.convert.timeout_secs, 600);
        assert_eq!(cfg.idempotency.policy, IdempotencyPolicy::Verified);
        assert!(cfg.idempotency.use_ledger);
        assert_eq!(cfg.converters.len(), 1);
        let registry = cfg.registry().expect("registry");
        assert_eq!(registry.names()[0], "teqc-lite");
        assert!(registry.get("convbin").is_ok());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let mut cfg = IngestConfig::default();
        merge_file_config(&mut cfg, &dir.path().join("absent.toml")).expect("merge");
        assert_eq!(cfg, IngestConfig::default());
    }

    #[test]
    fn bad_values_are_config_errors() {
        let mut cfg = IngestConfig::default();
        cfg.validation.small_fraction = 1.5;
        assert!(matches!(validate(&cfg), Err(IngestError::InvalidConfig(_))));

        let mut cfg = IngestConfig::default();
        cfg.convert.workers = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = IngestConfig::default();
        cfg.lock.timeout_secs = 0;
        assert!(validate(&cfg).is_err());

        assert!(validate(&IngestConfig::default()).is_ok());
    }

    #[test]
    fn unknown_policy_fails_to_parse() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[idempotency]\npolicy = \"sometimes\"\n").expect("write");
        let mut cfg = IngestConfig::default();
        let err = merge_file_config(&mut cfg, &path).expect_err("bad policy");
        assert!(format!("{err:#}").contains("failed to parse"));
    }

    #[test]
    fn settings_are_derived_from_sections() {
        let mut cfg = IngestConfig::default();
        cfg.lock.poll_interval_ms = 250;
        cfg.fetch.retries = 5;
        assert_eq!(cfg.step_settings().lock_poll, Duration::from_millis(250));
        assert_eq!(cfg.retry_policy().retries, 5);
        assert_eq!(cfg.dispatch_settings().discovery_window, Duration::from_secs(2));
    }
}
