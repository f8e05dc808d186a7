use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestPaths {
    pub home: PathBuf,
    pub config_file: PathBuf,
    pub tmp_dir: PathBuf,
    pub log_dir: PathBuf,
    pub metadata_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

pub fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

/// Default locations, all below `GNSS_INGEST_HOME` (`~/.gnss-ingest`).
/// The config file may still move the working directories.
pub fn resolve_paths() -> Result<IngestPaths> {
    let user_home = required_home_dir()?;
    let home = env_or_default_path("GNSS_INGEST_HOME", user_home.join(".gnss-ingest"));
    Ok(paths_under(home))
}

pub fn paths_under(home: PathBuf) -> IngestPaths {
    let config_file = env_or_default_path("GNSS_INGEST_CONFIG_PATH", home.join("config.toml"));
    IngestPaths {
        tmp_dir: home.join("tmp"),
        log_dir: home.join("log"),
        metadata_dir: home.join("sites"),
        config_file,
        home,
    }
}
