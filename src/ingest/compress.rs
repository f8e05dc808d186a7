use crate::external::process::{self, CommandOutcome};
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    /// Unix `compress` (LZW); delegated to `gzip -dc`.
    Lzw,
}

impl Compression {
    pub fn detect(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Some(Self::Gzip),
            Some("Z") => Some(Self::Lzw),
            _ => None,
        }
    }
}

/// File name with any compression suffix removed.
pub fn strip_compression(name: &str) -> &str {
    for suffix in [".gz", ".GZ", ".Z"] {
        if let Some(stem) = name.strip_suffix(suffix) {
            return stem;
        }
    }
    name
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decompressed {
    pub path: PathBuf,
    /// False when an existing decompressed sibling was reused.
    pub created: bool,
}

/// Decompresses `path` into `dest_dir`. Uncompressed inputs are returned
/// as-is; an already decompressed non-empty target is reused.
pub fn decompress_file(path: &Path, dest_dir: &Path, timeout: Duration) -> Result<Decompressed> {
    let Some(kind) = Compression::detect(path) else {
        return Ok(Decompressed {
            path: path.to_path_buf(),
            created: false,
        });
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let target = dest_dir.join(strip_compression(&name));
    if fs::metadata(&target).is_ok_and(|m| m.is_file() && m.len() > 0) {
        return Ok(Decompressed {
            path: target,
            created: false,
        });
    }
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)
        .with_context(|| format!("failed to create temp file in {}", dest_dir.display()))?;
    match kind {
        Compression::Gzip => {
            let source =
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            let mut decoder = MultiGzDecoder::new(source);
            io::copy(&mut decoder, tmp.as_file_mut())
                .with_context(|| format!("failed to gunzip {}", path.display()))?;
        }
        Compression::Lzw => {
            let sink = tmp
                .reopen()
                .with_context(|| format!("failed to reopen temp file for {}", target.display()))?;
            let mut cmd = Command::new("gzip");
            cmd.arg("-dc").arg(path);
            match process::run_into(&mut cmd, sink, Some(timeout))? {
                CommandOutcome::Finished { status, stderr, .. } if !status.success() => {
                    anyhow::bail!(
                        "gzip -dc {} exited with {status}: {}",
                        path.display(),
                        process::tail(&stderr, 200)
                    );
                }
                CommandOutcome::Finished { .. } => {}
                CommandOutcome::TimedOut { after } => {
                    anyhow::bail!("gzip -dc {} timed out after {after:?}", path.display());
                }
            }
        }
    }
    tmp.persist(&target)
        .with_context(|| format!("failed to persist {}", target.display()))?;
    Ok(Decompressed {
        path: target,
        created: true,
    })
}
