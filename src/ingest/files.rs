use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Source is removed once the destination is complete.
    Move,
    Copy,
}

pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let size_a = fs::metadata(a).with_context(|| format!("failed to stat {}", a.display()))?;
    let size_b = fs::metadata(b).with_context(|| format!("failed to stat {}", b.display()))?;
    if size_a.len() != size_b.len() {
        return Ok(false);
    }
    Ok(file_hash(a)? == file_hash(b)?)
}

/// Size of a non-empty regular file.
pub fn valid_size(path: &Path) -> Option<u64> {
    let meta = fs::metadata(path).ok()?;
    (meta.is_file() && meta.len() > 0).then_some(meta.len())
}

fn copy_atomically(from: &Path, to: &Path) -> Result<()> {
    let dir = to
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    let mut source = File::open(from).with_context(|| format!("failed to open {}", from.display()))?;
    io::copy(&mut source, tmp.as_file_mut())
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    tmp.persist(to)
        .with_context(|| format!("failed to persist {}", to.display()))?;
    Ok(())
}

/// Places `from` at `to`. Moves try a rename first and fall back to copy
/// then remove; the source never disappears before the destination is
/// complete.
pub fn transfer_file(from: &Path, to: &Path, mode: TransferMode) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match mode {
        TransferMode::Copy => copy_atomically(from, to),
        TransferMode::Move => match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(rename_err)
                if matches!(
                    rename_err.kind(),
                    ErrorKind::CrossesDevices | ErrorKind::PermissionDenied
                ) =>
            {
                copy_atomically(from, to)?;
                fs::remove_file(from)
                    .with_context(|| format!("failed to remove {}", from.display()))?;
                Ok(())
            }
            Err(rename_err) => Err(rename_err).with_context(|| {
                format!("failed to move {} to {}", from.display(), to.display())
            }),
        },
    }
}
