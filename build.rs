//! Writes `GENERATED_GNSS_INGEST_ENV_ALLOWLIST` into `OUT_DIR`: every
//! `GNSS_INGEST_*` name that appears as a whole string literal under `src/`.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const PREFIX: &str = "GNSS_INGEST_";

fn source_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = vec![root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = dirs.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// `"GNSS_INGEST_HOME"` counts; `GNSS_INGEST_*` in prose or inside a
/// longer literal does not.
fn quoted_env_names(source: &str) -> impl Iterator<Item = &str> {
    source.match_indices('"').filter_map(move |(at, _)| {
        let rest = source.get(at + 1..)?;
        if !rest.starts_with(PREFIX) {
            return None;
        }
        let len = rest
            .find(|c: char| !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'))
            .unwrap_or(rest.len());
        (len > PREFIX.len() && rest[len..].starts_with('"')).then(|| &rest[..len])
    })
}

fn main() -> io::Result<()> {
    let mut names = BTreeSet::new();
    for file in source_files(Path::new("src"))? {
        let source = fs::read_to_string(&file)?;
        names.extend(quoted_env_names(&source).map(str::to_owned));
    }

    let out_dir = env::var_os("OUT_DIR")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR is not set"))?;
    let mut out = fs::File::create(Path::new(&out_dir).join("gnss_ingest_env_allowlist.rs"))?;
    writeln!(out, "pub const GENERATED_GNSS_INGEST_ENV_ALLOWLIST: &[&str] = &[")?;
    for name in &names {
        writeln!(out, "    {name:?},")?;
    }
    writeln!(out, "];")?;

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");
    Ok(())
}
