//! Filesystem discovery: module executables, signature files, and input
//! sources.
//!
//! Modules live under `<data>/modules/<kind>/<name>`; the subdirectory
//! becomes the module's tag and the filename stem its name. Signatures are
//! `<data>/signatures/<name>.dice`. Source files are matched by glob under
//! the run's workspace with an extension filter.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use dice_core::error::{Error, Result};
use dice_core::model::{Id, Module, Source, SourceKind};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Extension of signature files.
pub const SIGNATURE_EXT: &str = ".dice";

/// Finds module executables matching the globs, hashed and tagged.
///
/// A glob may name the executable directly (`banner`) or include the kind
/// subdirectory (`classifier/banner`); plain names search all kinds.
pub fn find_module_files(modules_dir: &Path, patterns: &[String]) -> Result<Vec<Module>> {
    let mut modules = Vec::new();
    for pattern in patterns {
        let full = if pattern.contains('/') {
            modules_dir.join(pattern)
        } else {
            modules_dir.join("*").join(pattern)
        };
        for path in matches(&full)? {
            if !path.is_file() {
                continue;
            }
            modules.push(module_from_file(modules_dir, &path)?);
        }
    }
    Ok(modules)
}

fn module_from_file(modules_dir: &Path, path: &Path) -> Result<Module> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    // The kind directory between the modules root and the file, if any.
    let tags = path
        .strip_prefix(modules_dir)
        .ok()
        .and_then(Path::parent)
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .map(|kind| vec![kind.to_string()])
        .unwrap_or_default();

    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hash = hex_digest(hasher);

    debug!(module = %name, %hash, "module file found");
    Ok(Module {
        id: Id::ZERO,
        name,
        location: path.to_string_lossy().into_owned(),
        hash,
        tags,
        properties: Default::default(),
    })
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Finds `.dice` files matching the globs under the signatures directory.
pub fn find_signature_files(signatures_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let with_ext = if pattern.ends_with(SIGNATURE_EXT) {
            pattern.clone()
        } else {
            format!("{pattern}{SIGNATURE_EXT}")
        };
        for path in matches(&signatures_dir.join(with_ext))? {
            if path.is_file() {
                paths.push(path);
            }
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// The path of one signature by name.
#[must_use]
pub fn signature_file(signatures_dir: &Path, name: &str) -> PathBuf {
    signatures_dir.join(format!("{name}{SIGNATURE_EXT}"))
}

/// Finds source files matching the globs under the workspace, keeping only
/// the allowed extensions (`.json`, and friends).
pub fn find_source_files(
    workspace: &Path,
    patterns: &[String],
    extensions: &[&str],
) -> Result<Vec<Source>> {
    let mut sources = Vec::new();
    for pattern in patterns {
        for path in matches(&workspace.join(pattern))? {
            if !path.is_file() {
                continue;
            }
            let format = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            if !extensions.contains(&format) {
                continue;
            }
            sources.push(Source {
                id: Id::ZERO,
                name: path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string(),
                kind: SourceKind::File,
                format: format.to_string(),
                location: path.to_string_lossy().into_owned(),
                args: None,
            });
        }
    }
    Ok(sources)
}

fn matches(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern).map_err(|e| Error::Store {
        op: "glob",
        message: format!("invalid pattern '{pattern}': {e}"),
    })?;
    Ok(entries.filter_map(std::result::Result::ok).collect())
}
