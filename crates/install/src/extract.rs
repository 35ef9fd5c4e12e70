//! Archive extraction and executable lookup.
//!
//! Extraction always targets a caller-owned staging directory; entries that
//! would land outside it are skipped (zip) or rejected (tar).

use flate2::read::GzDecoder;
use simplicity_core::ArchiveKind;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, trace};

/// Extraction failure.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Filesystem error while reading the archive or writing entries.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed zip archive.
    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The catalogued executable is not in the archive.
    #[error("executable '{0}' not found in archive")]
    EntryNotFound(String),

    /// Several files match the catalogued executable by suffix.
    #[error("executable '{entry}' is ambiguous: {}", .candidates.join(", "))]
    AmbiguousEntry {
        /// Catalogued entry path.
        entry: String,
        /// Matching paths relative to the extraction root.
        candidates: Vec<String>,
    },
}

/// Unpack `archive` into `dest`.
///
/// For [`ArchiveKind::RawBinary`] the file is copied to `dest/<raw_entry>`.
///
/// # Errors
///
/// Returns an [`ExtractError`] if the archive is unreadable or an entry cannot
/// be written.
pub fn extract(
    archive: &Path,
    kind: ArchiveKind,
    dest: &Path,
    raw_entry: &str,
) -> Result<(), ExtractError> {
    std::fs::create_dir_all(dest)?;
    debug!(archive = %archive.display(), %kind, dest = %dest.display(), "Extracting");
    match kind {
        ArchiveKind::Zip => extract_zip(archive, dest),
        ArchiveKind::TarGz => extract_tar_gz(archive, dest),
        ArchiveKind::RawBinary => {
            let target = join_relative(dest, raw_entry);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(archive, target)?;
            Ok(())
        }
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let mut zip = zip::ZipArchive::new(BufReader::new(File::open(archive)?))?;

    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let Some(relative) = file.enclosed_name() else {
            debug!(name = %file.name(), "Skipping zip entry outside extraction root");
            continue;
        };
        let outpath = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&outpath)?;
        std::io::copy(&mut file, &mut out)?;
        trace!(path = %outpath.display(), "Extracted");

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    let mut tar = Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dest)?;
    Ok(())
}

/// Find the catalogued executable under `root`.
///
/// `entry_path` is tried as an exact relative path first. Archives often nest
/// everything under a versioned top-level folder, so a unique file whose
/// trailing components equal `entry_path` is accepted too.
///
/// # Errors
///
/// Returns [`ExtractError::EntryNotFound`] or [`ExtractError::AmbiguousEntry`].
pub fn locate_entry(root: &Path, entry_path: &str) -> Result<PathBuf, ExtractError> {
    let wanted = entry_components(entry_path);

    let exact = join_relative(root, entry_path);
    if exact.is_file() {
        return Ok(exact);
    }

    let mut files = Vec::new();
    collect_files(root, &mut files)?;

    let mut matches: Vec<PathBuf> = files
        .into_iter()
        .filter(|path| ends_with_components(path.strip_prefix(root).unwrap_or(path), &wanted))
        .collect();

    match matches.len() {
        0 => Err(ExtractError::EntryNotFound(entry_path.to_string())),
        1 => Ok(matches.remove(0)),
        _ => {
            matches.sort();
            Err(ExtractError::AmbiguousEntry {
                entry: entry_path.to_string(),
                candidates: matches
                    .iter()
                    .map(|p| p.strip_prefix(root).unwrap_or(p).display().to_string())
                    .collect(),
            })
        }
    }
}

fn entry_components(entry_path: &str) -> Vec<&str> {
    entry_path
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect()
}

fn join_relative(root: &Path, entry_path: &str) -> PathBuf {
    entry_components(entry_path)
        .into_iter()
        .fold(root.to_path_buf(), |p, c| p.join(c))
}

fn ends_with_components(relative: &Path, wanted: &[&str]) -> bool {
    let components: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    !wanted.is_empty() && components.ends_with(wanted)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}
