//! Database file naming conventions.
//!
//! The file-number space is shared across all file kinds; uniqueness is
//! enforced by the version set's `next_file_number` counter.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// File types in the database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Write-ahead log file.
    Log,
    /// SSTable data file.
    Table,
    /// Manifest (descriptor) file.
    Manifest,
    /// Current file (points to the active manifest).
    Current,
    /// Temporary file.
    Temp,
}

/// Generate the current file path.
pub fn current_file_path(db_path: &Path) -> PathBuf {
    db_path.join("CURRENT")
}

/// Generate a manifest (descriptor) file path.
pub fn descriptor_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(descriptor_file_name(number))
}

/// Generate a manifest (descriptor) file name.
pub fn descriptor_file_name(number: u64) -> String {
    format!("MANIFEST-{:06}", number)
}

/// Generate a log (WAL) file path.
pub fn log_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.log", number))
}

/// Generate an SSTable file path.
pub fn table_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.ldb", number))
}

/// Generate a temporary file path.
pub fn temp_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.tmp", number))
}

/// Parse a file name and return its type and number.
///
/// Returns `None` if the file name doesn't match any known pattern.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    if name == "CURRENT" {
        return Some((FileType::Current, 0));
    }

    if let Some(suffix) = name.strip_prefix("MANIFEST-") {
        if let Ok(number) = suffix.parse::<u64>() {
            return Some((FileType::Manifest, number));
        }
        return None;
    }

    if let Some(dot_pos) = name.rfind('.') {
        let (num_str, ext) = name.split_at(dot_pos);
        let ext = &ext[1..];

        if let Ok(number) = num_str.parse::<u64>() {
            let file_type = match ext {
                "log" => FileType::Log,
                // `.sst` is the historical table suffix; accept both.
                "ldb" | "sst" => FileType::Table,
                "tmp" => FileType::Temp,
                _ => return None,
            };
            return Some((file_type, number));
        }
    }

    None
}

/// Parse a manifest file name ("MANIFEST-NNNNNN") into its number.
pub fn parse_descriptor_name(name: &str) -> Option<u64> {
    match parse_file_name(name) {
        Some((FileType::Manifest, number)) => Some(number),
        _ => None,
    }
}

/// Point the CURRENT file at the given manifest.
///
/// Written through a temp file and renamed so the switch is atomic.
pub fn set_current_file(db_path: &Path, manifest_number: u64) -> Result<()> {
    let current_path = current_file_path(db_path);
    let temp_path = temp_file_path(db_path, manifest_number);

    {
        let mut file = File::create(&temp_path)?;
        writeln!(file, "{}", descriptor_file_name(manifest_number))?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, &current_path)?;

    Ok(())
}

/// Read the manifest name recorded in the CURRENT file.
///
/// Returns `Ok(None)` if CURRENT does not exist. The content must end
/// with a newline; anything else is corruption.
pub fn read_current_file(db_path: &Path) -> Result<Option<String>> {
    let current_path = current_file_path(db_path);
    if !current_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&current_path)?;
    if content.is_empty() || !content.ends_with('\n') {
        return Err(Error::corruption("CURRENT file does not end with newline"));
    }
    Ok(Some(content[..content.len() - 1].to_string()))
}

/// Delete a file, ignoring "not found" errors.
pub fn delete_file(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
