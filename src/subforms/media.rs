//! Binary attachments referenced by copied values.

use crate::core::error::FormlinkError;
use std::fs;
use std::path::Path;

/// True when `value` names a file with one of the attachment suffixes.
pub fn is_media_value(value: &str, extensions: &[String]) -> bool {
    Path::new(value)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

/// Copy the attachment named by `value` from one instance folder to another.
///
/// Only the final path component of `value` is used. Returns `false` when
/// the parent has no such file.
pub fn copy_attachment(value: &str, from_dir: &Path, to_dir: &Path) -> Result<bool, FormlinkError> {
    let Some(file_name) = Path::new(value).file_name() else {
        return Ok(false);
    };
    let source = from_dir.join(file_name);
    if !source.is_file() {
        tracing::debug!(source = %source.display(), "attachment not present in parent folder");
        return Ok(false);
    }
    fs::create_dir_all(to_dir)?;
    fs::copy(&source, to_dir.join(file_name))?;
    Ok(true)
}
