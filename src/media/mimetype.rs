use std::path::Path;

use anyhow::{Context, Result};

const FALLBACK: &str = "application/octet-stream";

/// MIME type sniffed from the file's magic bytes.
pub fn detect_mimetype(path: &Path) -> Result<String> {
    let kind = infer::get_from_path(path)
        .with_context(|| format!("Failed to read file for mimetype detection: {:?}", path))?;

    match kind {
        Some(k) => Ok(k.mime_type().to_string()),
        None => Ok(FALLBACK.to_string()),
    }
}

/// Whether the file looks like an image. Unreadable files are not images.
pub fn is_image(path: &Path) -> bool {
    detect_mimetype(path)
        .map(|mime| mime.starts_with("image/"))
        .unwrap_or(false)
}
