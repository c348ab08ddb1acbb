use std::path::{Path, PathBuf};

use anyhow::Result;
use crossbeam::channel::Sender;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::media::mimetype;

/// Sends every image file under `root` (hidden entries skipped) down `tx`.
/// Stops early when the receiving side hangs up. Returns how many were sent.
pub fn scan_images(root: &Path, tx: Sender<PathBuf>) -> Result<usize> {
    let walker = WalkDir::new(root).into_iter();
    let mut sent = 0;

    for entry in walker.filter_entry(|e| !is_hidden(e)) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !mimetype::is_image(entry.path()) {
            debug!(path = %entry.path().display(), "not an image, skipped");
            continue;
        }
        if tx.send(entry.path().to_path_buf()).is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::fs;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn only_visible_images_are_sent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::create_dir(dir.path().join(".cache"))?;
        fs::write(dir.path().join("a.png"), PNG_MAGIC)?;
        fs::write(dir.path().join("nested").join("b.png"), PNG_MAGIC)?;
        fs::write(dir.path().join(".cache").join("c.png"), PNG_MAGIC)?;
        fs::write(dir.path().join("notes.txt"), b"hello")?;

        let (tx, rx) = unbounded();
        let sent = scan_images(dir.path(), tx)?;
        let mut found: Vec<PathBuf> = rx.iter().collect();
        found.sort();

        assert_eq!(sent, 2);
        assert_eq!(
            found,
            vec![dir.path().join("a.png"), dir.path().join("nested").join("b.png")]
        );
        Ok(())
    }
}
