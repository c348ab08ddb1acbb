use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use sha2::{Digest, Sha256};

const MMAP_THRESHOLD: u64 = 500 * 1024 * 1024; // 500 MB

/// Hex SHA-256 of a file's contents. Identifies uploads and thumbnails.
pub fn calculate_hash(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let len = file.metadata()?.len();

    let mut hasher = Sha256::new();

    if len > MMAP_THRESHOLD {
        // SAFETY: the mapping is read once and dropped before returning; a file
        // truncated underneath us is outside what this tool handles.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        hasher.update(&mmap);
    } else {
        let mut reader = BufReader::new(file);
        let mut buffer = [0; 8192];
        loop {
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_and_buffer_hashes_agree() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.bin");
        fs::write(&path, b"abc")?;

        let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(calculate_hash(&path)?, expected);
        assert_eq!(hash_bytes(b"abc"), expected);
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(calculate_hash(Path::new("/definitely/not/here.jpg")).is_err());
    }
}
