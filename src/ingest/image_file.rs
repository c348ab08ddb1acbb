use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::debug;

use crate::ingest::hasher;

const THUMBNAIL_SIZE: u32 = 256;

/// What gets recorded about an uploaded image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub checksum: String,
    pub width: u32,
    pub height: u32,
    /// Upper-case format name, e.g. `PNG`.
    pub format: Option<String>,
    pub size: u64,
}

pub fn inspect(path: &Path) -> Result<ImageInfo> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {:?}", path))?
        .with_guessed_format()?;
    let format = reader.format().map(|f| format!("{f:?}").to_uppercase());
    let (width, height) = reader
        .into_dimensions()
        .with_context(|| format!("Failed to read image dimensions: {:?}", path))?;
    Ok(ImageInfo {
        checksum: hasher::calculate_hash(path)?,
        width,
        height,
        format,
        size: fs::metadata(path)?.len(),
    })
}

/// A JPEG thumbnail encoded in memory, not yet on disk.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub info: ImageInfo,
    bytes: Vec<u8>,
}

impl Thumbnail {
    pub fn file_name(&self) -> String {
        format!("{}.jpg", self.info.checksum)
    }

    /// Writes the thumbnail into `folder` under its checksum name. Returns
    /// the path and whether this call created the file; an existing file is
    /// reused.
    pub fn save(&self, folder: &Path) -> Result<(PathBuf, bool)> {
        fs::create_dir_all(folder)?;
        let target = folder.join(self.file_name());
        if target.is_file() {
            return Ok((target, false));
        }
        fs::write(&target, &self.bytes).with_context(|| format!("Failed to write thumbnail: {:?}", target))?;
        debug!(path = %target.display(), "thumbnail written");
        Ok((target, true))
    }
}

/// Encodes a JPEG thumbnail of `path` bounded by 256x256.
pub fn render_thumbnail(path: &Path) -> Result<Thumbnail> {
    let image = image::open(path).with_context(|| format!("Failed to decode image: {:?}", path))?;
    let thumbnail = image.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE);
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(thumbnail.to_rgb8());

    let mut bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .context("Failed to encode thumbnail")?;

    Ok(Thumbnail {
        info: ImageInfo {
            checksum: hasher::hash_bytes(&bytes),
            width: rgb.width(),
            height: rgb.height(),
            format: Some("JPEG".to_string()),
            size: bytes.len() as u64,
        },
        bytes,
    })
}
