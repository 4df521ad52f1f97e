//! Source image checks and encoding helpers for vision requests.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;

/// File extensions accepted as edit sources.
pub const SUPPORTED_EXTENSIONS: [&str; 8] =
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("image not found: {path}")]
    NotFound { path: PathBuf },

    #[error("unsupported image format '{extension}' for {path} (expected one of: {supported})")]
    Unsupported {
        path: PathBuf,
        extension: String,
        supported: String,
    },

    #[error("cannot decode image header of {path}: {detail}")]
    Undecodable { path: PathBuf, detail: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Basic facts about a source image, shown before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Check that `path` is an existing file with a supported extension.
pub fn ensure_supported(path: &Path) -> Result<(), MediaError> {
    if !path.is_file() {
        return Err(MediaError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let extension = extension_of(path);
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(MediaError::Unsupported {
            path: path.to_path_buf(),
            extension,
            supported: SUPPORTED_EXTENSIONS.join(", "),
        });
    }
    Ok(())
}

/// Validate the source and read its dimensions from the header.
pub fn inspect_source(path: &Path) -> Result<ImageInfo, MediaError> {
    ensure_supported(path)?;

    let (width, height) =
        image::image_dimensions(path).map_err(|e| MediaError::Undecodable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

    let format = image::ImageFormat::from_path(path)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("unknown")
        .to_string();

    Ok(ImageInfo {
        width,
        height,
        format,
    })
}

/// MIME type for a path, by extension. Unknown extensions are sent as JPEG.
pub fn media_type(path: &Path) -> &'static str {
    match extension_of(path).as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "image/jpeg",
    }
}

/// Read a file and encode it as a `data:` URI for vision requests.
pub async fn data_uri(path: &Path) -> Result<String, MediaError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MediaError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            MediaError::Read {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    Ok(format!("data:{};base64,{}", media_type(path), STANDARD.encode(bytes)))
}
