//! Input resolution: validate PDFs and collect image batches.
//!
//! PDFs are checked for the `%PDF` magic before pdfium sees them so callers
//! get a meaningful error rather than a pdfium load failure. Image batches
//! are filtered by extension and sorted by file name, which is also the page
//! order of the exported JSON.

use crate::error::{OcrError, PageError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extensions accepted in image batch mode.
pub const DEFAULT_IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tiff", "bmp"];

/// Validate that `path` exists, is readable and starts with `%PDF`.
pub fn resolve_pdf(path: &Path) -> Result<PathBuf, OcrError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(OcrError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(OcrError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(OcrError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(OcrError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn list_dir(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, OcrError> {
    let entries = std::fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => OcrError::PermissionDenied {
            path: dir.to_path_buf(),
        },
        _ => OcrError::FileNotFound {
            path: dir.to_path_buf(),
        },
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension(p, extensions))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Every `*.pdf` file directly inside `dir`, sorted by file name.
pub fn collect_pdfs(dir: &Path) -> Result<Vec<PathBuf>, OcrError> {
    if !dir.is_dir() {
        return Err(OcrError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }
    list_dir(dir, &["pdf".to_string()])
}

/// A single image, or every image inside a directory, sorted by file name.
///
/// Fails with [`OcrError::NoImagesFound`] when nothing matches `extensions`.
pub fn collect_images(path: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, OcrError> {
    if !path.exists() {
        return Err(OcrError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let images = if path.is_dir() {
        list_dir(path, extensions)?
    } else if has_extension(path, extensions) {
        vec![path.to_path_buf()]
    } else {
        Vec::new()
    };

    if images.is_empty() {
        return Err(OcrError::NoImagesFound {
            path: path.to_path_buf(),
            extensions: extensions.join(","),
        });
    }
    debug!("Collected {} images from {}", images.len(), path.display());
    Ok(images)
}

/// Output file for `input` when a whole directory is processed:
/// `<out_dir>/<stem>_ocr.pdf`.
pub fn batch_output_path(input: &Path, out_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    out_dir.join(format!("{stem}_ocr.pdf"))
}

/// Pixel dimensions of an image on disk, read from its header only.
pub fn image_dimensions(page_index: usize, path: &Path) -> Result<(u32, u32), PageError> {
    image::image_dimensions(path).map_err(|e| PageError::RenderFailed {
        page: page_index,
        detail: format!("cannot read image '{}': {}", path.display(), e),
    })
}
