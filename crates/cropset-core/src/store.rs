//! Image I/O collaborator.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError, ImageFormat};
use thiserror::Error;

use crate::error::{PipelineError, Result};

/// Why an image could not be loaded. `Missing` and `Undecodable` are soft.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image file not found")]
    Missing,
    #[error("image could not be decoded: {0}")]
    Undecodable(String),
    #[error(transparent)]
    Io(io::Error),
}

pub trait ImageStore {
    fn load(&self, path: &Path) -> std::result::Result<DynamicImage, LoadError>;

    /// Saves `image`, creating parent directories. The format follows the
    /// file extension. A reader never sees a partially written file.
    fn save(&self, image: &DynamicImage, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Filesystem store backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsImageStore;

impl ImageStore for FsImageStore {
    fn load(&self, path: &Path) -> std::result::Result<DynamicImage, LoadError> {
        if !path.is_file() {
            return Err(LoadError::Missing);
        }
        match image::open(path) {
            Ok(img) => Ok(img),
            Err(ImageError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => Err(LoadError::Missing),
            Err(ImageError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(LoadError::Undecodable(e.to_string()))
            }
            Err(ImageError::IoError(e)) => Err(LoadError::Io(e)),
            Err(e) => Err(LoadError::Undecodable(e.to_string())),
        }
    }

    fn save(&self, image: &DynamicImage, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(PipelineError::io(parent))?;
        }
        let format = ImageFormat::from_path(path)?;
        let tmp = tmp_path(path);
        if format == ImageFormat::Jpeg {
            // JPEG has no alpha or 16-bit support
            DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(&tmp, format)?;
        } else {
            image.save_with_format(&tmp, format)?;
        }
        fs::rename(&tmp, path).map_err(PipelineError::io(path))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(PipelineError::io(path))
    }
}

/// `dir/a.png` -> `dir/a.png.tmp`
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn save_creates_dirs_and_reads_back_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deer").join("cam1").join("img.png");
        let img = DynamicImage::ImageRgb8(RgbImage::new(12, 7));

        let store = FsImageStore;
        assert!(!store.exists(&path));
        store.save(&img, &path).unwrap();
        assert!(store.exists(&path));
        assert_eq!(store.load(&path).unwrap().height(), 7);
        assert_eq!(store.load(&path).unwrap().width(), 12);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn jpeg_drops_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        let img = DynamicImage::ImageRgba8(image::RgbaImage::new(8, 8));
        FsImageStore.save(&img, &path).unwrap();
        assert_eq!(FsImageStore.load(&path).unwrap().width(), 8);
    }

    #[test]
    fn load_classifies_failures() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(FsImageStore.load(&dir.path().join("none.jpg")), Err(LoadError::Missing)));

        let broken = dir.path().join("broken.jpg");
        fs::write(&broken, b"definitely not a jpeg").unwrap();
        assert!(matches!(FsImageStore.load(&broken), Err(LoadError::Undecodable(_))));
    }

    #[test]
    fn save_replaces_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deer").join("a.png");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        assert!(matches!(FsImageStore.load(&path), Err(LoadError::Undecodable(_))));

        FsImageStore.save(&DynamicImage::ImageRgb8(RgbImage::new(5, 4)), &path).unwrap();
        assert_eq!(FsImageStore.load(&path).unwrap().width(), 5);
        assert_eq!(tmp_path(&path), dir.path().join("deer").join("a.png.tmp"));
        assert!(!tmp_path(&path).exists());
    }
}
