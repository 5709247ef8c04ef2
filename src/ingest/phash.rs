use std::io;
use std::path::{Path, PathBuf};

use image_hasher::{HashAlg, HasherConfig};
use thiserror::Error;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug, Error)]
pub enum HashError {
    #[error("{0} does not exist or is not a file")]
    NotFound(PathBuf),
    #[error("image must be png, jpg or jpeg, got '{0}'")]
    UnsupportedExtension(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to rename image: {0}")]
    Io(#[from] io::Error),
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Average hash of the image's pixels on an 8x8 grid, as 16 lowercase hex digits.
pub fn compute_image_hash(image_file: &Path) -> Result<String, HashError> {
    if !image_file.is_file() {
        return Err(HashError::NotFound(image_file.to_path_buf()));
    }
    if !is_supported_image(image_file) {
        let ext = image_file
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Err(HashError::UnsupportedExtension(ext));
    }

    let img = image::open(image_file)?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Mean)
        .hash_size(8, 8)
        .to_hasher();

    let hash = hasher.hash_image(&img);
    Ok(hash
        .as_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

/// `<dir>/<hash><original suffix>`, keeping the suffix exactly as it was.
pub fn hashed_file_name(image_file: &Path, hash: &str) -> PathBuf {
    let file_name = match image_file.extension() {
        Some(ext) => format!("{hash}.{}", ext.to_string_lossy()),
        None => hash.to_string(),
    };
    image_file.with_file_name(file_name)
}

/// Hash the image and rename it in place. Returns the new path.
pub fn hash_and_rename(image_file: &Path) -> Result<PathBuf, HashError> {
    let hash = compute_image_hash(image_file)?;
    let renamed = hashed_file_name(image_file, &hash);
    if renamed != image_file {
        std::fs::rename(image_file, &renamed)?;
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_png(path: &Path, shade: u8) {
        let img = ImageBuffer::from_fn(32, 32, |x, _| {
            if x < 16 {
                Rgb([shade, shade, shade])
            } else {
                Rgb([255 - shade, 0, 0])
            }
        });
        img.save(path).unwrap();
    }

    #[test]
    fn hash_is_stable_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Scan_001.png");
        write_png(&path, 10);

        let first = compute_image_hash(&path).unwrap();
        let second = compute_image_hash(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rename_uses_hash_and_keeps_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Scan_002.png");
        write_png(&path, 40);

        let hash = compute_image_hash(&path).unwrap();
        let renamed = hash_and_rename(&path).unwrap();
        assert_eq!(renamed, dir.path().join(format!("{hash}.png")));
        assert!(renamed.exists());
        assert!(!path.exists());
    }

    #[test]
    fn rejects_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        assert!(matches!(
            compute_image_hash(&path),
            Err(HashError::UnsupportedExtension(ext)) if ext == "txt"
        ));
        assert!(matches!(
            compute_image_hash(&dir.path().join("missing.png")),
            Err(HashError::NotFound(_))
        ));
    }

    #[test]
    fn extension_check_ignores_case() {
        assert!(is_supported_image(Path::new("a.JPG")));
        assert!(is_supported_image(Path::new("a.jpeg")));
        assert!(!is_supported_image(Path::new("a.gif")));
        assert!(!is_supported_image(Path::new("Scan_1")));
    }
}
