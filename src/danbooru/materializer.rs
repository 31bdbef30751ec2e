//! File Materializer
//!
//! Persists a fetched payload verbatim. Any content type passes: images, video and flash alike.
//! Files are written to a temporary sibling first and renamed into place so a crash never leaves a
//! truncated file under the final name.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::danbooru::record::{Field, PostRecord};

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

pub type MaterializeResult<T> = Result<T, MaterializeError>;

/// Checks a payload against the hash the upstream reported.
pub fn verify_md5(bytes: &[u8], expected: &str) -> bool {
    format!("{:x}", md5::compute(bytes)).eq_ignore_ascii_case(expected.trim())
}

/// Longest file stem or directory name produced here, in characters.
pub const MAX_NAME_LEN: usize = 50;

/// Replaces characters that are not allowed in file names.
fn replace_invalid(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    name.chars()
        .map(|c| if invalid_chars.contains(&c) || c.is_control() { '_' } else { c })
        .collect()
}

/// Replaces characters that are not allowed in file names and caps the length.
pub fn sanitize_filename(name: &str) -> String {
    replace_invalid(name).chars().take(MAX_NAME_LEN).collect()
}

/// `{artists}_{id}` when the post names artists, `{id}` otherwise. `None` while the id is withheld.
///
/// Only the artist prefix is shortened, so the id always survives and two posts never share a stem.
pub fn file_stem(record: &PostRecord) -> Option<String> {
    let Field::Present(id) = record.id else {
        return None;
    };
    let id = id.to_string();
    let artists: Vec<String> = record.artists.iter().map(|name| replace_invalid(name)).collect();
    let room = MAX_NAME_LEN.saturating_sub(id.len() + 1);
    let prefix: String = artists.join("+").chars().take(room).collect();
    if prefix.is_empty() {
        return Some(id);
    }
    Some(format!("{}_{}", prefix, id))
}

/// Extension to write under: the declared one, else one derived from the content type, else `bin`.
pub fn extension_for(declared: Option<&str>, content_type: Option<&str>) -> String {
    if let Some(ext) = declared.map(str::trim).filter(|ext| !ext.is_empty()) {
        return ext.trim_start_matches('.').to_ascii_lowercase();
    }
    content_type
        .and_then(|content_type| content_type.split(';').next())
        .and_then(|mime| mime.trim().split('/').nth(1))
        .map(|subtype| match subtype {
            "jpeg" => "jpg".to_string(),
            "x-shockwave-flash" => "swf".to_string(),
            other => other.trim_start_matches("x-").to_string(),
        })
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "bin".to_string())
}

/// Writes payloads below a root directory.
#[derive(Debug, Clone)]
pub struct FileMaterializer {
    root: PathBuf,
}

impl FileMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where [`materialize`](Self::materialize) would put a file.
    pub fn target_path(&self, relative_dir: &str, stem: &str, ext: &str) -> MaterializeResult<PathBuf> {
        // Stems are built to length by the caller; cutting them here could drop the post id.
        let stem = replace_invalid(stem);
        let ext = sanitize_filename(ext.trim_start_matches('.'));
        if stem.trim().is_empty() || stem == "." || stem == ".." {
            return Err(MaterializeError::InvalidName(stem));
        }

        let mut dir = self.root.clone();
        for component in relative_dir.split(['/', '\\']).filter(|part| !part.is_empty()) {
            if component == "." || component == ".." {
                return Err(MaterializeError::InvalidName(relative_dir.to_string()));
            }
            dir.push(sanitize_filename(component));
        }

        let file_name = if ext.is_empty() { stem } else { format!("{}.{}", stem, ext) };
        Ok(dir.join(file_name))
    }

    /// Whether a file with this name already exists.
    pub async fn exists(&self, relative_dir: &str, stem: &str, ext: &str) -> bool {
        match self.target_path(relative_dir, stem, ext) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Writes `bytes` unchanged and returns the final path.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn materialize(
        &self,
        relative_dir: &str,
        stem: &str,
        ext: &str,
        bytes: &[u8],
    ) -> MaterializeResult<PathBuf> {
        let target = self.target_path(relative_dir, stem, ext)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut temp_name = target.as_os_str().to_os_string();
        temp_name.push(".part");
        let temp = PathBuf::from(temp_name);

        if let Err(e) = fs::write(&temp, bytes).await {
            warn!("Failed to write {}: {}", temp.display(), e);
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        info!("Saved {}", target.display());
        Ok(target)
    }

    /// Like [`materialize`](Self::materialize), but refuses payloads that do not match `expected_md5`.
    pub async fn materialize_verified(
        &self,
        relative_dir: &str,
        stem: &str,
        ext: &str,
        bytes: &[u8],
        expected_md5: &str,
    ) -> MaterializeResult<PathBuf> {
        if !verify_md5(bytes, expected_md5) {
            let path = self.target_path(relative_dir, stem, ext)?;
            return Err(MaterializeError::HashMismatch {
                path: path.display().to_string(),
                expected: expected_md5.to_string(),
                actual: format!("{:x}", md5::compute(bytes)),
            });
        }
        debug!(stem, "Hash verified");
        self.materialize(relative_dir, stem, ext, bytes).await
    }
}
