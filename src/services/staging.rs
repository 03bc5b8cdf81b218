//! Local scratch tree for one task at a time.
//!
//! Layout: `<root>/<original>/<key>` for downloads and `<root>/<converted>/<key'>`
//! for output. Every directory and file the pipeline creates below the root is
//! brought to the configured owner and mode right after it is written.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ConverterConfig;
use crate::utils::keys;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("object key '{0}' cannot be mapped into the staging tree")]
    InvalidKey(String),

    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chown {path}: {reason}")]
    Ownership { path: PathBuf, reason: String },
}

impl StagingError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file written into the staging tree, after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub owner: Option<(u32, u32)>,
    pub mode: u32,
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    original_root: PathBuf,
    converted_root: PathBuf,
    owner: Option<(u32, u32)>,
    dir_mode: u32,
    file_mode: u32,
}

impl StagingArea {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            root: config.staging_root.clone(),
            original_root: config.original_root(),
            converted_root: config.converted_root(),
            owner: config.owner(),
            dir_mode: config.dir_mode,
            file_mode: config.file_mode,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn original_root(&self) -> &Path {
        &self.original_root
    }

    pub fn converted_root(&self) -> &Path {
        &self.converted_root
    }

    /// Where the download of `key` is staged.
    pub fn original_path(&self, key: &str) -> Result<PathBuf, StagingError> {
        keys::relative_path(key)
            .map(|rel| self.original_root.join(rel))
            .ok_or_else(|| StagingError::InvalidKey(key.to_string()))
    }

    /// Where the output for `key` is staged, `key` being the destination name.
    pub fn converted_path(&self, key: &str) -> Result<PathBuf, StagingError> {
        keys::relative_path(key)
            .map(|rel| self.converted_root.join(rel))
            .ok_or_else(|| StagingError::InvalidKey(key.to_string()))
    }

    /// Creates every missing segment of `path` and normalizes the ones below the
    /// staging root. Succeeds when the directory already exists.
    pub async fn ensure_directory(&self, path: &Path) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StagingError::io("create_dir_all", path, e))?;
        self.set_owner_and_mode(path).await
    }

    /// Writes `data` to `path`, creating parents, then normalizes the file and
    /// every directory between the staging root and it.
    pub async fn write_file(&self, path: &Path, data: &[u8]) -> Result<StagedFile, StagingError> {
        if let Some(parent) = path.parent() {
            self.ensure_directory(parent).await?;
        }
        tokio::fs::write(path, data)
            .await
            .map_err(|e| StagingError::io("write", path, e))?;
        self.set_owner_and_mode(path).await?;

        Ok(StagedFile {
            path: path.to_path_buf(),
            owner: self.owner,
            mode: self.file_mode,
        })
    }

    /// Copies a staged file byte for byte, normalizing the copy.
    pub async fn copy_file(&self, from: &Path, to: &Path) -> Result<StagedFile, StagingError> {
        if let Some(parent) = to.parent() {
            self.ensure_directory(parent).await?;
        }
        tokio::fs::copy(from, to)
            .await
            .map_err(|e| StagingError::io("copy", to, e))?;
        self.set_owner_and_mode(to).await?;

        Ok(StagedFile {
            path: to.to_path_buf(),
            owner: self.owner,
            mode: self.file_mode,
        })
    }

    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, StagingError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| StagingError::io("read", path, e))
    }

    /// Removes a staged file; a file that is already gone is not an error.
    pub async fn remove_file(&self, path: &Path) -> Result<(), StagingError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::io("remove", path, e)),
        }
    }

    /// Applies owner and mode to every segment of `path` from the staging root
    /// down to `path` itself: directories get the directory mode, a final file
    /// gets the file mode. Segments above the root are left alone.
    pub async fn set_owner_and_mode(&self, path: &Path) -> Result<(), StagingError> {
        let mut segments: Vec<&Path> = path
            .ancestors()
            .take_while(|p| p.starts_with(&self.root))
            .collect();
        segments.reverse();

        for segment in segments {
            let meta = tokio::fs::metadata(segment)
                .await
                .map_err(|e| StagingError::io("stat", segment, e))?;
            let mode = if meta.is_dir() {
                self.dir_mode
            } else {
                self.file_mode
            };
            self.apply(segment, mode).await?;
        }

        Ok(())
    }

    #[cfg(unix)]
    async fn apply(&self, path: &Path, mode: u32) -> Result<(), StagingError> {
        use std::os::unix::fs::PermissionsExt;

        if let Some((uid, gid)) = self.owner {
            nix::unistd::chown(
                path,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )
            .map_err(|e| StagingError::Ownership {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| StagingError::io("chmod", path, e))
    }

    #[cfg(not(unix))]
    async fn apply(&self, _path: &Path, _mode: u32) -> Result<(), StagingError> {
        Ok(())
    }
}
