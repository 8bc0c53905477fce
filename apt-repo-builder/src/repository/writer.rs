// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writable repository trees.

Paths are `/` delimited and relative to the repository root.
*/

use {
    crate::io::sha256_hex,
    async_trait::async_trait,
    futures::{AsyncRead, AsyncReadExt},
    std::{
        borrow::Cow,
        collections::BTreeMap,
        io::{Error as IoError, ErrorKind},
        path::{Path, PathBuf},
        pin::Pin,
        sync::Mutex,
    },
};

/// Describes a repository path verification state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepositoryPathVerificationState {
    /// The path exists and its content has the expected digest.
    ExistsIntegrityVerified,
    /// The path exists and its content doesn't match expectations.
    ExistsIntegrityMismatch,
    /// The path is missing.
    Missing,
}

#[derive(Clone, Debug)]
pub struct RepositoryWrite<'a> {
    /// The path that was written.
    pub path: Cow<'a, str>,
    /// The number of bytes written.
    pub bytes_written: u64,
}

#[async_trait]
pub trait RepositoryWriter: Send + Sync {
    /// Check whether a path exists with content of the given SHA-256.
    async fn verify_path(
        &self,
        path: &str,
        sha256: &str,
    ) -> std::io::Result<RepositoryPathVerificationState>;

    /// Write data to a given path, replacing any existing content atomically.
    async fn write_path<'path, 'reader>(
        &self,
        path: Cow<'path, str>,
        reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> std::io::Result<RepositoryWrite<'path>>;

    /// Read the content of a path, if it exists.
    async fn read_path(&self, path: &str) -> std::io::Result<Option<Vec<u8>>>;

    /// Hex SHA-256 and size of a path, if it exists.
    async fn digest_path(&self, path: &str) -> std::io::Result<Option<(String, u64)>> {
        Ok(self
            .read_path(path)
            .await?
            .map(|data| (sha256_hex(&data), data.len() as u64)))
    }

    /// All file paths in the tree, sorted.
    async fn list_paths(&self) -> std::io::Result<Vec<String>>;

    /// Remove a file. Removing a missing path is not an error.
    async fn remove_path(&self, path: &str) -> std::io::Result<()>;
}

fn validate_path(path: &str) -> std::io::Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|c| c.is_empty() || c == "." || c == "..")
    {
        Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("invalid repository path: {}", path),
        ))
    } else {
        Ok(())
    }
}

/// A writable repository backed by a filesystem directory.
///
/// Writes go to a temporary file in the destination directory that is renamed
/// into place once complete.
#[derive(Clone, Debug)]
pub struct FilesystemRepositoryWriter {
    root_dir: PathBuf,
}

impl FilesystemRepositoryWriter {
    /// Construct a new instance, bound to the root directory specified.
    ///
    /// The directory does not need to exist.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn resolve(&self, path: &str) -> std::io::Result<PathBuf> {
        validate_path(path)?;

        Ok(self.root_dir.join(path))
    }
}

fn walk(root: &Path, dir: &Path, paths: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            walk(root, &path, paths)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            paths.push(
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            );
        }
    }

    Ok(())
}

/// Remove empty directories below `dir`.
fn prune_empty_dirs(dir: &Path) -> std::io::Result<bool> {
    let mut empty = true;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;

        if entry.file_type()?.is_dir() && prune_empty_dirs(&entry.path())? {
            std::fs::remove_dir(entry.path())?;
        } else {
            empty = false;
        }
    }

    Ok(empty)
}

#[async_trait]
impl RepositoryWriter for FilesystemRepositoryWriter {
    async fn verify_path(
        &self,
        path: &str,
        sha256: &str,
    ) -> std::io::Result<RepositoryPathVerificationState> {
        let dest_path = self.resolve(path)?;

        match tokio::fs::metadata(&dest_path).await {
            Ok(metadata) if metadata.is_file() => {
                let (digest, _) = crate::io::sha256_file(&dest_path).await?;

                Ok(if digest == sha256 {
                    RepositoryPathVerificationState::ExistsIntegrityVerified
                } else {
                    RepositoryPathVerificationState::ExistsIntegrityMismatch
                })
            }
            Ok(_) => Ok(RepositoryPathVerificationState::Missing),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Ok(RepositoryPathVerificationState::Missing)
            }
            Err(e) => Err(e),
        }
    }

    async fn digest_path(&self, path: &str) -> std::io::Result<Option<(String, u64)>> {
        match crate::io::sha256_file(&self.resolve(path)?).await {
            Ok(digest) => Ok(Some(digest)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_path<'path, 'reader>(
        &self,
        path: Cow<'path, str>,
        reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> std::io::Result<RepositoryWrite<'path>> {
        let dest_path = self.resolve(path.as_ref())?;
        let parent = dest_path
            .parent()
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "path has no parent"))?;

        std::fs::create_dir_all(parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        let bytes_written = {
            let mut writer = futures::io::AllowStdIo::new(temp.as_file_mut());
            futures::io::copy(reader, &mut writer).await?
        };
        temp.as_file().sync_all()?;
        temp.persist(&dest_path).map_err(|e| e.error)?;

        Ok(RepositoryWrite {
            path,
            bytes_written,
        })
    }

    async fn read_path(&self, path: &str) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_paths(&self) -> std::io::Result<Vec<String>> {
        let mut paths = vec![];

        if self.root_dir.is_dir() {
            walk(&self.root_dir, &self.root_dir, &mut paths)?;
        }

        paths.sort();

        Ok(paths)
    }

    async fn remove_path(&self, path: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if self.root_dir.is_dir() {
            prune_empty_dirs(&self.root_dir)?;
        }

        Ok(())
    }
}

/// A [RepositoryWriter] holding content in memory.
///
/// Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryRepositoryWriter {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryRepositoryWriter {
    /// Snapshot of all files.
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A poisoned map is still structurally valid.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RepositoryWriter for MemoryRepositoryWriter {
    async fn verify_path(
        &self,
        path: &str,
        sha256: &str,
    ) -> std::io::Result<RepositoryPathVerificationState> {
        Ok(match self.lock().get(path) {
            Some(data) if sha256_hex(data) == sha256 => {
                RepositoryPathVerificationState::ExistsIntegrityVerified
            }
            Some(_) => RepositoryPathVerificationState::ExistsIntegrityMismatch,
            None => RepositoryPathVerificationState::Missing,
        })
    }

    async fn write_path<'path, 'reader>(
        &self,
        path: Cow<'path, str>,
        mut reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> std::io::Result<RepositoryWrite<'path>> {
        validate_path(path.as_ref())?;

        let mut data = vec![];
        reader.read_to_end(&mut data).await?;
        let bytes_written = data.len() as u64;

        self.lock().insert(path.to_string(), data);

        Ok(RepositoryWrite {
            path,
            bytes_written,
        })
    }

    async fn read_path(&self, path: &str) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.lock().get(path).cloned())
    }

    async fn list_paths(&self) -> std::io::Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    async fn remove_path(&self, path: &str) -> std::io::Result<()> {
        self.lock().remove(path);

        Ok(())
    }
}

/// Write an in-memory buffer to a path.
pub async fn write_bytes(
    writer: &dyn RepositoryWriter,
    path: &str,
    data: &[u8],
) -> std::io::Result<u64> {
    let write = writer
        .write_path(
            Cow::Borrowed(path),
            Box::pin(futures::io::Cursor::new(data.to_vec())),
        )
        .await?;

    Ok(write.bytes_written)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn filesystem_write_list_remove() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = FilesystemRepositoryWriter::new(dir.path().join("repo"));

        write_bytes(&writer, "dists/stable/Release", b"release").await?;
        write_bytes(&writer, "pool/main/all/a.deb", b"deb").await?;
        write_bytes(&writer, "dists/stable/Release", b"release 2").await?;

        assert_eq!(
            writer.list_paths().await?,
            vec!["dists/stable/Release", "pool/main/all/a.deb"]
        );
        assert_eq!(
            writer.read_path("dists/stable/Release").await?,
            Some(b"release 2".to_vec())
        );
        assert_eq!(
            writer
                .verify_path("pool/main/all/a.deb", &sha256_hex(b"deb"))
                .await?,
            RepositoryPathVerificationState::ExistsIntegrityVerified
        );
        assert_eq!(
            writer.verify_path("pool/main/all/a.deb", "00").await?,
            RepositoryPathVerificationState::ExistsIntegrityMismatch
        );

        writer.remove_path("pool/main/all/a.deb").await?;
        assert!(!dir.path().join("repo/pool").exists());
        assert_eq!(
            writer.verify_path("pool/main/all/a.deb", "00").await?,
            RepositoryPathVerificationState::Missing
        );
        writer.remove_path("pool/main/all/a.deb").await?;

        Ok(())
    }

    #[tokio::test]
    async fn no_temporary_files_left_behind() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = FilesystemRepositoryWriter::new(dir.path());

        write_bytes(&writer, "a/b", b"x").await?;

        assert_eq!(std::fs::read_dir(dir.path().join("a"))?.count(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn digests_agree_across_writers() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let filesystem = FilesystemRepositoryWriter::new(dir.path());
        let memory = MemoryRepositoryWriter::default();

        let content = vec![7u8; 200 * 1024];
        write_bytes(&filesystem, "pool/big.deb", &content).await?;
        write_bytes(&memory, "pool/big.deb", &content).await?;

        let expected = Some((sha256_hex(&content), content.len() as u64));
        assert_eq!(filesystem.digest_path("pool/big.deb").await?, expected);
        assert_eq!(memory.digest_path("pool/big.deb").await?, expected);
        assert_eq!(filesystem.digest_path("pool/missing.deb").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let writer = MemoryRepositoryWriter::default();

        for path in ["../x", "/etc/passwd", "a//b", ""] {
            assert!(write_bytes(&writer, path, b"x").await.is_err());
        }
    }
}
