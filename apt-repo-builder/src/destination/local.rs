// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! A filesystem directory as a publish destination.

The destination path is a symbolic link to a generation directory
`.<name>.<n>` next to it. The staging area is a sibling directory
`.<name>.staging` seeded with hard links to the live files. Promotion renames
the staging directory to the next generation and atomically replaces the link,
so the destination path resolves to a complete tree at every point.
*/

use {
    crate::{
        destination::{PublishDestination, PublishedAsset},
        error::{RemoteError, RemoteErrorKind},
        io::sha256_file,
        repository::writer::{write_bytes, FilesystemRepositoryWriter, RepositoryWriter},
    },
    async_trait::async_trait,
    bytes::Bytes,
    log::{debug, info, warn},
    std::path::{Path, PathBuf},
};

#[derive(Clone, Debug)]
pub struct LocalDestination {
    live: FilesystemRepositoryWriter,
    staging: FilesystemRepositoryWriter,
    /// Name prefix of generation directories.
    generation_prefix: String,
    /// Where the replacement link is created before renaming it into place.
    pending_link: PathBuf,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repository".to_string())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    path.with_file_name(format!(".{}.{}", file_name(path), suffix))
}

async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn remove_link(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
async fn symlink_dir(target: &str, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_dir(target: &str, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}

/// Populate `dest` with links to every file under `source`.
fn link_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;

    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            link_tree(&entry.path(), &target)?;
        } else if std::fs::hard_link(entry.path(), &target).is_err() {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

impl LocalDestination {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        Self {
            live: FilesystemRepositoryWriter::new(path),
            staging: FilesystemRepositoryWriter::new(sibling(path, "staging")),
            generation_prefix: format!(".{}.", file_name(path)),
            pending_link: sibling(path, "link"),
        }
    }

    pub fn path(&self) -> &Path {
        self.live.root_dir()
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.root_dir()
    }

    fn generation_name(&self, generation: u64) -> String {
        format!("{}{}", self.generation_prefix, generation)
    }

    /// The generation the destination link points at, if any.
    async fn current_generation(&self) -> Option<u64> {
        let target = tokio::fs::read_link(self.path()).await.ok()?;
        let name = target.file_name()?.to_str()?;

        name.strip_prefix(&self.generation_prefix)?.parse().ok()
    }

    /// Point the destination link at `generation`, replacing any previous link.
    async fn switch_to(&self, generation: u64) -> std::io::Result<()> {
        remove_link(&self.pending_link).await?;
        symlink_dir(&self.generation_name(generation), &self.pending_link).await?;

        if let Err(e) = tokio::fs::rename(&self.pending_link, self.path()).await {
            remove_link(&self.pending_link).await?;
            return Err(e);
        }

        Ok(())
    }

    /// Remove generation directories other than `keep`.
    ///
    /// The previous generation stays readable until the next promotion.
    async fn remove_generations_except(&self, keep: &[Option<u64>]) -> std::io::Result<()> {
        let parent = match self.path().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut entries = tokio::fs::read_dir(&parent).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();

            let generation = match name
                .strip_prefix(&self.generation_prefix)
                .and_then(|g| g.parse::<u64>().ok())
            {
                Some(generation) => generation,
                None => continue,
            };

            if !keep.contains(&Some(generation)) {
                debug!("removing old generation {}", name);
                remove_tree(&entry.path()).await?;
            }
        }

        Ok(())
    }

    /// Turn a plain directory at the destination path into generation 0.
    ///
    /// The path is briefly absent while this happens. It only happens once.
    async fn adopt_directory(&self) -> std::io::Result<()> {
        let generation = self.path().with_file_name(self.generation_name(0));
        warn!(
            "moving {} to {} to enable atomic publishing",
            self.path().display(),
            generation.display()
        );

        remove_tree(&generation).await?;
        tokio::fs::rename(self.path(), &generation).await?;
        symlink_dir(&self.generation_name(0), self.path()).await
    }
}

#[async_trait]
impl PublishDestination for LocalDestination {
    fn describe(&self) -> String {
        format!("{}", self.path().display())
    }

    async fn create_release(&self) -> Result<(), RemoteError> {
        let metadata = tokio::fs::symlink_metadata(self.path()).await;

        match metadata {
            Ok(m) if m.file_type().is_symlink() => {}
            Ok(m) if m.is_dir() => self.adopt_directory().await?,
            Ok(_) => {
                return Err(RemoteError::new(
                    RemoteErrorKind::LocalIo,
                    format!("{} is not a directory", self.path().display()),
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = self.path().parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                let generation = self.path().with_file_name(self.generation_name(0));
                tokio::fs::create_dir_all(&generation).await?;
                self.switch_to(0).await?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    async fn list_assets(&self) -> Result<Vec<PublishedAsset>, RemoteError> {
        if !self.path().is_dir() {
            return Err(RemoteError::not_found(format!(
                "{} does not exist",
                self.path().display()
            )));
        }

        let mut assets = vec![];
        for path in self.live.list_paths().await? {
            let (sha256, size) = sha256_file(&self.path().join(&path)).await?;
            assets.push(PublishedAsset { path, size, sha256 });
        }

        Ok(assets)
    }

    async fn stage(&self) -> Result<(), RemoteError> {
        let staging = self.staging_path().to_path_buf();
        remove_tree(&staging).await?;

        let live = self.path().to_path_buf();
        debug!("seeding {} from {}", staging.display(), live.display());

        tokio::task::spawn_blocking(move || {
            if live.is_dir() {
                link_tree(&live, &staging)
            } else {
                std::fs::create_dir_all(&staging)
            }
        })
        .await
        .map_err(|e| RemoteError::network(format!("staging task failed: {}", e)))??;

        Ok(())
    }

    async fn upload_asset(
        &self,
        path: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        debug!("writing {} ({})", path, content_type);
        write_bytes(&self.staging, path, &data).await?;

        Ok(())
    }

    async fn delete_asset(&self, path: &str) -> Result<(), RemoteError> {
        self.staging.remove_path(path).await?;

        Ok(())
    }

    async fn promote(&self) -> Result<(), RemoteError> {
        if !self.staging_path().is_dir() {
            return Err(RemoteError::not_found(format!(
                "no staging area at {}",
                self.staging_path().display()
            )));
        }

        if self.path().is_dir() && !self.path().is_symlink() {
            self.adopt_directory().await?;
        }

        let previous = self.current_generation().await;
        let next = previous.map(|g| g + 1).unwrap_or(0);
        let next_dir = self.path().with_file_name(self.generation_name(next));

        remove_tree(&next_dir).await?;
        tokio::fs::rename(self.staging_path(), &next_dir).await?;

        if let Err(e) = self.switch_to(next).await {
            tokio::fs::rename(&next_dir, self.staging_path()).await?;
            return Err(e.into());
        }

        self.remove_generations_except(&[Some(next), previous]).await?;
        info!("promoted {}", self.path().display());

        Ok(())
    }

    async fn discard(&self) -> Result<(), RemoteError> {
        remove_tree(self.staging_path()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    #[tokio::test]
    async fn stage_upload_promote() -> Result<(), RemoteError> {
        let dir = tempfile::tempdir()?;
        let dest = LocalDestination::new(dir.path().join("repo"));

        assert!(dest.list_assets().await.is_err());
        dest.create_release().await?;
        assert!(dest.list_assets().await?.is_empty());

        dest.stage().await?;
        dest.upload_asset("a/one", "text/plain", Bytes::from_static(b"1"))
            .await?;
        dest.upload_asset("two", "text/plain", Bytes::from_static(b"22"))
            .await?;

        // Staged content is invisible until promotion.
        assert!(dest.list_assets().await?.is_empty());
        dest.promote().await?;

        let assets = dest.list_assets().await?;
        assert_eq!(
            assets.iter().map(|a| a.path.as_str()).collect::<Vec<_>>(),
            vec!["a/one", "two"]
        );
        assert_eq!(assets[1].size, 2);
        assert!(!dest.staging_path().exists());

        dest.stage().await?;
        dest.delete_asset("a/one").await?;
        dest.upload_asset("two", "text/plain", Bytes::from_static(b"333"))
            .await?;
        dest.discard().await?;

        let after_discard = dest.list_assets().await?;
        assert_eq!(after_discard, assets);
        assert_eq!(std::fs::read(dest.path().join("two"))?, b"22");

        dest.stage().await?;
        dest.delete_asset("a/one").await?;
        dest.promote().await?;
        assert_eq!(dest.list_assets().await?.len(), 1);
        assert!(!dest.path().join("a").exists());

        Ok(())
    }

    #[tokio::test]
    async fn staged_writes_do_not_alter_live_files() -> Result<(), RemoteError> {
        let dir = tempfile::tempdir()?;
        let dest = LocalDestination::new(dir.path().join("repo"));
        dest.create_release().await?;
        std::fs::write(dest.path().join("file"), b"live")?;

        dest.stage().await?;
        dest.upload_asset("file", "text/plain", Bytes::from_static(b"new"))
            .await?;

        assert_eq!(std::fs::read(dest.path().join("file"))?, b"live");

        Ok(())
    }

    #[tokio::test]
    async fn promotion_never_hides_the_live_tree() -> Result<(), RemoteError> {
        let dir = tempfile::tempdir()?;
        let dest = LocalDestination::new(dir.path().join("repo"));
        dest.create_release().await?;
        std::fs::write(dest.path().join("marker"), b"0")?;
        assert!(std::fs::symlink_metadata(dest.path())?.file_type().is_symlink());

        let marker = dest.path().join("marker");
        let done = Arc::new(AtomicBool::new(false));
        let watcher = {
            let done = done.clone();
            std::thread::spawn(move || {
                let mut missing = 0;
                while !done.load(Ordering::SeqCst) {
                    if std::fs::read(&marker).is_err() {
                        missing += 1;
                    }
                }
                missing
            })
        };

        for round in 1..=20u32 {
            dest.stage().await?;
            dest.upload_asset("marker", "text/plain", Bytes::from(round.to_string()))
                .await?;
            dest.promote().await?;
        }

        done.store(true, Ordering::SeqCst);
        let missing = watcher.join().unwrap();

        assert_eq!(missing, 0);
        assert_eq!(std::fs::read(dest.path().join("marker"))?, b"20");

        // The live and the previous generation are kept.
        let mut generations = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(".repo."))
            .collect::<Vec<_>>();
        generations.sort();
        assert_eq!(
            generations,
            vec![".repo.19".to_string(), ".repo.20".to_string()]
        );

        Ok(())
    }

    #[tokio::test]
    async fn plain_directory_is_adopted() -> Result<(), RemoteError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("repo");
        std::fs::create_dir_all(path.join("dists"))?;
        std::fs::write(path.join("dists/Release"), b"old")?;

        let dest = LocalDestination::new(&path);
        dest.create_release().await?;

        assert!(std::fs::symlink_metadata(&path)?.file_type().is_symlink());
        assert_eq!(std::fs::read(path.join("dists/Release"))?, b"old");
        assert_eq!(dest.list_assets().await?.len(), 1);

        Ok(())
    }
}
