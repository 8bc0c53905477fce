// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! A filesystem directory as a release source.

The latest release is the directory itself. A tagged release is the
subdirectory named by the tag.
*/

use {
    crate::{
        error::RemoteError,
        source::{ReleaseAsset, ReleaseSelector, ReleaseSource},
    },
    async_trait::async_trait,
    std::path::{Path, PathBuf},
    tokio::io::{AsyncWrite, AsyncWriteExt},
    url::Url,
};

#[derive(Clone, Debug)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn release_dir(&self, release: &ReleaseSelector) -> PathBuf {
        match release {
            ReleaseSelector::Latest => self.root.clone(),
            ReleaseSelector::Tag(tag) => self.root.join(tag),
        }
    }
}

#[async_trait]
impl ReleaseSource for LocalSource {
    fn describe(&self) -> String {
        format!("{}", self.root.display())
    }

    async fn list_assets(&self, release: &ReleaseSelector) -> Result<Vec<ReleaseAsset>, RemoteError> {
        let dir = self.release_dir(release);

        if !dir.is_dir() {
            return Err(RemoteError::not_found(format!(
                "release {}: {} is not a directory",
                release,
                dir.display()
            )));
        }

        let dir = dir.canonicalize()?;
        let mut assets = vec![];
        let mut entries = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let path = entry.path();
            let url = Url::from_file_path(&path).map_err(|_| {
                RemoteError::not_found(format!("{} is not an absolute path", path.display()))
            })?;

            assets.push(ReleaseAsset {
                name: entry.file_name().to_string_lossy().to_string(),
                url: url.to_string(),
                sha256: None,
                size: metadata.len(),
            });
        }

        assets.sort();

        Ok(assets)
    }

    async fn download_asset(
        &self,
        asset: &ReleaseAsset,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError> {
        let path = Url::parse(&asset.url)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| RemoteError::not_found(format!("not a file URL: {}", asset.url)))?;

        let mut fh = tokio::fs::File::open(&path).await?;
        let written = tokio::io::copy(&mut fh, &mut *writer).await?;
        writer.flush().await?;

        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::error::RemoteErrorKind};

    #[tokio::test]
    async fn list_and_download() -> Result<(), RemoteError> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("b.deb"), b"bbb")?;
        std::fs::write(dir.path().join("a.deb"), b"a")?;
        std::fs::create_dir(dir.path().join("v1"))?;
        std::fs::write(dir.path().join("v1/c.deb"), b"cc")?;

        let source = LocalSource::new(dir.path());

        let latest = source.list_assets(&ReleaseSelector::Latest).await?;
        assert_eq!(
            latest.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["a.deb", "b.deb"]
        );
        assert_eq!(latest[1].size, 3);

        let tagged = source
            .list_assets(&ReleaseSelector::Tag("v1".into()))
            .await?;
        assert_eq!(tagged.len(), 1);

        let mut data: Vec<u8> = vec![];
        let written = source.download_asset(&tagged[0], &mut data).await?;
        assert_eq!(written, 2);
        assert_eq!(data, b"cc");

        let missing = source
            .list_assets(&ReleaseSelector::Tag("v2".into()))
            .await
            .unwrap_err();
        assert_eq!(missing.kind, RemoteErrorKind::NotFound);

        Ok(())
    }
}
