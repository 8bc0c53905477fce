// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Retrieving release assets into a content-addressed cache.

Content lives at `<cache>/sha256/<first 2 hex chars>/<sha256>`. Downloads are
written to a temporary file inside the cache and renamed into place once their
digest is known, so concurrent writers never observe partial content.

Sources that don't advertise digests have the digest learned on first download
recorded in `<cache>/assets.json`, keyed by URL and size.
*/

use {
    crate::{
        error::{BuildError, FetchError, Phase, RemoteError},
        event::{BuildEvent, EventSink},
        io::{is_sha256_hex, sha256_file},
        retry::RetryPolicy,
        source::{deb_assets, ReleaseAsset, ReleaseSelector, ReleaseSource},
    },
    futures::{StreamExt, TryStreamExt},
    log::{debug, info, warn},
    regex::Regex,
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        io::Write,
        path::{Path, PathBuf},
        sync::Mutex,
    },
    tokio_util::sync::CancellationToken,
};

const ASSET_INDEX_VERSION: u32 = 1;

/// A release asset whose content is in the cache.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FetchedAsset {
    pub asset: ReleaseAsset,
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Location of the content.
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct AssetIndexEntry {
    url: String,
    size: u64,
    sha256: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct AssetIndexFile {
    version: u32,
    entries: Vec<AssetIndexEntry>,
}

fn cache_io(path: &Path, e: std::io::Error) -> FetchError {
    FetchError::CacheIo(format!("{}", path.display()), e)
}

/// A content-addressed store of asset content.
#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    index: Mutex<HashMap<(String, u64), String>>,
}

impl ContentCache {
    /// Open a cache, loading its asset index.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FetchError> {
        let root = root.as_ref().to_path_buf();
        let index_path = root.join("assets.json");

        let index = match std::fs::read(&index_path) {
            Ok(data) => match serde_json::from_slice::<AssetIndexFile>(&data) {
                Ok(file) if file.version == ASSET_INDEX_VERSION => file
                    .entries
                    .into_iter()
                    .filter(|e| is_sha256_hex(&e.sha256))
                    .map(|e| ((e.url, e.size), e.sha256))
                    .collect(),
                Ok(file) => {
                    warn!(
                        "ignoring asset index with unknown version {}",
                        file.version
                    );
                    HashMap::new()
                }
                Err(e) => {
                    warn!("ignoring unreadable {}: {}", index_path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(cache_io(&index_path, e)),
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where content with a given digest is stored.
    ///
    /// `sha256` must satisfy [is_sha256_hex].
    pub fn path_for(&self, sha256: &str) -> PathBuf {
        self.root
            .join("sha256")
            .join(sha256.get(0..2).unwrap_or("00"))
            .join(sha256)
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, u64), String>> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The digest of an asset, if advertised or previously learned.
    pub fn known_digest(&self, asset: &ReleaseAsset) -> Option<String> {
        asset
            .sha256
            .clone()
            .filter(|d| is_sha256_hex(d))
            .or_else(|| self.lock().get(&(asset.url.clone(), asset.size)).cloned())
    }

    fn remember(&self, asset: &ReleaseAsset, sha256: &str) {
        self.lock()
            .insert((asset.url.clone(), asset.size), sha256.to_string());
    }

    /// Persist the asset index.
    pub fn save_index(&self) -> Result<(), FetchError> {
        let mut entries = self
            .lock()
            .iter()
            .map(|((url, size), sha256)| AssetIndexEntry {
                url: url.clone(),
                size: *size,
                sha256: sha256.clone(),
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| (&a.url, a.size).cmp(&(&b.url, b.size)));

        let file = AssetIndexFile {
            version: ASSET_INDEX_VERSION,
            entries,
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| cache_io(&self.root, std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        std::fs::create_dir_all(&self.root).map_err(|e| cache_io(&self.root, e))?;
        let path = self.root.join("assets.json");
        let mut temp =
            tempfile::NamedTempFile::new_in(&self.root).map_err(|e| cache_io(&path, e))?;
        temp.write_all(&data).map_err(|e| cache_io(&path, e))?;
        temp.persist(&path).map_err(|e| cache_io(&path, e.error))?;

        Ok(())
    }

    /// Whether cached content exists and hashes to `sha256`.
    ///
    /// Corrupt content is removed.
    pub async fn verify(&self, sha256: &str) -> Result<bool, FetchError> {
        if !is_sha256_hex(sha256) {
            return Ok(false);
        }
        let path = self.path_for(sha256);

        match tokio::fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(cache_io(&path, e)),
        }

        let (actual, _) = sha256_file(&path).await.map_err(|e| cache_io(&path, e))?;
        if actual == sha256 {
            Ok(true)
        } else {
            warn!(
                "cached {} has digest {}; discarding",
                path.display(),
                actual
            );
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| cache_io(&path, e))?;
            Ok(false)
        }
    }
}

/// Settings for [ArtifactFetcher].
#[derive(Clone, Debug)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Additional filter on asset names.
    pub asset_pattern: Option<Regex>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            asset_pattern: None,
        }
    }
}

/// Result of a fetch.
#[derive(Clone, Debug, Default)]
pub struct FetchOutput {
    /// Fetched assets, sorted by name.
    pub assets: Vec<FetchedAsset>,
    pub downloaded: usize,
    pub cached: usize,
}

/// Retrieves the `.deb` assets of a release.
pub struct ArtifactFetcher<'a> {
    source: &'a dyn ReleaseSource,
    cache: &'a ContentCache,
    options: FetchOptions,
    cancel: CancellationToken,
    events: EventSink,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(
        source: &'a dyn ReleaseSource,
        cache: &'a ContentCache,
        options: FetchOptions,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        Self {
            source,
            cache,
            options,
            cancel,
            events,
        }
    }

    /// List the `.deb` assets of a release.
    pub async fn list(&self, release: &ReleaseSelector) -> Result<Vec<ReleaseAsset>, BuildError> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled(Phase::Fetch));
        }

        let what = format!("listing release {} of {}", release, self.source.describe());

        let source = self.source;
        let assets = tokio::select! {
            res = self.options.retry.run(&what, &self.cancel, || source.list_assets(release)) => {
                res.map_err(FetchError::from)?
            }
            _ = self.cancel.cancelled() => return Err(BuildError::Cancelled(Phase::Fetch)),
        };

        let total = assets.len();
        let assets = deb_assets(assets, self.options.asset_pattern.as_ref());
        info!(
            "release {} of {} has {} .deb assets ({} assets total)",
            release,
            self.source.describe(),
            assets.len(),
            total
        );

        Ok(assets)
    }

    /// Fetch all `.deb` assets of a release.
    pub async fn fetch(&self, release: &ReleaseSelector) -> Result<FetchOutput, BuildError> {
        let assets = self.list(release).await?;
        self.fetch_assets(assets).await
    }

    /// Fetch the given assets.
    pub async fn fetch_assets(&self, assets: Vec<ReleaseAsset>) -> Result<FetchOutput, BuildError> {
        self.events.emit(BuildEvent::FetchPlanned {
            assets: assets.len(),
        });

        let results = futures::stream::iter(assets.into_iter().map(|a| self.fetch_one(a)))
            .buffer_unordered(self.options.concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await;

        // Learned digests are kept even when another asset failed.
        self.cache.save_index()?;

        let mut output = FetchOutput::default();
        for (fetched, from_cache) in results? {
            if from_cache {
                output.cached += 1;
            } else {
                output.downloaded += 1;
            }
            output.assets.push(fetched);
        }
        output.assets.sort_by(|a, b| a.asset.name.cmp(&b.asset.name));

        Ok(output)
    }

    async fn fetch_one(&self, asset: ReleaseAsset) -> Result<(FetchedAsset, bool), BuildError> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled(Phase::Fetch));
        }

        if let Some(sha256) = self.cache.known_digest(&asset) {
            if self.cache.verify(&sha256).await? {
                debug!("{} is cached as {}", asset.name, sha256);
                self.events.emit(BuildEvent::AssetFetched {
                    name: asset.name.clone(),
                    size: asset.size,
                    from_cache: true,
                });

                return Ok((
                    FetchedAsset {
                        path: self.cache.path_for(&sha256),
                        asset,
                        sha256,
                    },
                    true,
                ));
            }
        }

        let fetched = tokio::select! {
            res = self.download(&asset) => res?,
            _ = self.cancel.cancelled() => return Err(BuildError::Cancelled(Phase::Fetch)),
        };

        self.events.emit(BuildEvent::AssetFetched {
            name: fetched.asset.name.clone(),
            size: fetched.asset.size,
            from_cache: false,
        });

        Ok((fetched, false))
    }

    async fn download(&self, asset: &ReleaseAsset) -> Result<FetchedAsset, FetchError> {
        let temp_dir = self.cache.temp_dir();
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| cache_io(&temp_dir, e))?;

        info!("downloading {}", asset.name);

        let what = format!("downloading {}", asset.name);
        let source = self.source;
        let temp_dir = temp_dir.as_path();
        let temp = self
            .options
            .retry
            .run(&what, &self.cancel, || async move {
                let temp = tempfile::NamedTempFile::new_in(temp_dir)?;
                let mut fh = tokio::fs::File::from_std(temp.reopen()?);
                source.download_asset(asset, &mut fh).await?;

                Ok::<_, RemoteError>(temp)
            })
            .await?;

        let (sha256, size) = sha256_file(temp.path())
            .await
            .map_err(|e| cache_io(temp.path(), e))?;

        if let Some(expected) = &asset.sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(FetchError::ChecksumMismatch {
                    name: asset.name.clone(),
                    expected: expected.clone(),
                    actual: sha256,
                });
            }
        }

        if size != asset.size {
            warn!(
                "{} advertised {} bytes; downloaded {}",
                asset.name, asset.size, size
            );
        }

        let path = self.cache.path_for(&sha256);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| cache_io(parent, e))?;
        }
        temp.persist(&path).map_err(|e| cache_io(&path, e.error))?;

        self.cache.remember(asset, &sha256);

        Ok(FetchedAsset {
            asset: asset.clone(),
            sha256,
            path,
        })
    }
}
