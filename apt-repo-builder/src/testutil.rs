// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators with failure injection.

use {
    crate::{
        destination::{PublishDestination, PublishedAsset},
        error::{RemoteError, RemoteErrorKind},
        io::sha256_hex,
        source::{ReleaseAsset, ReleaseSelector, ReleaseSource},
    },
    async_trait::async_trait,
    bytes::Bytes,
    std::{
        collections::{BTreeMap, HashMap},
        sync::{Arc, Mutex, MutexGuard},
    },
    tokio::io::{AsyncWrite, AsyncWriteExt},
};

type Failures = HashMap<String, (RemoteErrorKind, usize)>;

/// Consume one injected failure for `key`.
fn take_failure(failures: &mut Failures, key: &str) -> Option<RemoteError> {
    let (kind, remaining) = failures.get_mut(key)?;
    if *remaining == 0 {
        return None;
    }
    *remaining -= 1;

    Some(RemoteError::new(*kind, format!("injected failure for {}", key)))
}

#[derive(Default)]
struct SourceState {
    releases: BTreeMap<String, Vec<(ReleaseAsset, Vec<u8>)>>,
    latest: Option<String>,
    failures: Failures,
    downloads: usize,
}

/// A [ReleaseSource] serving content from memory.
///
/// The latest release is the most recently added tag.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

impl MemorySource {
    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap()
    }

    fn insert(&self, tag: &str, name: &str, data: &[u8], sha256: Option<String>) {
        let asset = ReleaseAsset {
            name: name.to_string(),
            url: format!("memory://{}/{}", tag, name),
            sha256,
            size: data.len() as u64,
        };

        let mut state = self.lock();
        let assets = state.releases.entry(tag.to_string()).or_default();
        assets.retain(|(a, _)| a.name != name);
        assets.push((asset, data.to_vec()));
        state.latest = Some(tag.to_string());
    }

    /// Attach an asset to a release, optionally advertising its digest.
    pub fn add(&self, tag: &str, name: &str, data: &[u8], advertise_digest: bool) {
        let digest = advertise_digest.then(|| sha256_hex(data));
        self.insert(tag, name, data, digest);
    }

    /// Attach an asset advertising an arbitrary digest.
    pub fn add_with_digest(&self, tag: &str, name: &str, data: &[u8], sha256: &str) {
        self.insert(tag, name, data, Some(sha256.to_string()));
    }

    /// Make the next `count` downloads of `name` fail.
    pub fn fail_downloads(&self, name: &str, kind: RemoteErrorKind, count: usize) {
        self.lock().failures.insert(name.to_string(), (kind, count));
    }

    /// Number of successful downloads.
    pub fn downloads(&self) -> usize {
        self.lock().downloads
    }
}

#[async_trait]
impl ReleaseSource for MemorySource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list_assets(&self, release: &ReleaseSelector) -> Result<Vec<ReleaseAsset>, RemoteError> {
        let state = self.lock();

        let tag = match release {
            ReleaseSelector::Latest => state.latest.clone(),
            ReleaseSelector::Tag(tag) => Some(tag.clone()),
        };

        tag.and_then(|tag| state.releases.get(&tag))
            .map(|assets| assets.iter().map(|(a, _)| a.clone()).collect())
            .ok_or_else(|| RemoteError::not_found(format!("release {}", release)))
    }

    async fn download_asset(
        &self,
        asset: &ReleaseAsset,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError> {
        let data = {
            let mut state = self.lock();

            if let Some(e) = take_failure(&mut state.failures, &asset.name) {
                return Err(e);
            }

            let data = state
                .releases
                .values()
                .flatten()
                .find(|(a, _)| a.url == asset.url)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| RemoteError::not_found(&asset.url))?;
            state.downloads += 1;

            data
        };

        writer.write_all(&data).await?;
        writer.flush().await?;

        Ok(data.len() as u64)
    }
}

type Tree = BTreeMap<String, (Vec<u8>, String)>;

struct DestinationState {
    released: bool,
    live: Tree,
    staging: Option<Tree>,
    failures: Failures,
    upload_attempts: usize,
    deletions: usize,
    promotions: usize,
}

/// A [PublishDestination] holding trees in memory.
///
/// Clones share state.
#[derive(Clone)]
pub struct MemoryDestination {
    state: Arc<Mutex<DestinationState>>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(DestinationState {
                released: true,
                live: Tree::new(),
                staging: None,
                failures: Failures::new(),
                upload_attempts: 0,
                deletions: 0,
                promotions: 0,
            })),
        }
    }
}

impl MemoryDestination {
    /// A destination whose release doesn't exist yet.
    pub fn unreleased() -> Self {
        let dest = Self::default();
        dest.lock().released = false;
        dest
    }

    fn lock(&self) -> MutexGuard<'_, DestinationState> {
        self.state.lock().unwrap()
    }

    /// Add files to the live tree.
    pub fn seed(&self, files: &[(&str, &[u8])]) {
        let mut state = self.lock();
        for (path, data) in files {
            state.live.insert(
                path.to_string(),
                (data.to_vec(), "application/octet-stream".to_string()),
            );
        }
    }

    /// Make the next `count` uploads of `path` fail.
    pub fn fail_uploads(&self, path: &str, kind: RemoteErrorKind, count: usize) {
        self.lock().failures.insert(path.to_string(), (kind, count));
    }

    /// Snapshot of the live tree.
    pub fn live(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock()
            .live
            .iter()
            .map(|(k, (data, _))| (k.clone(), data.clone()))
            .collect()
    }

    pub fn content_type(&self, path: &str) -> Option<String> {
        self.lock().live.get(path).map(|(_, ct)| ct.clone())
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn has_staging(&self) -> bool {
        self.lock().staging.is_some()
    }

    pub fn upload_attempts(&self) -> usize {
        self.lock().upload_attempts
    }

    pub fn deletions(&self) -> usize {
        self.lock().deletions
    }

    pub fn promotions(&self) -> usize {
        self.lock().promotions
    }
}

fn no_staging() -> RemoteError {
    RemoteError::not_found("no staging area")
}

#[async_trait]
impl PublishDestination for MemoryDestination {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn create_release(&self) -> Result<(), RemoteError> {
        self.lock().released = true;

        Ok(())
    }

    async fn list_assets(&self) -> Result<Vec<PublishedAsset>, RemoteError> {
        let state = self.lock();

        if !state.released {
            return Err(RemoteError::not_found("release does not exist"));
        }

        Ok(state
            .live
            .iter()
            .map(|(path, (data, _))| PublishedAsset {
                path: path.clone(),
                size: data.len() as u64,
                sha256: sha256_hex(data),
            })
            .collect())
    }

    async fn stage(&self) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.staging = Some(state.live.clone());

        Ok(())
    }

    async fn upload_asset(
        &self,
        path: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.upload_attempts += 1;

        if let Some(e) = take_failure(&mut state.failures, path) {
            return Err(e);
        }

        state
            .staging
            .as_mut()
            .ok_or_else(no_staging)?
            .insert(path.to_string(), (data.to_vec(), content_type.to_string()));

        Ok(())
    }

    async fn delete_asset(&self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.staging.as_mut().ok_or_else(no_staging)?.remove(path);
        state.deletions += 1;

        Ok(())
    }

    async fn promote(&self) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let staging = state.staging.take().ok_or_else(no_staging)?;
        state.live = staging;
        state.promotions += 1;

        Ok(())
    }

    async fn discard(&self) -> Result<(), RemoteError> {
        self.lock().staging = None;

        Ok(())
    }
}
