// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publishing a repository tree to a destination.

Publishing diffs the local tree against the live destination, uploads the
difference to a staging area, applies deletions once every upload succeeded
and then promotes the staging area. Any failure discards the staging area.
*/

use {
    crate::{
        destination::{content_type, PublishDestination, PublishedAsset},
        error::{BuildError, Phase, PublishError, RemoteErrorKind},
        event::{BuildEvent, EventSink},
        io::sha256_hex,
        repository::writer::RepositoryWriter,
        retry::RetryPolicy,
    },
    bytes::Bytes,
    futures::{StreamExt, TryStreamExt},
    log::{debug, info, warn},
    std::collections::BTreeMap,
    tokio_util::sync::CancellationToken,
};

/// Changes needed to make a destination match a local tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPlan {
    /// Files that are new or whose size or digest differs.
    pub upload: Vec<PublishedAsset>,
    /// Paths already holding the local content.
    pub unchanged: Vec<String>,
    /// Live paths absent from the local tree.
    pub delete: Vec<String>,
}

impl PublishPlan {
    /// Diff a local tree against the live assets.
    ///
    /// Stale live assets are only scheduled for deletion when
    /// `delete_existing` is set.
    pub fn compute(
        local: &[PublishedAsset],
        live: &[PublishedAsset],
        delete_existing: bool,
    ) -> Self {
        let live = live
            .iter()
            .map(|a| (a.path.as_str(), a))
            .collect::<BTreeMap<_, _>>();

        let mut plan = Self::default();

        for asset in local {
            match live.get(asset.path.as_str()) {
                Some(existing) if existing.size == asset.size && existing.sha256 == asset.sha256 => {
                    plan.unchanged.push(asset.path.clone());
                }
                _ => plan.upload.push(asset.clone()),
            }
        }

        if delete_existing {
            let local_paths = local
                .iter()
                .map(|a| a.path.as_str())
                .collect::<std::collections::BTreeSet<_>>();

            plan.delete = live
                .keys()
                .filter(|p| !local_paths.contains(*p))
                .map(|p| p.to_string())
                .collect();
        }

        plan.upload.sort();
        plan.unchanged.sort();

        plan
    }

    /// Whether applying the plan changes nothing.
    pub fn is_empty(&self) -> bool {
        self.upload.is_empty() && self.delete.is_empty()
    }

    pub fn upload_bytes(&self) -> u64 {
        self.upload.iter().map(|a| a.size).sum()
    }
}

/// Settings for [Publisher].
#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Remove live assets that the local tree doesn't have.
    pub delete_existing: bool,
    /// Compute the plan without changing the destination.
    pub dry_run: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            delete_existing: false,
            dry_run: false,
        }
    }
}

/// The result of publishing.
#[derive(Clone, Debug, Default)]
pub struct PublishOutput {
    pub plan: PublishPlan,
    pub uploaded: usize,
    pub deleted: usize,
    /// Whether the staging area replaced the live repository.
    pub promoted: bool,
}

/// Inventory of a local tree.
pub async fn local_assets(tree: &dyn RepositoryWriter) -> Result<Vec<PublishedAsset>, PublishError> {
    let mut assets = vec![];

    for path in tree.list_paths().await.map_err(|e| PublishError::Io("<tree>".into(), e))? {
        let (sha256, size) = tree
            .digest_path(&path)
            .await
            .map_err(|e| PublishError::Io(path.clone(), e))?
            .unwrap_or_else(|| (sha256_hex(&[]), 0));

        assets.push(PublishedAsset { path, size, sha256 });
    }

    Ok(assets)
}

/// Publishes local trees to a [PublishDestination].
pub struct Publisher<'a> {
    destination: &'a dyn PublishDestination,
    options: PublishOptions,
    cancel: CancellationToken,
    events: EventSink,
}

impl<'a> Publisher<'a> {
    pub fn new(
        destination: &'a dyn PublishDestination,
        options: PublishOptions,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        Self {
            destination,
            options,
            cancel,
            events,
        }
    }

    fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            Err(BuildError::Cancelled(Phase::Publish))
        } else {
            Ok(())
        }
    }

    async fn live_assets(&self) -> Result<Vec<PublishedAsset>, PublishError> {
        let destination = self.destination;

        match self
            .options
            .retry
            .run("listing published assets", &self.cancel, || {
                destination.list_assets()
            })
            .await
        {
            Ok(assets) => Ok(assets),
            // Nothing is published yet in a dry run against a fresh destination.
            Err(e) if self.options.dry_run && e.kind == RemoteErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    /// Compute the changes publishing `tree` would make.
    pub async fn plan(&self, tree: &dyn RepositoryWriter) -> Result<PublishPlan, BuildError> {
        self.check_cancelled()?;

        let local = local_assets(tree).await?;
        let live = self.live_assets().await?;

        Ok(PublishPlan::compute(
            &local,
            &live,
            self.options.delete_existing,
        ))
    }

    /// Publish `tree`.
    pub async fn publish(&self, tree: &dyn RepositoryWriter) -> Result<PublishOutput, BuildError> {
        self.check_cancelled()?;

        if !self.options.dry_run {
            let destination = self.destination;
            self.options
                .retry
                .run("creating release", &self.cancel, || destination.create_release())
                .await
                .map_err(PublishError::from)?;
        }

        let plan = self.plan(tree).await?;

        info!(
            "publish plan for {}: {} uploads ({} bytes), {} unchanged, {} deletions",
            self.destination.describe(),
            plan.upload.len(),
            plan.upload_bytes(),
            plan.unchanged.len(),
            plan.delete.len()
        );
        self.events.emit(BuildEvent::UploadPlanned {
            files: plan.upload.len(),
            bytes: plan.upload_bytes(),
        });

        let mut output = PublishOutput {
            plan,
            ..Default::default()
        };

        if self.options.dry_run {
            for asset in &output.plan.upload {
                info!("would upload {} ({} bytes)", asset.path, asset.size);
            }
            for path in &output.plan.delete {
                info!("would delete {}", path);
            }
            return Ok(output);
        }

        if output.plan.is_empty() {
            info!("{} is up to date", self.destination.describe());
            return Ok(output);
        }

        let destination = self.destination;
        self.options
            .retry
            .run("staging", &self.cancel, || destination.stage())
            .await
            .map_err(PublishError::from)?;

        match self.apply(tree, &output.plan).await {
            Ok((uploaded, deleted)) => {
                output.uploaded = uploaded;
                output.deleted = deleted;
                output.promoted = true;
                Ok(output)
            }
            Err(e) => {
                warn!("publish failed; discarding staged changes");
                if let Err(discard_err) = self.destination.discard().await {
                    warn!("failed to discard staging area: {}", discard_err);
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        tree: &dyn RepositoryWriter,
        plan: &PublishPlan,
    ) -> Result<(usize, usize), BuildError> {
        let uploads = futures::stream::iter(plan.upload.iter().map(|a| self.upload(tree, a)))
            .buffer_unordered(self.options.concurrency.max(1))
            .try_collect::<Vec<_>>();

        let uploaded = tokio::select! {
            res = uploads => res?.len(),
            _ = self.cancel.cancelled() => return Err(BuildError::Cancelled(Phase::Publish)),
        };

        let mut deleted = 0;
        for path in &plan.delete {
            self.check_cancelled()?;

            let destination = self.destination;
            self.options
                .retry
                .run(&format!("deleting {}", path), &self.cancel, || {
                    destination.delete_asset(path)
                })
                .await
                .map_err(PublishError::from)?;

            debug!("deleted {}", path);
            self.events.emit(BuildEvent::FileDeleted { path: path.clone() });
            deleted += 1;
        }

        self.check_cancelled()?;
        let destination = self.destination;
        self.options
            .retry
            .run("promoting", &self.cancel, || destination.promote())
            .await
            .map_err(PublishError::from)?;

        Ok((uploaded, deleted))
    }

    async fn upload(
        &self,
        tree: &dyn RepositoryWriter,
        asset: &PublishedAsset,
    ) -> Result<(), BuildError> {
        self.check_cancelled()?;

        let data = tree
            .read_path(&asset.path)
            .await
            .map_err(|e| PublishError::Io(asset.path.clone(), e))?
            .ok_or_else(|| {
                PublishError::Io(
                    asset.path.clone(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "vanished from local tree"),
                )
            })?;
        let data = Bytes::from(data);

        let destination = self.destination;
        let path = asset.path.as_str();
        let media_type = content_type(path);
        self.options
            .retry
            .run(&format!("uploading {}", path), &self.cancel, || {
                destination.upload_asset(path, media_type, data.clone())
            })
            .await
            .map_err(PublishError::from)?;

        info!("uploaded {} ({} bytes)", path, asset.size);
        self.events.emit(BuildEvent::FileUploaded {
            path: asset.path.clone(),
            size: asset.size,
        });

        Ok(())
    }
}
