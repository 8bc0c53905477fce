// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! GitHub release assets as a publish destination.

The repository is the set of assets attached to one release, by default
tagged `apt-<codename>`. Asset names can't contain `/`, so only flat trees
can be published.

Files are uploaded under a `staged--` prefix. Promotion renames staged
assets over their live counterparts one file at a time: `.deb` files first,
then `Packages` indices, then `Release`, `Release.gpg` and finally
`InRelease`. Deferred deletions run last. A client reading during promotion
can observe a checksum mismatch and has to retry; a failure before promotion
leaves the live assets untouched.
*/

use {
    crate::{
        destination::{PublishDestination, PublishedAsset},
        error::{RemoteError, RemoteErrorKind},
        github::{
            check_status, transport_error, GitHubClient, GithubAsset, GithubRelease,
            JSON_MEDIA_TYPE, REQUEST_TIMEOUT,
        },
    },
    async_trait::async_trait,
    bytes::Bytes,
    log::{debug, info, warn},
    reqwest::{header::CONTENT_TYPE, Method, StatusCode},
    std::{
        collections::{BTreeMap, BTreeSet},
        time::Duration,
    },
    tokio::sync::Mutex,
};

/// Name prefix of uploaded but not yet promoted assets.
pub const STAGING_PREFIX: &str = "staged--";

const PAGE_SIZE: usize = 100;

/// Slowest upload rate tolerated before an upload is abandoned.
const MIN_UPLOAD_BYTES_PER_SEC: u64 = 64 * 1024;

fn upload_timeout(size: usize) -> Duration {
    REQUEST_TIMEOUT + Duration::from_secs(size as u64 / MIN_UPLOAD_BYTES_PER_SEC)
}

/// Promotion order. Files referenced by others go first.
fn promotion_rank(name: &str) -> u8 {
    match name {
        "InRelease" => 4,
        "Release" | "Release.gpg" => 3,
        _ if name.starts_with("Packages") => 2,
        _ if name.ends_with(".deb") => 0,
        _ => 1,
    }
}

#[derive(Clone, Debug)]
struct ReleaseHandle {
    id: u64,
    upload_base: String,
}

impl From<&GithubRelease> for ReleaseHandle {
    fn from(release: &GithubRelease) -> Self {
        Self {
            id: release.id,
            upload_base: release.upload_base().to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Staging {
    /// Final asset name to the id of its staged upload.
    uploaded: BTreeMap<String, u64>,
    /// Live asset names to remove after promotion.
    deleted: BTreeSet<String>,
}

/// Publishes a flat repository to the assets of a GitHub release.
#[derive(Debug)]
pub struct GitHubDestination {
    client: GitHubClient,
    owner: String,
    repo: String,
    tag: String,
    release: Mutex<Option<ReleaseHandle>>,
    staging: Mutex<Staging>,
}

impl GitHubDestination {
    pub fn new(
        api_url: Option<&str>,
        owner: impl ToString,
        repo: impl ToString,
        tag: impl ToString,
        token: Option<String>,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            client: GitHubClient::new(api_url, token)?,
            owner: owner.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            release: Mutex::new(None),
            staging: Mutex::new(Staging::default()),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        self.client
            .url(&format!("/repos/{}/{}{}", self.owner, self.repo, path))
    }

    fn asset_url(&self, id: u64) -> String {
        self.repo_url(&format!("/releases/assets/{}", id))
    }

    async fn lookup_release(&self) -> Result<Option<ReleaseHandle>, RemoteError> {
        let url = self.repo_url(&format!("/releases/tags/{}", self.tag));

        match self
            .client
            .send_json::<GithubRelease>(
                self.client.request(Method::GET, &url, JSON_MEDIA_TYPE),
                &format!("GET {}", url),
            )
            .await
        {
            Ok(release) => Ok(Some(ReleaseHandle::from(&release))),
            Err(e) if e.kind == RemoteErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn release(&self) -> Result<ReleaseHandle, RemoteError> {
        if let Some(handle) = self.release.lock().await.clone() {
            return Ok(handle);
        }

        let handle = self.lookup_release().await?.ok_or_else(|| {
            RemoteError::not_found(format!("release {} of {}/{}", self.tag, self.owner, self.repo))
        })?;
        *self.release.lock().await = Some(handle.clone());

        Ok(handle)
    }

    /// Every asset of the release, staged ones included.
    async fn remote_assets(&self) -> Result<Vec<GithubAsset>, RemoteError> {
        let release = self.release().await?;
        let url = self.repo_url(&format!("/releases/{}/assets", release.id));

        let mut assets = vec![];
        for page in 1u32.. {
            let batch = self
                .client
                .send_json::<Vec<GithubAsset>>(
                    self.client
                        .request(Method::GET, &url, JSON_MEDIA_TYPE)
                        .query(&[("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())]),
                    &format!("GET {}", url),
                )
                .await?;

            let last = batch.len() < PAGE_SIZE;
            assets.extend(batch);
            if last {
                break;
            }
        }

        Ok(assets)
    }

    async fn delete_remote(&self, id: u64, name: &str) -> Result<(), RemoteError> {
        let url = self.asset_url(id);

        match self
            .client
            .send(
                self.client
                    .request(Method::DELETE, &url, JSON_MEDIA_TYPE)
                    .timeout(REQUEST_TIMEOUT),
                &format!("DELETE {}", name),
            )
            .await
        {
            Ok(_) => {
                debug!("deleted release asset {}", name);
                Ok(())
            }
            Err(e) if e.kind == RemoteErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename_remote(&self, id: u64, name: &str) -> Result<(), RemoteError> {
        let url = self.asset_url(id);

        self.client
            .send_json::<GithubAsset>(
                self.client
                    .request(Method::PATCH, &url, JSON_MEDIA_TYPE)
                    .json(&serde_json::json!({ "name": name })),
                &format!("PATCH {}", name),
            )
            .await?;

        Ok(())
    }

    /// Upload an asset, returning `None` when the name is already taken.
    async fn post_asset(
        &self,
        release: &ReleaseHandle,
        name: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<Option<GithubAsset>, RemoteError> {
        let what = format!("uploading {}", name);
        let response = self
            .client
            .request(Method::POST, &release.upload_base, JSON_MEDIA_TYPE)
            .query(&[("name", name)])
            .header(CONTENT_TYPE, content_type)
            .timeout(upload_timeout(data.len()))
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(None);
        }

        let asset = check_status(response, &what)?
            .json::<GithubAsset>()
            .await
            .map_err(transport_error)?;

        Ok(Some(asset))
    }

    fn release_body(&self) -> String {
        format!(
            "APT repository published by apt-repo-builder.\n\n\
             Install with:\n\n    \
             curl -fsSL https://github.com/{owner}/{repo}/releases/download/{tag}/apt-add-repo | sudo sh\n",
            owner = self.owner,
            repo = self.repo,
            tag = self.tag
        )
    }
}

#[async_trait]
impl PublishDestination for GitHubDestination {
    fn describe(&self) -> String {
        format!("github:{}/{}@{}", self.owner, self.repo, self.tag)
    }

    async fn create_release(&self) -> Result<(), RemoteError> {
        if let Some(handle) = self.lookup_release().await? {
            *self.release.lock().await = Some(handle);
            return Ok(());
        }

        info!("creating release {} in {}/{}", self.tag, self.owner, self.repo);
        let url = self.repo_url("/releases");
        let release = self
            .client
            .send_json::<GithubRelease>(
                self.client
                    .request(Method::POST, &url, JSON_MEDIA_TYPE)
                    .json(&serde_json::json!({
                        "tag_name": self.tag,
                        "name": format!("Debian/Ubuntu APT repository for {}", self.tag),
                        "body": self.release_body(),
                        "make_latest": "false",
                    })),
                &format!("POST {}", url),
            )
            .await?;
        *self.release.lock().await = Some(ReleaseHandle::from(&release));

        Ok(())
    }

    async fn list_assets(&self) -> Result<Vec<PublishedAsset>, RemoteError> {
        Ok(self
            .remote_assets()
            .await?
            .into_iter()
            .filter(|a| !a.name.starts_with(STAGING_PREFIX))
            .map(|a| PublishedAsset {
                // Without a digest the asset compares unequal and is uploaded again.
                sha256: a.sha256().unwrap_or_default(),
                size: a.size,
                path: a.name,
            })
            .collect())
    }

    async fn stage(&self) -> Result<(), RemoteError> {
        *self.staging.lock().await = Staging::default();

        for asset in self.remote_assets().await? {
            if asset.name.starts_with(STAGING_PREFIX) {
                warn!("removing leftover staged asset {}", asset.name);
                self.delete_remote(asset.id, &asset.name).await?;
            }
        }

        Ok(())
    }

    async fn upload_asset(
        &self,
        path: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        if path.contains('/') || path.starts_with(STAGING_PREFIX) {
            return Err(RemoteError::new(
                RemoteErrorKind::LocalIo,
                format!("{} can't be published as a release asset", path),
            ));
        }

        let release = self.release().await?;
        let name = format!("{}{}", STAGING_PREFIX, path);

        let asset = match self
            .post_asset(&release, &name, content_type, data.clone())
            .await?
        {
            Some(asset) => asset,
            None => {
                // An earlier attempt may have completed without us seeing the response.
                debug!("{} already exists; replacing it", name);
                if let Some(existing) = self
                    .remote_assets()
                    .await?
                    .into_iter()
                    .find(|a| a.name == name)
                {
                    self.delete_remote(existing.id, &name).await?;
                }

                self.post_asset(&release, &name, content_type, data)
                    .await?
                    .ok_or_else(|| {
                        RemoteError::network(format!("{}: asset name still taken", name))
                    })?
            }
        };

        self.staging
            .lock()
            .await
            .uploaded
            .insert(path.to_string(), asset.id);

        Ok(())
    }

    async fn delete_asset(&self, path: &str) -> Result<(), RemoteError> {
        self.staging.lock().await.deleted.insert(path.to_string());

        Ok(())
    }

    async fn promote(&self) -> Result<(), RemoteError> {
        let (mut uploaded, deleted) = {
            let staging = self.staging.lock().await;
            (
                staging.uploaded.iter().map(|(k, v)| (k.clone(), *v)).collect::<Vec<_>>(),
                staging.deleted.iter().cloned().collect::<Vec<_>>(),
            )
        };
        uploaded.sort_by(|(a, _), (b, _)| {
            promotion_rank(a).cmp(&promotion_rank(b)).then_with(|| a.cmp(b))
        });

        let live = self
            .remote_assets()
            .await?
            .into_iter()
            .filter(|a| !a.name.starts_with(STAGING_PREFIX))
            .map(|a| (a.name, a.id))
            .collect::<BTreeMap<_, _>>();

        for (name, staged_id) in uploaded {
            if let Some(live_id) = live.get(&name) {
                self.delete_remote(*live_id, &name).await?;
            }
            self.rename_remote(staged_id, &name).await?;
            debug!("promoted {}", name);

            self.staging.lock().await.uploaded.remove(&name);
        }

        for name in deleted {
            if let Some(live_id) = live.get(&name) {
                self.delete_remote(*live_id, &name).await?;
            }

            self.staging.lock().await.deleted.remove(&name);
        }

        info!("promoted staged assets of {}", self.describe());

        Ok(())
    }

    async fn discard(&self) -> Result<(), RemoteError> {
        let uploaded = std::mem::take(&mut *self.staging.lock().await).uploaded;

        for (name, id) in uploaded {
            self.delete_remote(id, &format!("{}{}", STAGING_PREFIX, name))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            error::{BuildError, PublishError},
            io::sha256_hex,
            publisher::{PublishOptions, Publisher},
            repository::writer::{write_bytes, MemoryRepositoryWriter},
            retry::RetryPolicy,
        },
        mockito::{Matcher, Server, ServerGuard},
        serde_json::json,
        tokio_util::sync::CancellationToken,
    };

    fn asset_json(server: &ServerGuard, id: u64, name: &str, content: Option<&[u8]>) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "url": format!("{}/repos/o/r/releases/assets/{}", server.url(), id),
            "size": content.map(|c| c.len()).unwrap_or(0),
            "digest": content.map(|c| format!("sha256:{}", sha256_hex(c))),
        })
    }

    async fn mock_release(server: &mut ServerGuard, live: serde_json::Value) -> Vec<mockito::Mock> {
        let release = json!({
            "id": 1,
            "tag_name": "apt-stable",
            "upload_url": format!("{}/uploads/1/assets{{?name,label}}", server.url()),
        });

        vec![
            server
                .mock("GET", "/repos/o/r/releases/tags/apt-stable")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(release.to_string())
                .expect_at_least(1)
                .create_async()
                .await,
            server
                .mock("GET", "/repos/o/r/releases/1/assets")
                .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(live.to_string())
                .expect_at_least(1)
                .create_async()
                .await,
        ]
    }

    async fn mock_upload(server: &mut ServerGuard, id: u64, path: &str, status: usize) -> mockito::Mock {
        let name = format!("{}{}", STAGING_PREFIX, path);
        let body = asset_json(server, id, &name, None).to_string();

        server
            .mock("POST", "/uploads/1/assets")
            .match_query(Matcher::UrlEncoded("name".into(), name))
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    async fn mock_delete(server: &mut ServerGuard, id: u64) -> mockito::Mock {
        server
            .mock("DELETE", format!("/repos/o/r/releases/assets/{}", id).as_str())
            .with_status(204)
            .create_async()
            .await
    }

    async fn mock_rename(server: &mut ServerGuard, id: u64, name: &str) -> mockito::Mock {
        let body = asset_json(server, id, name, None).to_string();

        server
            .mock("PATCH", format!("/repos/o/r/releases/assets/{}", id).as_str())
            .match_body(Matcher::PartialJson(json!({ "name": name })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    fn destination(server: &ServerGuard) -> GitHubDestination {
        GitHubDestination::new(Some(&server.url()), "o", "r", "apt-stable", Some("secret".into()))
            .unwrap()
    }

    fn publisher(destination: &GitHubDestination) -> Publisher<'_> {
        Publisher::new(
            destination,
            PublishOptions {
                concurrency: 1,
                retry: RetryPolicy::immediate(0),
                delete_existing: true,
                dry_run: false,
            },
            CancellationToken::new(),
            Default::default(),
        )
    }

    #[tokio::test]
    async fn missing_release_is_created() -> Result<(), RemoteError> {
        let mut server = Server::new_async().await;

        let lookup = server
            .mock("GET", "/repos/o/r/releases/tags/apt-stable")
            .with_status(404)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/repos/o/r/releases")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(json!({
                "tag_name": "apt-stable",
                "make_latest": "false",
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": 9,
                    "tag_name": "apt-stable",
                    "upload_url": format!("{}/uploads/9/assets{{?name,label}}", server.url()),
                })
                .to_string(),
            )
            .create_async()
            .await;

        let destination = destination(&server);
        destination.create_release().await?;

        lookup.assert_async().await;
        create.assert_async().await;
        assert_eq!(destination.release().await?.id, 9);

        Ok(())
    }

    #[tokio::test]
    async fn staged_assets_are_renamed_over_live_ones() -> Result<(), BuildError> {
        let mut server = Server::new_async().await;
        let live = json!([
            asset_json(&server, 10, "Packages", Some(b"old")),
            asset_json(&server, 11, "stale_1.0_amd64.deb", Some(b"stale")),
            asset_json(&server, 12, "Release", Some(b"same")),
        ]);
        let _release = mock_release(&mut server, live).await;

        let upload = mock_upload(&mut server, 20, "Packages", 201).await;
        let replace_live = mock_delete(&mut server, 10).await;
        let rename = mock_rename(&mut server, 20, "Packages").await;
        let remove_stale = mock_delete(&mut server, 11).await;
        let keep_release = server
            .mock("DELETE", "/repos/o/r/releases/assets/12")
            .expect(0)
            .create_async()
            .await;

        let tree = MemoryRepositoryWriter::default();
        write_bytes(&tree, "Packages", b"new").await.unwrap();
        write_bytes(&tree, "Release", b"same").await.unwrap();

        let destination = destination(&server);
        let output = publisher(&destination).publish(&tree).await?;

        assert!(output.promoted);
        assert_eq!(output.uploaded, 1);
        assert_eq!(output.deleted, 1);
        assert_eq!(output.plan.unchanged, vec!["Release".to_string()]);

        upload.assert_async().await;
        replace_live.assert_async().await;
        rename.assert_async().await;
        remove_stale.assert_async().await;
        keep_release.assert_async().await;

        Ok(())
    }

    #[tokio::test]
    async fn failed_upload_discards_staged_assets() {
        let mut server = Server::new_async().await;
        let live = json!([asset_json(&server, 11, "stale_1.0_amd64.deb", Some(b"stale"))]);
        let _release = mock_release(&mut server, live).await;

        let _uploaded = mock_upload(&mut server, 30, "a_1.0_amd64.deb", 201).await;
        let _rejected = mock_upload(&mut server, 31, "b_1.0_amd64.deb", 401).await;
        let discard = mock_delete(&mut server, 30).await;
        let keep_live = server
            .mock("DELETE", "/repos/o/r/releases/assets/11")
            .expect(0)
            .create_async()
            .await;
        let no_renames = server
            .mock("PATCH", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let tree = MemoryRepositoryWriter::default();
        write_bytes(&tree, "a_1.0_amd64.deb", b"a").await.unwrap();
        write_bytes(&tree, "b_1.0_amd64.deb", b"b").await.unwrap();

        let destination = destination(&server);
        let err = publisher(&destination).publish(&tree).await.unwrap_err();

        assert!(matches!(err, BuildError::Publish(PublishError::AuthFailure(_))));
        discard.assert_async().await;
        keep_live.assert_async().await;
        no_renames.assert_async().await;
    }

    #[tokio::test]
    async fn taken_staging_name_is_replaced() -> Result<(), RemoteError> {
        let mut server = Server::new_async().await;
        let live = json!([asset_json(&server, 40, "staged--Packages", Some(b"partial"))]);
        let _release = mock_release(&mut server, live).await;

        let _taken = server
            .mock("POST", "/uploads/1/assets")
            .match_query(Matcher::UrlEncoded("name".into(), "staged--Packages".into()))
            .with_status(422)
            .create_async()
            .await;
        let stale = mock_delete(&mut server, 40).await;

        let destination = destination(&server);
        let err = destination
            .upload_asset("Packages", "text/plain", Bytes::from_static(b"new"))
            .await
            .unwrap_err();

        // The name was freed but the mocked upload keeps refusing it.
        stale.assert_async().await;
        assert!(err.message.contains("still taken"));

        Ok(())
    }

    #[tokio::test]
    async fn nested_paths_are_rejected() {
        let server = Server::new_async().await;
        let destination = destination(&server);

        let err = destination
            .upload_asset("pool/main/a.deb", "application/octet-stream", Bytes::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        let err = destination
            .upload_asset("staged--x", "application/octet-stream", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::LocalIo);
    }

    #[test]
    fn promotion_order() {
        let mut names = vec!["InRelease", "Packages.gz", "a_1_all.deb", "Release", "o-r.asc", "Release.gpg"];
        names.sort_by(|a, b| promotion_rank(a).cmp(&promotion_rank(b)).then_with(|| a.cmp(b)));

        assert_eq!(
            names,
            vec!["a_1_all.deb", "o-r.asc", "Packages.gz", "Release", "Release.gpg", "InRelease"]
        );
        assert_eq!(upload_timeout(0), REQUEST_TIMEOUT);
        assert_eq!(upload_timeout(64 * 1024 * 10), REQUEST_TIMEOUT + Duration::from_secs(10));
    }
}
