// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! GitHub releases as a release source. */

use {
    crate::{
        error::{RemoteError, RemoteErrorKind},
        github::{
            next_chunk, GitHubClient, GithubAsset, GithubRelease, JSON_MEDIA_TYPE, READ_TIMEOUT,
        },
        source::{ReleaseAsset, ReleaseSelector, ReleaseSource},
    },
    async_trait::async_trait,
    log::debug,
    reqwest::Method,
    tokio::io::{AsyncWrite, AsyncWriteExt},
};

impl From<GithubAsset> for ReleaseAsset {
    fn from(asset: GithubAsset) -> Self {
        Self {
            sha256: asset.sha256(),
            name: asset.name,
            url: asset.url,
            size: asset.size,
        }
    }
}

/// Releases of a GitHub repository.
#[derive(Debug)]
pub struct GitHubSource {
    client: GitHubClient,
    owner: String,
    repo: String,
}

impl GitHubSource {
    pub fn new(
        api_url: Option<&str>,
        owner: impl ToString,
        repo: impl ToString,
        token: Option<String>,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            client: GitHubClient::new(api_url, token)?,
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    fn release_url(&self, release: &ReleaseSelector) -> String {
        match release {
            ReleaseSelector::Latest => self
                .client
                .url(&format!("/repos/{}/{}/releases/latest", self.owner, self.repo)),
            ReleaseSelector::Tag(tag) => self.client.url(&format!(
                "/repos/{}/{}/releases/tags/{}",
                self.owner, self.repo, tag
            )),
        }
    }
}

#[async_trait]
impl ReleaseSource for GitHubSource {
    fn describe(&self) -> String {
        format!("github:{}/{}", self.owner, self.repo)
    }

    async fn list_assets(&self, release: &ReleaseSelector) -> Result<Vec<ReleaseAsset>, RemoteError> {
        let url = self.release_url(release);
        debug!("resolving release {} of {}", release, self.describe());

        let release = self
            .client
            .send_json::<GithubRelease>(
                self.client.request(Method::GET, &url, JSON_MEDIA_TYPE),
                &format!("GET {}", url),
            )
            .await
            .map_err(|e| match e.kind {
                RemoteErrorKind::NotFound => RemoteError::not_found(format!(
                    "release {} of {}/{}",
                    release, self.owner, self.repo
                )),
                _ => e,
            })?;

        debug!(
            "release {} has {} assets",
            release.tag_name,
            release.assets.len()
        );

        Ok(release.assets.into_iter().map(ReleaseAsset::from).collect())
    }

    async fn download_asset(
        &self,
        asset: &ReleaseAsset,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError> {
        let response = self
            .client
            .send(
                self.client
                    .request(Method::GET, &asset.url, "application/octet-stream"),
                &format!("GET {}", asset.url),
            )
            .await?;

        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = next_chunk(&mut stream, READ_TIMEOUT, &asset.name).await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;

        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use {super::*, mockito::Server};

    #[test]
    fn release_json() -> Result<(), serde_json::Error> {
        let release: GithubRelease = serde_json::from_str(
            r#"{
                "tag_name": "v1.0",
                "assets": [
                    {
                        "name": "tool_1.0_amd64.deb",
                        "url": "https://api.github.com/repos/o/r/releases/assets/1",
                        "browser_download_url": "https://github.com/o/r/releases/download/v1.0/tool_1.0_amd64.deb",
                        "size": 1024,
                        "digest": "sha256:9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08"
                    },
                    {
                        "name": "evil_1.0_amd64.deb",
                        "url": "https://api.github.com/repos/o/r/releases/assets/3",
                        "size": 5,
                        "digest": "sha256:../../../../etc/passwd"
                    },
                    {
                        "name": "short_1.0_amd64.deb",
                        "url": "https://api.github.com/repos/o/r/releases/assets/4",
                        "size": 5,
                        "digest": "sha256:é0"
                    },
                    {
                        "name": "notes.txt",
                        "url": "https://api.github.com/repos/o/r/releases/assets/2",
                        "size": 3
                    }
                ]
            }"#,
        )?;

        let assets = release
            .assets
            .into_iter()
            .map(ReleaseAsset::from)
            .collect::<Vec<_>>();

        assert_eq!(
            assets[0].sha256.as_deref(),
            Some("9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08")
        );
        assert_eq!(assets[0].size, 1024);
        assert_eq!(assets[1].sha256, None);
        assert_eq!(assets[2].sha256, None);
        assert_eq!(assets[3].sha256, None);

        Ok(())
    }

    #[test]
    fn urls() -> Result<(), RemoteError> {
        let source = GitHubSource::new(Some("https://ghe.example.com/api/v3/"), "o", "r", None)?;

        assert_eq!(
            source.release_url(&ReleaseSelector::Latest),
            "https://ghe.example.com/api/v3/repos/o/r/releases/latest"
        );
        assert_eq!(
            source.release_url(&ReleaseSelector::Tag("v2".into())),
            "https://ghe.example.com/api/v3/repos/o/r/releases/tags/v2"
        );
        assert_eq!(source.describe(), "github:o/r");

        Ok(())
    }

    #[tokio::test]
    async fn lists_and_downloads_over_http() -> Result<(), RemoteError> {
        let mut server = Server::new_async().await;
        let url = server.url();

        let _release = server
            .mock("GET", "/repos/o/r/releases/tags/v1.0")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"tag_name": "v1.0", "assets": [
                    {{"name": "a_1.0_amd64.deb", "url": "{}/repos/o/r/releases/assets/1", "size": 3}}
                ]}}"#,
                url
            ))
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/repos/o/r/releases/tags/v2.0")
            .with_status(404)
            .create_async()
            .await;
        let download = server
            .mock("GET", "/repos/o/r/releases/assets/1")
            .match_header("accept", "application/octet-stream")
            .with_status(200)
            .with_body("deb")
            .create_async()
            .await;

        let source = GitHubSource::new(Some(&url), "o", "r", Some("secret".into()))?;

        let assets = source
            .list_assets(&ReleaseSelector::Tag("v1.0".into()))
            .await?;
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].name, "a_1.0_amd64.deb");

        let mut content = vec![];
        assert_eq!(source.download_asset(&assets[0], &mut content).await?, 3);
        assert_eq!(content, b"deb");
        download.assert_async().await;

        let err = source
            .list_assets(&ReleaseSelector::Tag("v2.0".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NotFound);

        Ok(())
    }
}
