// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Release sources.

A release source lists the assets attached to a release and downloads them.
[github::GitHubSource] talks to the GitHub REST API and
[local::LocalSource] reads a directory.
*/

use {
    crate::error::{BuildError, RemoteError},
    async_trait::async_trait,
    once_cell::sync::Lazy,
    regex::Regex,
    serde::{Deserialize, Serialize},
    std::{path::PathBuf, str::FromStr},
    tokio::io::AsyncWrite,
};

pub mod github;
pub mod local;

/// A file attached to a release.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ReleaseAsset {
    pub name: String,
    /// Where the content is downloaded from.
    pub url: String,
    /// Hex SHA-256 advertised by the source.
    pub sha256: Option<String>,
    pub size: u64,
}

/// Which release to read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReleaseSelector {
    Latest,
    Tag(String),
}

impl Default for ReleaseSelector {
    fn default() -> Self {
        Self::Latest
    }
}

impl FromStr for ReleaseSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "latest" => Self::Latest,
            tag => Self::Tag(tag.to_string()),
        })
    }
}

impl std::fmt::Display for ReleaseSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Tag(tag) => f.write_str(tag),
        }
    }
}

/// A provider of release assets.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Human readable description of the source.
    fn describe(&self) -> String;

    /// List all assets attached to a release.
    async fn list_assets(&self, release: &ReleaseSelector) -> Result<Vec<ReleaseAsset>, RemoteError>;

    /// Write the content of an asset, returning the number of bytes written.
    async fn download_asset(
        &self,
        asset: &ReleaseAsset,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError>;
}

/// Select the `.deb` assets, optionally further filtered by a name pattern.
///
/// The extension check is case insensitive.
pub fn deb_assets(assets: Vec<ReleaseAsset>, pattern: Option<&Regex>) -> Vec<ReleaseAsset> {
    let mut assets = assets
        .into_iter()
        .filter(|a| a.name.to_lowercase().ends_with(".deb"))
        .filter(|a| pattern.map(|p| p.is_match(&a.name)).unwrap_or(true))
        .collect::<Vec<_>>();
    assets.sort();

    assets
}

static GITHUB_LOCATOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:github:|https://github\.com/|git@github\.com:)(?P<owner>[^/\s]+)/(?P<repo>[^/\s]+?)(?:\.git)?/?$",
    )
    .unwrap()
});

/// Where releases are read from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceLocator {
    GitHub { owner: String, repo: String },
    Local(PathBuf),
}

impl SourceLocator {
    /// Parse a locator.
    ///
    /// Accepted forms are `github:<owner>/<repo>`,
    /// `https://github.com/<owner>/<repo>[.git]`,
    /// `git@github.com:<owner>/<repo>.git`, `file://<path>` and plain paths.
    pub fn parse(s: &str) -> Result<Self, BuildError> {
        if let Some(caps) = GITHUB_LOCATOR_RE.captures(s) {
            return Ok(Self::GitHub {
                owner: caps["owner"].to_string(),
                repo: caps["repo"].to_string(),
            });
        }

        if s.starts_with("github:") || s.contains("github.com") {
            return Err(BuildError::Config(format!(
                "unrecognized GitHub repository locator: {}",
                s
            )));
        }

        if s.starts_with("file://") {
            let url = url::Url::parse(s)
                .map_err(|e| BuildError::Config(format!("invalid file URL {}: {}", s, e)))?;
            let path = url
                .to_file_path()
                .map_err(|_| BuildError::Config(format!("invalid file URL: {}", s)))?;

            return Ok(Self::Local(path));
        }

        if s.contains("://") {
            return Err(BuildError::Config(format!("unsupported release source: {}", s)));
        }

        Ok(Self::Local(PathBuf::from(s)))
    }

    /// The `(owner, repo)` pair for GitHub sources.
    pub fn github(&self) -> Option<(&str, &str)> {
        match self {
            Self::GitHub { owner, repo } => Some((owner, repo)),
            Self::Local(_) => None,
        }
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GitHub { owner, repo } => write!(f, "github:{}/{}", owner, repo),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}
