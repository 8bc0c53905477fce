// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publish destinations.

A destination holds a live repository tree. Changes are made to a staging
area that starts as a copy of the live tree and replaces it on
[PublishDestination::promote].

[local::LocalDestination] publishes to a directory and
[github::GitHubDestination] to the assets of a GitHub release.
*/

use {
    crate::{
        error::{BuildError, RemoteError},
        source::SourceLocator,
    },
    async_trait::async_trait,
    bytes::Bytes,
    serde::{Deserialize, Serialize},
    std::path::PathBuf,
};

pub mod github;
pub mod local;

/// Where a repository is published.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DestinationLocator {
    /// A directory on the local filesystem.
    Local(PathBuf),

    /// The assets of a release, created when missing.
    GitHubRelease {
        owner: String,
        repo: String,
        /// Defaults to `apt-<codename>`.
        tag: Option<String>,
    },
}

impl DestinationLocator {
    /// Parse a locator.
    ///
    /// `github:<owner>/<repo>[@<tag>]` and the GitHub repository URLs accepted
    /// by [SourceLocator::parse] name releases. Anything else is a directory.
    pub fn parse(s: &str) -> Result<Self, BuildError> {
        let (repository, tag) = match s.strip_prefix("github:").and_then(|rest| rest.split_once('@')) {
            Some((repository, tag)) if !tag.is_empty() && !tag.contains('/') => {
                (format!("github:{}", repository), Some(tag.to_string()))
            }
            Some(_) => {
                return Err(BuildError::Config(format!("invalid release tag in {}", s)));
            }
            None => (s.to_string(), None),
        };

        Ok(match SourceLocator::parse(&repository)? {
            SourceLocator::GitHub { owner, repo } => Self::GitHubRelease { owner, repo, tag },
            SourceLocator::Local(path) => Self::Local(path),
        })
    }

    pub fn is_github(&self) -> bool {
        matches!(self, Self::GitHubRelease { .. })
    }
}

/// A file present in a repository tree.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PublishedAsset {
    /// Path relative to the repository root.
    pub path: String,
    pub size: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
}

/// Media type to advertise for a repository file.
pub fn content_type(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);

    match name {
        "Packages" | "Release" => "text/plain",
        "InRelease" | "Release.gpg" => "application/pgp-signature",
        crate::repository::assembler::INSTALL_SCRIPT_NAME => "application/x-sh",
        _ => match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some("deb") => "application/vnd.debian.binary-package",
            Some("gz") => "application/gzip",
            Some("xz") => "application/x-xz",
            Some("asc") => "application/pgp-keys",
            Some("list") => "text/plain",
            _ => "application/octet-stream",
        },
    }
}

/// A place repository trees are published to.
#[async_trait]
pub trait PublishDestination: Send + Sync {
    /// Human readable description of the destination.
    fn describe(&self) -> String;

    /// Ensure the live repository exists.
    async fn create_release(&self) -> Result<(), RemoteError>;

    /// List files of the live repository.
    ///
    /// Fails with `NotFound` if the live repository doesn't exist.
    async fn list_assets(&self) -> Result<Vec<PublishedAsset>, RemoteError>;

    /// Begin a staging area seeded with the live repository.
    ///
    /// A leftover staging area from an interrupted publish is replaced.
    async fn stage(&self) -> Result<(), RemoteError>;

    /// Write a file to the staging area.
    async fn upload_asset(
        &self,
        path: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<(), RemoteError>;

    /// Remove a file from the staging area.
    async fn delete_asset(&self, path: &str) -> Result<(), RemoteError>;

    /// Make the staging area the live repository.
    async fn promote(&self) -> Result<(), RemoteError>;

    /// Drop the staging area, leaving the live repository untouched.
    async fn discard(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn locators() -> Result<(), BuildError> {
        assert_eq!(
            DestinationLocator::parse("/srv/apt")?,
            DestinationLocator::Local(PathBuf::from("/srv/apt"))
        );
        assert_eq!(
            DestinationLocator::parse("github:o/r")?,
            DestinationLocator::GitHubRelease {
                owner: "o".into(),
                repo: "r".into(),
                tag: None
            }
        );
        assert_eq!(
            DestinationLocator::parse("github:o/r@apt-bookworm")?,
            DestinationLocator::GitHubRelease {
                owner: "o".into(),
                repo: "r".into(),
                tag: Some("apt-bookworm".into())
            }
        );
        assert!(DestinationLocator::parse("https://github.com/o/r.git")?.is_github());

        for invalid in ["github:o/r@", "github:o/r@a/b", "github:o", "s3://bucket"] {
            assert!(DestinationLocator::parse(invalid).is_err(), "{}", invalid);
        }

        Ok(())
    }

    #[test]
    fn content_types() {
        assert_eq!(
            content_type("pool/main/a/foo_1.0_amd64.deb"),
            "application/vnd.debian.binary-package"
        );
        assert_eq!(
            content_type("dists/stable/main/binary-amd64/Packages"),
            "text/plain"
        );
        assert_eq!(
            content_type("dists/stable/main/binary-amd64/Packages.gz"),
            "application/gzip"
        );
        assert_eq!(
            content_type("dists/stable/InRelease"),
            "application/pgp-signature"
        );
        assert_eq!(content_type("owner-repo.asc"), "application/pgp-keys");
        assert_eq!(content_type("apt-add-repo"), "application/x-sh");
        assert_eq!(content_type("README"), "application/octet-stream");
    }
}
