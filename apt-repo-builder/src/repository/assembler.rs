// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Laying out the repository tree.

The tree looks like:

```text
pool/<component>/<arch>/<package>_<version>_<arch>.deb
dists/<codename>/<component>/binary-<arch>/Packages[.gz|.xz]
dists/<codename>/Release
dists/<codename>/InRelease        (signer)
dists/<codename>/Release.gpg      (signer)
<basename>.asc                    (signer)
<basename>.list                   (when a public URL is configured)
apt-add-repo                      (when a public URL is configured)
```

With [RepositoryLayout::Flat] the `.deb` files, a single `Packages[.gz|.xz]`
and the `Release` files all sit at the root next to the other root files.
*/

use {
    crate::{
        error::AssemblyError,
        index::IndexSet,
        io::{compress, Compression, MultiContentDigest},
        repository::{
            release::ReleaseMetadata,
            writer::{write_bytes, RepositoryPathVerificationState, RepositoryWriter},
            RepositoryLayout,
        },
    },
    chrono::{DateTime, Duration, Utc},
    log::{debug, info},
    std::{
        borrow::Cow,
        collections::{BTreeMap, BTreeSet},
        path::PathBuf,
    },
};

/// Name of the install script written at the repository root.
pub const INSTALL_SCRIPT_NAME: &str = "apt-add-repo";

/// Settings controlling repository layout and `Release` content.
#[derive(Clone, Debug)]
pub struct AssemblyOptions {
    pub codename: String,
    pub suite: String,
    pub origin: String,
    pub label: String,
    pub description: Option<String>,
    /// Compressed index flavors written next to the uncompressed `Packages`.
    pub compressions: Vec<Compression>,
    /// Keep files from a previous layout that the current one doesn't produce.
    pub preserve_stale: bool,
    /// Days from the build date until the `Release` expires.
    pub valid_days: Option<u32>,
    /// Prefix of root level files, e.g. `<owner>-<repo>`.
    pub basename: String,
    /// URL the published tree will be served from.
    pub public_url: Option<String>,
    /// Whether the signer will produce signatures and a public key.
    pub signed: bool,
    pub layout: RepositoryLayout,
}

impl AssemblyOptions {
    /// Path of a file that `Release` entries are relative to.
    pub fn dist_path(&self, relative: &str) -> String {
        match self.layout {
            RepositoryLayout::Pool => format!("dists/{}/{}", self.codename, relative),
            RepositoryLayout::Flat => relative.to_string(),
        }
    }

    pub fn release_path(&self) -> String {
        self.dist_path("Release")
    }

    pub fn inrelease_path(&self) -> String {
        self.dist_path("InRelease")
    }

    pub fn release_gpg_path(&self) -> String {
        self.dist_path("Release.gpg")
    }

    pub fn public_key_path(&self) -> String {
        format!("{}.asc", self.basename)
    }

    pub fn sources_list_path(&self) -> String {
        format!("{}.list", self.basename)
    }

    /// Paths the signer writes.
    fn signer_paths(&self) -> Vec<String> {
        vec![
            self.inrelease_path(),
            self.release_gpg_path(),
            self.public_key_path(),
        ]
    }
}

/// The result of assembling a repository.
#[derive(Clone, Debug)]
pub struct AssemblyOutput {
    pub release: ReleaseMetadata,
    /// Exact bytes of `dists/<codename>/Release`.
    pub release_bytes: Vec<u8>,
    /// Number of files (re)written.
    pub written: usize,
    /// Number of files already holding the desired content.
    pub unchanged: usize,
    /// Stale paths removed.
    pub pruned: Vec<String>,
}

/// Writes a repository tree from an [IndexSet].
pub struct RepositoryAssembler<'a> {
    writer: &'a dyn RepositoryWriter,
    options: AssemblyOptions,
}

impl<'a> RepositoryAssembler<'a> {
    pub fn new(writer: &'a dyn RepositoryWriter, options: AssemblyOptions) -> Self {
        Self { writer, options }
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    /// Assemble the tree.
    ///
    /// `assets` maps release asset names to the local files holding their
    /// content. `date` becomes the `Release` date.
    pub async fn assemble(
        &self,
        indices: &IndexSet,
        assets: &BTreeMap<String, PathBuf>,
        date: DateTime<Utc>,
    ) -> Result<AssemblyOutput, AssemblyError> {
        let mut expected = BTreeSet::new();
        let mut written = 0;
        let mut unchanged = 0;

        for package in &indices.packages {
            expected.insert(package.filename.clone());

            let state = self
                .writer
                .verify_path(&package.filename, &package.digest.sha256)
                .await
                .map_err(|e| AssemblyError::IoFailure(package.filename.clone(), e))?;

            if state == RepositoryPathVerificationState::ExistsIntegrityVerified {
                unchanged += 1;
                continue;
            }

            let source = assets.get(&package.asset_name).ok_or_else(|| {
                AssemblyError::IoFailure(
                    package.asset_name.clone(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "asset content not fetched"),
                )
            })?;

            let fh = std::fs::File::open(source)
                .map_err(|e| AssemblyError::IoFailure(format!("{}", source.display()), e))?;

            info!("writing {}", package.filename);
            self.writer
                .write_path(
                    Cow::Borrowed(package.filename.as_str()),
                    Box::pin(futures::io::AllowStdIo::new(fh)),
                )
                .await
                .map_err(|e| AssemblyError::IoFailure(package.filename.clone(), e))?;
            written += 1;
        }

        let mut entries = BTreeMap::new();

        let index_files = match self.options.layout {
            RepositoryLayout::Pool => indices
                .indices
                .iter()
                .map(|index| (index.relative_path(), index.to_packages_text()))
                .collect::<Vec<_>>(),
            RepositoryLayout::Flat => vec![("Packages".to_string(), indices.flat_packages_text())],
        };

        for (relative, text) in index_files {
            let mut flavors = vec![(Compression::None, text.clone().into_bytes())];
            for compression in &self.options.compressions {
                if *compression == Compression::None {
                    continue;
                }

                let data = compress(text.as_bytes(), *compression)
                    .await
                    .map_err(|e| AssemblyError::IoFailure(relative.clone(), e))?;
                flavors.push((*compression, data));
            }

            for (compression, data) in flavors {
                let path = format!("{}{}", relative, compression.extension());
                let full_path = self.options.dist_path(&path);

                if self.write_if_changed(&full_path, &data).await? {
                    written += 1;
                } else {
                    unchanged += 1;
                }

                entries.insert(path, MultiContentDigest::of(&data));
                expected.insert(full_path);
            }
        }

        let release = ReleaseMetadata {
            origin: self.options.origin.clone(),
            label: self.options.label.clone(),
            suite: self.options.suite.clone(),
            codename: self.options.codename.clone(),
            components: match self.options.layout {
                RepositoryLayout::Pool => indices.components.clone(),
                RepositoryLayout::Flat => vec![],
            },
            architectures: indices.architectures.clone(),
            description: self.options.description.clone(),
            date,
            valid_until: self
                .options
                .valid_days
                .map(|days| date + Duration::days(days as i64)),
            entries,
        };
        let release_bytes = release.render().into_bytes();
        let release_path = self.options.release_path();

        if self.write_if_changed(&release_path, &release_bytes).await? {
            written += 1;

            // Signatures over the previous content no longer apply.
            for path in [self.options.inrelease_path(), self.options.release_gpg_path()] {
                self.writer
                    .remove_path(&path)
                    .await
                    .map_err(|e| AssemblyError::IoFailure(path.clone(), e))?;
            }
        } else {
            unchanged += 1;
        }
        expected.insert(release_path);

        if let Some(url) = &self.options.public_url {
            for (path, content) in [
                (self.options.sources_list_path(), self.sources_list(url, indices)),
                (INSTALL_SCRIPT_NAME.to_string(), self.install_script(url)),
            ] {
                if self.write_if_changed(&path, content.as_bytes()).await? {
                    written += 1;
                } else {
                    unchanged += 1;
                }
                expected.insert(path);
            }
        }

        if self.options.signed {
            expected.extend(self.options.signer_paths());
        }

        let pruned = if self.options.preserve_stale {
            vec![]
        } else {
            self.prune(&expected).await?
        };

        Ok(AssemblyOutput {
            release,
            release_bytes,
            written,
            unchanged,
            pruned,
        })
    }

    async fn write_if_changed(&self, path: &str, data: &[u8]) -> Result<bool, AssemblyError> {
        let existing = self
            .writer
            .read_path(path)
            .await
            .map_err(|e| AssemblyError::IoFailure(path.to_string(), e))?;

        if existing.as_deref() == Some(data) {
            debug!("{} is up to date", path);
            return Ok(false);
        }

        info!("writing {}", path);
        write_bytes(self.writer, path, data)
            .await
            .map_err(|e| AssemblyError::IoFailure(path.to_string(), e))?;

        Ok(true)
    }

    async fn prune(&self, expected: &BTreeSet<String>) -> Result<Vec<String>, AssemblyError> {
        let existing = self
            .writer
            .list_paths()
            .await
            .map_err(|e| AssemblyError::IoFailure("repository tree".to_string(), e))?;

        let mut pruned = vec![];
        for path in existing {
            if !expected.contains(&path) {
                info!("removing stale {}", path);
                self.writer
                    .remove_path(&path)
                    .await
                    .map_err(|e| AssemblyError::IoFailure(path.clone(), e))?;
                pruned.push(path);
            }
        }

        Ok(pruned)
    }

    /// A `sources.list` fragment pointing at the published tree.
    fn sources_list(&self, url: &str, indices: &IndexSet) -> String {
        if self.options.layout == RepositoryLayout::Flat {
            return format!(
                "deb [signed-by=/etc/apt/keyrings/{key}] {url} ./\n",
                key = self.options.public_key_path(),
                url = url.trim_end_matches('/'),
            );
        }

        format!(
            "deb [signed-by=/etc/apt/keyrings/{key}] {url} {codename} {components}\n",
            key = self.options.public_key_path(),
            url = url.trim_end_matches('/'),
            codename = self.options.codename,
            components = indices.components.join(" "),
        )
    }

    /// A shell script that installs the key and `sources.list` fragment.
    fn install_script(&self, url: &str) -> String {
        let url = url.trim_end_matches('/');
        let key = self.options.public_key_path();
        let list = self.options.sources_list_path();

        let mut script = String::from("#!/bin/sh\nset -e\n\n");
        if self.options.signed {
            script.push_str("install -d -m 0755 /etc/apt/keyrings\n");
            script.push_str(&format!(
                "curl -fsSL {url}/{key} -o /etc/apt/keyrings/{key}\n",
                url = url,
                key = key
            ));
        }
        script.push_str(&format!(
            "curl -fsSL {url}/{list} -o /etc/apt/sources.list.d/{list}\n",
            url = url,
            list = list
        ));
        script.push_str("apt-get update\n");

        script
    }
}
