// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package indexing.

The indexer turns fetched `.deb` files into [Package] records and groups them
into one [RepositoryIndex] per (component, architecture) pair.
*/

use {
    crate::{
        deb::{resolve_control_file, DebError},
        error::ParseError,
        io::MultiContentDigest,
        package::{Package, ParsedDeb},
        repository::RepositoryLayout,
    },
    log::warn,
    std::{
        collections::{btree_map::Entry, BTreeMap, BTreeSet},
        io::Read,
    },
};

/// The architecture name for architecture independent packages.
pub const ARCH_ALL: &str = "all";

/// The `Packages` index for a single (component, architecture) pair.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RepositoryIndex {
    pub component: String,
    pub architecture: String,
    pub packages: Vec<Package>,
}

impl RepositoryIndex {
    /// Path of the uncompressed index relative to `dists/<codename>`.
    pub fn relative_path(&self) -> String {
        format!(
            "{}/binary-{}/Packages",
            self.component, self.architecture
        )
    }

    /// Serialize to `Packages` file content.
    ///
    /// Each stanza is followed by a blank line. An index without packages
    /// serializes to an empty file.
    pub fn to_packages_text(&self) -> String {
        packages_text(&self.packages)
    }
}

fn packages_text(packages: &[Package]) -> String {
    packages
        .iter()
        .map(|p| format!("{}\n", p.to_paragraph()))
        .collect()
}

/// The complete set of indices for a repository.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexSet {
    pub components: Vec<String>,
    pub architectures: Vec<String>,
    pub indices: Vec<RepositoryIndex>,
    /// Every distinct package, each listed once regardless of how many
    /// indices reference it.
    pub packages: Vec<Package>,
}

impl IndexSet {
    pub fn index(&self, component: &str, architecture: &str) -> Option<&RepositoryIndex> {
        self.indices
            .iter()
            .find(|i| i.component == component && i.architecture == architecture)
    }

    /// `Packages` content listing every package, for flat repositories.
    pub fn flat_packages_text(&self) -> String {
        packages_text(&self.packages)
    }
}

/// Classifies `.deb` files and builds indices.
#[derive(Clone, Debug)]
pub struct PackageIndexer {
    components: Vec<String>,
    architectures: BTreeSet<String>,
    layout: RepositoryLayout,
}

impl PackageIndexer {
    /// Create an indexer.
    ///
    /// `components` must be non-empty; the first is the default component.
    /// An empty `architectures` means the set is discovered from packages.
    pub fn new(components: Vec<String>, architectures: impl IntoIterator<Item = String>) -> Self {
        Self {
            components,
            architectures: architectures
                .into_iter()
                .filter(|a| a != ARCH_ALL)
                .collect(),
            layout: RepositoryLayout::Pool,
        }
    }

    /// Place `.deb` files according to `layout`.
    pub fn with_layout(mut self, layout: RepositoryLayout) -> Self {
        self.layout = layout;
        self
    }

    fn default_component(&self) -> &str {
        self.components
            .first()
            .map(|s| s.as_str())
            .unwrap_or("main")
    }

    /// Read the control file of `.deb` content and pair it with its digests.
    pub fn parse_deb(
        &self,
        asset_name: &str,
        reader: impl Read,
        digest: MultiContentDigest,
    ) -> Result<ParsedDeb, ParseError> {
        let control = resolve_control_file(reader).map_err(|e| malformed(asset_name, e))?;

        Ok(ParsedDeb::new(&control, digest))
    }

    /// Component a package belongs to.
    ///
    /// A `Section` of the form `<component>/<section>` selects that component
    /// when it is configured.
    fn component_for(&self, parsed: &ParsedDeb) -> &str {
        parsed
            .fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Section"))
            .and_then(|(_, v)| v.split_once('/'))
            .and_then(|(component, _)| self.components.iter().find(|c| *c == component))
            .map(|c| c.as_str())
            .unwrap_or_else(|| self.default_component())
    }

    /// Derive a [Package] from a parsed `.deb`.
    pub fn package(&self, asset_name: &str, parsed: &ParsedDeb) -> Result<Package, ParseError> {
        let package = Package::from_parsed(parsed, self.component_for(parsed), asset_name, self.layout)
            .map_err(|e| malformed(asset_name, e))?;

        if package.architecture != ARCH_ALL
            && !self.architectures.is_empty()
            && !self.architectures.contains(&package.architecture)
        {
            return Err(ParseError::UnsupportedArchitecture {
                path: asset_name.to_string(),
                architecture: package.architecture,
            });
        }

        Ok(package)
    }

    /// Group packages into indices.
    ///
    /// Every configured component and architecture gets an index, even when
    /// empty. `all` packages appear in the index of every concrete
    /// architecture. When no concrete architecture is configured or
    /// discovered, a single `all` architecture is used.
    pub fn build(&self, packages: Vec<Package>) -> IndexSet {
        let mut packages = packages;
        packages.sort_by(|a, b| a.asset_name.cmp(&b.asset_name));

        let mut unique = BTreeMap::new();
        let mut filenames = BTreeMap::new();
        for package in packages {
            let key = (
                package.name.clone(),
                package.version.to_string(),
                package.architecture.clone(),
            );

            // Versions differing only by epoch share a pool path.
            if let Some(owner) = filenames.get(&package.filename) {
                if !unique.contains_key(&key) {
                    warn!(
                        "ignoring {}: {} is already provided by {}",
                        package.asset_name, package.filename, owner
                    );
                    continue;
                }
            }

            match unique.entry(key) {
                Entry::Occupied(existing) => {
                    let existing: &Package = existing.get();
                    warn!(
                        "ignoring {}: {} {} {} is already provided by {}",
                        package.asset_name,
                        package.name,
                        package.version,
                        package.architecture,
                        existing.asset_name
                    );
                }
                Entry::Vacant(slot) => {
                    filenames.insert(package.filename.clone(), package.asset_name.clone());
                    slot.insert(package);
                }
            }
        }

        let mut packages = unique.into_values().collect::<Vec<_>>();
        packages.sort_by(|a, b| a.index_cmp(b));

        let mut architectures = if self.architectures.is_empty() {
            packages
                .iter()
                .filter(|p| p.architecture != ARCH_ALL)
                .map(|p| p.architecture.clone())
                .collect::<BTreeSet<_>>()
        } else {
            self.architectures.clone()
        };
        if architectures.is_empty() {
            architectures.insert(ARCH_ALL.to_string());
        }

        let mut indices = vec![];
        for component in &self.components {
            for architecture in &architectures {
                indices.push(RepositoryIndex {
                    component: component.clone(),
                    architecture: architecture.clone(),
                    packages: packages
                        .iter()
                        .filter(|p| {
                            &p.component == component
                                && (&p.architecture == architecture || p.architecture == ARCH_ALL)
                        })
                        .cloned()
                        .collect(),
                });
            }
        }

        IndexSet {
            components: self.components.clone(),
            architectures: architectures.into_iter().collect(),
            indices,
            packages,
        }
    }
}

fn malformed(asset_name: &str, e: impl Into<DebError>) -> ParseError {
    ParseError::MalformedControlFile {
        path: asset_name.to_string(),
        reason: e.into().to_string(),
    }
}
