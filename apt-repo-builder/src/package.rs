// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package records derived from `.deb` files. */

use {
    crate::{
        binary_package_control::{BinaryPackageControlFile, DEPENDENCY_FIELDS},
        control::{ControlError, ControlParagraph},
        io::{ChecksumType, MultiContentDigest},
        package_version::PackageVersion,
        repository::RepositoryLayout,
    },
    serde::{Deserialize, Serialize},
    std::{cmp::Ordering, collections::BTreeMap},
};

/// Fields computed by the indexer rather than copied from `DEBIAN/control`.
const GENERATED_FIELDS: &[&str] = &["Filename", "Size", "MD5sum", "SHA1", "SHA256"];

/// Fields emitted before the file fields in `Packages` stanzas.
const LEADING_FIELDS: &[&str] = &[
    "Package",
    "Source",
    "Version",
    "Installed-Size",
    "Maintainer",
    "Architecture",
];

/// Fields emitted after the file fields. `Description` is always last.
const TRAILING_FIELDS: &[&str] = &["Section", "Priority", "Homepage"];

/// The control fields and content digests of a `.deb` file.
///
/// This is everything the indexer needs from the archive itself and is what
/// gets memoized per content checksum.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ParsedDeb {
    pub fields: Vec<(String, String)>,
    pub digest: MultiContentDigest,
}

impl ParsedDeb {
    pub fn new(control: &BinaryPackageControlFile, digest: MultiContentDigest) -> Self {
        Self {
            fields: control
                .iter_fields()
                .map(|f| (f.name().to_string(), f.value_str().to_string()))
                .collect(),
            digest,
        }
    }

    /// Reconstitute and validate the control paragraph.
    pub fn control(&self) -> Result<BinaryPackageControlFile, ControlError> {
        let mut paragraph = ControlParagraph::default();
        for (name, value) in &self.fields {
            paragraph.set_field_from_string(name, value);
        }

        BinaryPackageControlFile::try_from(paragraph)
    }
}

/// A binary package as listed in a repository index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Package {
    pub name: String,
    pub version: PackageVersion,
    pub architecture: String,
    /// Relationship fields in canonical order, e.g. `Depends: libc6`.
    pub dependencies: Vec<String>,
    pub description: String,
    /// Control fields other than the generated file fields.
    pub fields: BTreeMap<String, String>,
    pub size: u64,
    pub digest: MultiContentDigest,
    pub component: String,
    /// Path of the `.deb` relative to the repository root.
    pub filename: String,
    /// Name of the release asset this package came from.
    pub asset_name: String,
}

impl Package {
    /// Derive a package record from parsed `.deb` content.
    ///
    /// `component` is where the package will be placed in the pool.
    pub fn from_parsed(
        parsed: &ParsedDeb,
        component: &str,
        asset_name: &str,
        layout: RepositoryLayout,
    ) -> Result<Self, ControlError> {
        let control = parsed.control()?;
        let architecture = control.architecture()?.to_string();

        let fields = control
            .iter_fields()
            .filter(|f| {
                !GENERATED_FIELDS
                    .iter()
                    .any(|g| g.eq_ignore_ascii_case(f.name()))
            })
            .map(|f| (f.name().to_string(), f.value_str().to_string()))
            .collect();

        Ok(Self {
            name: control.package()?.to_string(),
            version: control.version()?,
            filename: layout.deb_path(component, &architecture, &control.canonical_filename()?),
            architecture,
            dependencies: control.dependencies(),
            description: control.description().to_string(),
            fields,
            size: parsed.digest.size,
            digest: parsed.digest.clone(),
            component: component.to_string(),
            asset_name: asset_name.to_string(),
        })
    }

    /// Index ordering: name, then version, then architecture.
    pub fn index_cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.architecture.cmp(&other.architecture))
    }

    fn field(&self, name: &str) -> Option<(&str, &str)> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `Packages` stanza describing this package.
    ///
    /// Field order is fixed so repeated renders are byte-identical.
    pub fn to_paragraph(&self) -> ControlParagraph {
        let mut paragraph = ControlParagraph::default();
        let mut emitted = vec![];

        let mut emit = |paragraph: &mut ControlParagraph, name: &str| {
            if let Some((key, value)) = self.field(name) {
                paragraph.set_field_from_string(key, value);
                emitted.push(key.to_lowercase());
            }
        };

        for name in LEADING_FIELDS.iter().chain(DEPENDENCY_FIELDS.iter()) {
            emit(&mut paragraph, name);
        }

        paragraph.set_field_from_string("Filename", &self.filename);
        paragraph.set_field_from_string("Size", self.size);
        for checksum in ChecksumType::all() {
            paragraph.set_field_from_string(
                checksum.package_field_name(),
                self.digest.hex(checksum),
            );
        }

        for name in TRAILING_FIELDS {
            emit(&mut paragraph, name);
        }
        emit(&mut paragraph, "Description");

        // BTreeMap iteration gives the alphabetical tail.
        for (key, value) in &self.fields {
            if !emitted.contains(&key.to_lowercase()) {
                paragraph.set_field_from_string(key, value);
            }
        }

        paragraph
    }
}
