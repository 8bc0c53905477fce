// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! APT repository trees.

A repository is a directory tree holding a pool of `.deb` files and, per
distribution, `Packages` indices plus a `Release` file describing them. See
<https://wiki.debian.org/DebianRepository/Format> for the canonical definition.

[assembler::RepositoryAssembler] writes a tree through a
[writer::RepositoryWriter]. [release::ReleaseMetadata] renders the `Release`
file.

Hosts without directories, such as GitHub release assets, get a
[RepositoryLayout::Flat] tree: a flat repository in the sense of
<https://wiki.debian.org/DebianRepository/Format#Flat_Repository_Format>.
*/

use serde::{Deserialize, Serialize};

pub mod assembler;
pub mod release;
pub mod writer;

/// How files are arranged in a repository tree.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryLayout {
    /// `pool/<component>/<arch>/` and `dists/<codename>/` directories.
    Pool,

    /// Every file at the root, with a single `Packages` index.
    Flat,
}

impl Default for RepositoryLayout {
    fn default() -> Self {
        Self::Pool
    }
}

impl RepositoryLayout {
    /// Path of a `.deb` relative to the repository root.
    pub fn deb_path(&self, component: &str, architecture: &str, filename: &str) -> String {
        match self {
            Self::Pool => format!("pool/{}/{}/{}", component, architecture, filename),
            Self::Flat => flat_name(filename),
        }
    }
}

/// `name` with characters release asset hosts rewrite replaced by `.`.
///
/// GitHub stores `tool_1.0~rc1_amd64.deb` as `tool_1.0.rc1_amd64.deb`; naming
/// the file that way up front keeps `Filename` fields valid.
pub fn flat_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deb_paths() {
        assert_eq!(
            RepositoryLayout::Pool.deb_path("main", "amd64", "tool_1.0~rc1_amd64.deb"),
            "pool/main/amd64/tool_1.0~rc1_amd64.deb"
        );
        assert_eq!(
            RepositoryLayout::Flat.deb_path("main", "amd64", "tool_1.0~rc1+b2_amd64.deb"),
            "tool_1.0.rc1.b2_amd64.deb"
        );
        assert_eq!(flat_name("Packages.gz"), "Packages.gz");
    }
}
