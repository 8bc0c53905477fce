// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Build signed APT repositories from release artifacts.

This crate turns the `.deb` files attached to a release into a signed
Debian/Ubuntu APT repository and publishes it. Everything is done natively:
control files are read directly out of `.deb` archives, `Packages` and
`Release` files are rendered in-process and OpenPGP signatures are produced
with the [pgp] crate. No `dpkg`, `apt-ftparchive` or `gpg` binaries are needed.

# Determinism

Given the same set of `.deb` files and the same configuration, the produced
repository is byte-for-byte identical. Indices are sorted, gzip output carries
no timestamp and the `Release` date of a previous build is kept when its inputs
haven't changed.

# A Tour of Functionality

Builds are a pipeline of phases, sequenced by [orchestrator::Orchestrator]:

1. **Fetch.** A [source::ReleaseSource] lists and downloads release assets.
   [source::github::GitHubSource] speaks the GitHub REST API and
   [source::local::LocalSource] reads a directory. [fetcher::ArtifactFetcher]
   downloads `.deb` assets with bounded concurrency and retries
   ([retry::RetryPolicy]) into a content-addressed [fetcher::ContentCache].
2. **Index.** [deb] extracts the control file from `.deb` archives. Control
   files are parsed by [control] and interpreted by [binary_package_control].
   [index::PackageIndexer] turns them into [package::Package] records grouped
   into per component and architecture [index::RepositoryIndex] instances.
   [package_version::PackageVersion] implements Debian version ordering.
3. **Assemble.** [repository::assembler::RepositoryAssembler] writes the
   `pool/` and `dists/` tree through a [repository::writer::RepositoryWriter],
   including the `Release` file ([repository::release::ReleaseMetadata]).
4. **Sign.** [signing_key::KeyStore] loads or generates a key and
   [signer::ReleaseSigner] produces `InRelease` and `Release.gpg` using the
   primitives in [openpgp].
5. **Publish.** [publisher::Publisher] diffs the tree against a
   [destination::PublishDestination], uploads changes into a staging area and
   promotes it. [destination::local::LocalDestination] swaps a directory
   symlink; [destination::github::GitHubDestination] renames release assets
   and needs the [repository::RepositoryLayout::Flat] layout.

[github] holds the REST API client both GitHub collaborators share.

[config::BuilderConfig] holds all settings. Errors are defined in [error].
Progress is reported through [event::BuildEvent].
*/

pub mod binary_package_control;
pub mod config;
pub mod control;
pub mod deb;
pub mod destination;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod github;
pub mod index;
pub mod io;
pub mod openpgp;
pub mod orchestrator;
pub mod package;
pub mod package_version;
pub mod publisher;
pub mod repository;
pub mod retry;
pub mod signer;
pub mod signing_key;
pub mod source;
#[cfg(test)]
pub(crate) mod testutil;
