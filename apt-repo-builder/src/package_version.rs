// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian package version string handling.

Versions have the form `[epoch:]upstream_version[-debian_revision]` and sort
using the rules at
<https://www.debian.org/doc/debian-policy/ch-controlfields.html#version>.
*/

use {
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        num::ParseIntError,
        str::FromStr,
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error)]
pub enum VersionError {
    #[error("error parsing epoch: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("the epoch component has non-digit characters: {0}")]
    EpochNonNumeric(String),

    #[error("upstream_version component is empty: {0}")]
    UpstreamVersionEmpty(String),

    #[error("upstream_version component has illegal character: {0}")]
    UpstreamVersionIllegalChar(String),

    #[error("debian_revision component has illegal character: {0}")]
    DebianRevisionIllegalChar(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// A parsed Debian package version.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PackageVersion {
    epoch: Option<u32>,
    upstream_version: String,
    debian_revision: Option<String>,
}

impl PackageVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let (epoch, remainder) = match s.split_once(':') {
            Some((epoch, remainder)) => (Some(epoch), remainder),
            None => (None, s),
        };

        let (upstream, debian) = match remainder.rsplit_once('-') {
            Some((upstream, debian)) => (upstream, Some(debian)),
            None => (remainder, None),
        };

        let epoch = match epoch {
            Some(epoch) if epoch.is_empty() || !epoch.chars().all(|c| c.is_ascii_digit()) => {
                return Err(VersionError::EpochNonNumeric(s.to_string()));
            }
            Some(epoch) => Some(u32::from_str(epoch)?),
            None => None,
        };

        if upstream.is_empty() {
            return Err(VersionError::UpstreamVersionEmpty(s.to_string()));
        }

        // Hyphens are only legal when a revision follows. Colons can't
        // appear at all since the first one delimits the epoch.
        if !upstream.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~') || (c == '-' && debian.is_some())
        }) {
            return Err(VersionError::UpstreamVersionIllegalChar(s.to_string()));
        }

        if let Some(debian) = debian {
            if debian.is_empty()
                || !debian
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '~'))
            {
                return Err(VersionError::DebianRevisionIllegalChar(s.to_string()));
            }
        }

        Ok(Self {
            epoch,
            upstream_version: upstream.to_string(),
            debian_revision: debian.map(|x| x.to_string()),
        })
    }

    pub fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// The epoch, with an absent epoch treated as `0`.
    pub fn epoch_assumed(&self) -> u32 {
        self.epoch.unwrap_or(0)
    }

    pub fn upstream_version(&self) -> &str {
        &self.upstream_version
    }

    pub fn debian_revision(&self) -> Option<&str> {
        self.debian_revision.as_deref()
    }

    /// The version string without its epoch, as used in `.deb` file names.
    pub fn without_epoch(&self) -> String {
        match &self.debian_revision {
            Some(revision) => format!("{}-{}", self.upstream_version, revision),
            None => self.upstream_version.clone(),
        }
    }
}

impl FromStr for PackageVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}:", epoch)?;
        }

        write!(f, "{}", self.without_epoch())
    }
}

/// Sort weight of a character in the non-digit parts of a version.
///
/// Tilde sorts before everything, including the end of the string. Letters
/// sort before all other non-digit characters.
fn char_order(c: Option<u8>) -> i32 {
    match c {
        Some(b'~') => -1,
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn lexical_compare(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());

    for pos in 0..std::cmp::max(a.len(), b.len()) {
        match char_order(a.get(pos).copied()).cmp(&char_order(b.get(pos).copied())) {
            Ordering::Equal => {}
            res => return res,
        }
    }

    Ordering::Equal
}

/// Split off the leading run of characters matching a predicate.
fn split_leading(s: &str, digits: bool) -> (&str, &str) {
    let pos = s
        .find(|c: char| c.is_ascii_digit() != digits)
        .unwrap_or(s.len());

    s.split_at(pos)
}

/// Compare a numeric run. Empty counts as zero.
fn numeric_compare(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');

    // Comparing by length first avoids overflow on long runs of digits.
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Compare an upstream_version or debian_revision component.
///
/// Alternates between comparing leading non-digit runs lexically and leading
/// digit runs numerically until a difference is found or both inputs are
/// exhausted.
fn compare_component(a: &str, b: &str) -> Ordering {
    let mut a_remaining = a;
    let mut b_remaining = b;

    while !a_remaining.is_empty() || !b_remaining.is_empty() {
        let (a_text, a_rest) = split_leading(a_remaining, false);
        let (b_text, b_rest) = split_leading(b_remaining, false);

        match lexical_compare(a_text, b_text) {
            Ordering::Equal => {}
            res => return res,
        }

        let (a_digits, a_rest) = split_leading(a_rest, true);
        let (b_digits, b_rest) = split_leading(b_rest, true);

        match numeric_compare(a_digits, b_digits) {
            Ordering::Equal => {}
            res => return res,
        }

        a_remaining = a_rest;
        b_remaining = b_rest;
    }

    Ordering::Equal
}

impl PartialOrd<Self> for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // An absent revision compares equal to `0`.
        self.epoch_assumed()
            .cmp(&other.epoch_assumed())
            .then_with(|| compare_component(&self.upstream_version, &other.upstream_version))
            .then_with(|| {
                compare_component(
                    self.debian_revision.as_deref().unwrap_or("0"),
                    other.debian_revision.as_deref().unwrap_or("0"),
                )
            })
    }
}
