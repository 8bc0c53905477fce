// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` file generation.

Checksum blocks are formatted like `apt-ftparchive`:
` <hex digest> <size right-aligned to 16 columns> <path>`.
*/

use {
    crate::{
        control::{ControlError, ControlFile, ControlParagraph},
        io::{ChecksumType, MultiContentDigest},
    },
    chrono::{DateTime, Utc},
    std::collections::BTreeMap,
};

/// Formatter string for dates in release files.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// The content of a `dists/<codename>/Release` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseMetadata {
    pub origin: String,
    pub label: String,
    pub suite: String,
    pub codename: String,
    pub components: Vec<String>,
    pub architectures: Vec<String>,
    pub description: Option<String>,
    pub date: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Index files keyed by path relative to `dists/<codename>`.
    pub entries: BTreeMap<String, MultiContentDigest>,
}

impl ReleaseMetadata {
    /// Render `Release` file content.
    ///
    /// Output is a function of the struct content; only `date` varies
    /// between builds of identical inputs.
    pub fn render(&self) -> String {
        let mut paragraph = ControlParagraph::default();

        paragraph.set_field_from_string("Origin", &self.origin);
        paragraph.set_field_from_string("Label", &self.label);
        paragraph.set_field_from_string("Suite", &self.suite);
        paragraph.set_field_from_string("Codename", &self.codename);
        paragraph.set_field_from_string("Date", self.date.format(DATE_FORMAT));
        if let Some(valid_until) = &self.valid_until {
            paragraph.set_field_from_string("Valid-Until", valid_until.format(DATE_FORMAT));
        }
        paragraph.set_field_from_string("Architectures", self.architectures.join(" "));
        if !self.components.is_empty() {
            paragraph.set_field_from_string("Components", self.components.join(" "));
        }
        if let Some(description) = &self.description {
            paragraph.set_field_from_string("Description", description);
        }

        for checksum in ChecksumType::all() {
            let lines = self
                .entries
                .iter()
                .map(|(path, digest)| {
                    format!("\n {} {:>16} {}", digest.hex(checksum), digest.size, path)
                })
                .collect::<String>();

            paragraph.set_field_from_string(checksum.field_name(), lines);
        }

        paragraph.to_string()
    }
}

/// An entry in a checksum block of a `Release` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseEntry {
    pub path: String,
    pub size: u64,
    pub digest: String,
}

/// Read the entries of a checksum block from `Release` content.
pub fn parse_release_entries(
    release: &str,
    checksum: ChecksumType,
) -> Result<Vec<ReleaseEntry>, ControlError> {
    let paragraph = ControlFile::parse_str(release)?
        .into_paragraphs()
        .next()
        .ok_or(ControlError::NoParagraph)?;

    let field = match paragraph.field(checksum.field_name()) {
        Some(field) => field,
        None => return Ok(vec![]),
    };

    field
        .iter_lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let parts = line.split_ascii_whitespace().collect::<Vec<_>>();

            match parts.as_slice() {
                [digest, size, path] => Ok(ReleaseEntry {
                    path: path.to_string(),
                    size: size.parse().map_err(|_| ControlError::Syntax {
                        line: 0,
                        reason: format!("invalid size in release entry: {}", line),
                    })?,
                    digest: digest.to_string(),
                }),
                _ => Err(ControlError::Syntax {
                    line: 0,
                    reason: format!("malformed release entry: {}", line),
                }),
            }
        })
        .collect()
}
