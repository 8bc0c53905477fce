// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian binary package control files. */

use {
    crate::{
        control::{ControlError, ControlParagraph, Result},
        package_version::PackageVersion,
    },
    std::ops::Deref,
};

/// Fields expressing relationships with other packages, in canonical order.
pub const DEPENDENCY_FIELDS: &[&str] = &[
    "Pre-Depends",
    "Depends",
    "Recommends",
    "Suggests",
    "Enhances",
    "Breaks",
    "Conflicts",
    "Provides",
    "Replaces",
];

/// A `DEBIAN/control` paragraph of a binary package.
///
/// Mandatory fields have getters returning [Result]. [Deref] exposes the
/// inner [ControlParagraph] for everything else.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryPackageControlFile {
    paragraph: ControlParagraph,
}

impl Deref for BinaryPackageControlFile {
    type Target = ControlParagraph;

    fn deref(&self) -> &Self::Target {
        &self.paragraph
    }
}

impl From<BinaryPackageControlFile> for ControlParagraph {
    fn from(cf: BinaryPackageControlFile) -> Self {
        cf.paragraph
    }
}

impl TryFrom<ControlParagraph> for BinaryPackageControlFile {
    type Error = ControlError;

    /// Wrap a paragraph after checking that mandatory fields are well formed.
    fn try_from(paragraph: ControlParagraph) -> Result<Self> {
        let cf = Self { paragraph };

        cf.package()?;
        cf.architecture()?;
        cf.version()?;

        Ok(cf)
    }
}

impl BinaryPackageControlFile {
    /// The `Package` field.
    pub fn package(&self) -> Result<&str> {
        let name = self.required_single_line("Package")?;

        if name.len() < 2
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c))
        {
            return Err(ControlError::Syntax {
                line: 0,
                reason: format!("invalid package name '{}'", name),
            });
        }

        Ok(name)
    }

    /// The `Version` field as its original string.
    pub fn version_str(&self) -> Result<&str> {
        self.required_single_line("Version")
    }

    /// The `Version` field parsed into a [PackageVersion].
    pub fn version(&self) -> Result<PackageVersion> {
        PackageVersion::parse(self.version_str()?).map_err(|e| ControlError::Syntax {
            line: 0,
            reason: e.to_string(),
        })
    }

    /// The `Architecture` field.
    pub fn architecture(&self) -> Result<&str> {
        let arch = self.required_single_line("Architecture")?;

        if !arch
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ControlError::Syntax {
                line: 0,
                reason: format!("invalid architecture '{}'", arch),
            });
        }

        Ok(arch)
    }

    pub fn source(&self) -> Option<&str> {
        self.field_str("Source")
    }

    pub fn section(&self) -> Option<&str> {
        self.field_str("Section")
    }

    /// The `Description` field; empty when absent.
    pub fn description(&self) -> &str {
        self.field_str("Description").unwrap_or_default()
    }

    /// Values of the relationship fields that are present, in canonical order.
    pub fn dependencies(&self) -> Vec<String> {
        DEPENDENCY_FIELDS
            .iter()
            .filter_map(|name| {
                self.field(name)
                    .map(|f| format!("{}: {}", name, f.iter_lines().collect::<Vec<_>>().join(" ")))
            })
            .collect()
    }

    /// The file name dpkg tooling would give this package.
    ///
    /// This is `<package>_<version without epoch>_<architecture>.deb`.
    pub fn canonical_filename(&self) -> Result<String> {
        let version = self.version()?;

        Ok(format!(
            "{}_{}_{}.deb",
            self.package()?,
            version.without_epoch(),
            self.architecture()?
        ))
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::control::ControlFile, indoc::indoc};

    fn parse(s: &str) -> Result<BinaryPackageControlFile> {
        let paragraph = ControlFile::parse_str(s)?
            .into_paragraphs()
            .next()
            .ok_or(ControlError::NoParagraph)?;

        BinaryPackageControlFile::try_from(paragraph)
    }

    #[test]
    fn parse_valid() -> Result<()> {
        let cf = parse(indoc! {"
            Package: hello
            Version: 1:2.10-2
            Architecture: amd64
            Depends: libc6 (>= 2.14),
             libfoo
            Conflicts: hello-traditional
            Description: example package
        "})?;

        assert_eq!(cf.package()?, "hello");
        assert_eq!(cf.architecture()?, "amd64");
        assert_eq!(cf.canonical_filename()?, "hello_2.10-2_amd64.deb");
        assert_eq!(
            cf.dependencies(),
            vec![
                "Depends: libc6 (>= 2.14), libfoo".to_string(),
                "Conflicts: hello-traditional".to_string()
            ]
        );
        assert_eq!(cf.description(), "example package");

        Ok(())
    }

    #[test]
    fn missing_mandatory_fields() {
        assert!(matches!(
            parse("Package: hello\nArchitecture: all\n"),
            Err(ControlError::RequiredFieldMissing("Version"))
        ));
        assert!(matches!(
            parse("Version: 1\nArchitecture: all\n"),
            Err(ControlError::RequiredFieldMissing("Package"))
        ));
    }

    #[test]
    fn invalid_values() {
        assert!(parse("Package: Hello World\nVersion: 1\nArchitecture: all\n").is_err());
        assert!(parse("Package: hello\nVersion: 1\nArchitecture: AMD64\n").is_err());
        assert!(parse("Package: hello\nVersion: a:1\nArchitecture: all\n").is_err());
    }
}
