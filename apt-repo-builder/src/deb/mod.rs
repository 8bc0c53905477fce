// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading `.deb` package files.

A `.deb` binary package is an `ar` archive with 3 entries:

1. `debian-binary` holding the version of the binary package format.
2. `control.tar[.<ext>]` holding package metadata.
3. `data.tar[.<ext>]` holding file content.

Only the `control` file inside `control.tar` is read. The format is described
at <https://manpages.debian.org/unstable/dpkg-dev/deb.5.en.html>.
*/

use {
    crate::{
        binary_package_control::BinaryPackageControlFile,
        control::{ControlError, ControlParagraphReader},
    },
    std::io::{Cursor, Read},
    thiserror::Error,
};

#[cfg(test)]
pub(crate) mod builder;

/// Errors reading a `.deb` file.
#[derive(Debug, Error)]
pub enum DebError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control file error: {0}")]
    Control(#[from] ControlError),

    #[error("not a binary package archive: {0}")]
    NotBinaryPackage(String),

    #[error("unknown compression for archive member: control.tar{0}")]
    UnknownCompression(String),

    #[error("control file not found")]
    ControlFileNotFound,
}

pub type Result<T> = std::result::Result<T, DebError>;

fn reader_from_extension(extension: &str, data: Cursor<Vec<u8>>) -> Result<Box<dyn Read>> {
    match extension {
        "" => Ok(Box::new(data)),
        ".gz" => Ok(Box::new(libflate::gzip::Decoder::new(data)?)),
        ".xz" => Ok(Box::new(xz2::read::XzDecoder::new(data))),
        ".zst" => Ok(Box::new(zstd::Decoder::new(data)?)),
        _ => Err(DebError::UnknownCompression(extension.to_string())),
    }
}

/// Find and parse the `control` file within a `control.tar` archive.
fn control_from_tar(reader: Box<dyn Read>) -> Result<BinaryPackageControlFile> {
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;

        let path = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        if path.trim_start_matches("./") != "control" {
            continue;
        }

        let mut data = vec![];
        entry.read_to_end(&mut data)?;

        let paragraph = ControlParagraphReader::new(Cursor::new(data))
            .next()
            .ok_or(ControlError::NoParagraph)??;

        return Ok(BinaryPackageControlFile::try_from(paragraph)?);
    }

    Err(DebError::ControlFileNotFound)
}

/// Resolve the binary package control file from `.deb` content.
pub fn resolve_control_file(reader: impl Read) -> Result<BinaryPackageControlFile> {
    let mut archive = ar::Archive::new(reader);
    let mut first = true;

    while let Some(entry) = archive.next_entry() {
        let mut entry = entry?;
        let identifier = String::from_utf8_lossy(entry.header().identifier()).to_string();

        if first {
            first = false;

            let mut version = String::new();
            entry.read_to_string(&mut version)?;

            if identifier != "debian-binary" || !version.starts_with("2.") {
                return Err(DebError::NotBinaryPackage(format!(
                    "first member is {} with version {:?}",
                    identifier,
                    version.trim()
                )));
            }
        } else if let Some(tail) = identifier.strip_prefix("control.tar") {
            let mut data = vec![];
            entry.read_to_end(&mut data)?;

            return control_from_tar(reader_from_extension(tail, Cursor::new(data))?);
        }
    }

    if first {
        Err(DebError::NotBinaryPackage("empty ar archive".to_string()))
    } else {
        Err(DebError::ControlFileNotFound)
    }
}

#[cfg(test)]
mod test {
    use {
        super::{builder::DebFixture, *},
        crate::io::Compression,
    };

    #[test]
    fn read_control_uncompressed_and_gzip() -> Result<()> {
        for compression in [Compression::None, Compression::Gzip] {
            let deb = DebFixture::new("hello", "1.0-1", "amd64")
                .field("Depends", "libc6")
                .control_compression(compression)
                .build()?;

            let control = resolve_control_file(Cursor::new(deb))?;
            assert_eq!(control.package()?, "hello");
            assert_eq!(control.version_str()?, "1.0-1");
            assert_eq!(control.field_str("Depends"), Some("libc6"));
        }

        Ok(())
    }

    #[test]
    fn not_an_ar_archive() {
        assert!(resolve_control_file(Cursor::new(b"this is not a deb".to_vec())).is_err());
    }

    #[test]
    fn malformed_control_is_error() -> Result<()> {
        let deb = DebFixture::raw_control(b"Package hello\n").build()?;

        assert!(matches!(
            resolve_control_file(Cursor::new(deb)),
            Err(DebError::Control(ControlError::Syntax { .. }))
        ));

        Ok(())
    }

    #[test]
    fn missing_control_member() -> Result<()> {
        let deb = DebFixture::new("hello", "1.0", "all").omit_control().build()?;

        assert!(matches!(
            resolve_control_file(Cursor::new(deb)),
            Err(DebError::ControlFileNotFound)
        ));

        Ok(())
    }
}
