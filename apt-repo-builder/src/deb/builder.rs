// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Construction of small `.deb` files for tests. */

use {
    crate::{control::ControlParagraph, io::Compression},
    std::io::Write,
};

/// Builds a minimal `.deb` archive with a fixed mtime.
pub struct DebFixture {
    control: Vec<u8>,
    compression: Compression,
    include_control: bool,
}

impl DebFixture {
    pub fn new(package: &str, version: &str, arch: &str) -> Self {
        let mut paragraph = ControlParagraph::default();
        paragraph.set_field_from_string("Package", package);
        paragraph.set_field_from_string("Version", version);
        paragraph.set_field_from_string("Architecture", arch);
        paragraph.set_field_from_string("Maintainer", "Someone <someone@example.com>");
        paragraph.set_field_from_string(
            "Description",
            format!("{} test package\n Longer description.", package),
        );

        Self::raw_control(paragraph.to_string().as_bytes())
    }

    /// Use verbatim bytes as the `control` file.
    pub fn raw_control(data: &[u8]) -> Self {
        Self {
            control: data.to_vec(),
            compression: Compression::Gzip,
            include_control: true,
        }
    }

    /// Append a field to the control file.
    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.control
            .extend_from_slice(format!("{}: {}\n", name, value).as_bytes());
        self
    }

    pub fn control_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Leave `control` out of `control.tar`.
    pub fn omit_control(mut self) -> Self {
        self.include_control = false;
        self
    }

    fn tar(files: &[(&str, &[u8])]) -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_cksum();
            builder.append_data(&mut header, path, *data)?;
        }

        builder.into_inner()
    }

    fn compress(&self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(data),
            Compression::Gzip => {
                let mut encoder = libflate::gzip::Encoder::new(Vec::new())?;
                encoder.write_all(&data)?;
                encoder.finish().into_result()
            }
            Compression::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
                encoder.write_all(&data)?;
                encoder.finish()
            }
        }
    }

    pub fn build(&self) -> std::io::Result<Vec<u8>> {
        let md5sums = b"d41d8cd98f00b204e9800998ecf8427e  usr/share/doc/empty\n";
        let control_tar = if self.include_control {
            Self::tar(&[("control", self.control.as_slice()), ("md5sums", &md5sums[..])])?
        } else {
            Self::tar(&[("md5sums", &md5sums[..])])?
        };
        let control_tar = self.compress(control_tar)?;
        let data_tar = Self::tar(&[("usr/share/doc/empty", &b""[..])])?;

        let mut deb = Vec::new();
        let mut ar_builder = ar::Builder::new(&mut deb);

        for (name, data) in [
            ("debian-binary".to_string(), b"2.0\n".to_vec()),
            (
                format!("control.tar{}", self.compression.extension()),
                control_tar,
            ),
            ("data.tar".to_string(), data_tar),
        ] {
            let mut header = ar::Header::new(name.into_bytes(), data.len() as _);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            ar_builder.append(&header, data.as_slice())?;
        }

        drop(ar_builder);

        Ok(deb)
    }
}
