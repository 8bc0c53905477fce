// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers: content digests and index compression. */

use {
    async_compression::futures::bufread::{GzipEncoder, XzEncoder},
    digest::Digest,
    futures::{AsyncBufRead, AsyncRead, AsyncReadExt},
    serde::{Deserialize, Serialize},
    std::{path::Path, pin::Pin},
    tokio::io::AsyncReadExt as TokioAsyncReadExt,
};

/// A checksum flavor used in repository indices.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    /// All flavors in the order they appear in `Release` files.
    pub fn all() -> impl Iterator<Item = Self> {
        [Self::Md5, Self::Sha1, Self::Sha256].into_iter()
    }

    /// Name of the checksum block in `Release` files.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Name of the per-package field in `Packages` files.
    pub fn package_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }
}

/// Size and digests of a piece of content.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct MultiContentDigest {
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

impl MultiContentDigest {
    /// Compute all digests of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut digester = MultiDigester::default();
        digester.update(data);
        digester.finish()
    }

    /// Hex digest for a checksum flavor.
    pub fn hex(&self, checksum: ChecksumType) -> &str {
        match checksum {
            ChecksumType::Md5 => &self.md5,
            ChecksumType::Sha1 => &self.sha1,
            ChecksumType::Sha256 => &self.sha256,
        }
    }
}

/// Computes multiple content digests at once.
#[derive(Clone, Default)]
pub struct MultiDigester {
    size: u64,
    md5: md5::Md5,
    sha1: sha1::Sha1,
    sha256: sha2::Sha256,
}

impl MultiDigester {
    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
    }

    pub fn finish(self) -> MultiContentDigest {
        MultiContentDigest {
            size: self.size,
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
        }
    }
}

/// Hex SHA-256 of a buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(data))
}

/// Whether `s` is a lowercase hex SHA-256 digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Stream a file through SHA-256, returning the hex digest and size.
pub async fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut fh = tokio::fs::File::open(path).await?;
    let mut hasher = sha2::Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let count = fh.read(&mut buffer).await?;
        if count == 0 {
            break;
        }

        hasher.update(&buffer[0..count]);
        size += count as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

/// Compression format applied to index files.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression (no extension).
    None,

    /// Gzip compression (.gz extension).
    Gzip,

    /// XZ compression (.xz extension).
    Xz,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Xz => ".xz",
        }
    }
}

/// Wrap a reader with transparent compression.
///
/// The gzip encoder writes a zero modification time so output is a pure
/// function of input.
pub fn read_compressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipEncoder::new(stream)),
        Compression::Xz => Box::pin(XzEncoder::new(stream)),
    }
}

/// Compress an in-memory buffer.
pub async fn compress(data: &[u8], compression: Compression) -> std::io::Result<Vec<u8>> {
    let mut reader = read_compressed(futures::io::Cursor::new(data), compression);
    let mut buffer = vec![];
    reader.read_to_end(&mut buffer).await?;

    Ok(buffer)
}
