// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing `Release` files.

Signing moves through `NoKey` ([crate::signing_key::KeyStore]) to
`KeyLoaded` ([ReleaseSigner]) to `Signed` ([ReleaseSignatures]). Signatures
are always verified against the public key before they are returned.
*/

use {
    crate::{
        error::SigningError,
        openpgp::{cleartext_sign, detached_sign, verify_cleartext, verify_detached},
        repository::{
            assembler::AssemblyOptions,
            writer::{write_bytes, RepositoryWriter},
        },
        signing_key::SigningKey,
    },
    log::{debug, info},
    std::io::Cursor,
};

type Result<T> = std::result::Result<T, SigningError>;

/// Signatures over a `Release` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseSignatures {
    /// Cleartext signed `Release` content.
    pub inrelease: String,
    /// Armored detached signature.
    pub release_gpg: String,
}

/// Outcome of signing a repository tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignOutcome {
    /// New signatures were written.
    Signed,
    /// Existing signatures already verify over the current `Release`.
    Unchanged,
}

/// Signs `Release` content with a loaded key.
#[derive(Debug)]
pub struct ReleaseSigner {
    key: SigningKey,
}

impl ReleaseSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// Produce and verify signatures over `release`.
    pub fn sign(&self, release: &[u8]) -> Result<ReleaseSignatures> {
        let secret = self.key.secret_key();

        let signatures = ReleaseSignatures {
            inrelease: cleartext_sign(secret, self.key.passphrase_fn(), Cursor::new(release))?,
            release_gpg: detached_sign(secret, self.key.passphrase_fn(), release)?,
        };

        self.verify(release, &signatures)?;

        Ok(signatures)
    }

    /// Verify signatures over `release` against the public key.
    pub fn verify(&self, release: &[u8], signatures: &ReleaseSignatures) -> Result<()> {
        let public = self.key.public_key();

        verify_detached(public, release, &signatures.release_gpg)?;

        let signed = verify_cleartext(public, &signatures.inrelease)?;
        let expected = String::from_utf8_lossy(release);
        let expected = expected
            .lines()
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n");

        if signed != expected {
            return Err(SigningError::SignatureVerifyFailed(
                "InRelease content does not match Release".to_string(),
            ));
        }

        Ok(())
    }

    /// Sign the `Release` of an assembled tree and write the signatures and
    /// the public key.
    ///
    /// Nothing is written when existing signatures verify over `release`.
    pub async fn sign_tree(
        &self,
        writer: &dyn RepositoryWriter,
        options: &AssemblyOptions,
        release: &[u8],
    ) -> Result<SignOutcome> {
        let key_path = options.public_key_path();
        let key_armored = self.key.public_key_armored().as_bytes();

        if read(writer, &key_path).await?.as_deref() != Some(key_armored) {
            info!("writing public key {} to {}", self.key.key_id(), key_path);
            write(writer, &key_path, key_armored).await?;
        }

        let inrelease_path = options.inrelease_path();
        let release_gpg_path = options.release_gpg_path();

        if let (Some(inrelease), Some(release_gpg)) = (
            read(writer, &inrelease_path).await?,
            read(writer, &release_gpg_path).await?,
        ) {
            let existing = ReleaseSignatures {
                inrelease: String::from_utf8_lossy(&inrelease).to_string(),
                release_gpg: String::from_utf8_lossy(&release_gpg).to_string(),
            };

            match self.verify(release, &existing) {
                Ok(()) => {
                    debug!("existing signatures verify; not re-signing");
                    return Ok(SignOutcome::Unchanged);
                }
                Err(e) => debug!("re-signing: {}", e),
            }
        }

        info!("signing {} with key {}", options.release_path(), self.key.key_id());
        let signatures = self.sign(release)?;

        write(writer, &release_gpg_path, signatures.release_gpg.as_bytes()).await?;
        write(writer, &inrelease_path, signatures.inrelease.as_bytes()).await?;

        Ok(SignOutcome::Signed)
    }
}

async fn read(writer: &dyn RepositoryWriter, path: &str) -> Result<Option<Vec<u8>>> {
    writer
        .read_path(path)
        .await
        .map_err(|e| SigningError::Io(path.to_string(), e))
}

async fn write(writer: &dyn RepositoryWriter, path: &str, data: &[u8]) -> Result<()> {
    write_bytes(writer, path, data)
        .await
        .map_err(|e| SigningError::Io(path.to_string(), e))?;

    Ok(())
}
