// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! OpenPGP signature primitives.

Two signature forms are produced:

* Detached, ASCII armored binary signatures (`Release.gpg`).
* Cleartext signatures as defined by
  [RFC 4880 Section 7](https://datatracker.ietf.org/doc/html/rfc4880.html#section-7)
  (`InRelease`). These have the form:

```text
-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA256

<dash-escaped signed content>
-----BEGIN PGP SIGNATURE-----

<signature data>
-----END PGP SIGNATURE-----
```
*/

use {
    crate::error::SigningError,
    chrono::SubsecRound,
    pgp::{
        crypto::HashAlgorithm,
        packet::{Packet, SignatureConfig, SignatureType, Subpacket},
        types::{KeyVersion, PublicKeyTrait, SecretKeyTrait},
        Signature,
    },
    smallvec::SmallVec,
    std::io::{BufRead, Cursor},
};

const HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_ARMOR: &str = "-----BEGIN PGP SIGNATURE-----";

type Result<T> = std::result::Result<T, SigningError>;

fn verify_failed(message: impl ToString) -> SigningError {
    SigningError::SignatureVerifyFailed(message.to_string())
}

fn signature_config(
    key: &impl SecretKeyTrait,
    signature_type: SignatureType,
) -> SignatureConfig {
    let hashed_subpackets = vec![
        Subpacket::IssuerFingerprint(KeyVersion::V4, SmallVec::from_slice(&key.fingerprint())),
        Subpacket::SignatureCreationTime(chrono::Utc::now().trunc_subsecs(0)),
    ];
    let unhashed_subpackets = vec![Subpacket::Issuer(key.key_id())];

    SignatureConfig::new_v4(
        Default::default(),
        signature_type,
        key.algorithm(),
        HashAlgorithm::SHA2_256,
        hashed_subpackets,
        unhashed_subpackets,
    )
}

fn armor_signature(signature: Signature) -> Result<String> {
    let packet = Packet::Signature(signature);
    let mut writer = Cursor::new(Vec::<u8>::new());
    pgp::armor::write(&packet, pgp::armor::BlockType::Signature, &mut writer, None)?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| SigningError::Pgp(pgp::errors::Error::Utf8Error(e.utf8_error())))
}

/// Parse the signature packets of an armored signature block.
pub fn parse_armored_signatures(armored: &str) -> Result<Vec<Signature>> {
    let mut dearmor = pgp::armor::Dearmor::new(Cursor::new(armored.as_bytes().to_vec()));
    dearmor
        .read_header()
        .map_err(|e| verify_failed(format!("bad signature armor: {:?}", e)))?;

    if !matches!(dearmor.typ, Some(pgp::armor::BlockType::Signature)) {
        return Err(verify_failed("armor block is not a signature"));
    }

    let mut signatures = vec![];
    for packet in pgp::packet::PacketParser::new(dearmor) {
        match packet {
            Ok(Packet::Signature(signature)) => signatures.push(signature),
            Ok(packet) => {
                return Err(verify_failed(format!(
                    "unexpected PGP packet; expected Signature; got {:?}",
                    packet.tag()
                )))
            }
            Err(e) => return Err(verify_failed(format!("PGP packet parsing error: {:?}", e))),
        }
    }

    if signatures.is_empty() {
        Err(verify_failed("no PGP signatures present"))
    } else {
        Ok(signatures)
    }
}

/// Produce an armored detached signature over the exact bytes of `data`.
pub fn detached_sign<PW>(key: &impl SecretKeyTrait, key_pw: PW, data: &[u8]) -> Result<String>
where
    PW: FnOnce() -> String,
{
    let config = signature_config(key, SignatureType::Binary);
    let signature = config.sign(key, key_pw, Cursor::new(data))?;

    armor_signature(signature)
}

/// Verify an armored detached signature over `data`.
pub fn verify_detached(key: &impl PublicKeyTrait, data: &[u8], armored: &str) -> Result<()> {
    for signature in parse_armored_signatures(armored)? {
        signature
            .verify(key, Cursor::new(data))
            .map_err(|e| verify_failed(format!("detached signature: {:?}", e)))?;
    }

    Ok(())
}

/// Produce a cleartext signed document from text.
///
/// Trailing whitespace is removed from lines and lines starting with `-` or
/// `From ` are dash-escaped. The signature is computed over the lines joined
/// with CRLF. The returned document uses LF line endings.
pub fn cleartext_sign<PW, R>(key: &impl SecretKeyTrait, key_pw: PW, data: R) -> Result<String>
where
    PW: FnOnce() -> String,
    R: BufRead,
{
    let mut dashed_lines = vec![];
    let mut source_lines = vec![];

    for line in data.lines() {
        let line = line.map_err(|e| SigningError::Io("cleartext input".to_string(), e))?;
        let line = line.trim_end();

        dashed_lines.push(if line.starts_with('-') || line.starts_with("From ") {
            format!("- {}", line)
        } else {
            line.to_string()
        });
        source_lines.push(line.to_string());
    }

    let cleartext = source_lines.join("\r\n").into_bytes();

    let config = signature_config(key, SignatureType::Text);
    let signature = config.sign(key, key_pw, Cursor::new(cleartext))?;

    let lines = [HEADER.to_string(), "Hash: SHA256".to_string(), String::new()]
        .into_iter()
        .chain(dashed_lines.into_iter())
        .chain(std::iter::once(armor_signature(signature)?))
        .collect::<Vec<_>>();

    Ok(lines.join("\n"))
}

/// Verify a cleartext signed document, returning the signed text.
///
/// The returned text has lines joined by LF and no trailing newline.
pub fn verify_cleartext(key: &impl PublicKeyTrait, document: &str) -> Result<String> {
    let mut lines = document.lines();

    if lines.next().map(|l| l.trim_end()) != Some(HEADER) {
        return Err(verify_failed(format!(
            "bad cleartext header; expected `{}`",
            HEADER
        )));
    }

    let mut saw_hash = false;
    loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => break,
            Some(line) if line.starts_with("Hash: ") => {
                if !line["Hash: ".len()..]
                    .split(',')
                    .any(|h| h.trim() == "SHA256")
                {
                    return Err(verify_failed(format!("unsupported hash header: {}", line)));
                }
                saw_hash = true;
            }
            Some(line) => {
                return Err(verify_failed(format!(
                    "expected Hash: header; got {}",
                    line
                )))
            }
            None => return Err(verify_failed("truncated cleartext document")),
        }
    }

    if !saw_hash {
        return Err(verify_failed("no Hash headers in cleartext document"));
    }

    let mut body = vec![];
    let mut found_signature = false;
    for line in &mut lines {
        if line.trim_end() == SIGNATURE_ARMOR {
            found_signature = true;
            break;
        }

        body.push(line.strip_prefix("- ").unwrap_or(line).trim_end());
    }

    if !found_signature {
        return Err(verify_failed("cleartext document lacks a signature"));
    }

    let armored = std::iter::once(SIGNATURE_ARMOR)
        .chain(lines)
        .collect::<Vec<_>>()
        .join("\n");

    let signed = body.join("\r\n");
    for signature in parse_armored_signatures(&armored)? {
        signature
            .verify(key, Cursor::new(signed.as_bytes()))
            .map_err(|e| verify_failed(format!("cleartext signature: {:?}", e)))?;
    }

    Ok(body.join("\n"))
}
