//! Java KeyStore (JKS) encoding of a bundle
//!
//! Only trusted certificate entries are written. The layout is JKS version 2:
//!
//! ```text
//! u32 magic 0xFEEDFEED | u32 version 2 | u32 entry count
//! per entry: u32 tag 2 | UTF alias | i64 creation millis | UTF cert type | u32 len | DER
//! 20 byte SHA-1 over password (UTF-16BE) || "Mighty Aphrodite" || everything above
//! ```
//!
//! Aliases are stable across runs: downstream JVMs look certificates up by
//! alias, so the alias scheme must not change.

use chrono::{DateTime, Utc};
use sha1::{Digest as _, Sha1};

use crate::bundle::Certificate;
use crate::{BundleError, Result};

const MAGIC: u32 = 0xFEED_FEED;
const VERSION: u32 = 2;
const TAG_TRUSTED_CERTIFICATE: u32 = 2;
const INTEGRITY_SALT: &[u8] = b"Mighty Aphrodite";

/// Certificate type recorded in every entry
pub const CERTIFICATE_TYPE: &str = "X509";

/// Number of hex characters of the signature used for anonymous aliases
const ANONYMOUS_SIGNATURE_CHARS: usize = 32;

/// Build the keytool compatible alias for the certificate at `index`
///
/// The common name is lower-cased one character at a time, replaced by
/// `anon_` plus the first 32 hex characters of the signature when empty,
/// every character outside `[a-z0-9]` becomes `_`, and the zero padded index
/// is prepended.
pub fn certificate_alias(index: usize, cert: &Certificate) -> String {
    let mut name = cert.common_name().to_string();
    if name.is_empty() {
        let signature = hex::encode(cert.signature());
        let end = signature.len().min(ANONYMOUS_SIGNATURE_CHARS);
        name = format!("anon_{}", &signature[..end]);
    }

    let sanitized: String = name
        .chars()
        .map(lower_char)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!("{index:04}_{sanitized}")
}

/// Simple one-to-one lowercase mapping
///
/// `str::to_lowercase` expands `İ` (U+0130) to two characters, which would add
/// an underscore to the alias; only the first character of the mapping is kept.
fn lower_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// One trusted certificate entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedCertificateEntry {
    /// Entry alias
    pub alias: String,
    /// Entry creation time (metadata only)
    pub creation_date: DateTime<Utc>,
    /// DER bytes of the certificate
    pub content: Vec<u8>,
}

/// In-memory trust store, entries in bundle order
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    entries: Vec<TrustedCertificateEntry>,
}

impl KeyStore {
    /// Build one entry per certificate, all sharing `creation_date`
    pub fn from_certificates(certs: &[Certificate], creation_date: DateTime<Utc>) -> Self {
        let entries = certs
            .iter()
            .enumerate()
            .map(|(index, cert)| TrustedCertificateEntry {
                alias: certificate_alias(index, cert),
                creation_date,
                content: cert.raw().to_vec(),
            })
            .collect();
        Self { entries }
    }

    /// Entries in bundle order
    pub fn entries(&self) -> &[TrustedCertificateEntry] {
        &self.entries
    }

    /// Serialize to JKS bytes, sealed with `password`
    pub fn encode(&self, password: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(&length_u32(self.entries.len(), "entry count")?.to_be_bytes());

        for entry in &self.entries {
            out.extend_from_slice(&TAG_TRUSTED_CERTIFICATE.to_be_bytes());
            write_utf(&mut out, &entry.alias)?;
            out.extend_from_slice(&entry.creation_date.timestamp_millis().to_be_bytes());
            write_utf(&mut out, CERTIFICATE_TYPE)?;
            out.extend_from_slice(&length_u32(entry.content.len(), "certificate")?.to_be_bytes());
            out.extend_from_slice(&entry.content);
        }

        let mut hasher = Sha1::new();
        hasher.update(password_bytes(password));
        hasher.update(INTEGRITY_SALT);
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize());

        Ok(out)
    }
}

fn length_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| BundleError::Encode(format!("{what} too large: {len}")))
}

/// Java `DataOutput.writeUTF`; aliases and types are plain ASCII, so the
/// modified UTF-8 encoding is the byte string itself.
fn write_utf(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| BundleError::Encode(format!("string too long for JKS: {}", value.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Password as Java chars, big endian
fn password_bytes(password: &str) -> Vec<u8> {
    password
        .encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect()
}
