//! The certificate bundle
//!
//! A bundle is built by one refresh cycle: created empty, appended to once
//! per source buffer, then handed over as a whole. It is never mutated after
//! it has been published, so readers can share it behind an `Arc`.

use std::fmt;

use chrono::{DateTime, Utc};
use pem::{EncodeConfig, LineEnding, Pem};
use sha2::{Digest as _, Sha256};
use tracing::debug;
use x509_parser::parse_x509_certificate;

use crate::keystore::KeyStore;
use crate::{BundleError, Result};

const PEM_BEGIN: &[u8] = b"-----BEGIN ";
const PEM_END: &[u8] = b"-----END ";
const PEM_DASHES: &[u8] = b"-----";

/// PEM label written for every certificate
pub const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

/// A parsed X.509 certificate
///
/// Only the attributes the bundle needs are kept; the raw DER is the source
/// of truth for both encodings and for the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    raw: Vec<u8>,
    common_name: String,
    subject: String,
    signature: Vec<u8>,
}

impl Certificate {
    /// Parse one DER certificate
    ///
    /// Trailing bytes after the certificate are ignored; `raw()` holds
    /// exactly the bytes of the certificate itself.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (rest, cert) = parse_x509_certificate(der)
            .map_err(|e| BundleError::Parse(format!("invalid DER certificate: {e}")))?;

        let consumed = der.len() - rest.len();
        let common_name = cert
            .subject()
            .iter_common_name()
            .last()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            raw: der[..consumed].to_vec(),
            common_name,
            subject: cert.subject().to_string(),
            signature: cert.signature_value.data.to_vec(),
        })
    }

    /// Raw DER bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Subject common name, empty when the subject has none
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Printable subject distinguished name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Signature bytes
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

/// SHA-256 over the ordered raw bytes of every certificate in a bundle
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Ordered set of CA certificates plus the keystore password
#[derive(Clone)]
pub struct CertBundle {
    certs: Vec<Certificate>,
    password: String,
    changed_at: DateTime<Utc>,
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("certificates", &self.certs.len())
            .field("changed_at", &self.changed_at)
            .finish_non_exhaustive()
    }
}

impl CertBundle {
    /// Create an empty bundle
    ///
    /// `changed_at` starts at the Unix epoch until the first append.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            certs: Vec::new(),
            password: password.into(),
            changed_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Parse every certificate in `data` and append them in encounter order
    ///
    /// `data` may hold any number of PEM blocks, possibly surrounded by
    /// comments, or a single DER certificate. On error nothing is appended.
    pub fn append(&mut self, data: &[u8]) -> Result<usize> {
        let parsed = decode_all(data)?;
        for cert in &parsed {
            debug!(subject = %cert.subject(), "Importing certificate");
        }
        let count = parsed.len();
        self.certs.extend(parsed);
        self.changed_at = Utc::now();
        Ok(count)
    }

    /// Content digest, a pure function of the certificates and their order
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        for cert in &self.certs {
            hasher.update(cert.raw());
        }
        Digest(hasher.finalize().into())
    }

    /// Content equality by digest
    ///
    /// Hashes both bundles; callers comparing one bundle repeatedly should
    /// keep its digest around instead.
    pub fn same_content(&self, other: &CertBundle) -> bool {
        self.digest() == other.digest()
    }

    /// Encode as concatenated `CERTIFICATE` PEM blocks with LF line endings
    pub fn to_pem(&self) -> Vec<u8> {
        let mut out = String::new();
        for cert in &self.certs {
            out.push_str(&pem::encode_config(
                &Pem::new(PEM_CERTIFICATE_TAG, cert.raw().to_vec()),
                EncodeConfig::new().set_line_ending(LineEnding::LF),
            ));
        }
        out.into_bytes()
    }

    /// Build the trust store view of this bundle
    ///
    /// Every entry shares a single creation timestamp taken now.
    pub fn keystore(&self) -> KeyStore {
        KeyStore::from_certificates(&self.certs, Utc::now())
    }

    /// Encode as a Java KeyStore protected by `password`
    pub fn to_keystore(&self, password: &str) -> Result<Vec<u8>> {
        self.keystore().encode(password)
    }

    /// Encode as a Java KeyStore protected by the bundle password
    pub fn to_jks(&self) -> Result<Vec<u8>> {
        self.to_keystore(&self.password)
    }

    /// Number of certificates
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// True when no certificate has been appended
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Time of the last successful append
    pub fn changed_at(&self) -> DateTime<Utc> {
        self.changed_at
    }

    /// Certificates in bundle order
    pub fn certificates(&self) -> &[Certificate] {
        &self.certs
    }

    /// Keystore password
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl PartialEq for CertBundle {
    fn eq(&self, other: &Self) -> bool {
        self.same_content(other)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split the next complete PEM block off `data`
///
/// Returns the block (BEGIN line through END line) and everything after it.
fn next_pem_block(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = find(data, PEM_BEGIN)?;
    let block = &data[start..];
    let end = find(block, PEM_END)?;
    let label_start = end + PEM_END.len();
    let close = find(&block[label_start..], PEM_DASHES)?;
    let mut block_end = label_start + close + PEM_DASHES.len();

    if block[block_end..].starts_with(b"\r\n") {
        block_end += 2;
    } else if block[block_end..].starts_with(b"\n") {
        block_end += 1;
    }

    Some((&block[..block_end], &block[block_end..]))
}

fn decode_all(data: &[u8]) -> Result<Vec<Certificate>> {
    let mut certs = Vec::new();
    let mut remaining = data;

    while let Some((block, rest)) = next_pem_block(remaining) {
        let pem = pem::parse(block)
            .map_err(|e| BundleError::Parse(format!("invalid PEM block: {e}")))?;
        certs.push(Certificate::from_der(pem.contents())?);
        remaining = rest;
    }

    // No armor left: either trailing whitespace, or a single DER certificate
    if !remaining.iter().all(u8::is_ascii_whitespace) {
        certs.push(Certificate::from_der(remaining)?);
    }

    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self_signed_der, self_signed_pem};

    fn bundle_of(pems: &[String]) -> CertBundle {
        let mut bundle = CertBundle::new("changeme");
        bundle.append(pems.concat().as_bytes()).unwrap();
        bundle
    }

    #[test]
    fn test_append_multiple_pem_blocks_in_order() {
        let a = self_signed_pem(Some("Alpha Root"));
        let b = self_signed_pem(Some("Beta Root"));

        let mut bundle = CertBundle::new("changeme");
        let count = bundle.append(format!("{a}{b}").as_bytes()).unwrap();

        assert_eq!(count, 2);
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.certificates()[0].common_name(), "Alpha Root");
        assert_eq!(bundle.certificates()[1].common_name(), "Beta Root");
    }

    #[test]
    fn test_append_skips_comments_between_blocks() {
        let a = self_signed_pem(Some("Alpha Root"));
        let b = self_signed_pem(Some("Beta Root"));
        let data = format!(
            "##\n## Bundle of CA Root Certificates\n##\n\nAlpha Root\n==========\n{a}\nBeta Root\n=========\n{b}\n\n"
        );

        let mut bundle = CertBundle::new("changeme");
        assert_eq!(bundle.append(data.as_bytes()).unwrap(), 2);
    }

    #[test]
    fn test_append_single_der_certificate() {
        let der = self_signed_der(Some("Binary Root"));

        let mut bundle = CertBundle::new("changeme");
        assert_eq!(bundle.append(&der).unwrap(), 1);
        assert_eq!(bundle.certificates()[0].raw(), der.as_slice());
        assert_eq!(bundle.certificates()[0].common_name(), "Binary Root");
    }

    #[test]
    fn test_append_empty_buffer_appends_nothing() {
        let mut bundle = CertBundle::new("changeme");
        assert_eq!(bundle.append(b"").unwrap(), 0);
        assert_eq!(bundle.append(b"\n\n  \n").unwrap(), 0);
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_append_rejects_garbage_payload() {
        let data = "-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydGlmaWNhdGU=\n-----END CERTIFICATE-----\n";

        let mut bundle = CertBundle::new("changeme");
        let err = bundle.append(data.as_bytes()).unwrap_err();
        assert!(matches!(err, BundleError::Parse(_)));
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_append_rejects_trailing_junk() {
        let a = self_signed_pem(Some("Alpha Root"));
        let data = format!("{a}this is not a certificate");

        let mut bundle = CertBundle::new("changeme");
        assert!(bundle.append(data.as_bytes()).is_err());
        assert!(bundle.is_empty(), "failed append must not keep partial results");
    }

    #[test]
    fn test_append_advances_changed_at() {
        let mut bundle = CertBundle::new("changeme");
        assert_eq!(bundle.changed_at(), DateTime::<Utc>::UNIX_EPOCH);

        bundle
            .append(self_signed_pem(Some("Alpha Root")).as_bytes())
            .unwrap();
        let first = bundle.changed_at();
        assert!(first > DateTime::<Utc>::UNIX_EPOCH);

        bundle
            .append(self_signed_pem(Some("Beta Root")).as_bytes())
            .unwrap();
        assert!(bundle.changed_at() >= first);
    }

    #[test]
    fn test_failed_append_keeps_changed_at() {
        let mut bundle = CertBundle::new("changeme");
        bundle
            .append(self_signed_pem(Some("Alpha Root")).as_bytes())
            .unwrap();
        let before = bundle.changed_at();

        assert!(bundle.append(b"garbage").is_err());
        assert_eq!(bundle.changed_at(), before);
    }

    #[test]
    fn test_pem_round_trip_preserves_digest() {
        let original = bundle_of(&[
            self_signed_pem(Some("Alpha Root")),
            self_signed_pem(None),
            self_signed_pem(Some("Gamma Root")),
        ]);

        let pem = original.to_pem();
        let mut copy = CertBundle::new("other-password");
        copy.append(&pem).unwrap();

        assert_eq!(copy.len(), 3);
        assert_eq!(copy.digest(), original.digest());
        assert_eq!(copy, original);
    }

    #[test]
    fn test_pem_output_uses_lf_and_certificate_label() {
        let bundle = bundle_of(&[self_signed_pem(Some("Alpha Root"))]);
        let text = String::from_utf8(bundle.to_pem()).unwrap();

        assert!(text.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(text.ends_with("-----END CERTIFICATE-----\n"));
        assert!(!text.contains('\r'));
        assert!(text.lines().all(|line| line.len() <= 64));
    }

    #[test]
    fn test_digest_is_stable() {
        let bundle = bundle_of(&[self_signed_pem(Some("Alpha Root"))]);
        assert_eq!(bundle.digest(), bundle.digest());
        assert_eq!(bundle.digest().to_hex().len(), 64);
    }

    #[test]
    fn test_appending_changes_digest() {
        let a = self_signed_pem(Some("Alpha Root"));
        let mut bundle = bundle_of(&[a.clone()]);
        let before = bundle.digest();

        // Even a duplicate certificate changes the content
        bundle.append(a.as_bytes()).unwrap();
        assert_ne!(bundle.digest(), before);
    }

    #[test]
    fn test_empty_bundle_digest_differs_from_non_empty() {
        let empty = CertBundle::new("changeme");
        let full = bundle_of(&[self_signed_pem(Some("Alpha Root"))]);
        assert_ne!(empty.digest(), full.digest());
    }

    #[test]
    fn test_order_matters_for_identity() {
        let a = self_signed_pem(Some("Alpha Root"));
        let b = self_signed_pem(Some("Beta Root"));

        let ab = bundle_of(&[a.clone(), b.clone()]);
        let ba = bundle_of(&[b, a]);
        assert!(!ab.same_content(&ba));
    }

    #[test]
    fn test_same_content_ignores_password_and_time() {
        let a = self_signed_pem(Some("Alpha Root"));
        let mut one = CertBundle::new("one");
        one.append(a.as_bytes()).unwrap();
        let mut two = CertBundle::new("two");
        two.append(a.as_bytes()).unwrap();

        assert!(one.same_content(&two));
        assert!(two.same_content(&one));
    }

    #[test]
    fn test_certificate_from_der_extracts_attributes() {
        let der = self_signed_der(Some("Alpha Root"));
        let cert = Certificate::from_der(&der).unwrap();

        assert_eq!(cert.common_name(), "Alpha Root");
        assert!(cert.subject().contains("Alpha Root"));
        assert!(!cert.signature().is_empty());
    }

    #[test]
    fn test_certificate_without_common_name() {
        let der = self_signed_der(None);
        let cert = Certificate::from_der(&der).unwrap();
        assert_eq!(cert.common_name(), "");
    }

    #[test]
    fn test_next_pem_block_handles_crlf() {
        let a = self_signed_pem(Some("Alpha Root"));
        let (block, rest) = next_pem_block(a.as_bytes()).unwrap();
        assert!(
            block.ends_with(b"-----END CERTIFICATE-----\r\n")
                || block.ends_with(b"-----END CERTIFICATE-----\n")
        );
        assert!(rest.iter().all(u8::is_ascii_whitespace));
    }
}
