//! CA certificate bundles for certificator
//!
//! A [`CertBundle`] is an ordered list of parsed certificates, identified by a
//! SHA-256 [`Digest`] over their raw DER bytes, that can be encoded as a PEM
//! file or as a Java KeyStore of trusted certificate entries.

#![deny(missing_docs)]

pub mod bundle;
pub mod keystore;

#[cfg(test)]
pub(crate) mod testutil;

pub use bundle::{CertBundle, Certificate, Digest};
pub use keystore::{certificate_alias, KeyStore, TrustedCertificateEntry};

use thiserror::Error;

/// Errors raised while parsing or encoding a bundle
#[derive(Debug, Error)]
pub enum BundleError {
    /// Certificate data could not be decoded
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    /// An artifact could not be produced
    #[error("failed to encode bundle: {0}")]
    Encode(String),
}

/// Result type for bundle operations
pub type Result<T> = std::result::Result<T, BundleError>;
