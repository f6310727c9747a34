//! Artifact encoders
//!
//! Each encoder turns the bundle into the payload of one ConfigMap. A round
//! encodes every artifact once and shares the bytes across all namespaces.

use std::sync::Arc;

use certificator_bundle::{BundleError, CertBundle};
use certificator_common::{
    Error, Result, JKS_FILENAME, JKS_RESOURCE_NAME, PEM_FILENAME, PEM_RESOURCE_NAME,
};

/// Serializes a bundle into one artifact format
pub trait ArtifactEncoder: Send + Sync {
    /// Data key inside the ConfigMap
    fn filename(&self) -> &str;

    /// ConfigMap name
    fn resource_name(&self) -> &str;

    /// Encode the bundle
    fn encode(&self, bundle: &CertBundle) -> Result<Vec<u8>>;
}

/// Concatenated PEM certificates
#[derive(Debug, Default, Clone, Copy)]
pub struct PemEncoder;

impl ArtifactEncoder for PemEncoder {
    fn filename(&self) -> &str {
        PEM_FILENAME
    }

    fn resource_name(&self) -> &str {
        PEM_RESOURCE_NAME
    }

    fn encode(&self, bundle: &CertBundle) -> Result<Vec<u8>> {
        Ok(bundle.to_pem())
    }
}

/// Java KeyStore sealed with the bundle password
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyStoreEncoder;

impl ArtifactEncoder for KeyStoreEncoder {
    fn filename(&self) -> &str {
        JKS_FILENAME
    }

    fn resource_name(&self) -> &str {
        JKS_RESOURCE_NAME
    }

    fn encode(&self, bundle: &CertBundle) -> Result<Vec<u8>> {
        bundle.to_jks().map_err(|e| encode_error(self.resource_name(), e))
    }
}

fn encode_error(resource: &str, e: BundleError) -> Error {
    Error::internal_with_context(format!("encode {resource}"), e.to_string())
}

/// One encoded artifact, shared by every operation of a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Data key inside the ConfigMap
    pub filename: String,
    /// ConfigMap name
    pub resource_name: String,
    /// Encoded bytes
    pub payload: Arc<Vec<u8>>,
}

/// PEM and JKS, in that order
pub fn default_encoders() -> Vec<Arc<dyn ArtifactEncoder>> {
    vec![Arc::new(PemEncoder), Arc::new(KeyStoreEncoder)]
}

/// Encode the bundle with every encoder
///
/// Fails on the first encoder error; a round with a partial artifact set
/// would record namespaces as converged without every artifact.
pub fn encode_all(
    encoders: &[Arc<dyn ArtifactEncoder>],
    bundle: &CertBundle,
) -> Result<Vec<Artifact>> {
    encoders
        .iter()
        .map(|encoder| {
            Ok(Artifact {
                filename: encoder.filename().to_string(),
                resource_name: encoder.resource_name().to_string(),
                payload: Arc::new(encoder.encode(bundle)?),
            })
        })
        .collect()
}
