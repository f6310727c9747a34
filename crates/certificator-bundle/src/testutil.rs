//! Certificate fixtures for unit tests

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

/// Generate a self-signed CA certificate and return its DER bytes
///
/// `None` produces a certificate with an empty subject.
pub(crate) fn self_signed_der(common_name: Option<&str>) -> Vec<u8> {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name = DistinguishedName::new();
    if let Some(cn) = common_name {
        params.distinguished_name.push(DnType::CommonName, cn);
    }
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().der().to_vec()
}

/// Generate a self-signed CA certificate and return it PEM armored
pub(crate) fn self_signed_pem(common_name: Option<&str>) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", self_signed_der(common_name)))
}
