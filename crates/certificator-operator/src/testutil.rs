//! Fixtures shared by unit tests

use certificator_bundle::CertBundle;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

/// Self-signed CA certificate, PEM armored
pub(crate) fn ca_pem(common_name: &str) -> String {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().pem()
}

/// Bundle holding one fresh certificate per name
pub(crate) fn bundle_with(names: &[&str]) -> CertBundle {
    let mut bundle = CertBundle::new("changeme");
    for name in names {
        bundle.append(ca_pem(name).as_bytes()).unwrap();
    }
    bundle
}
