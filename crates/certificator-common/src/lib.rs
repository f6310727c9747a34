//! Common types for certificator: errors, constants, telemetry and metrics

#![deny(missing_docs)]

pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use metrics::{Metrics, NoopObserver, Observer, Outcome};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Value of the `app.kubernetes.io/managed-by` label on every written ConfigMap
pub const MANAGED_BY: &str = "certificator";

/// Label key identifying resources managed by certificator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Annotation carrying the RFC3339 time of the last apply
pub const ANNOTATION_LAST_APPLIED: &str = "certificator.nais.io/last-applied-at";

/// ConfigMap data key (file name inside the pod) for the PEM bundle
pub const PEM_FILENAME: &str = "ca-bundle.pem";

/// ConfigMap data key (file name inside the pod) for the JKS bundle
pub const JKS_FILENAME: &str = "ca-bundle.jks";

/// ConfigMap name holding the PEM bundle
pub const PEM_RESOURCE_NAME: &str = "ca-bundle-pem";

/// ConfigMap name holding the JKS bundle
pub const JKS_RESOURCE_NAME: &str = "ca-bundle-jks";

/// Field manager / user agent reported to the API server
pub const FIELD_MANAGER: &str = "certificator";
