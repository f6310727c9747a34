//! Error types for certificator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context it was raised in: the source a fetch
//! failed for, the namespace and artifact an apply failed for, and so on.
//!
//! Only [`Error::Config`] is fatal, and only before the reconciler starts.
//! Everything else is recovered at the boundary where it happens and turned
//! into a retry schedule or a registry update.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for certificator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Certificate data could not be decoded
    #[error("parse error [{origin}]: {message}")]
    Parse {
        /// Where the data came from (file path or URL)
        origin: String,
        /// Description of what failed
        message: String,
    },

    /// A certificate source was unreachable or answered with a non-success status
    #[error("fetch error [{origin}]: {message}")]
    Fetch {
        /// File path or URL being fetched
        origin: String,
        /// Description of what failed
        message: String,
        /// HTTP status code, when the remote answered
        status: Option<u16>,
    },

    /// The namespace watch stream broke
    #[error("watch error: {message}")]
    Watch {
        /// Description of what failed
        message: String,
    },

    /// Creating or updating an artifact in a namespace failed
    #[error("apply error for {resource} in {namespace}: {message}")]
    Apply {
        /// Target namespace
        namespace: String,
        /// ConfigMap name of the artifact
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid process configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The offending setting, if known
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "refresh", "encode")
        context: String,
    },
}

impl Error {
    /// Create a parse error for data coming from `origin`
    pub fn parse(origin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            origin: origin.into(),
            message: msg.into(),
        }
    }

    /// Create a fetch error for a source
    pub fn fetch(origin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            origin: origin.into(),
            message: msg.into(),
            status: None,
        }
    }

    /// Create a fetch error for a remote source that answered with `status`
    pub fn fetch_status(origin: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::Fetch {
            origin: origin.into(),
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create a watch error
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch {
            message: msg.into(),
        }
    }

    /// Create an apply error for one artifact in one namespace
    pub fn apply(
        namespace: impl Into<String>,
        resource: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            namespace: namespace.into(),
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending setting
    pub fn config_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Get the namespace if this error is associated with one
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Error::Apply { namespace, .. } => Some(namespace),
            _ => None,
        }
    }

    /// Get the origin (file path or URL) for source related errors
    pub fn origin(&self) -> Option<&str> {
        match self {
            Error::Parse { origin, .. } | Error::Fetch { origin, .. } => Some(origin),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a broken upstream surfaces which source failed and how
    #[test]
    fn story_fetch_errors_name_the_source() {
        let err = Error::fetch_status("https://curl.se/ca/cacert.pem", 503, "service unavailable");
        assert!(err.to_string().contains("curl.se"));
        assert!(err.to_string().contains("service unavailable"));
        assert_eq!(err.origin(), Some("https://curl.se/ca/cacert.pem"));
        match &err {
            Error::Fetch { status, .. } => assert_eq!(*status, Some(503)),
            _ => panic!("Expected Fetch variant"),
        }
    }

    /// Story: apply failures are attributed to a namespace and resource
    #[test]
    fn story_apply_errors_carry_namespace() {
        let err = Error::apply("team-a", "ca-bundle-jks", "forbidden");
        assert_eq!(err.namespace(), Some("team-a"));
        assert!(err.to_string().contains("ca-bundle-jks"));
        assert!(err.to_string().contains("team-a"));
    }

    #[test]
    fn test_config_error_names_the_field() {
        let err = Error::config("no CA certificate sources configured");
        assert!(err.to_string().starts_with("configuration error"));

        let err = Error::config_for_field("ca-directories", "/nope is not a directory");
        match &err {
            Error::Config { field, .. } => assert_eq!(field.as_deref(), Some("ca-directories")),
            _ => panic!("Expected Config variant"),
        }
    }

    #[test]
    fn test_parse_error_display() {
        let err = Error::parse("/etc/ssl/certs/broken.pem", "invalid base64");
        assert!(err.to_string().starts_with("parse error [/etc/ssl/certs/broken.pem]"));
        assert_eq!(err.namespace(), None);
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));

        let err = Error::internal_with_context("encode", "keystore write failed");
        assert!(err.to_string().contains("[encode]"));
    }
}
