//! Certificator operator
//!
//! Keeps every watched namespace supplied with the current CA bundle, as a
//! PEM ConfigMap and a JKS ConfigMap. The [`reconciler`] owns all state and
//! talks to the outside world only through the traits in [`sources`],
//! [`watch`] and [`apply`].

pub mod apply;
pub mod artifact;
pub mod config;
pub mod reconciler;
pub mod registry;
pub mod sources;
pub mod watch;

#[cfg(test)]
pub(crate) mod testutil;

pub use certificator_common::{Error, Result};
pub use reconciler::{Reconciler, ReconcilerSettings};
