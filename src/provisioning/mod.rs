//! Relay resource provisioning.
//!
//! Dynamic tunnels create their hybrid connection on open and delete it on
//! close. [`ArmProvisioner`] does this against Azure Resource Manager.

pub mod arm;

use std::fmt;

use futures::future::BoxFuture;

use crate::descriptor::TunnelDescriptor;

pub use arm::{ArmProvisioner, ArmSettings};

#[derive(Debug)]
pub enum ProvisionError {
    /// Descriptor lacks something the management API needs.
    Incomplete(&'static str),
    /// Obtaining a management token failed.
    Auth(String),
    /// The management API answered with an error status.
    Api { status: u16, message: String },
    Http(reqwest::Error),
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete(field) => write!(f, "descriptor has no {field}"),
            Self::Auth(msg) => write!(f, "management authentication failed: {msg}"),
            Self::Api { status, message } => {
                write!(f, "management API returned {status}: {message}")
            }
            Self::Http(e) => write!(f, "management request failed: {e}"),
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProvisionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

/// Creates and removes the relay resource behind a tunnel.
pub trait ResourceProvisioner: Send + Sync {
    /// Create (or update) the resource. An existing resource is success.
    fn create<'a>(&'a self, descriptor: &'a TunnelDescriptor)
        -> BoxFuture<'a, Result<(), ProvisionError>>;

    /// Delete the resource. A missing resource is success.
    fn delete<'a>(&'a self, descriptor: &'a TunnelDescriptor)
        -> BoxFuture<'a, Result<(), ProvisionError>>;

    fn exists<'a>(&'a self, descriptor: &'a TunnelDescriptor)
        -> BoxFuture<'a, Result<bool, ProvisionError>>;
}
