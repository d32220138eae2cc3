use controllers::{BindingError, MemberSyncError, RegistrationSyncError};
use kube::runtime::reflector::store::WriterDropped;
use store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Member sync error: {0}")]
    MemberSync(#[from] MemberSyncError),

    #[error("Registration sync error: {0}")]
    RegistrationSync(#[from] RegistrationSyncError),

    #[error("Deployment binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("Cache sync error: {0}")]
    CacheSync(#[from] WriterDropped),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Variant name, lowercased, for use as a metric label.
    pub fn metric_label(&self) -> String {
        let debug = format!("{self:?}");
        debug
            .split(['(', ' ', '{'])
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod api;
pub mod config;
pub mod controllers;
pub mod member;
pub mod predicates;
pub mod recorder;
pub mod runtime;
pub mod store;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod fixtures;
