use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{api::registration::DescriptorError, store::StoreError};

use helm::RenderError;

/// Independent failures collected into one error.
#[derive(Debug)]
pub struct AggregateError<E>(pub Vec<E>);

impl<E> AggregateError<E> {
    /// Fails with every error found in `results`, succeeds when there is none.
    pub fn check(results: impl IntoIterator<Item = Result<(), E>>) -> Result<(), Self> {
        let errors: Vec<E> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors))
        }
    }

    pub fn errors(&self) -> &[E] {
        &self.0
    }
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, " [{err}]")?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AggregateError<E> {}

/// Outcome of a teardown step that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Done,
    /// Objects are still going away; retry later.
    Pending(String),
}

pub type BackupWaitResult<T> = std::result::Result<T, BackupWaitError>;

#[derive(Error, Debug)]
pub enum BackupWaitError {
    #[error("Backup bucket lookup error: {0}")]
    Lookup(#[source] StoreError),

    #[error("Error while waiting for backup bucket {name} to be deleted after {timeout:?}: {message}")]
    Timeout {
        name: String,
        timeout: Duration,
        message: String,
    },
}

pub type MemberSyncResult<T> = std::result::Result<T, MemberSyncError>;

#[derive(Error, Debug)]
pub enum MemberSyncError {
    #[error("Member lookup error: {0}")]
    Lookup(#[source] StoreError),

    #[error("Registration list error: {0}")]
    ListRegistrations(#[source] StoreError),

    #[error("Binding list error: {0}")]
    ListBindings(#[source] StoreError),

    #[error("Member finalizer error: {0}")]
    Finalizer(#[source] StoreError),

    #[error("{0}")]
    Backup(#[from] BackupWaitError),

    #[error("Deployment bindings for member {0:?} still pending, cannot release member")]
    StillReferenced(String),
}

/// Failure to converge the binding of one member.
#[derive(Error, Debug)]
#[error("member {member}: {source}")]
pub struct MemberBindingError {
    pub member: String,
    pub source: BindingWriteError,
}

#[derive(Error, Debug)]
pub enum BindingWriteError {
    #[error("{0}")]
    Backup(#[from] BackupWaitError),

    #[error("Member finalizer error: {0}")]
    Finalizer(#[source] StoreError),

    #[error("Spec hash error: {0}")]
    Hash(#[from] serde_json::Error),

    #[error("Binding write error: {0}")]
    Write(#[source] StoreError),

    #[error("Binding delete error: {0}")]
    Delete(#[source] StoreError),
}

pub type RegistrationSyncResult<T> = std::result::Result<T, RegistrationSyncError>;

#[derive(Error, Debug)]
pub enum RegistrationSyncError {
    #[error("Registration lookup error: {0}")]
    Lookup(#[source] StoreError),

    #[error("Member list error: {0}")]
    ListMembers(#[source] StoreError),

    #[error("Binding list error: {0}")]
    ListBindings(#[source] StoreError),

    #[error("Registration finalizer error: {0}")]
    Finalizer(#[source] StoreError),

    #[error("Binding sync error: {0}")]
    Members(#[from] AggregateError<MemberBindingError>),

    #[error("Binding delete error: {0}")]
    Delete(#[source] AggregateError<StoreError>),

    #[error("Deletion of {0} deployment binding(s) is still pending")]
    DeletionPending(usize),
}

pub type CleanupResult<T> = std::result::Result<T, CleanupError>;

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Extension list error: {0}")]
    ListExtensions(#[source] StoreError),

    #[error("Extension delete error: {0}")]
    Extensions(#[source] AggregateError<StoreError>),

    #[error("Managed artifact delete error: {0}")]
    ManagedArtifact(#[source] StoreError),

    #[error("Legacy status decode error: {0}")]
    LegacyStatus(#[from] serde_json::Error),

    #[error("Legacy resource delete error: {0}")]
    LegacyResources(#[source] AggregateError<StoreError>),

    #[error("Namespace delete error: {0}")]
    Namespace(#[source] StoreError),
}

pub type BindingResult<T> = std::result::Result<T, BindingError>;

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Binding lookup error: {0}")]
    Lookup(#[source] StoreError),

    #[error("Registration lookup error: {0}")]
    Registration(#[source] StoreError),

    #[error("Member lookup error: {0}")]
    Member(#[source] StoreError),

    #[error("Member client error: {0}")]
    MemberClient(#[source] StoreError),

    #[error("Chart information error: {0}")]
    ChartInformation(#[from] DescriptorError),

    #[error("Namespace error: {0}")]
    Namespace(#[source] StoreError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Installation error: {0}")]
    Install(#[source] StoreError),

    #[error("Binding finalizer error: {0}")]
    Finalizer(#[source] StoreError),

    #[error("Binding status error: {0}")]
    Status(#[source] StoreError),

    #[error("{0}")]
    DeletionPending(String),

    #[error("Cleanup error: {0}")]
    Cleanup(#[from] CleanupError),
}

pub mod binding;
pub mod controller;
pub mod fleet_member;
pub mod helm;
pub mod registration;
