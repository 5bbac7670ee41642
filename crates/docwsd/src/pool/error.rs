//! Error types for jails, privileges, startup locking and process launch.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or entering a worker jail.
#[derive(Debug, Error)]
pub enum JailError {
    /// A template tree could not be walked.
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// A filesystem operation on a jail path failed.
    #[error("{operation} {path} failed: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The jail directory already exists.
    #[error("jail directory already exists: {0}")]
    Exists(PathBuf),

    /// Dropping privileges after entering the jail failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
}

impl JailError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while shedding privileges.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    /// Reading the current capability sets failed.
    #[error("failed to read capabilities: {0}")]
    Query(#[source] io::Error),

    /// Writing the reduced capability sets failed.
    #[error("failed to apply capabilities: {0}")]
    Apply(#[source] io::Error),

    /// The capability is still present after clearing it.
    #[error("capability {0} is still held after dropping it")]
    StillHeld(&'static str),

    /// Switching the user id failed.
    #[error("setuid({uid}) failed: {source}")]
    SetUid {
        uid: u32,
        #[source]
        source: io::Error,
    },
}

/// Errors raised by the startup lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while launching a child process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch {role} process {program}: {source}")]
    Launch {
        role: &'static str,
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} process exited before reporting a pid")]
    NoPid(&'static str),
}
